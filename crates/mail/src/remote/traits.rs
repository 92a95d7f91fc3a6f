//! Remote mailbox capability

use super::ApiError;
use crate::gmail::api::GmailMessage;
use crate::models::MessageId;
use crate::sync::QueryFilter;

/// One page of message IDs from a listing call
#[derive(Debug, Clone, Default)]
pub struct IdPage {
    pub ids: Vec<MessageId>,
    pub next_page_token: Option<String>,
}

/// Read-only access to a remote mailbox
///
/// Implementations make exactly one remote call per method invocation;
/// retries and paging are layered on top by the sync engine.
pub trait MailboxApi: Send + Sync {
    /// Fetch one page of message IDs matching `filter`
    fn list_ids_page(
        &self,
        filter: &QueryFilter,
        page_token: Option<&str>,
    ) -> Result<IdPage, ApiError>;

    /// Fetch the full raw message by ID
    fn get_message(&self, id: &MessageId) -> Result<GmailMessage, ApiError>;
}
