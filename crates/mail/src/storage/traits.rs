//! Storage trait definitions

use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::models::{Message, MessageId};

/// Persistence sink for mirrored messages
///
/// Implementations are shared by all sync workers. Each write must be atomic
/// per call so an abandoned worker can never leave a half-written row.
/// Rows are never physically removed.
pub trait MailStore: Send + Sync {
    /// Insert a message, or refresh an existing row
    ///
    /// An existing row keeps its immutable content (subject, body, sender,
    /// recipients, thread, timestamp); labels, read/outgoing flags and size
    /// are replaced, `is_deleted` is cleared, and `last_indexed` becomes the
    /// later of the stored and supplied values.
    fn upsert_message(&self, message: Message) -> Result<()>;

    /// Check if a message exists (deleted or not)
    fn has_message(&self, id: &MessageId) -> Result<bool>;

    /// Get a message by ID
    fn get_message(&self, id: &MessageId) -> Result<Option<Message>>;

    /// Mark `deleted` rows deleted and clear the flag on `restored` rows,
    /// moving each changed row's `last_indexed` forward to `now`
    ///
    /// Both batches commit together or not at all. Unknown IDs are ignored.
    /// Returns the number of rows changed in each batch.
    fn apply_deletion_state(
        &self,
        deleted: &[MessageId],
        restored: &[MessageId],
        now: DateTime<Utc>,
    ) -> Result<(usize, usize)>;

    /// Maximum `last_indexed` over all rows, or `None` for an empty store
    fn get_watermark(&self) -> Result<Option<DateTime<Utc>>>;

    /// IDs of all rows not marked deleted
    fn get_active_ids(&self) -> Result<HashSet<MessageId>>;

    /// IDs of all rows marked deleted
    fn get_deleted_ids(&self) -> Result<HashSet<MessageId>>;

    /// Count all rows, including deleted ones
    fn count_messages(&self) -> Result<usize>;
}
