use thiserror::Error;

use crate::models::MessageId;
use crate::remote::ApiError;

/// Errors that end a sync command
///
/// Failures of individual messages inside a batch run are counted in the
/// summary instead; only [`SyncError::Message`] reports one directly.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("listing remote messages failed: {0}")]
    Listing(#[source] ApiError),

    #[error("interrupted during {phase}")]
    Interrupted { phase: &'static str },

    #[error("deletion reconciliation failed: {0:#}")]
    Reconcile(anyhow::Error),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),

    #[error("failed to sync message {id}: {reason}")]
    Message { id: MessageId, reason: String },
}
