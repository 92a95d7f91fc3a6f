//! Mail crate - local mirror of a Gmail mailbox
//!
//! This crate provides:
//! - Domain models (Message, EmailAddress, labels)
//! - Gmail API client, OAuth authentication and message normalization
//! - The `MailboxApi` remote capability with an in-memory double
//! - Storage trait with SQLite and in-memory backends
//! - The sync engine: query planning, listing, deletion reconciliation,
//!   a bounded fetch pool, retries and cooperative shutdown

pub mod config;
pub mod gmail;
pub mod models;
pub mod remote;
pub mod storage;
pub mod sync;

pub use config::{GmailCredentials, SyncSettings};
pub use gmail::{GmailAuth, GmailClient};
pub use models::{EmailAddress, LabelId, Message, MessageId, Recipients, ThreadId};
pub use remote::{ApiError, InMemoryMailbox, MailboxApi};
pub use storage::{InMemoryMailStore, MailStore, SqliteMailStore};
pub use sync::{
    QueryFilter, RetryPolicy, ShutdownCoordinator, ShutdownState, SyncEngine, SyncError,
    SyncMode, SyncSummary,
};
