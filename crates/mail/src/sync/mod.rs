//! Sync engine for mirroring a remote mailbox into the local store
//!
//! A run plans a listing filter from the local watermark, lists matching IDs,
//! optionally reconciles deletions, then fetches missing messages on a
//! bounded worker pool. Every phase observes the run's
//! [`ShutdownCoordinator`].

mod engine;
mod error;
mod lister;
mod pool;
mod query;
mod reconcile;
mod retry;
mod shutdown;

pub use engine::{SyncEngine, SyncSummary, default_workers};
pub use error::SyncError;
pub use lister::list_all_ids;
pub use pool::{FailedMessage, Outcome, PoolReport, WorkerContext, run_pool};
pub use query::{QueryFilter, SyncMode, plan_query};
pub use reconcile::{ReconcileStats, detect_deletions, reconcile_deletions};
pub use retry::{RetryPolicy, with_retry};
pub use shutdown::{Interrupt, ShutdownCoordinator, ShutdownState};
