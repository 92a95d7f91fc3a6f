//! Sync commands: incremental/full sync, single-message refresh and
//! deletion-only reconciliation

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::Utc;
use log::info;

use super::error::SyncError;
use super::lister::list_all_ids;
use super::pool::{FailedMessage, PoolReport, WorkerContext, run_pool};
use super::query::{SyncMode, plan_query};
use super::reconcile::{detect_deletions, reconcile_deletions};
use super::retry::RetryPolicy;
use super::shutdown::ShutdownCoordinator;
use crate::models::MessageId;
use crate::remote::MailboxApi;
use crate::storage::MailStore;

/// Statistics from a sync command
#[derive(Debug, Default, Clone)]
pub struct SyncSummary {
    /// IDs returned by the remote listing
    pub listed: usize,
    /// IDs handed to the worker pool
    pub submitted: usize,
    pub fetched: usize,
    pub skipped: usize,
    pub failed: usize,
    /// In flight when a forced stop arrived
    pub abandoned: usize,
    /// Never dispatched because of a shutdown request
    pub not_started: usize,
    pub deleted: usize,
    pub restored: usize,
    /// At least one interrupt arrived during the run
    pub interrupted: bool,
    /// A second interrupt forced the stop
    pub forced: bool,
    pub failures: Vec<FailedMessage>,
    pub duration_ms: u64,
}

impl SyncSummary {
    fn absorb(&mut self, report: PoolReport) {
        self.submitted += report.submitted;
        self.fetched += report.fetched;
        self.skipped += report.skipped;
        self.failed += report.failed;
        self.abandoned += report.abandoned;
        self.not_started += report.not_started;
        self.failures.extend(report.failures);
    }

    fn log(&self, command: &str) {
        let status = if self.forced {
            "force-stopped"
        } else if self.interrupted {
            "interrupted"
        } else {
            "complete"
        };
        info!(
            "{} {} in {}ms: {} listed, {} fetched, {} skipped, {} failed, {} deleted, {} restored, {} not started, {} abandoned",
            command,
            status,
            self.duration_ms,
            self.listed,
            self.fetched,
            self.skipped,
            self.failed,
            self.deleted,
            self.restored,
            self.not_started,
            self.abandoned
        );
    }
}

/// Worker count when none is configured
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Drives sync commands against a mailbox and a local store
pub struct SyncEngine {
    api: Arc<dyn MailboxApi>,
    store: Arc<dyn MailStore>,
    policy: RetryPolicy,
    workers: usize,
}

impl SyncEngine {
    pub fn new(api: Arc<dyn MailboxApi>, store: Arc<dyn MailStore>) -> Self {
        Self {
            api,
            store,
            policy: RetryPolicy::api(),
            workers: default_workers(),
        }
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Incremental or full sync
    ///
    /// Incremental runs list only messages newer than the watermark. Full runs
    /// list everything, reconcile deletions against that listing, then fetch
    /// whatever is missing locally.
    pub fn sync(
        &self,
        mode: SyncMode,
        shutdown: &Arc<ShutdownCoordinator>,
    ) -> Result<SyncSummary, SyncError> {
        let start = Instant::now();
        let result = self.run_sync(mode, shutdown);
        finish_run("Sync", shutdown, start, result)
    }

    /// Re-fetch one message regardless of whether it is stored
    pub fn sync_message(
        &self,
        id: &MessageId,
        shutdown: &Arc<ShutdownCoordinator>,
    ) -> Result<SyncSummary, SyncError> {
        let start = Instant::now();
        let result = self.run_sync_message(id, shutdown);
        finish_run("Message refresh", shutdown, start, result)
    }

    /// Reconcile deletion flags without fetching any messages
    pub fn sync_deleted_messages(
        &self,
        shutdown: &Arc<ShutdownCoordinator>,
    ) -> Result<SyncSummary, SyncError> {
        let start = Instant::now();
        let result = detect_deletions(self.api.as_ref(), self.store.as_ref(), &self.policy, shutdown)
            .map(|stats| SyncSummary {
                deleted: stats.deleted,
                restored: stats.restored,
                ..SyncSummary::default()
            });
        finish_run("Deletion sync", shutdown, start, result)
    }

    fn run_sync(
        &self,
        mode: SyncMode,
        shutdown: &Arc<ShutdownCoordinator>,
    ) -> Result<SyncSummary, SyncError> {
        if shutdown.is_stopping() {
            return Err(SyncError::Interrupted { phase: "planning" });
        }

        let watermark = self.store.get_watermark().context("reading watermark")?;
        let filter = plan_query(watermark, mode);
        info!(
            "Starting {} sync ({}) with {} workers",
            mode, filter, self.workers
        );

        let ids = list_all_ids(self.api.as_ref(), &filter, &self.policy, shutdown)?;
        info!("Listed {} messages", ids.len());

        let mut summary = SyncSummary {
            listed: ids.len(),
            ..SyncSummary::default()
        };

        if mode == SyncMode::Full {
            if shutdown.is_stopping() {
                return Err(SyncError::Interrupted {
                    phase: "reconciliation",
                });
            }
            let remote: HashSet<MessageId> = ids.iter().cloned().collect();
            let stats = reconcile_deletions(self.store.as_ref(), &remote, Utc::now())?;
            summary.deleted = stats.deleted;
            summary.restored = stats.restored;
        }

        let report = self.run_workers(ids, false, shutdown)?;
        summary.absorb(report);
        Ok(summary)
    }

    fn run_sync_message(
        &self,
        id: &MessageId,
        shutdown: &Arc<ShutdownCoordinator>,
    ) -> Result<SyncSummary, SyncError> {
        if shutdown.is_stopping() {
            return Err(SyncError::Interrupted { phase: "fetch" });
        }

        info!("Refreshing message {}", id);
        let report = self.run_workers(vec![id.clone()], true, shutdown)?;
        if let Some(failure) = report.failures.first() {
            return Err(SyncError::Message {
                id: failure.id.clone(),
                reason: failure.reason.clone(),
            });
        }

        let mut summary = SyncSummary {
            listed: 1,
            ..SyncSummary::default()
        };
        summary.absorb(report);
        Ok(summary)
    }

    fn run_workers(
        &self,
        ids: Vec<MessageId>,
        force: bool,
        shutdown: &Arc<ShutdownCoordinator>,
    ) -> Result<PoolReport, SyncError> {
        let ctx = Arc::new(WorkerContext {
            api: Arc::clone(&self.api),
            store: Arc::clone(&self.store),
            policy: self.policy.clone(),
            shutdown: Arc::clone(shutdown),
            force,
        });
        let report = run_pool(ctx, ids, self.workers).context("starting worker pool")?;
        Ok(report)
    }
}

/// Stop the coordinator and fold its state into the outcome
///
/// An interrupt during listing or planning is not an error: nothing was
/// written, and the run reports an empty interrupted summary.
fn finish_run(
    command: &str,
    shutdown: &ShutdownCoordinator,
    start: Instant,
    result: Result<SyncSummary, SyncError>,
) -> Result<SyncSummary, SyncError> {
    shutdown.finish();

    let mut summary = match result {
        Ok(summary) => summary,
        Err(SyncError::Interrupted { phase }) => {
            info!("{} interrupted during {}; no changes written", command, phase);
            SyncSummary::default()
        }
        Err(e) => return Err(e),
    };
    summary.interrupted = shutdown.was_interrupted();
    summary.forced = shutdown.was_forced();
    summary.duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    summary.log(command);
    Ok(summary)
}
