//! Bounded worker pool that fetches, parses and persists messages
//!
//! A fixed number of runners pull IDs from a shared queue. Each runner asks
//! the shutdown coordinator before taking another ID, so a drain stops new
//! work without touching messages already in flight. The driver thread
//! tallies outcomes and gives up waiting as soon as a forced stop arrives.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use std::vec;

use chrono::Utc;
use log::{debug, info, warn};

use super::retry::{RetryPolicy, with_retry};
use super::shutdown::{Interrupt, ShutdownCoordinator};
use crate::gmail::normalize_message;
use crate::models::MessageId;
use crate::remote::MailboxApi;
use crate::storage::MailStore;

const PROGRESS_EVERY: usize = 100;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shared dependencies for every runner
pub struct WorkerContext {
    pub api: Arc<dyn MailboxApi>,
    pub store: Arc<dyn MailStore>,
    pub policy: RetryPolicy,
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Re-fetch even if the message is already stored
    pub force: bool,
}

/// Result of processing one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Fetched,
    Skipped,
    Failed(String),
    /// Dropped at a checkpoint after a forced stop
    Abandoned,
}

/// A message that could not be synced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedMessage {
    pub id: MessageId,
    pub reason: String,
}

/// Tally of a pool run
///
/// `fetched + skipped + failed + abandoned == dispatched` and
/// `dispatched + not_started == submitted`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolReport {
    pub submitted: usize,
    pub dispatched: usize,
    pub fetched: usize,
    pub skipped: usize,
    pub failed: usize,
    pub abandoned: usize,
    pub not_started: usize,
    pub failures: Vec<FailedMessage>,
}

impl PoolReport {
    fn completed(&self) -> usize {
        self.fetched + self.skipped + self.failed + self.abandoned
    }

    fn record(&mut self, id: MessageId, outcome: Outcome) {
        match outcome {
            Outcome::Fetched => self.fetched += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Abandoned => self.abandoned += 1,
            Outcome::Failed(reason) => {
                self.failed += 1;
                self.failures.push(FailedMessage { id, reason });
            }
        }
    }
}

struct Queue {
    ids: vec::IntoIter<MessageId>,
    dispatched: usize,
}

fn lock_queue(queue: &Mutex<Queue>) -> MutexGuard<'_, Queue> {
    queue.lock().unwrap_or_else(|e| e.into_inner())
}

impl WorkerContext {
    /// Fetch, parse and persist a single message
    pub fn process(&self, id: &MessageId) -> Outcome {
        if !self.force {
            match self.store.has_message(id) {
                Ok(true) => return Outcome::Skipped,
                Ok(false) => {}
                Err(e) => return Outcome::Failed(format!("checking local store: {e:#}")),
            }
        }

        let raw = match with_retry(
            &format!("Fetching message {id}"),
            &self.policy,
            &self.shutdown,
            Interrupt::OnForceStop,
            || self.api.get_message(id),
        ) {
            Ok(raw) => raw,
            Err(e) if self.shutdown.is_force_stopping() => {
                debug!("Abandoning message {} after fetch error: {}", id, e);
                return Outcome::Abandoned;
            }
            Err(e) => return Outcome::Failed(format!("fetch: {e}")),
        };

        if self.shutdown.is_force_stopping() {
            return Outcome::Abandoned;
        }

        let message = match normalize_message(raw, Utc::now()) {
            Ok(message) => message,
            Err(e) => return Outcome::Failed(format!("parse: {e}")),
        };

        if self.shutdown.is_force_stopping() {
            return Outcome::Abandoned;
        }

        match self.store.upsert_message(message) {
            Ok(()) => Outcome::Fetched,
            Err(e) => Outcome::Failed(format!("persist: {e:#}")),
        }
    }
}

fn run_worker(ctx: &WorkerContext, queue: &Mutex<Queue>, events: Sender<(MessageId, Outcome)>) {
    loop {
        let id = {
            let mut queue = lock_queue(queue);
            if !ctx.shutdown.should_dispatch() {
                break;
            }
            match queue.ids.next() {
                Some(id) => {
                    queue.dispatched += 1;
                    id
                }
                None => break,
            }
        };

        let outcome = ctx.process(&id);
        match &outcome {
            Outcome::Failed(reason) => warn!("Failed to sync message {}: {}", id, reason),
            Outcome::Abandoned => debug!("Abandoned message {}", id),
            _ => {}
        }

        if events.send((id, outcome)).is_err() {
            break;
        }
    }
}

/// Process `ids` with up to `workers` concurrent runners
///
/// Returns after every dispatched message completes, or immediately once a
/// forced stop is observed; in-flight messages are then counted as abandoned.
pub fn run_pool(
    ctx: Arc<WorkerContext>,
    ids: Vec<MessageId>,
    workers: usize,
) -> anyhow::Result<PoolReport> {
    let mut report = PoolReport {
        submitted: ids.len(),
        ..PoolReport::default()
    };
    if ids.is_empty() {
        return Ok(report);
    }

    let workers = workers.clamp(1, ids.len());
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("sync-worker-{i}"))
        .build()?;

    let queue = Arc::new(Mutex::new(Queue {
        ids: ids.into_iter(),
        dispatched: 0,
    }));
    let (tx, rx) = mpsc::channel();

    for _ in 0..workers {
        let ctx = Arc::clone(&ctx);
        let queue = Arc::clone(&queue);
        let tx = tx.clone();
        pool.spawn(move || run_worker(&ctx, &queue, tx));
    }
    drop(tx);

    let mut forced = false;
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok((id, outcome)) => {
                report.record(id, outcome);
                let done = report.completed();
                if done % PROGRESS_EVERY == 0 {
                    info!(
                        "Progress: {}/{} messages ({} fetched, {} skipped, {} failed)",
                        done, report.submitted, report.fetched, report.skipped, report.failed
                    );
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if ctx.shutdown.is_force_stopping() {
            forced = true;
            break;
        }
    }

    if forced {
        // Late results that already arrived still count
        while let Ok((id, outcome)) = rx.try_recv() {
            report.record(id, outcome);
        }
    }

    // Holding the queue lock means no runner is between its dispatch check
    // and its counter update.
    report.dispatched = lock_queue(&queue).dispatched;
    report.not_started = report.submitted - report.dispatched;
    let in_flight = report.dispatched.saturating_sub(report.completed());
    if in_flight > 0 {
        warn!("Stopped without waiting for {} in-flight messages", in_flight);
        report.abandoned += in_flight;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{ApiError, InMemoryMailbox};
    use crate::storage::InMemoryMailStore;
    use chrono::TimeZone;

    fn context(mailbox: Arc<InMemoryMailbox>, force: bool) -> (Arc<WorkerContext>, Arc<InMemoryMailStore>) {
        let store = Arc::new(InMemoryMailStore::new());
        let ctx = Arc::new(WorkerContext {
            api: mailbox,
            store: store.clone(),
            policy: RetryPolicy::fast(),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            force,
        });
        (ctx, store)
    }

    fn mailbox(count: usize) -> (Arc<InMemoryMailbox>, Vec<MessageId>) {
        let mailbox = InMemoryMailbox::new();
        let mut ids = Vec::new();
        for i in 0..count {
            let id = format!("m{i:03}");
            mailbox.insert_simple(&id, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
            ids.push(MessageId::new(id));
        }
        (Arc::new(mailbox), ids)
    }

    #[test]
    fn test_all_messages_are_fetched() {
        let (mailbox, ids) = mailbox(25);
        let (ctx, store) = context(mailbox, false);

        let report = run_pool(ctx, ids, 4).unwrap();

        assert_eq!(report.fetched, 25);
        assert_eq!(report.dispatched, 25);
        assert_eq!(report.not_started, 0);
        assert_eq!(store.count_messages().unwrap(), 25);
    }

    #[test]
    fn test_existing_messages_are_skipped() {
        let (mailbox, ids) = mailbox(5);
        let (ctx, _store) = context(mailbox.clone(), false);
        run_pool(ctx.clone(), ids.clone(), 2).unwrap();

        let report = run_pool(ctx, ids, 2).unwrap();

        assert_eq!(report.skipped, 5);
        assert_eq!(report.fetched, 0);
        assert_eq!(mailbox.fetch_calls(), 5);
    }

    #[test]
    fn test_force_refetches_stored_messages() {
        let (mailbox, ids) = mailbox(3);
        let (ctx, _store) = context(mailbox.clone(), true);
        run_pool(ctx.clone(), ids.clone(), 2).unwrap();

        let report = run_pool(ctx, ids, 2).unwrap();

        assert_eq!(report.fetched, 3);
        assert_eq!(mailbox.fetch_calls(), 6);
    }

    #[test]
    fn test_one_failure_does_not_stop_the_rest() {
        let (mailbox, ids) = mailbox(10);
        mailbox.fail_fetch("m004", ApiError::NotFound("gone".into()));
        let (ctx, store) = context(mailbox, false);

        let report = run_pool(ctx, ids, 3).unwrap();

        assert_eq!(report.fetched, 9);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].id, MessageId::new("m004"));
        assert_eq!(store.count_messages().unwrap(), 9);
    }

    #[test]
    fn test_unparseable_message_counts_as_failed() {
        let (mailbox, ids) = mailbox(2);
        let mut broken = crate::remote::simple_message("m001", Utc::now());
        broken.payload = None;
        mailbox.insert(broken);
        let (ctx, _store) = context(mailbox, false);

        let report = run_pool(ctx, ids, 2).unwrap();

        assert_eq!(report.fetched, 1);
        assert_eq!(report.failed, 1);
    }

    #[test]
    fn test_drain_before_start_dispatches_nothing() {
        let (mailbox, ids) = mailbox(4);
        let (ctx, store) = context(mailbox, false);
        ctx.shutdown.request_shutdown();

        let report = run_pool(ctx, ids, 2).unwrap();

        assert_eq!(report.dispatched, 0);
        assert_eq!(report.not_started, 4);
        assert_eq!(store.count_messages().unwrap(), 0);
    }

    #[test]
    fn test_empty_input() {
        let (mailbox, _) = mailbox(0);
        let (ctx, _store) = context(mailbox, false);
        let report = run_pool(ctx, Vec::new(), 4).unwrap();
        assert_eq!(report, PoolReport::default());
    }
}
