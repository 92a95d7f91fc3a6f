//! Deletion reconciliation against a complete remote listing

use std::collections::HashSet;

use anyhow::Context;
use chrono::{DateTime, Utc};
use log::{info, warn};

use super::error::SyncError;
use super::lister::list_all_ids;
use super::query::QueryFilter;
use super::retry::RetryPolicy;
use super::shutdown::ShutdownCoordinator;
use crate::models::MessageId;
use crate::remote::MailboxApi;
use crate::storage::MailStore;

/// Rows whose deletion flag changed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    pub deleted: usize,
    pub restored: usize,
}

/// Bring local deletion flags in line with `remote_ids`
///
/// `remote_ids` must come from an unrestricted listing. Active rows missing
/// from it are marked deleted; deleted rows present in it are restored.
pub fn reconcile_deletions(
    store: &dyn MailStore,
    remote_ids: &HashSet<MessageId>,
    now: DateTime<Utc>,
) -> Result<ReconcileStats, SyncError> {
    let stats = apply_reconciliation(store, remote_ids, now).map_err(SyncError::Reconcile)?;
    info!(
        "Reconciled deletions: {} marked deleted, {} restored",
        stats.deleted, stats.restored
    );
    Ok(stats)
}

fn apply_reconciliation(
    store: &dyn MailStore,
    remote_ids: &HashSet<MessageId>,
    now: DateTime<Utc>,
) -> anyhow::Result<ReconcileStats> {
    let active = store
        .get_active_ids()
        .context("loading active message IDs")?;
    let deleted = store
        .get_deleted_ids()
        .context("loading deleted message IDs")?;

    let mut to_delete: Vec<MessageId> = active.difference(remote_ids).cloned().collect();
    let mut to_restore: Vec<MessageId> = deleted.intersection(remote_ids).cloned().collect();
    to_delete.sort();
    to_restore.sort();

    if remote_ids.is_empty() && !active.is_empty() {
        warn!(
            "Remote mailbox listed no messages; marking all {} local messages deleted",
            active.len()
        );
    }

    let (deleted, restored) = store
        .apply_deletion_state(&to_delete, &to_restore, now)
        .context("applying deletion state")?;

    Ok(ReconcileStats { deleted, restored })
}

/// List the whole remote mailbox, then reconcile
///
/// Nothing is written unless the listing completes.
pub fn detect_deletions(
    api: &dyn MailboxApi,
    store: &dyn MailStore,
    policy: &RetryPolicy,
    shutdown: &ShutdownCoordinator,
) -> Result<ReconcileStats, SyncError> {
    let ids = list_all_ids(api, &QueryFilter::All, policy, shutdown)?;
    if shutdown.is_stopping() {
        return Err(SyncError::Interrupted {
            phase: "reconciliation",
        });
    }
    let remote: HashSet<MessageId> = ids.into_iter().collect();
    reconcile_deletions(store, &remote, Utc::now())
}
