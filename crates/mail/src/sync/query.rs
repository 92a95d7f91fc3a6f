//! Listing filters derived from the local watermark

use std::fmt;

use chrono::{DateTime, Utc};

/// How a sync run chooses which remote messages to list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Only messages newer than the local watermark
    Incremental,
    /// Every message, followed by deletion reconciliation
    Full,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Incremental => write!(f, "incremental"),
            SyncMode::Full => write!(f, "full"),
        }
    }
}

/// Restriction applied to a remote listing
///
/// A filter holds at most one date predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryFilter {
    All,
    /// Messages at or after this instant, at whole-second precision
    After(DateTime<Utc>),
}

impl QueryFilter {
    /// Gmail search expression, or `None` for an unrestricted listing
    ///
    /// Sub-second precision is truncated, which can only widen the result.
    pub fn to_gmail_query(&self) -> Option<String> {
        match self {
            QueryFilter::All => None,
            QueryFilter::After(at) => Some(format!("after:{}", at.timestamp())),
        }
    }

    /// Whether a message dated `date` falls inside this filter
    pub fn matches(&self, date: DateTime<Utc>) -> bool {
        match self {
            QueryFilter::All => true,
            QueryFilter::After(at) => date.timestamp() >= at.timestamp(),
        }
    }
}

impl fmt::Display for QueryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryFilter::All => write!(f, "all messages"),
            QueryFilter::After(at) => write!(f, "after {}", at.to_rfc3339()),
        }
    }
}

/// Choose the listing filter for a run
///
/// Incremental runs list from the watermark; a full run, or a store with no
/// watermark yet, lists everything.
pub fn plan_query(watermark: Option<DateTime<Utc>>, mode: SyncMode) -> QueryFilter {
    match (mode, watermark) {
        (SyncMode::Incremental, Some(at)) => QueryFilter::After(at),
        _ => QueryFilter::All,
    }
}
