//! Paginated ID listing

use std::collections::HashSet;

use log::debug;

use super::error::SyncError;
use super::query::QueryFilter;
use super::retry::{RetryPolicy, with_retry};
use super::shutdown::{Interrupt, ShutdownCoordinator};
use crate::models::MessageId;
use crate::remote::MailboxApi;

/// Follow pagination until exhausted and return every matching ID
///
/// IDs are deduplicated, keeping first-seen order. The listing succeeds or
/// fails as a unit: a page that still fails after retries discards the pages
/// already collected, and a shutdown request aborts between pages.
pub fn list_all_ids(
    api: &dyn MailboxApi,
    filter: &QueryFilter,
    policy: &RetryPolicy,
    shutdown: &ShutdownCoordinator,
) -> Result<Vec<MessageId>, SyncError> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    let mut page_token: Option<String> = None;
    let mut pages = 0usize;

    loop {
        if shutdown.is_stopping() {
            return Err(SyncError::Interrupted { phase: "listing" });
        }

        let page = with_retry(
            "Listing messages",
            policy,
            shutdown,
            Interrupt::OnShutdown,
            || api.list_ids_page(filter, page_token.as_deref()),
        );
        let page = match page {
            Ok(page) => page,
            Err(_) if shutdown.is_stopping() => {
                return Err(SyncError::Interrupted { phase: "listing" });
            }
            Err(e) => return Err(SyncError::Listing(e)),
        };
        pages += 1;

        for id in page.ids {
            if seen.insert(id.clone()) {
                ids.push(id);
            }
        }
        debug!("Listed page {} ({} unique IDs so far)", pages, ids.len());

        match page.next_page_token {
            Some(token) if !token.is_empty() => page_token = Some(token),
            _ => break,
        }
    }

    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{ApiError, IdPage, InMemoryMailbox};
    use crate::gmail::api::GmailMessage;
    use chrono::{TimeZone, Utc};

    fn mailbox_with(count: usize, page_size: usize) -> InMemoryMailbox {
        let mailbox = InMemoryMailbox::new().with_page_size(page_size);
        for i in 0..count {
            let date = Utc.with_ymd_and_hms(2024, 1, 1 + i as u32, 0, 0, 0).unwrap();
            mailbox.insert_simple(&format!("m{i:02}"), date);
        }
        mailbox
    }

    #[test]
    fn test_follows_pagination() {
        let mailbox = mailbox_with(7, 3);
        let shutdown = ShutdownCoordinator::new();
        let ids = list_all_ids(&mailbox, &QueryFilter::All, &RetryPolicy::fast(), &shutdown)
            .unwrap();
        assert_eq!(ids.len(), 7);
        assert_eq!(mailbox.list_calls(), 3);
    }

    #[test]
    fn test_empty_listing() {
        let mailbox = InMemoryMailbox::new();
        let shutdown = ShutdownCoordinator::new();
        let ids = list_all_ids(&mailbox, &QueryFilter::All, &RetryPolicy::fast(), &shutdown)
            .unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn test_transient_page_failure_is_retried() {
        let mailbox = mailbox_with(6, 2);
        mailbox.fail_list_page_times(1, ApiError::rate_limited("quota"), 2);
        let shutdown = ShutdownCoordinator::new();
        let ids = list_all_ids(&mailbox, &QueryFilter::All, &RetryPolicy::fast(), &shutdown)
            .unwrap();
        assert_eq!(ids.len(), 6);
    }

    #[test]
    fn test_persistent_page_failure_fails_the_listing() {
        let mailbox = mailbox_with(6, 2);
        mailbox.fail_list_page(2, ApiError::Server {
            status: 500,
            message: "backend error".into(),
        });
        let shutdown = ShutdownCoordinator::new();
        let result = list_all_ids(&mailbox, &QueryFilter::All, &RetryPolicy::fast(), &shutdown);
        assert!(matches!(result, Err(SyncError::Listing(ApiError::Server { .. }))));
    }

    #[test]
    fn test_shutdown_aborts_listing() {
        let mailbox = mailbox_with(3, 1);
        let shutdown = ShutdownCoordinator::new();
        shutdown.request_shutdown();
        let result = list_all_ids(&mailbox, &QueryFilter::All, &RetryPolicy::fast(), &shutdown);
        assert!(matches!(result, Err(SyncError::Interrupted { .. })));
        assert_eq!(mailbox.list_calls(), 0);
    }

    /// Serves the same ID on two pages
    struct OverlappingPages;

    impl MailboxApi for OverlappingPages {
        fn list_ids_page(
            &self,
            _filter: &QueryFilter,
            page_token: Option<&str>,
        ) -> Result<IdPage, ApiError> {
            Ok(match page_token {
                None => IdPage {
                    ids: vec![MessageId::new("a"), MessageId::new("b")],
                    next_page_token: Some("2".into()),
                },
                Some(_) => IdPage {
                    ids: vec![MessageId::new("b"), MessageId::new("c")],
                    next_page_token: None,
                },
            })
        }

        fn get_message(&self, id: &MessageId) -> Result<GmailMessage, ApiError> {
            Err(ApiError::NotFound(id.to_string()))
        }
    }

    #[test]
    fn test_duplicates_across_pages_are_removed() {
        let shutdown = ShutdownCoordinator::new();
        let ids = list_all_ids(
            &OverlappingPages,
            &QueryFilter::All,
            &RetryPolicy::fast(),
            &shutdown,
        )
        .unwrap();
        assert_eq!(
            ids,
            vec![MessageId::new("a"), MessageId::new("b"), MessageId::new("c")]
        );
    }
}
