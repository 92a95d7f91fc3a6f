//! In-memory mailbox
//!
//! A [`MailboxApi`] backed by a map of raw messages, with hooks for injecting
//! failures and for holding fetches open. Used by tests and dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, RwLock};

use chrono::{DateTime, TimeZone, Utc};

use super::{ApiError, IdPage, MailboxApi};
use crate::gmail::api::{GmailMessage, Header, MessageBody, MessagePayload};
use crate::models::MessageId;
use crate::sync::QueryFilter;

/// An injected failure
#[derive(Debug, Clone)]
struct Fault {
    error: ApiError,
    /// Remaining times to fail; `None` fails forever
    remaining: Option<u32>,
}

impl Fault {
    /// Consume one occurrence, returning the error if it still applies
    fn trip(&mut self) -> Option<ApiError> {
        match &mut self.remaining {
            None => Some(self.error.clone()),
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some(self.error.clone())
            }
        }
    }
}

/// Blocks fetches until opened
#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

/// In-memory implementation of MailboxApi
pub struct InMemoryMailbox {
    /// Ordered by ID so paging is deterministic
    messages: RwLock<BTreeMap<String, GmailMessage>>,
    page_size: usize,
    fetch_faults: Mutex<HashMap<String, Fault>>,
    /// Keyed by zero-based page index
    list_faults: Mutex<HashMap<usize, Fault>>,
    gate: Option<Gate>,
    list_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    fetches_waiting: AtomicUsize,
}

impl InMemoryMailbox {
    /// Create an empty mailbox
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(BTreeMap::new()),
            page_size: 500,
            fetch_faults: Mutex::new(HashMap::new()),
            list_faults: Mutex::new(HashMap::new()),
            gate: None,
            list_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            fetches_waiting: AtomicUsize::new(0),
        }
    }

    /// Serve listings in pages of `page_size` IDs
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Hold every fetch until [`open_gate`](Self::open_gate) is called
    pub fn with_fetch_gate(mut self) -> Self {
        self.gate = Some(Gate::default());
        self
    }

    /// Add or replace a raw message
    pub fn insert(&self, message: GmailMessage) {
        let mut messages = self.messages.write().unwrap_or_else(|e| e.into_inner());
        messages.insert(message.id.clone(), message);
    }

    /// Add a minimal well-formed message dated `date`
    pub fn insert_simple(&self, id: &str, date: DateTime<Utc>) {
        self.insert(simple_message(id, date));
    }

    /// Remove a message, as if it was deleted remotely
    pub fn remove(&self, id: &str) {
        let mut messages = self.messages.write().unwrap_or_else(|e| e.into_inner());
        messages.remove(id);
    }

    /// Fail every fetch of `id` with `error`
    pub fn fail_fetch(&self, id: &str, error: ApiError) {
        self.add_fetch_fault(id, error, None);
    }

    /// Fail the next `times` fetches of `id` with `error`, then succeed
    pub fn fail_fetch_times(&self, id: &str, error: ApiError, times: u32) {
        self.add_fetch_fault(id, error, Some(times));
    }

    /// Fail every request for listing page `page` with `error`
    pub fn fail_list_page(&self, page: usize, error: ApiError) {
        let mut faults = self.list_faults.lock().unwrap_or_else(|e| e.into_inner());
        faults.insert(
            page,
            Fault {
                error,
                remaining: None,
            },
        );
    }

    /// Fail the next `times` requests for listing page `page`, then succeed
    pub fn fail_list_page_times(&self, page: usize, error: ApiError, times: u32) {
        let mut faults = self.list_faults.lock().unwrap_or_else(|e| e.into_inner());
        faults.insert(
            page,
            Fault {
                error,
                remaining: Some(times),
            },
        );
    }

    /// Release all held and future fetches
    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            let mut open = gate.open.lock().unwrap_or_else(|e| e.into_inner());
            *open = true;
            gate.cond.notify_all();
        }
    }

    /// Number of fetches currently held at the gate
    pub fn fetches_waiting(&self) -> usize {
        self.fetches_waiting.load(Ordering::SeqCst)
    }

    /// Number of listing requests served (including failed ones)
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Number of fetch requests served (including failed ones)
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn add_fetch_fault(&self, id: &str, error: ApiError, remaining: Option<u32>) {
        let mut faults = self.fetch_faults.lock().unwrap_or_else(|e| e.into_inner());
        faults.insert(id.to_string(), Fault { error, remaining });
    }

    fn wait_at_gate(&self) {
        let Some(gate) = &self.gate else {
            return;
        };
        self.fetches_waiting.fetch_add(1, Ordering::SeqCst);
        let mut open = gate.open.lock().unwrap_or_else(|e| e.into_inner());
        while !*open {
            open = gate.cond.wait(open).unwrap_or_else(|e| e.into_inner());
        }
        self.fetches_waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for InMemoryMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl MailboxApi for InMemoryMailbox {
    fn list_ids_page(
        &self,
        filter: &QueryFilter,
        page_token: Option<&str>,
    ) -> Result<IdPage, ApiError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let offset: usize = match page_token {
            Some(token) => token
                .parse()
                .map_err(|_| ApiError::BadRequest {
                    status: 400,
                    message: format!("invalid page token {token}"),
                })?,
            None => 0,
        };
        let page_index = offset / self.page_size;

        {
            let mut faults = self.list_faults.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(error) = faults.get_mut(&page_index).and_then(Fault::trip) {
                return Err(error);
            }
        }

        let messages = self.messages.read().unwrap_or_else(|e| e.into_inner());
        let matching: Vec<&GmailMessage> = messages
            .values()
            .filter(|m| filter.matches(message_date(m)))
            .collect();

        let ids = matching
            .iter()
            .skip(offset)
            .take(self.page_size)
            .map(|m| MessageId::new(&m.id))
            .collect();
        let next_offset = offset + self.page_size;
        let next_page_token = (next_offset < matching.len()).then(|| next_offset.to_string());

        Ok(IdPage {
            ids,
            next_page_token,
        })
    }

    fn get_message(&self, id: &MessageId) -> Result<GmailMessage, ApiError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.wait_at_gate();

        {
            let mut faults = self.fetch_faults.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(error) = faults.get_mut(id.as_str()).and_then(Fault::trip) {
                return Err(error);
            }
        }

        let messages = self.messages.read().unwrap_or_else(|e| e.into_inner());
        messages
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("message {id}")))
    }
}

/// Date used for filter matching, from Gmail's internal date
fn message_date(message: &GmailMessage) -> DateTime<Utc> {
    message
        .internal_date
        .as_deref()
        .and_then(|d| d.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Build a minimal well-formed raw message
pub fn simple_message(id: &str, date: DateTime<Utc>) -> GmailMessage {
    use base64::prelude::*;

    let body = format!("Body of {id}");
    GmailMessage {
        id: id.to_string(),
        thread_id: format!("thread-{id}"),
        label_ids: Some(vec!["INBOX".to_string(), "UNREAD".to_string()]),
        snippet: body.clone(),
        internal_date: Some(date.timestamp_millis().to_string()),
        size_estimate: Some(body.len() as u64 + 200),
        history_id: None,
        payload: Some(MessagePayload {
            headers: Some(vec![
                Header::new("From", "Sender <sender@example.com>"),
                Header::new("To", "me@example.com"),
                Header::new("Subject", format!("Subject {id}")),
                Header::new("Date", date.to_rfc2822()),
            ]),
            body: Some(MessageBody {
                size: Some(body.len() as u64),
                data: Some(BASE64_URL_SAFE_NO_PAD.encode(&body)),
            }),
            parts: None,
            mime_type: Some("text/plain".to_string()),
        }),
    }
}
