//! Gmail API HTTP client
//!
//! Implements [`MailboxApi`] over the Gmail REST API.
//! Uses synchronous HTTP (ureq) so calls can run on plain worker threads.
//! Every request carries its own timeout; retries are the caller's concern.

use std::time::Duration;

use log::debug;
use serde::de::DeserializeOwned;
use ureq::Agent;

use super::GmailAuth;
use super::api::{GmailMessage, ListMessagesResponse};
use crate::models::MessageId;
use crate::remote::{ApiError, IdPage, MailboxApi};
use crate::sync::QueryFilter;

/// Gmail API client
pub struct GmailClient {
    auth: GmailAuth,
    agent: Agent,
}

impl GmailClient {
    /// Gmail API base URL
    const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1";

    /// Largest page the list endpoint accepts
    const PAGE_SIZE: usize = 500;

    /// Create a new Gmail client with the default 30 second request timeout
    pub fn new(auth: GmailAuth) -> Self {
        Self::with_timeout(auth, Duration::from_secs(30))
    }

    /// Create a new Gmail client with an explicit per-request timeout
    pub fn with_timeout(auth: GmailAuth, timeout: Duration) -> Self {
        // Error statuses are classified from the response body below, so
        // they must not be turned into opaque errors by the agent.
        let config = Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();

        Self {
            auth,
            agent: Agent::new_with_config(config),
        }
    }

    /// Trigger authentication flow
    pub fn authenticate(&self) -> anyhow::Result<()> {
        self.auth.authenticate()
    }

    fn access_token(&self) -> Result<String, ApiError> {
        self.auth
            .get_access_token()
            .map_err(|e| ApiError::Auth(format!("{:#}", e)))
    }

    /// Issue a GET and decode the JSON body, classifying failures
    fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        let access_token = self.access_token()?;
        let url = format!("{}{}", Self::BASE_URL, path);

        let mut request = self
            .agent
            .get(&url)
            .header("Authorization", &format!("Bearer {}", access_token));
        for (key, value) in query {
            request = request.query(*key, *value);
        }

        let mut response = request.call().map_err(classify_transport_error)?;
        let status = response.status().as_u16();

        if status >= 400 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.body_mut().read_to_string().unwrap_or_default();
            return Err(ApiError::from_status(status, &body, retry_after));
        }

        response
            .body_mut()
            .read_json::<T>()
            .map_err(classify_transport_error)
    }
}

impl MailboxApi for GmailClient {
    fn list_ids_page(
        &self,
        filter: &QueryFilter,
        page_token: Option<&str>,
    ) -> Result<IdPage, ApiError> {
        let page_size = Self::PAGE_SIZE.to_string();
        let rendered = filter.to_gmail_query();

        let mut query = vec![("maxResults", page_size.as_str())];
        if let Some(q) = rendered.as_deref() {
            query.push(("q", q));
        }
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }

        let list: ListMessagesResponse = self.get_json("/users/me/messages", &query)?;
        debug!(
            "Listed {} message ids (estimate {:?})",
            list.messages.as_ref().map_or(0, Vec::len),
            list.result_size_estimate
        );

        Ok(IdPage {
            ids: list
                .messages
                .unwrap_or_default()
                .into_iter()
                .map(|m| MessageId::new(m.id))
                .collect(),
            next_page_token: list.next_page_token,
        })
    }

    fn get_message(&self, id: &MessageId) -> Result<GmailMessage, ApiError> {
        let path = format!("/users/me/messages/{}", urlencoding::encode(id.as_str()));
        self.get_json(&path, &[("format", "full")])
    }
}

/// Map a transport-level ureq error onto the retry taxonomy
fn classify_transport_error(err: ureq::Error) -> ApiError {
    match err {
        ureq::Error::StatusCode(status) => ApiError::from_status(status, "", None),
        ureq::Error::Timeout(t) => ApiError::Timeout(t.to_string()),
        ureq::Error::Io(e) => ApiError::Network(e.to_string()),
        ureq::Error::HostNotFound => ApiError::Network("host not found".to_string()),
        ureq::Error::ConnectionFailed => ApiError::Network("connection failed".to_string()),
        ureq::Error::Json(e) => ApiError::InvalidResponse(e.to_string()),
        other => ApiError::InvalidResponse(other.to_string()),
    }
}
