//! Message model representing a mirrored Gmail message

use chrono::{DateTime, Utc};
use log::debug;
use mailparse::{MailAddr, SingleInfo};
use serde::{Deserialize, Serialize};

use super::LabelId;

/// Unique identifier for a message (Gmail message ID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a conversation (Gmail thread ID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ThreadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An email address with optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    /// Display name (e.g., "John Doe")
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com")
    pub email: String,
}

impl EmailAddress {
    /// Create a new email address with just the email
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Create a new email address with a display name
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }

    /// Parse a single address such as `John Doe <john@example.com>`
    ///
    /// Falls back to the trimmed input as a bare address when the header does
    /// not parse.
    pub fn parse(s: &str) -> Self {
        Self::parse_list(s)
            .into_iter()
            .next()
            .unwrap_or_else(|| Self::new(s.trim()))
    }

    /// Parse an RFC 5322 address-list header
    ///
    /// Group members are flattened into the list; an empty group such as
    /// `undisclosed-recipients:;` contributes nothing. A malformed header
    /// yields no addresses.
    pub fn parse_list(s: &str) -> Vec<Self> {
        let list = match mailparse::addrparse(s) {
            Ok(list) => list,
            Err(e) => {
                debug!("Unparsable address header {:?}: {}", s, e);
                return Vec::new();
            }
        };

        let mut addresses = Vec::new();
        for addr in list.iter() {
            match addr {
                MailAddr::Single(info) => addresses.push(Self::from(info)),
                MailAddr::Group(group) => addresses.extend(group.addrs.iter().map(Self::from)),
            }
        }
        addresses
    }
}

impl From<&SingleInfo> for EmailAddress {
    fn from(info: &SingleInfo) -> Self {
        Self {
            name: info
                .display_name
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string),
            email: info.addr.clone(),
        }
    }
}

/// Recipients grouped by header role
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipients {
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
}

/// Canonical record of one mirrored mailbox item
///
/// `timestamp` is the message's own date and never changes once stored.
/// `last_indexed` records when the sync engine last created or reconciled the
/// row; it only ever moves forward and is the sole source of the incremental
/// sync watermark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub thread_id: ThreadId,
    pub sender: EmailAddress,
    pub recipients: Recipients,
    /// Gmail label IDs in the order the API returned them
    pub labels: Vec<String>,
    pub subject: String,
    /// Plain text body
    pub body: String,
    /// Size in bytes as reported by the server
    pub size: u64,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
    pub is_outgoing: bool,
    pub is_deleted: bool,
    pub last_indexed: DateTime<Utc>,
}

impl Message {
    /// Create a new message builder
    pub fn builder(message_id: MessageId, thread_id: ThreadId) -> MessageBuilder {
        MessageBuilder::new(message_id, thread_id)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// Builder for creating Message instances
///
/// `is_read` and `is_outgoing` are derived from the labels at build time
/// unless set explicitly.
pub struct MessageBuilder {
    message_id: MessageId,
    thread_id: ThreadId,
    sender: Option<EmailAddress>,
    recipients: Recipients,
    labels: Vec<String>,
    subject: String,
    body: String,
    size: u64,
    timestamp: Option<DateTime<Utc>>,
    is_read: Option<bool>,
    is_outgoing: Option<bool>,
    is_deleted: bool,
    last_indexed: Option<DateTime<Utc>>,
}

impl MessageBuilder {
    fn new(message_id: MessageId, thread_id: ThreadId) -> Self {
        Self {
            message_id,
            thread_id,
            sender: None,
            recipients: Recipients::default(),
            labels: Vec::new(),
            subject: String::new(),
            body: String::new(),
            size: 0,
            timestamp: None,
            is_read: None,
            is_outgoing: None,
            is_deleted: false,
            last_indexed: None,
        }
    }

    pub fn sender(mut self, sender: EmailAddress) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn to(mut self, to: Vec<EmailAddress>) -> Self {
        self.recipients.to = to;
        self
    }

    pub fn cc(mut self, cc: Vec<EmailAddress>) -> Self {
        self.recipients.cc = cc;
        self
    }

    pub fn bcc(mut self, bcc: Vec<EmailAddress>) -> Self {
        self.recipients.bcc = bcc;
        self
    }

    pub fn labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn is_read(mut self, is_read: bool) -> Self {
        self.is_read = Some(is_read);
        self
    }

    pub fn is_outgoing(mut self, is_outgoing: bool) -> Self {
        self.is_outgoing = Some(is_outgoing);
        self
    }

    pub fn is_deleted(mut self, is_deleted: bool) -> Self {
        self.is_deleted = is_deleted;
        self
    }

    pub fn last_indexed(mut self, last_indexed: DateTime<Utc>) -> Self {
        self.last_indexed = Some(last_indexed);
        self
    }

    pub fn build(self) -> Message {
        let has = |label: &str| self.labels.iter().any(|l| l == label);
        let is_read = self.is_read.unwrap_or_else(|| !has(LabelId::UNREAD));
        let is_outgoing = self.is_outgoing.unwrap_or_else(|| has(LabelId::SENT));
        let now = Utc::now();

        Message {
            message_id: self.message_id,
            thread_id: self.thread_id,
            sender: self
                .sender
                .unwrap_or_else(|| EmailAddress::new("unknown@unknown.com")),
            recipients: self.recipients,
            labels: self.labels,
            subject: self.subject,
            body: self.body,
            size: self.size,
            timestamp: self.timestamp.unwrap_or(now),
            is_read,
            is_outgoing,
            is_deleted: self.is_deleted,
            last_indexed: self.last_indexed.unwrap_or(now),
        }
    }
}
