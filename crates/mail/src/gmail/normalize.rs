//! Gmail API response normalization
//!
//! Converts raw Gmail API messages to canonical [`Message`] records.

use base64::prelude::*;
use chrono::{DateTime, TimeZone, Utc};
use log::debug;

use super::api::{GmailMessage, MessagePart, MessagePayload};
use crate::models::{EmailAddress, Message, MessageId, ThreadId};

const HTML_WRAP_WIDTH: usize = 120;

/// A raw message that cannot be turned into a [`Message`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("message {0} has no payload")]
    MissingPayload(String),
    #[error("message {0} has no thread id")]
    MissingThreadId(String),
    #[error("message {0} has neither a parsable Date header nor an internal date")]
    MissingDate(String),
}

/// Normalize a Gmail API message
///
/// `indexed_at` becomes the row's `last_indexed`; the message's own date
/// (the `Date` header, falling back to Gmail's `internalDate`) becomes its
/// `timestamp`.
pub fn normalize_message(
    gmail_msg: GmailMessage,
    indexed_at: DateTime<Utc>,
) -> Result<Message, ParseError> {
    let id = MessageId::new(&gmail_msg.id);
    if gmail_msg.thread_id.is_empty() {
        return Err(ParseError::MissingThreadId(gmail_msg.id));
    }
    let thread_id = ThreadId::new(&gmail_msg.thread_id);

    let Some(payload) = gmail_msg.payload.as_ref() else {
        return Err(ParseError::MissingPayload(gmail_msg.id));
    };

    let sender = extract_header(payload, "From")
        .map(|s| EmailAddress::parse(&s))
        .unwrap_or_else(|| EmailAddress::new("unknown@unknown.com"));

    let address_list = |name: &str| {
        extract_header(payload, name)
            .map(|s| EmailAddress::parse_list(&s))
            .unwrap_or_default()
    };
    let to = address_list("To");
    let cc = address_list("Cc");
    let bcc = address_list("Bcc");

    let subject = extract_header(payload, "Subject").unwrap_or_default();

    let timestamp = extract_header(payload, "Date")
        .and_then(|d| parse_date_header(&d))
        .or_else(|| parse_internal_date(gmail_msg.internal_date.as_deref()))
        .ok_or_else(|| ParseError::MissingDate(gmail_msg.id.clone()))?;

    let body = extract_plain_text_body(payload)
        .or_else(|| extract_html_body(payload).map(|html| html_to_text(&html)))
        .unwrap_or_default();

    let size = gmail_msg
        .size_estimate
        .or_else(|| payload.body.as_ref().and_then(|b| b.size))
        .unwrap_or(0);

    let labels = gmail_msg.label_ids.unwrap_or_default();

    Ok(Message::builder(id, thread_id)
        .sender(sender)
        .to(to)
        .cc(cc)
        .bcc(bcc)
        .subject(subject)
        .body(body)
        .size(size)
        .timestamp(timestamp)
        .labels(labels)
        .last_indexed(indexed_at)
        .build())
}

/// Extract a header value by name
fn extract_header(payload: &MessagePayload, name: &str) -> Option<String> {
    payload.headers.as_ref()?.iter().find_map(|h| {
        if h.name.eq_ignore_ascii_case(name) {
            Some(h.value.clone())
        } else {
            None
        }
    })
}

/// Parse an RFC 2822 `Date` header
fn parse_date_header(value: &str) -> Option<DateTime<Utc>> {
    let secs = mailparse::dateparse(value).ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

/// Parse Gmail's internal date (milliseconds since epoch)
fn parse_internal_date(value: Option<&str>) -> Option<DateTime<Utc>> {
    let millis: i64 = value?.parse().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

/// Extract plain text body from message payload
fn extract_plain_text_body(payload: &MessagePayload) -> Option<String> {
    if let Some(body) = &payload.body
        && let Some(data) = &body.data
        && payload
            .mime_type
            .as_ref()
            .is_some_and(|m| m.starts_with("text/plain"))
    {
        return decode_base64_body(data);
    }

    if let Some(parts) = &payload.parts {
        return find_part(parts, "text/plain");
    }

    None
}

/// Extract HTML body from message payload
fn extract_html_body(payload: &MessagePayload) -> Option<String> {
    if let Some(body) = &payload.body
        && let Some(data) = &body.data
        && payload
            .mime_type
            .as_ref()
            .is_some_and(|m| m.starts_with("text/html"))
    {
        return decode_base64_body(data);
    }

    if let Some(parts) = &payload.parts {
        return find_part(parts, "text/html");
    }

    None
}

/// Recursively search message parts for the first body of `mime`
///
/// Attachments (parts with a filename) are skipped.
fn find_part(parts: &[MessagePart], mime: &str) -> Option<String> {
    for part in parts {
        let is_attachment = part.filename.as_ref().is_some_and(|f| !f.is_empty());
        if !is_attachment
            && part.mime_type.as_ref().is_some_and(|m| m.starts_with(mime))
            && let Some(body) = &part.body
            && let Some(data) = &body.data
            && let Some(text) = decode_base64_body(data)
        {
            return Some(text);
        }

        if let Some(nested) = &part.parts
            && let Some(text) = find_part(nested, mime)
        {
            return Some(text);
        }
    }

    None
}

/// Decode base64-encoded body data
///
/// Gmail uses URL-safe base64 but padding can vary, so we try multiple decoders.
fn decode_base64_body(data: &str) -> Option<String> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE};

    let decoders: &[&base64::engine::GeneralPurpose] =
        &[&BASE64_URL_SAFE_NO_PAD, &URL_SAFE, &STANDARD, &STANDARD_NO_PAD];

    for decoder in decoders {
        if let Ok(decoded) = decoder.decode(data) {
            return Some(String::from_utf8_lossy(&decoded).into_owned());
        }
    }

    None
}

/// Reduce an HTML body to readable text
///
/// Blank lines and trailing padding from the renderer are dropped. If the
/// document cannot be rendered the raw HTML is kept.
fn html_to_text(html: &str) -> String {
    match html2text::from_read(html.as_bytes(), HTML_WRAP_WIDTH) {
        Ok(text) => text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Err(e) => {
            debug!("Failed to render HTML body: {}", e);
            html.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmail::api::{Header, MessageBody};

    fn encode(s: &str) -> String {
        BASE64_URL_SAFE_NO_PAD.encode(s)
    }

    fn make_test_payload(headers: Vec<(&str, &str)>) -> MessagePayload {
        MessagePayload {
            headers: Some(headers.into_iter().map(|(n, v)| Header::new(n, v)).collect()),
            body: Some(MessageBody {
                size: Some(5),
                data: Some(encode("hello")),
            }),
            parts: None,
            mime_type: Some("text/plain".to_string()),
        }
    }

    fn make_gmail_message(payload: MessagePayload) -> GmailMessage {
        GmailMessage {
            id: "m1".to_string(),
            thread_id: "t1".to_string(),
            label_ids: Some(vec!["INBOX".to_string(), "UNREAD".to_string()]),
            internal_date: Some("1704844800000".to_string()),
            size_estimate: Some(1234),
            payload: Some(payload),
            ..Default::default()
        }
    }

    #[test]
    fn test_extract_header_case_insensitive() {
        let payload = make_test_payload(vec![("FROM", "test@example.com")]);
        assert_eq!(
            extract_header(&payload, "from"),
            Some("test@example.com".to_string())
        );
        assert_eq!(extract_header(&payload, "Cc"), None);
    }

    #[test]
    fn test_normalize_full_message() {
        let payload = make_test_payload(vec![
            ("From", "Alice <alice@example.com>"),
            ("To", "bob@example.com, \"Carol, C\" <carol@example.com>"),
            ("Cc", "dave@example.com"),
            ("Bcc", "erin@example.com"),
            ("Subject", "Quarterly numbers"),
            ("Date", "Tue, 9 Jan 2024 10:00:00 +0000 (UTC)"),
        ]);
        let indexed_at = Utc::now();
        let msg = normalize_message(make_gmail_message(payload), indexed_at).unwrap();

        assert_eq!(msg.message_id.as_str(), "m1");
        assert_eq!(msg.thread_id.as_str(), "t1");
        assert_eq!(msg.sender.name.as_deref(), Some("Alice"));
        assert_eq!(msg.recipients.to.len(), 2);
        assert_eq!(msg.recipients.to[1].name.as_deref(), Some("Carol, C"));
        assert_eq!(msg.recipients.cc[0].email, "dave@example.com");
        assert_eq!(msg.recipients.bcc[0].email, "erin@example.com");
        assert_eq!(msg.subject, "Quarterly numbers");
        assert_eq!(msg.body, "hello");
        assert_eq!(msg.size, 1234);
        assert_eq!(msg.timestamp.to_rfc3339(), "2024-01-09T10:00:00+00:00");
        assert_eq!(msg.last_indexed, indexed_at);
        assert!(!msg.is_read);
        assert!(!msg.is_outgoing);
        assert!(!msg.is_deleted);
    }

    #[test]
    fn test_timestamp_falls_back_to_internal_date() {
        let payload = make_test_payload(vec![("Date", "Tue, 9 Foo 2024 10:00:00 +0000")]);
        let msg = normalize_message(make_gmail_message(payload), Utc::now()).unwrap();
        assert_eq!(msg.timestamp.timestamp_millis(), 1_704_844_800_000);
    }

    #[test]
    fn test_missing_date_is_parse_error() {
        let payload = make_test_payload(vec![]);
        let mut raw = make_gmail_message(payload);
        raw.internal_date = None;
        assert_eq!(
            normalize_message(raw, Utc::now()),
            Err(ParseError::MissingDate("m1".to_string()))
        );
    }

    #[test]
    fn test_missing_payload_is_parse_error() {
        let mut raw = make_gmail_message(make_test_payload(vec![]));
        raw.payload = None;
        assert!(matches!(
            normalize_message(raw, Utc::now()),
            Err(ParseError::MissingPayload(_))
        ));
    }

    #[test]
    fn test_multipart_prefers_plain_text() {
        let payload = MessagePayload {
            headers: Some(vec![Header::new("Date", "Tue, 9 Jan 2024 10:00:00 +0000")]),
            body: None,
            mime_type: Some("multipart/alternative".to_string()),
            parts: Some(vec![
                MessagePart {
                    mime_type: Some("text/html".to_string()),
                    body: Some(MessageBody {
                        size: None,
                        data: Some(encode("<p>html</p>")),
                    }),
                    ..Default::default()
                },
                MessagePart {
                    mime_type: Some("text/plain".to_string()),
                    body: Some(MessageBody {
                        size: None,
                        data: Some(encode("plain")),
                    }),
                    ..Default::default()
                },
            ]),
        };
        let msg = normalize_message(make_gmail_message(payload), Utc::now()).unwrap();
        assert_eq!(msg.body, "plain");
    }

    #[test]
    fn test_html_only_body_is_stripped() {
        let payload = MessagePayload {
            headers: None,
            body: Some(MessageBody {
                size: None,
                data: Some(encode(
                    "<html><body><p>Hi &amp; welcome</p><p>Bye</p></body></html>",
                )),
            }),
            mime_type: Some("text/html".to_string()),
            parts: None,
        };
        let msg = normalize_message(make_gmail_message(payload), Utc::now()).unwrap();
        assert_eq!(msg.body, "Hi & welcome\nBye");
    }

    #[test]
    fn test_html_entities_are_decoded() {
        let text = html_to_text("<p>It&#8217;s &mdash; caf&eacute; &copy; 2024</p>");
        assert_eq!(text, "It\u{2019}s \u{2014} caf\u{e9} \u{a9} 2024");
        assert!(!text.contains('&'));
    }

    #[test]
    fn test_date_header_with_zone_comment_and_offset() {
        assert_eq!(
            parse_date_header("Tue, 9 Jan 2024 10:00:00 +0000 (UTC)"),
            Utc.with_ymd_and_hms(2024, 1, 9, 10, 0, 0).single()
        );
        assert_eq!(
            parse_date_header("Mon, 8 Jan 2024 19:30:00 -0800"),
            Utc.with_ymd_and_hms(2024, 1, 9, 3, 30, 0).single()
        );
        assert_eq!(parse_date_header("Tue, 9 Foo 2024 10:00:00 +0000"), None);
    }

    #[test]
    fn test_undisclosed_recipients_group_is_empty() {
        let payload = make_test_payload(vec![
            ("To", "undisclosed-recipients:;"),
            ("Bcc", "erin@example.com"),
        ]);
        let msg = normalize_message(make_gmail_message(payload), Utc::now()).unwrap();
        assert!(msg.recipients.to.is_empty());
        assert_eq!(msg.recipients.bcc, vec![EmailAddress::new("erin@example.com")]);
    }

    #[test]
    fn test_sent_label_marks_outgoing() {
        let mut raw = make_gmail_message(make_test_payload(vec![]));
        raw.label_ids = Some(vec!["SENT".to_string()]);
        let msg = normalize_message(raw, Utc::now()).unwrap();
        assert!(msg.is_outgoing);
        assert!(msg.is_read);
    }

    #[test]
    fn test_decode_base64_body() {
        let encoded = "SGVsbG8sIFdvcmxkIQ";
        assert_eq!(decode_base64_body(encoded), Some("Hello, World!".to_string()));
    }
}
