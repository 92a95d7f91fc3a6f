//! SQLite-based mail storage

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use rusqlite_migration::{M, Migrations};

use super::traits::MailStore;
use crate::models::{EmailAddress, Message, MessageId, Recipients, ThreadId};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            -- One row per mirrored message. sender, recipients and labels
            -- hold JSON; timestamps are fixed-width RFC 3339 UTC text so
            -- that text comparison matches chronological order.
            CREATE TABLE messages (
                message_id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                recipients TEXT NOT NULL,
                labels TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                timestamp TEXT NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0,
                is_outgoing INTEGER NOT NULL DEFAULT 0,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                last_indexed TEXT NOT NULL
            );

            CREATE INDEX idx_messages_last_indexed ON messages(last_indexed);
            CREATE INDEX idx_messages_thread_id ON messages(thread_id);
            CREATE INDEX idx_messages_timestamp ON messages(timestamp);
            CREATE INDEX idx_messages_is_deleted ON messages(is_deleted);
            "#,
        ),
    ])
}

/// Render a timestamp in the stored fixed-width form
fn encode_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid stored timestamp {:?}", s))
}

/// Columns as read from SQLite, before JSON and timestamp decoding
struct MessageRow {
    message_id: String,
    thread_id: String,
    sender: String,
    recipients: String,
    labels: String,
    subject: String,
    body: String,
    size: i64,
    timestamp: String,
    is_read: bool,
    is_outgoing: bool,
    is_deleted: bool,
    last_indexed: String,
}

impl MessageRow {
    const COLUMNS: &'static str = "message_id, thread_id, sender, recipients, labels, subject, \
         body, size, timestamp, is_read, is_outgoing, is_deleted, last_indexed";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            message_id: row.get(0)?,
            thread_id: row.get(1)?,
            sender: row.get(2)?,
            recipients: row.get(3)?,
            labels: row.get(4)?,
            subject: row.get(5)?,
            body: row.get(6)?,
            size: row.get(7)?,
            timestamp: row.get(8)?,
            is_read: row.get(9)?,
            is_outgoing: row.get(10)?,
            is_deleted: row.get(11)?,
            last_indexed: row.get(12)?,
        })
    }

    fn into_message(self) -> Result<Message> {
        let sender: EmailAddress =
            serde_json::from_str(&self.sender).context("Invalid sender JSON")?;
        let recipients: Recipients =
            serde_json::from_str(&self.recipients).context("Invalid recipients JSON")?;
        let labels: Vec<String> =
            serde_json::from_str(&self.labels).context("Invalid labels JSON")?;

        Ok(Message {
            message_id: MessageId::new(self.message_id),
            thread_id: ThreadId::new(self.thread_id),
            sender,
            recipients,
            labels,
            subject: self.subject,
            body: self.body,
            size: u64::try_from(self.size).unwrap_or(0),
            timestamp: decode_ts(&self.timestamp)?,
            is_read: self.is_read,
            is_outgoing: self.is_outgoing,
            is_deleted: self.is_deleted,
            last_indexed: decode_ts(&self.last_indexed)?,
        })
    }
}

/// SQLite-based mail storage
///
/// All access goes through one connection behind a mutex, which gives the
/// single-writer discipline the concurrent sync workers rely on.
pub struct SqliteMailStore {
    conn: Mutex<Connection>,
}

impl SqliteMailStore {
    /// Open (creating if needed) the database at `db_path` and migrate it
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        // WAL lets readers (e.g. ad-hoc SQL sessions) run during a sync;
        // NORMAL sync is safe with WAL.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
            "#,
        )?;

        Self::migrate(conn)
    }

    /// Open a private in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::migrate(conn)
    }

    fn migrate(mut conn: Connection) -> Result<Self> {
        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Database connection lock poisoned"))
    }

    fn ids_where_deleted(&self, deleted: bool) -> Result<HashSet<MessageId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT message_id FROM messages WHERE is_deleted = ?")?;
        let ids = stmt
            .query_map([deleted], |row| row.get::<_, String>(0))?
            .map(|r| r.map(MessageId::new))
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    }
}

impl MailStore for SqliteMailStore {
    fn upsert_message(&self, message: Message) -> Result<()> {
        let sender = serde_json::to_string(&message.sender)?;
        let recipients = serde_json::to_string(&message.recipients)?;
        let labels = serde_json::to_string(&message.labels)?;

        let conn = self.conn()?;
        // Immutable content columns are deliberately absent from the
        // DO UPDATE list.
        conn.execute(
            "INSERT INTO messages
             (message_id, thread_id, sender, recipients, labels, subject, body,
              size, timestamp, is_read, is_outgoing, is_deleted, last_indexed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12)
             ON CONFLICT(message_id) DO UPDATE SET
                labels = excluded.labels,
                size = excluded.size,
                is_read = excluded.is_read,
                is_outgoing = excluded.is_outgoing,
                is_deleted = 0,
                last_indexed = MAX(messages.last_indexed, excluded.last_indexed)",
            params![
                message.message_id.as_str(),
                message.thread_id.as_str(),
                sender,
                recipients,
                labels,
                message.subject,
                message.body,
                i64::try_from(message.size).unwrap_or(i64::MAX),
                encode_ts(&message.timestamp),
                message.is_read,
                message.is_outgoing,
                encode_ts(&message.last_indexed),
            ],
        )
        .with_context(|| format!("Failed to upsert message {}", message.message_id))?;

        Ok(())
    }

    fn has_message(&self, id: &MessageId) -> Result<bool> {
        let conn = self.conn()?;
        let exists = conn
            .query_row(
                "SELECT 1 FROM messages WHERE message_id = ?",
                [id.as_str()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        Ok(exists)
    }

    fn get_message(&self, id: &MessageId) -> Result<Option<Message>> {
        let row = {
            let conn = self.conn()?;
            conn.query_row(
                &format!(
                    "SELECT {} FROM messages WHERE message_id = ?",
                    MessageRow::COLUMNS
                ),
                [id.as_str()],
                MessageRow::from_row,
            )
            .optional()?
        };

        row.map(MessageRow::into_message).transpose()
    }

    fn apply_deletion_state(
        &self,
        deleted: &[MessageId],
        restored: &[MessageId],
        now: DateTime<Utc>,
    ) -> Result<(usize, usize)> {
        if deleted.is_empty() && restored.is_empty() {
            return Ok((0, 0));
        }

        let now = encode_ts(&now);
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut changed = (0, 0);
        {
            let mut stmt = tx.prepare(
                "UPDATE messages
                 SET is_deleted = ?1, last_indexed = MAX(last_indexed, ?2)
                 WHERE message_id = ?3",
            )?;
            for id in deleted {
                changed.0 += stmt.execute(params![true, now, id.as_str()])?;
            }
            for id in restored {
                changed.1 += stmt.execute(params![false, now, id.as_str()])?;
            }
        }
        // Dropping an uncommitted transaction rolls back both batches
        tx.commit().context("Failed to commit deletion state")?;

        Ok(changed)
    }

    fn get_watermark(&self) -> Result<Option<DateTime<Utc>>> {
        let max: Option<String> = {
            let conn = self.conn()?;
            conn.query_row("SELECT MAX(last_indexed) FROM messages", [], |row| {
                row.get(0)
            })?
        };

        max.as_deref().map(decode_ts).transpose()
    }

    fn get_active_ids(&self) -> Result<HashSet<MessageId>> {
        self.ids_where_deleted(false)
    }

    fn get_deleted_ids(&self) -> Result<HashSet<MessageId>> {
        self.ids_where_deleted(true)
    }

    fn count_messages(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn make_message(id: &str, timestamp: DateTime<Utc>, last_indexed: DateTime<Utc>) -> Message {
        Message::builder(MessageId::new(id), ThreadId::new("t1"))
            .sender(EmailAddress::with_name("Alice", "alice@example.com"))
            .to(vec![EmailAddress::new("bob@example.com")])
            .bcc(vec![EmailAddress::new("carol@example.com")])
            .labels(vec!["INBOX".to_string(), "UNREAD".to_string()])
            .subject("Hello")
            .body("Body text")
            .size(42)
            .timestamp(timestamp)
            .last_indexed(last_indexed)
            .build()
    }

    #[test]
    fn test_upsert_and_get_round_trips_structured_fields() {
        let store = SqliteMailStore::in_memory().unwrap();
        let msg = make_message("m1", at(2023, 5, 1), at(2024, 1, 1));
        store.upsert_message(msg.clone()).unwrap();

        let loaded = store.get_message(&MessageId::new("m1")).unwrap().unwrap();
        assert_eq!(loaded, msg);
        assert!(store.has_message(&MessageId::new("m1")).unwrap());
        assert!(!store.has_message(&MessageId::new("m2")).unwrap());
    }

    #[test]
    fn test_watermark_uses_last_indexed_not_timestamp() {
        let store = SqliteMailStore::in_memory().unwrap();
        assert_eq!(store.get_watermark().unwrap(), None);

        store
            .upsert_message(make_message("old", at(2022, 1, 1), at(2024, 6, 1)))
            .unwrap();
        store
            .upsert_message(make_message("new", at(2024, 5, 1), at(2024, 5, 2)))
            .unwrap();

        assert_eq!(store.get_watermark().unwrap(), Some(at(2024, 6, 1)));
    }

    #[test]
    fn test_refresh_keeps_content_and_never_moves_last_indexed_back() {
        let store = SqliteMailStore::in_memory().unwrap();
        store
            .upsert_message(make_message("m1", at(2023, 5, 1), at(2024, 3, 1)))
            .unwrap();

        let mut refreshed = make_message("m1", at(2020, 1, 1), at(2024, 2, 1));
        refreshed.subject = "Changed".to_string();
        refreshed.labels = vec!["INBOX".to_string()];
        refreshed.is_read = true;
        store.upsert_message(refreshed).unwrap();

        let loaded = store.get_message(&MessageId::new("m1")).unwrap().unwrap();
        assert_eq!(loaded.subject, "Hello");
        assert_eq!(loaded.timestamp, at(2023, 5, 1));
        assert_eq!(loaded.labels, vec!["INBOX".to_string()]);
        assert!(loaded.is_read);
        assert_eq!(loaded.last_indexed, at(2024, 3, 1));
        assert_eq!(store.count_messages().unwrap(), 1);
    }

    #[test]
    fn test_deletion_state_and_resurrect() {
        let store = SqliteMailStore::in_memory().unwrap();
        for id in ["a", "b", "c"] {
            store
                .upsert_message(make_message(id, at(2023, 1, 1), at(2024, 1, 1)))
                .unwrap();
        }

        let changed = store
            .apply_deletion_state(
                &[MessageId::new("b"), MessageId::new("zz")],
                &[],
                at(2024, 2, 1),
            )
            .unwrap();
        assert_eq!(changed, (1, 0));

        let active = store.get_active_ids().unwrap();
        assert_eq!(active.len(), 2);
        assert!(!active.contains(&MessageId::new("b")));
        assert_eq!(
            store.get_deleted_ids().unwrap(),
            HashSet::from([MessageId::new("b")])
        );
        assert_eq!(store.get_watermark().unwrap(), Some(at(2024, 2, 1)));

        let changed = store
            .apply_deletion_state(&[MessageId::new("c")], &[MessageId::new("b")], at(2024, 3, 1))
            .unwrap();
        assert_eq!(changed, (1, 1));
        let b = store.get_message(&MessageId::new("b")).unwrap().unwrap();
        assert!(!b.is_deleted);
        assert_eq!(b.last_indexed, at(2024, 3, 1));
        assert_eq!(
            store.get_deleted_ids().unwrap(),
            HashSet::from([MessageId::new("c")])
        );
        assert_eq!(store.count_messages().unwrap(), 3);
    }

    #[test]
    fn test_failed_restore_rolls_back_deletions() {
        let store = SqliteMailStore::in_memory().unwrap();
        for id in ["a", "b"] {
            store
                .upsert_message(make_message(id, at(2023, 1, 1), at(2024, 1, 1)))
                .unwrap();
        }
        store
            .apply_deletion_state(&[MessageId::new("b")], &[], at(2024, 2, 1))
            .unwrap();
        store
            .conn()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER refuse_restore BEFORE UPDATE OF is_deleted ON messages
                 WHEN OLD.is_deleted = 1 AND NEW.is_deleted = 0
                 BEGIN SELECT RAISE(ABORT, 'restore refused'); END;",
            )
            .unwrap();

        let result =
            store.apply_deletion_state(&[MessageId::new("a")], &[MessageId::new("b")], at(2024, 3, 1));

        assert!(result.is_err());
        assert_eq!(
            store.get_active_ids().unwrap(),
            HashSet::from([MessageId::new("a")])
        );
        assert_eq!(store.get_watermark().unwrap(), Some(at(2024, 2, 1)));
    }

    #[test]
    fn test_file_database_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.db");
        {
            let store = SqliteMailStore::new(&path).unwrap();
            store
                .upsert_message(make_message("m1", at(2023, 1, 1), at(2024, 1, 1)))
                .unwrap();
        }
        let store = SqliteMailStore::new(&path).unwrap();
        assert_eq!(store.count_messages().unwrap(), 1);
        assert_eq!(store.get_watermark().unwrap(), Some(at(2024, 1, 1)));
    }
}
