//! In-memory storage implementation
//!
//! Mirrors the SQLite store's semantics without a database; used by tests.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use super::MailStore;
use crate::models::{Message, MessageId};

/// In-memory implementation of MailStore
///
/// A single RwLock over the whole map makes each call atomic.
pub struct InMemoryMailStore {
    messages: RwLock<HashMap<MessageId, Message>>,
}

impl InMemoryMailStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(HashMap::new()),
        }
    }

    fn ids_where(&self, deleted: bool) -> HashSet<MessageId> {
        let messages = self.messages.read().unwrap_or_else(|e| e.into_inner());
        messages
            .values()
            .filter(|m| m.is_deleted == deleted)
            .map(|m| m.message_id.clone())
            .collect()
    }
}

impl Default for InMemoryMailStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MailStore for InMemoryMailStore {
    fn upsert_message(&self, message: Message) -> Result<()> {
        let mut messages = self.messages.write().unwrap_or_else(|e| e.into_inner());
        match messages.get_mut(&message.message_id) {
            Some(existing) => {
                existing.labels = message.labels;
                existing.size = message.size;
                existing.is_read = message.is_read;
                existing.is_outgoing = message.is_outgoing;
                existing.is_deleted = false;
                existing.last_indexed = existing.last_indexed.max(message.last_indexed);
            }
            None => {
                let mut message = message;
                message.is_deleted = false;
                messages.insert(message.message_id.clone(), message);
            }
        }
        Ok(())
    }

    fn has_message(&self, id: &MessageId) -> Result<bool> {
        let messages = self.messages.read().unwrap_or_else(|e| e.into_inner());
        Ok(messages.contains_key(id))
    }

    fn get_message(&self, id: &MessageId) -> Result<Option<Message>> {
        let messages = self.messages.read().unwrap_or_else(|e| e.into_inner());
        Ok(messages.get(id).cloned())
    }

    fn apply_deletion_state(
        &self,
        deleted: &[MessageId],
        restored: &[MessageId],
        now: DateTime<Utc>,
    ) -> Result<(usize, usize)> {
        let mut messages = self.messages.write().unwrap_or_else(|e| e.into_inner());
        let mut mark = |ids: &[MessageId], is_deleted: bool| {
            let mut changed = 0;
            for id in ids {
                if let Some(message) = messages.get_mut(id) {
                    message.is_deleted = is_deleted;
                    message.last_indexed = message.last_indexed.max(now);
                    changed += 1;
                }
            }
            changed
        };
        let deleted = mark(deleted, true);
        let restored = mark(restored, false);
        Ok((deleted, restored))
    }

    fn get_watermark(&self) -> Result<Option<DateTime<Utc>>> {
        let messages = self.messages.read().unwrap_or_else(|e| e.into_inner());
        Ok(messages.values().map(|m| m.last_indexed).max())
    }

    fn get_active_ids(&self) -> Result<HashSet<MessageId>> {
        Ok(self.ids_where(false))
    }

    fn get_deleted_ids(&self) -> Result<HashSet<MessageId>> {
        Ok(self.ids_where(true))
    }

    fn count_messages(&self) -> Result<usize> {
        let messages = self.messages.read().unwrap_or_else(|e| e.into_inner());
        Ok(messages.len())
    }
}
