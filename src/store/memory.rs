//! In-memory message store.

use crate::error::Result;
use crate::types::{StoredMessage, Timestamp};
use parking_lot::RwLock;
use std::time::Duration;

use super::MessageStore;

/// Keeps every message in a vector, oldest first.
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: RwLock<Vec<StoredMessage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }
}

impl MessageStore for MemoryStore {
    fn insert(&self, message: &StoredMessage) -> Result<()> {
        self.messages.write().push(message.clone());
        Ok(())
    }

    fn query_since(&self, topic: &str, since: Timestamp) -> Result<Vec<StoredMessage>> {
        Ok(self
            .messages
            .read()
            .iter()
            .filter(|m| m.topic == topic && m.timestamp > since)
            .cloned()
            .collect())
    }

    fn delete_older_than(&self, age: Duration) -> Result<usize> {
        let cutoff = Timestamp::now().before(age);
        let mut messages = self.messages.write();
        let before = messages.len();
        messages.retain(|m| m.timestamp >= cutoff);
        Ok(before - messages.len())
    }
}
