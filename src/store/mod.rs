//! Durable message stores used for replay.
//!
//! The broker only needs three capabilities from a store: append a
//! published message, read back a topic's messages newer than a cursor,
//! and drop messages past the retention window. Two engines ship here:
//!
//! - [`MemoryStore`]: in-process, for tests and ephemeral brokers
//! - [`LogStore`]: an append-only file with per-record checksums
//!
//! Writes go through a [`Persister`] thread so publishers never wait on
//! I/O, and a [`RetentionJob`] trims the store on a fixed interval.

mod log;
mod memory;
mod persister;
mod retention;

pub use log::LogStore;
pub use memory::MemoryStore;
pub use persister::Persister;
pub use retention::RetentionJob;

use crate::error::Result;
use crate::types::{StoredMessage, Timestamp};
use std::time::Duration;

/// Storage engine backing replay.
pub trait MessageStore: Send + Sync {
    /// Append a published message.
    fn insert(&self, message: &StoredMessage) -> Result<()>;

    /// Messages on `topic` with a timestamp strictly after `since`, in
    /// insertion order.
    fn query_since(&self, topic: &str, since: Timestamp) -> Result<Vec<StoredMessage>>;

    /// Remove messages older than `age`. Returns how many were removed.
    fn delete_older_than(&self, age: Duration) -> Result<usize>;
}
