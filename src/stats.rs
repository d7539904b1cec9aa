//! Delivery counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the broker counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Publish calls accepted (including ones with no subscribers).
    pub published: u64,
    /// Frames queued to subscribers, live and replayed, first attempts only.
    pub delivered: u64,
    /// Frames refused because a subscriber channel was full.
    pub rejected: u64,
    /// Envelopes queued again after an ack timeout.
    pub redelivered: u64,
    pub acknowledged: u64,
    /// Pending envelopes dropped because their subscriber left.
    pub abandoned: u64,
    /// Pending envelopes dropped after reaching the attempt limit.
    pub expired: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub published: AtomicU64,
    pub delivered: AtomicU64,
    pub rejected: AtomicU64,
    pub redelivered: AtomicU64,
    pub acknowledged: AtomicU64,
    pub abandoned: AtomicU64,
    pub expired: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Take back a bump made ahead of an attempt that failed.
    pub(crate) fn unbump(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> BrokerStats {
        BrokerStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}
