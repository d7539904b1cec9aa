//! Topic-indexed registry of subscriber channels.

use crate::types::SubscriberId;
use crossbeam_channel::bounded;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::types::{ReplaySummary, SubscriberChannel, SubscriptionHandle};

/// Attached channels by topic, in subscribe order.
///
/// Shared with every handle through a `Weak`, so a dropped handle can
/// detach itself.
#[derive(Default)]
pub(crate) struct TopicTable {
    topics: RwLock<HashMap<String, Vec<Arc<SubscriberChannel>>>>,
}

impl TopicTable {
    /// Detach and close a channel. Returns true if it was attached to `topic`.
    pub(crate) fn remove(&self, topic: &str, id: SubscriberId) -> bool {
        let mut topics = self.topics.write();
        let Some(subs) = topics.get_mut(topic) else {
            return false;
        };
        let Some(pos) = subs.iter().position(|ch| ch.id() == id) else {
            return false;
        };

        let channel = subs.remove(pos);
        channel.close();
        if subs.is_empty() {
            topics.remove(topic);
        }

        debug!(topic, subscriber = %id, "subscriber detached");
        true
    }
}

/// Maps topic names to the channels attached to them.
///
/// Snapshots for fan-out take the shared lock, so publishes to different
/// topics do not contend. Attaching and detaching take the exclusive lock.
pub(crate) struct SubscriptionRegistry {
    table: Arc<TopicTable>,
    /// Counter for generating subscriber IDs.
    next_id: AtomicU64,
    /// Capacity of every channel created here.
    capacity: usize,
}

impl SubscriptionRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            table: Arc::new(TopicTable::default()),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    /// Create a channel for `topic` without attaching it.
    ///
    /// Nothing published reaches it until `attach`; used to run catch-up
    /// before the channel goes live.
    pub(crate) fn open(&self, topic: &str) -> (Arc<SubscriberChannel>, SubscriptionHandle) {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.capacity);

        let channel = Arc::new(SubscriberChannel::new(id, topic.to_string(), sender));
        let handle = SubscriptionHandle::new(id, topic.to_string(), receiver, Arc::downgrade(&self.table));

        (channel, handle)
    }

    /// Append an opened channel to its topic's list.
    pub(crate) fn attach(&self, channel: Arc<SubscriberChannel>) {
        debug!(topic = channel.topic(), subscriber = %channel.id(), "subscriber attached");
        self.table
            .topics
            .write()
            .entry(channel.topic().to_string())
            .or_default()
            .push(channel);
    }

    /// Create and attach a channel in one step.
    #[cfg(test)]
    pub(crate) fn subscribe(&self, topic: &str) -> SubscriptionHandle {
        let (channel, handle) = self.open(topic);
        self.attach(channel);
        handle
    }

    /// Detach and close a channel. Safe to call more than once.
    ///
    /// Returns true if the channel was attached to `topic`.
    pub(crate) fn unsubscribe(&self, topic: &str, id: SubscriberId) -> bool {
        self.table.remove(topic, id)
    }

    /// Current channels of `topic` for fan-out.
    pub(crate) fn snapshot(&self, topic: &str) -> Vec<Arc<SubscriberChannel>> {
        self.table
            .topics
            .read()
            .get(topic)
            .map(|subs| subs.clone())
            .unwrap_or_default()
    }

    /// Number of topics with at least one subscriber.
    pub(crate) fn topic_count(&self) -> usize {
        self.table.topics.read().len()
    }

    /// Number of channels attached to `topic`.
    pub(crate) fn subscriber_count(&self, topic: &str) -> usize {
        self.table.topics.read().get(topic).map_or(0, Vec::len)
    }

    /// Detach and close every channel.
    pub(crate) fn close_all(&self) {
        let drained: Vec<_> = self.table.topics.write().drain().collect();
        for (_, subs) in drained {
            for channel in subs {
                channel.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::types::{Delivery, Rejection};
    use std::time::Duration;

    #[test]
    fn test_subscribe_unsubscribe() {
        let registry = SubscriptionRegistry::new(10);

        let handle = registry.subscribe("news");
        assert_eq!(registry.subscriber_count("news"), 1);
        assert_eq!(registry.topic_count(), 1);

        assert!(registry.unsubscribe("news", handle.id));
        assert_eq!(registry.subscriber_count("news"), 0);
        assert_eq!(registry.topic_count(), 0);

        // Idempotent
        assert!(!registry.unsubscribe("news", handle.id));
    }

    #[test]
    fn test_unsubscribe_closes_receiver() {
        let registry = SubscriptionRegistry::new(10);
        let handle = registry.subscribe("news");

        registry.unsubscribe("news", handle.id);
        assert!(handle.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(handle.recv().is_err());
    }

    #[test]
    fn test_unsubscribe_wrong_topic_is_noop() {
        let registry = SubscriptionRegistry::new(10);
        let handle = registry.subscribe("news");

        assert!(!registry.unsubscribe("sports", handle.id));
        assert_eq!(registry.subscriber_count("news"), 1);
    }

    #[test]
    fn test_topics_are_case_sensitive() {
        let registry = SubscriptionRegistry::new(10);
        registry.subscribe("News");
        registry.subscribe("news");

        assert_eq!(registry.topic_count(), 2);
        assert_eq!(registry.subscriber_count("News"), 1);
        assert_eq!(registry.subscriber_count("NEWS"), 0);
    }

    #[test]
    fn test_snapshot_preserves_subscribe_order() {
        let registry = SubscriptionRegistry::new(10);
        let a = registry.subscribe("t");
        let b = registry.subscribe("t");
        let c = registry.subscribe("t");

        let ids: Vec<_> = registry.snapshot("t").iter().map(|ch| ch.id()).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);

        registry.unsubscribe("t", b.id);
        let ids: Vec<_> = registry.snapshot("t").iter().map(|ch| ch.id()).collect();
        assert_eq!(ids, vec![a.id, c.id]);
    }

    #[test]
    fn test_opened_channel_is_not_live_until_attached() {
        let registry = SubscriptionRegistry::new(10);
        let (channel, _handle) = registry.open("t");

        assert!(registry.snapshot("t").is_empty());
        registry.attach(channel);
        assert_eq!(registry.snapshot("t").len(), 1);
    }

    #[test]
    fn test_snapshot_outlives_unsubscribe() {
        let registry = SubscriptionRegistry::new(10);
        let handle = registry.subscribe("t");
        let snapshot = registry.snapshot("t");

        registry.unsubscribe("t", handle.id);

        let result = snapshot[0].try_send(Delivery::Message(b"late".to_vec()));
        assert_eq!(result, Err(Rejection::Closed));
    }

    #[test]
    fn test_close_all() {
        let registry = SubscriptionRegistry::new(10);
        let a = registry.subscribe("a");
        let b = registry.subscribe("b");

        registry.close_all();

        assert_eq!(registry.topic_count(), 0);
        assert!(a.recv().is_err());
        assert!(b.recv().is_err());
    }

    #[test]
    fn test_dropped_handle_detaches() {
        let registry = SubscriptionRegistry::new(10);

        for _ in 0..1000 {
            let handle = registry.subscribe("quiet");
            assert_eq!(registry.subscriber_count("quiet"), 1);
            drop(handle);
        }

        assert_eq!(registry.subscriber_count("quiet"), 0);
        assert_eq!(registry.topic_count(), 0);
    }

    #[test]
    fn test_dropped_handle_closes_snapshotted_channel() {
        let registry = SubscriptionRegistry::new(10);
        let handle = registry.subscribe("t");
        let snapshot = registry.snapshot("t");

        drop(handle);

        assert!(snapshot[0].is_closed());
        let result = snapshot[0].try_send(Delivery::Message(b"late".to_vec()));
        assert_eq!(result, Err(Rejection::Closed));
    }

    #[test]
    fn test_handle_outliving_registry() {
        let registry = SubscriptionRegistry::new(10);
        let handle = registry.subscribe("t");

        drop(registry);
        assert!(handle.recv().is_err());
        drop(handle);
    }
}
