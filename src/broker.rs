//! The broker object handed to transports.

use crate::config::{BrokerConfig, DeliveryMode, EmptyTopicPolicy, ReplayConfig};
use crate::delivery::DeliveryEngine;
use crate::ack::DeliverError;
use crate::error::{BrokerError, Result};
use crate::stats::{BrokerStats, Counters};
use crate::store::{MemoryStore, MessageStore, Persister, RetentionJob};
use crate::subscriptions::{ReplaySummary, SubscriberChannel, SubscriptionHandle, SubscriptionRegistry};
use crate::types::{MessageId, StoredMessage, SubscriberId, Timestamp};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a publish accomplished.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishReceipt {
    pub topic: String,
    /// Subscribers the message was queued to.
    pub delivered: usize,
    /// One id per delivery in at-least-once mode, empty otherwise.
    pub message_ids: Vec<MessageId>,
}

/// Topic-based publish/subscribe broker.
///
/// Construct one per process (or per test) and share it by reference or
/// `Arc`. All operations are safe to call concurrently.
///
/// # Example
///
/// ```ignore
/// let broker = Broker::new(BrokerConfig::at_least_once(Duration::from_secs(5)))?;
/// let sub = broker.subscribe("t", None)?;
///
/// broker.publish("t", br#"{"value":1}"#.to_vec())?;
///
/// let envelope = sub.recv()?.decode_envelope(EnvelopeCodec::Json)?;
/// broker.acknowledge(&envelope.id)?;
/// ```
pub struct Broker {
    config: BrokerConfig,
    registry: SubscriptionRegistry,
    engine: DeliveryEngine,
    /// Replay source; present when replay is configured.
    store: Option<Arc<dyn MessageStore>>,
    persister: Option<Persister>,
    retention: Option<RetentionJob>,
    counters: Arc<Counters>,
    shutting_down: AtomicBool,
}

impl Broker {
    /// Create a broker. With `config.replay` set, messages are kept in an
    /// in-memory store for replay.
    pub fn new(config: BrokerConfig) -> Result<Self> {
        let store: Option<Arc<dyn MessageStore>> = match config.replay {
            Some(_) => Some(Arc::new(MemoryStore::new())),
            None => None,
        };
        Self::build(config, store)
    }

    /// Create a broker persisting to and replaying from `store`.
    ///
    /// Replay is enabled even if `config.replay` is unset, with default
    /// retention settings.
    pub fn with_store(mut config: BrokerConfig, store: Arc<dyn MessageStore>) -> Result<Self> {
        if config.replay.is_none() {
            config.replay = Some(ReplayConfig::default());
        }
        Self::build(config, Some(store))
    }

    fn build(config: BrokerConfig, store: Option<Arc<dyn MessageStore>>) -> Result<Self> {
        config.validate()?;

        let counters = Arc::new(Counters::default());
        let engine = DeliveryEngine::new(&config, Arc::clone(&counters))?;

        let (persister, retention) = match (&store, &config.replay) {
            (Some(store), Some(replay)) => (
                Some(Persister::start(Arc::clone(store), replay.persist_queue_capacity)?),
                Some(RetentionJob::start(
                    Arc::clone(store),
                    replay.deletion_interval,
                    replay.retention,
                )?),
            ),
            _ => (None, None),
        };

        info!(
            mode = ?config.delivery,
            ack_timeout = ?config.ack_timeout,
            replay = store.is_some(),
            "broker started"
        );

        Ok(Self {
            registry: SubscriptionRegistry::new(config.channel_capacity),
            config,
            engine,
            store,
            persister,
            retention,
            counters,
            shutting_down: AtomicBool::new(false),
        })
    }

    // --- Transport operations ---

    /// Deliver `payload` to every current subscriber of `topic`.
    ///
    /// Never blocks on subscribers. If some subscriber channels are full the
    /// others still receive the message and `CapacityExceeded` reports how
    /// many were refused. With no subscribers this is a no-op unless the
    /// config rejects empty topics.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<PublishReceipt> {
        self.ensure_running()?;
        let payload = payload.into();
        Counters::bump(&self.counters.published);

        if let Some(ref persister) = self.persister {
            persister.submit(StoredMessage::new(topic, payload.clone(), Timestamp::now()));
        }

        let targets = self.registry.snapshot(topic);
        if targets.is_empty() {
            return match self.config.empty_topic {
                EmptyTopicPolicy::Ignore => {
                    debug!(topic, "no subscribers");
                    Ok(PublishReceipt {
                        topic: topic.to_string(),
                        delivered: 0,
                        message_ids: Vec::new(),
                    })
                }
                EmptyTopicPolicy::Reject => Err(BrokerError::NoSubscribers(topic.to_string())),
            };
        }

        let fan_out = self.engine.fan_out(topic, &payload, &targets)?;
        drop(targets);

        for id in &fan_out.gone {
            self.registry.unsubscribe(topic, *id);
        }

        if fan_out.rejected > 0 {
            return Err(BrokerError::CapacityExceeded {
                topic: topic.to_string(),
                rejected: fan_out.rejected,
                delivered: fan_out.delivered,
            });
        }

        Ok(PublishReceipt {
            topic: topic.to_string(),
            delivered: fan_out.delivered,
            message_ids: fan_out.message_ids,
        })
    }

    /// Attach a new subscriber to `topic`.
    ///
    /// With `since` set and replay enabled, stored messages newer than
    /// `since` are queued first, in store order, before the channel starts
    /// receiving live messages. Replay stops at the first full channel;
    /// `handle.replay` tells what happened.
    pub fn subscribe(&self, topic: &str, since: Option<Timestamp>) -> Result<SubscriptionHandle> {
        self.ensure_running()?;
        let (channel, mut handle) = self.registry.open(topic);

        if let Some(since) = since {
            handle.replay = self.replay(topic, since, &channel);
        }

        self.registry.attach(channel);
        Ok(handle)
    }

    /// Detach a subscriber and close its channel. Safe to repeat.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.registry.unsubscribe(&handle.topic, handle.id)
    }

    /// Detach by topic and subscriber id.
    pub fn unsubscribe_id(&self, topic: &str, id: SubscriberId) -> bool {
        self.registry.unsubscribe(topic, id)
    }

    /// Resolve a pending at-least-once delivery.
    pub fn acknowledge(&self, id: &MessageId) -> Result<()> {
        self.engine.acknowledge(id)
    }

    // --- Introspection ---

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.engine.mode()
    }

    /// Replay store, if any.
    pub fn store(&self) -> Option<&Arc<dyn MessageStore>> {
        self.store.as_ref()
    }

    pub fn topic_count(&self) -> usize {
        self.registry.topic_count()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.registry.subscriber_count(topic)
    }

    /// Envelopes awaiting acknowledgment (always 0 in at-most-once mode).
    pub fn pending_count(&self) -> usize {
        self.engine.tracker().map_or(0, |t| t.pending_count())
    }

    pub fn stats(&self) -> BrokerStats {
        self.counters.snapshot()
    }

    /// Stop background threads and close every subscription.
    ///
    /// Queued persistence writes are flushed first. Later calls fail with
    /// `ShuttingDown`.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(ref retention) = self.retention {
            retention.stop();
        }
        self.engine.shutdown();
        if let Some(ref persister) = self.persister {
            persister.shutdown();
        }
        self.registry.close_all();

        info!("broker stopped");
    }

    // --- Private Helpers ---

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            Err(BrokerError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Queue stored messages into a channel that is not yet live.
    ///
    /// Runs without any registry lock held; store errors are logged and
    /// leave the subscription live-only.
    fn replay(&self, topic: &str, since: Timestamp, channel: &Arc<SubscriberChannel>) -> ReplaySummary {
        let mut summary = ReplaySummary::default();
        let Some(ref store) = self.store else {
            return summary;
        };

        let messages = match store.query_since(topic, since) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(topic, error = %e, "replay query failed, subscribing live only");
                return summary;
            }
        };

        let total = messages.len();
        for message in messages {
            match self.engine.enqueue(topic, &message.payload, channel) {
                Ok(_) => summary.replayed += 1,
                Err(DeliverError::Unprocessable(e)) => {
                    summary.skipped += 1;
                    warn!(topic, error = %e, "stored message cannot be enveloped, skipped");
                }
                Err(DeliverError::Rejected(_)) => {
                    summary.truncated = true;
                    warn!(
                        topic,
                        replayed = summary.replayed,
                        total,
                        "subscriber channel filled during replay, rest skipped"
                    );
                    break;
                }
            }
        }

        debug!(topic, replayed = summary.replayed, "replay finished");
        summary
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
