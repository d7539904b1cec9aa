//! Per-mode enqueue logic shared by live fan-out and replay.

use crate::ack::{AckSettings, AckTracker, DeliverError};
use crate::config::{BrokerConfig, DeliveryMode};
use crate::envelope::Envelope;
use crate::error::{BrokerError, Result};
use crate::stats::Counters;
use crate::subscriptions::{Delivery, Rejection, SubscriberChannel};
use crate::types::{MessageId, SubscriberId};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of delivering one message to a topic snapshot.
#[derive(Debug, Default)]
pub(crate) struct FanOut {
    pub delivered: usize,
    pub rejected: usize,
    /// Ids minted for this fan-out (at-least-once only).
    pub message_ids: Vec<MessageId>,
    /// Subscribers whose receiving side has gone away.
    pub gone: Vec<SubscriberId>,
}

/// Hands payloads to subscriber channels according to the delivery mode.
pub(crate) struct DeliveryEngine {
    mode: DeliveryMode,
    /// Present only in at-least-once mode.
    tracker: Option<AckTracker>,
    counters: Arc<Counters>,
}

impl DeliveryEngine {
    pub(crate) fn new(config: &BrokerConfig, counters: Arc<Counters>) -> Result<Self> {
        let tracker = match config.delivery {
            DeliveryMode::AtMostOnce => None,
            DeliveryMode::AtLeastOnce => Some(AckTracker::start(
                AckSettings {
                    timeout: config.ack_timeout,
                    codec: config.codec,
                    max_attempts: config.max_attempts,
                },
                Arc::clone(&counters),
            )?),
        };

        Ok(Self {
            mode: config.delivery,
            tracker,
            counters,
        })
    }

    pub(crate) fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub(crate) fn tracker(&self) -> Option<&AckTracker> {
        self.tracker.as_ref()
    }

    /// Queue one payload to one channel without blocking.
    ///
    /// At-least-once wraps it in an envelope under a fresh id and starts
    /// its ack timer; at-most-once queues the raw bytes.
    pub(crate) fn enqueue(
        &self,
        topic: &str,
        payload: &[u8],
        target: &Arc<SubscriberChannel>,
    ) -> std::result::Result<Option<MessageId>, DeliverError> {
        // Counted before the frame is visible to the subscriber
        Counters::bump(&self.counters.delivered);
        let result = match &self.tracker {
            Some(tracker) => tracker
                .deliver(Envelope::new(topic, payload), target)
                .map(Some),
            None => target
                .try_send(Delivery::Message(payload.to_vec()))
                .map(|()| None)
                .map_err(DeliverError::Rejected),
        };

        if result.is_err() {
            Counters::unbump(&self.counters.delivered);
        }
        result
    }

    /// Deliver to every target. A full channel only affects itself.
    ///
    /// An unencodable payload fails the whole fan-out; it fails identically
    /// for every target, so nothing has been queued when it is reported.
    pub(crate) fn fan_out(
        &self,
        topic: &str,
        payload: &[u8],
        targets: &[Arc<SubscriberChannel>],
    ) -> Result<FanOut> {
        let mut out = FanOut::default();

        for target in targets {
            match self.enqueue(topic, payload, target) {
                Ok(id) => {
                    out.delivered += 1;
                    out.message_ids.extend(id);
                }
                Err(DeliverError::Rejected(Rejection::Full)) => {
                    out.rejected += 1;
                    Counters::bump(&self.counters.rejected);
                    warn!(topic, subscriber = %target.id(), "subscriber channel full, message dropped");
                }
                Err(DeliverError::Rejected(Rejection::Closed)) => {
                    debug!(topic, subscriber = %target.id(), "subscriber gone");
                    out.gone.push(target.id());
                }
                Err(DeliverError::Unprocessable(e)) => {
                    warn!(topic, error = %e, "message cannot be enveloped");
                    return Err(e);
                }
            }
        }

        Ok(out)
    }

    /// Resolve a pending envelope.
    pub(crate) fn acknowledge(&self, id: &MessageId) -> Result<()> {
        match &self.tracker {
            Some(tracker) => tracker.acknowledge(id),
            None => Err(BrokerError::MessageNotFound(id.clone())),
        }
    }

    pub(crate) fn shutdown(&self) {
        if let Some(tracker) = &self.tracker {
            tracker.shutdown();
        }
    }
}
