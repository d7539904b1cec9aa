//! Pending-acknowledgment bookkeeping.

use crate::config::EnvelopeCodec;
use crate::envelope::Envelope;
use crate::error::{BrokerError, Result};
use crate::stats::Counters;
use crate::subscriptions::{Delivery, Rejection, SubscriberChannel};
use crate::types::MessageId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use super::scheduler::{RetryScheduler, Timer};

/// Settings the tracker needs from the broker config.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AckSettings {
    pub timeout: Duration,
    pub codec: EnvelopeCodec,
    pub max_attempts: Option<u32>,
}

/// A delivered envelope waiting for its acknowledgment.
struct PendingAck {
    envelope: Envelope,
    target: Arc<SubscriberChannel>,
    /// Successful enqueues so far, the first delivery included.
    attempts: u32,
    /// Bumped on every re-arm; timers carrying an older value are stale.
    generation: u64,
}

/// What a timer fire did to its entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FireOutcome {
    /// Entry gone or re-armed since; nothing to do.
    Stale,
    Redelivered,
    /// Channel still full; try again next cycle.
    StillFull,
    Abandoned,
    Expired,
}

struct Shared {
    pending: Mutex<HashMap<MessageId, PendingAck>>,
    settings: AckSettings,
    counters: Arc<Counters>,
}

/// Tracks at-least-once deliveries until they are acknowledged.
///
/// The timer thread and `acknowledge` mutate entries under the same lock,
/// so an acknowledgment racing a retry either removes the entry first (the
/// fire finds nothing) or waits until the retry has been queued.
pub(crate) struct AckTracker {
    shared: Arc<Shared>,
    scheduler: RetryScheduler,
}

impl AckTracker {
    pub(crate) fn start(settings: AckSettings, counters: Arc<Counters>) -> Result<Self> {
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            settings,
            counters,
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let scheduler = RetryScheduler::start(move |timer| {
            let shared = weak.upgrade()?;
            shared.on_timer(timer)
        })?;

        Ok(Self { shared, scheduler })
    }

    /// Queue an envelope to `target` and start tracking it.
    ///
    /// The entry is registered while the pending lock is held, so an
    /// acknowledgment can never observe the frame before its entry exists.
    pub(crate) fn deliver(
        &self,
        envelope: Envelope,
        target: &Arc<SubscriberChannel>,
    ) -> std::result::Result<MessageId, DeliverError> {
        let frame = envelope
            .encode(self.shared.settings.codec)
            .map_err(DeliverError::Unprocessable)?;

        let id = envelope.id.clone();
        let generation = 0;
        {
            let mut pending = self.shared.pending.lock();
            target
                .try_send(Delivery::Envelope(frame))
                .map_err(DeliverError::Rejected)?;
            pending.insert(
                id.clone(),
                PendingAck {
                    envelope,
                    target: Arc::clone(target),
                    attempts: 1,
                    generation,
                },
            );
        }

        self.scheduler.arm(Timer {
            id: id.clone(),
            generation,
            deadline: Instant::now() + self.shared.settings.timeout,
        });

        Ok(id)
    }

    /// Resolve a pending envelope.
    pub(crate) fn acknowledge(&self, id: &MessageId) -> Result<()> {
        let removed = self.shared.pending.lock().remove(id);
        match removed {
            Some(entry) => {
                Counters::bump(&self.shared.counters.acknowledged);
                debug!(
                    message_id = %id,
                    topic = %entry.envelope.topic,
                    attempts = entry.attempts,
                    "acknowledged"
                );
                Ok(())
            }
            None => Err(BrokerError::MessageNotFound(id.clone())),
        }
    }

    /// Envelopes awaiting acknowledgment.
    pub(crate) fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Delivery attempts made so far for a pending id.
    #[cfg(test)]
    pub(crate) fn attempts(&self, id: &MessageId) -> Option<u32> {
        self.shared.pending.lock().get(id).map(|entry| entry.attempts)
    }

    /// Stop the timer thread and forget all pending entries.
    pub(crate) fn shutdown(&self) {
        self.scheduler.shutdown();
        let dropped = {
            let mut pending = self.shared.pending.lock();
            let n = pending.len();
            pending.clear();
            n
        };
        if dropped > 0 {
            debug!(dropped, "pending acknowledgments discarded on shutdown");
        }
    }
}

impl Shared {
    fn on_timer(&self, timer: Timer) -> Option<Timer> {
        let mut pending = self.pending.lock();
        let outcome = self.fire(&mut pending, &timer);

        match outcome {
            FireOutcome::Stale => None,
            FireOutcome::Abandoned | FireOutcome::Expired => {
                pending.remove(&timer.id);
                None
            }
            FireOutcome::Redelivered | FireOutcome::StillFull => {
                let entry = pending.get_mut(&timer.id)?;
                entry.generation += 1;
                Some(Timer {
                    id: timer.id,
                    generation: entry.generation,
                    deadline: Instant::now() + self.settings.timeout,
                })
            }
        }
    }

    fn fire(&self, pending: &mut HashMap<MessageId, PendingAck>, timer: &Timer) -> FireOutcome {
        let Some(entry) = pending.get_mut(&timer.id) else {
            return FireOutcome::Stale;
        };
        if entry.generation != timer.generation {
            return FireOutcome::Stale;
        }

        if entry.target.is_closed() {
            Counters::bump(&self.counters.abandoned);
            debug!(
                message_id = %timer.id,
                subscriber = %entry.target.id(),
                "subscriber gone, abandoning"
            );
            return FireOutcome::Abandoned;
        }

        if let Some(max) = self.settings.max_attempts {
            if entry.attempts >= max {
                Counters::bump(&self.counters.expired);
                warn!(
                    message_id = %timer.id,
                    topic = %entry.envelope.topic,
                    attempts = entry.attempts,
                    "attempt limit reached without acknowledgment"
                );
                return FireOutcome::Expired;
            }
        }

        let frame = match entry.envelope.encode(self.settings.codec) {
            Ok(frame) => frame,
            Err(e) => {
                error!(message_id = %timer.id, error = %e, "re-encoding envelope failed");
                return FireOutcome::Abandoned;
            }
        };

        // Counted before the frame is visible to the subscriber
        Counters::bump(&self.counters.redelivered);
        match entry.target.try_send(Delivery::Envelope(frame)) {
            Ok(()) => {
                entry.attempts += 1;
                debug!(
                    message_id = %timer.id,
                    attempt = entry.attempts,
                    "redelivered"
                );
                FireOutcome::Redelivered
            }
            Err(Rejection::Full) => {
                Counters::unbump(&self.counters.redelivered);
                debug!(message_id = %timer.id, "subscriber still full, retrying later");
                FireOutcome::StillFull
            }
            Err(Rejection::Closed) => {
                Counters::unbump(&self.counters.redelivered);
                Counters::bump(&self.counters.abandoned);
                FireOutcome::Abandoned
            }
        }
    }
}

/// Why an envelope was not queued.
#[derive(Debug)]
pub(crate) enum DeliverError {
    Unprocessable(BrokerError),
    Rejected(Rejection),
}
