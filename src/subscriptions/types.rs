//! Subscriber channel types.

use crate::config::EnvelopeCodec;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::types::SubscriberId;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use std::sync::Weak;

use super::registry::TopicTable;

/// A frame queued for a subscriber.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Raw published payload (at-most-once).
    Message(Vec<u8>),
    /// Serialized envelope awaiting acknowledgment (at-least-once).
    Envelope(Vec<u8>),
}

impl Delivery {
    /// The bytes a transport writes out.
    pub fn bytes(&self) -> &[u8] {
        match self {
            Delivery::Message(b) | Delivery::Envelope(b) => b,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Delivery::Message(b) | Delivery::Envelope(b) => b,
        }
    }

    /// Parse the frame as an envelope.
    pub fn decode_envelope(&self, codec: EnvelopeCodec) -> Result<Envelope> {
        Envelope::decode(self.bytes(), codec)
    }
}

/// Why a frame could not be queued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Rejection {
    /// Queue at capacity.
    Full,
    /// Unsubscribed, or the receiving side was dropped.
    Closed,
}

/// Sending half of a subscription, owned by the registry.
///
/// The sender is never cloned, so taking it out on close disconnects the
/// receiver once the queue is drained.
pub(crate) struct SubscriberChannel {
    id: SubscriberId,
    topic: String,
    sender: RwLock<Option<Sender<Delivery>>>,
}

impl SubscriberChannel {
    pub(crate) fn new(id: SubscriberId, topic: String, sender: Sender<Delivery>) -> Self {
        Self {
            id,
            topic,
            sender: RwLock::new(Some(sender)),
        }
    }

    pub(crate) fn id(&self) -> SubscriberId {
        self.id
    }

    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    /// Queue a frame without blocking.
    pub(crate) fn try_send(&self, delivery: Delivery) -> std::result::Result<(), Rejection> {
        let guard = self.sender.read();
        let Some(sender) = guard.as_ref() else {
            return Err(Rejection::Closed);
        };
        match sender.try_send(delivery) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Rejection::Full),
            Err(TrySendError::Disconnected(_)) => Err(Rejection::Closed),
        }
    }

    /// Close the channel. Returns false if it was already closed.
    pub(crate) fn close(&self) -> bool {
        self.sender.write().take().is_some()
    }

    /// True once unsubscribed. Dropping the handle unsubscribes too; a
    /// receiver gone any other way shows up as `Closed` on the next send.
    pub(crate) fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }
}

/// Outcome of the historical catch-up performed on subscribe.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Stored messages queued before going live.
    pub replayed: usize,
    /// Stored messages that could not be encoded and were skipped.
    pub skipped: usize,
    /// True if the channel filled up and replay stopped early.
    pub truncated: bool,
}

/// Handle to receive from a subscription.
///
/// Dropping the handle unsubscribes it.
pub struct SubscriptionHandle {
    pub id: SubscriberId,
    pub topic: String,
    /// What the catch-up delivered before the channel went live.
    pub replay: ReplaySummary,
    /// Channel to receive frames.
    pub receiver: Receiver<Delivery>,
    registry: Weak<TopicTable>,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        id: SubscriberId,
        topic: String,
        receiver: Receiver<Delivery>,
        registry: Weak<TopicTable>,
    ) -> Self {
        Self {
            id,
            topic,
            replay: ReplaySummary::default(),
            receiver,
            registry,
        }
    }

    /// Receive the next frame (blocking). Errors once unsubscribed and drained.
    pub fn recv(&self) -> std::result::Result<Delivery, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a frame (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<Delivery, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> std::result::Result<Delivery, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Blocking iterator that ends when the subscription is closed.
    pub fn iter(&self) -> crossbeam_channel::Iter<'_, Delivery> {
        self.receiver.iter()
    }

    /// Drain whatever is queued right now.
    pub fn try_iter(&self) -> crossbeam_channel::TryIter<'_, Delivery> {
        self.receiver.try_iter()
    }

    /// Frames currently queued.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(table) = self.registry.upgrade() {
            table.remove(&self.topic, self.id);
        }
    }
}
