//! # Courier
//!
//! The delivery core of a topic-based publish/subscribe broker. Transports
//! (WebSocket, HTTP, anything else) sit on top and call into [`Broker`].
//!
//! ## Core Concepts
//!
//! - **Topics**: Exact, case-sensitive names; a topic exists while it has subscribers
//! - **Subscriptions**: Bounded per-subscriber channels; full channels drop, never block
//! - **Delivery modes**: At-most-once raw payloads, or at-least-once envelopes
//!   redelivered until acknowledged
//! - **Replay**: Optional store of recent messages queued to new subscribers
//!   before live traffic
//!
//! ## Example
//!
//! ```ignore
//! use courier::{Broker, BrokerConfig, EnvelopeCodec};
//! use std::time::Duration;
//!
//! let broker = Broker::new(BrokerConfig::at_least_once(Duration::from_secs(5)))?;
//! let sub = broker.subscribe("orders", None)?;
//!
//! broker.publish("orders", br#"{"id":42}"#.to_vec())?;
//!
//! let envelope = sub.recv()?.decode_envelope(EnvelopeCodec::Json)?;
//! broker.acknowledge(&envelope.id)?;
//! ```

mod ack;
pub mod broker;
pub mod config;
mod delivery;
pub mod envelope;
pub mod error;
pub mod stats;
pub mod store;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use broker::{Broker, PublishReceipt};
pub use config::{BrokerConfig, DeliveryMode, EmptyTopicPolicy, EnvelopeCodec, ReplayConfig};
pub use envelope::Envelope;
pub use error::{BrokerError, ErrorReport, Result};
pub use stats::BrokerStats;
pub use store::{LogStore, MemoryStore, MessageStore, Persister, RetentionJob};
pub use subscriptions::{Delivery, ReplaySummary, SubscriptionHandle};
pub use types::{MessageId, StoredMessage, SubscriberId, Timestamp};
