//! Broker configuration.

use crate::error::{BrokerError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How published messages are handed to subscribers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Raw payload, one attempt, lost on a full queue.
    #[default]
    AtMostOnce,
    /// Enveloped payload, redelivered until acknowledged.
    AtLeastOnce,
}

/// What a publish to a topic without subscribers reports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyTopicPolicy {
    /// Silent no-op.
    #[default]
    Ignore,
    /// `BrokerError::NoSubscribers`.
    Reject,
}

/// Wire encoding for at-least-once envelopes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeCodec {
    /// `{"id":..,"topic":..,"payload":<raw JSON>}`. Payloads must be JSON.
    #[default]
    Json,
    /// MessagePack map with the payload as a binary blob.
    MessagePack,
}

/// Replay and retention settings for the durable store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// How often the retention job runs.
    /// Default: 5s
    #[serde(with = "duration_ms")]
    pub deletion_interval: Duration,

    /// Messages older than this are deleted by the retention job.
    /// Default: 15s
    #[serde(with = "duration_ms")]
    pub retention: Duration,

    /// Max messages waiting to be written before persistence drops them.
    /// Default: 1024
    pub persist_queue_capacity: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            deletion_interval: Duration::from_secs(5),
            retention: Duration::from_secs(15),
            persist_queue_capacity: 1024,
        }
    }
}

/// Immutable per-broker settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub delivery: DeliveryMode,

    /// Time an envelope waits for acknowledgment before it is redelivered.
    /// Default: 10s
    #[serde(with = "duration_ms")]
    pub ack_timeout: Duration,

    /// Frames a subscriber channel holds before publishes to it fail.
    /// Default: 10
    pub channel_capacity: usize,

    /// Give up on an envelope after this many deliveries (None = never).
    pub max_attempts: Option<u32>,

    pub empty_topic: EmptyTopicPolicy,

    pub codec: EnvelopeCodec,

    /// Durable replay (None = live only, nothing persisted).
    pub replay: Option<ReplayConfig>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            delivery: DeliveryMode::AtMostOnce,
            ack_timeout: Duration::from_secs(10),
            channel_capacity: 10,
            max_attempts: None,
            empty_topic: EmptyTopicPolicy::Ignore,
            codec: EnvelopeCodec::Json,
            replay: None,
        }
    }
}

impl BrokerConfig {
    /// At-least-once configuration with the given ack timeout.
    pub fn at_least_once(ack_timeout: Duration) -> Self {
        Self {
            delivery: DeliveryMode::AtLeastOnce,
            ack_timeout,
            ..Default::default()
        }
    }

    /// Parse a JSON config document; missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: BrokerConfig = serde_json::from_str(json)
            .map_err(|e| BrokerError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(BrokerError::InvalidConfig(
                "channel_capacity must be at least 1".into(),
            ));
        }
        if self.ack_timeout.is_zero() {
            return Err(BrokerError::InvalidConfig(
                "ack_timeout must be non-zero".into(),
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(BrokerError::InvalidConfig(
                "max_attempts must be at least 1".into(),
            ));
        }
        if let Some(ref replay) = self.replay {
            if replay.deletion_interval.is_zero() {
                return Err(BrokerError::InvalidConfig(
                    "deletion_interval must be non-zero".into(),
                ));
            }
            if replay.persist_queue_capacity == 0 {
                return Err(BrokerError::InvalidConfig(
                    "persist_queue_capacity must be at least 1".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Durations as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
