//! Error types for the broker.

use crate::types::MessageId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Subscription channel for topic {topic} is full ({rejected} rejected, {delivered} delivered)")]
    CapacityExceeded {
        topic: String,
        rejected: usize,
        delivered: usize,
    },

    #[error("No subscribers for topic: {0}")]
    NoSubscribers(String),

    #[error("No pending acknowledgment for message: {0}")]
    MessageNotFound(MessageId),

    #[error("Unprocessable message: {0}")]
    Unprocessable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    #[error("Message log is locked by another process")]
    Locked,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Broker is shutting down")]
    ShuttingDown,
}

impl BrokerError {
    /// Numeric code reported across the transport boundary.
    pub fn code(&self) -> u16 {
        match self {
            BrokerError::CapacityExceeded { .. } => 503,
            BrokerError::NoSubscribers(_) | BrokerError::MessageNotFound(_) => 404,
            BrokerError::Unprocessable(_) => 422,
            BrokerError::InvalidConfig(_) => 400,
            BrokerError::ShuttingDown => 503,
            _ => 500,
        }
    }

    /// The `(code, message)` pair handed to transports.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for BrokerError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for BrokerError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        BrokerError::Deserialization(e.to_string())
    }
}

/// Caller-visible failure, stripped of internal state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: u16,
    pub message: String,
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        let full = BrokerError::CapacityExceeded {
            topic: "t".into(),
            rejected: 1,
            delivered: 2,
        };
        assert_eq!(full.code(), 503);
        assert_eq!(BrokerError::NoSubscribers("t".into()).code(), 404);
        assert_eq!(BrokerError::Unprocessable("bad".into()).code(), 422);
        assert_eq!(BrokerError::Locked.code(), 500);
    }

    #[test]
    fn test_report_carries_message() {
        let report = BrokerError::NoSubscribers("sports".into()).report();
        assert_eq!(report.code, 404);
        assert_eq!(report.message, "No subscribers for topic: sports");

        let json = serde_json::to_string(&report).unwrap();
        assert_eq!(json, r#"{"code":404,"message":"No subscribers for topic: sports"}"#);
    }
}
