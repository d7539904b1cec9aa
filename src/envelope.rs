//! At-least-once wire envelope.
//!
//! An envelope wraps a payload with the id the subscriber acknowledges.
//! The payload is passed through untouched: the JSON codec embeds it as a
//! raw JSON value, the MessagePack codec as a binary blob.

use crate::config::EnvelopeCodec;
use crate::error::{BrokerError, Result};
use crate::types::MessageId;
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;
use std::fmt;

/// One queued delivery of a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub id: MessageId,
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Serialize)]
struct JsonOut<'a> {
    id: &'a MessageId,
    topic: &'a str,
    payload: &'a RawValue,
}

#[derive(Deserialize)]
struct JsonIn {
    id: MessageId,
    topic: String,
    payload: Box<RawValue>,
}

#[derive(Serialize)]
struct PackOut<'a> {
    id: &'a MessageId,
    topic: &'a str,
    payload: BytesRef<'a>,
}

#[derive(Deserialize)]
struct PackIn {
    id: MessageId,
    topic: String,
    payload: BytesBuf,
}

impl Envelope {
    /// Wrap a payload under a freshly minted id.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: MessageId::mint(),
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Serialize for a subscriber channel.
    ///
    /// Fails with `Unprocessable` when the JSON codec is given a payload
    /// that is not a JSON document.
    pub fn encode(&self, codec: EnvelopeCodec) -> Result<Vec<u8>> {
        match codec {
            EnvelopeCodec::Json => {
                let payload: &RawValue = serde_json::from_slice(&self.payload)
                    .map_err(|e| BrokerError::Unprocessable(e.to_string()))?;
                let out = JsonOut {
                    id: &self.id,
                    topic: &self.topic,
                    payload,
                };
                serde_json::to_vec(&out).map_err(|e| BrokerError::Unprocessable(e.to_string()))
            }
            EnvelopeCodec::MessagePack => {
                let out = PackOut {
                    id: &self.id,
                    topic: &self.topic,
                    payload: BytesRef(&self.payload),
                };
                rmp_serde::to_vec_named(&out).map_err(|e| BrokerError::Unprocessable(e.to_string()))
            }
        }
    }

    /// Parse an envelope produced by `encode`.
    pub fn decode(bytes: &[u8], codec: EnvelopeCodec) -> Result<Self> {
        match codec {
            EnvelopeCodec::Json => {
                let parsed: JsonIn = serde_json::from_slice(bytes)
                    .map_err(|e| BrokerError::Deserialization(e.to_string()))?;
                Ok(Self {
                    id: parsed.id,
                    topic: parsed.topic,
                    payload: parsed.payload.get().as_bytes().to_vec(),
                })
            }
            EnvelopeCodec::MessagePack => {
                let parsed: PackIn = rmp_serde::from_slice(bytes)?;
                Ok(Self {
                    id: parsed.id,
                    topic: parsed.topic,
                    payload: parsed.payload.0,
                })
            }
        }
    }
}

struct BytesRef<'a>(&'a [u8]);

impl Serialize for BytesRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.0)
    }
}

struct BytesBuf(Vec<u8>);

impl<'de> Deserialize<'de> for BytesBuf {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = BytesBuf;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte array")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<BytesBuf, E> {
                Ok(BytesBuf(v.to_vec()))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> std::result::Result<BytesBuf, E> {
                Ok(BytesBuf(v))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<BytesBuf, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    out.push(b);
                }
                Ok(BytesBuf(out))
            }
        }

        deserializer.deserialize_byte_buf(BytesVisitor)
    }
}
