//! Event schemas & error taxonomy.
//!
//! An `Event` is `(topic, payload, timestamp)`. Payloads
//! travel the bus as `serde_json::Value` maps — a structured record is
//! converted to a plain keyed map for transport; typed payload structs in
//! [`payloads`] are how individual services construct and interpret those
//! maps.

pub mod payloads;
pub mod topics;

pub use payloads::*;
pub use topics::topic;

use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Instant;

/// A single event in flight on the bus.
#[derive(Debug, Clone)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
    /// Monotonic instant used only for intra-process ordering assertions in
    /// tests; never serialized onto the wire.
    pub received_at: Instant,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            received_at: Instant::now(),
        }
    }

    /// An event with no payload is represented as an empty map: a missing
    /// payload is an empty map, not a null or absent value.
    pub fn empty(topic: impl Into<String>) -> Self {
        Self::new(topic, Value::Object(Map::new()))
    }
}

/// Convert a typed payload record into the map transport representation.
///
/// A small payload-validation helper at the bus boundary: serialization
/// failure means the payload shape does not match its record definition,
/// which is a programmer error, not a runtime condition a caller should
/// recover from.
pub fn to_payload<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).expect("payload type must serialize to a JSON object")
}

/// Deserialize a payload map back into a typed record. Returns `None` (and
/// the caller should treat this as `DispatchInvalidPayload`-like) rather
/// than panicking, since the payload here can originate from an external
/// collaborator emitting on the bus directly.
pub fn from_payload<T: serde::de::DeserializeOwned>(payload: &Value) -> Option<T> {
    serde_json::from_value(payload.clone()).ok()
}
