//! Change events emitted by store watches and relayed over the bus
//!
//! The JSON form of [`ChangeEvent`] is the bus envelope:
//!
//! ```text
//! { "ResType": 0, "ValueBytes": "<base64>", "Key": "/registry/pod/default/web", "Revision": 42 }
//! ```
//!
//! `Key` and `Revision` are optional on the wire so the bare
//! `{ "ResType", "ValueBytes" }` envelope still decodes.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Content type used for every relayed change event
pub const EVENT_CONTENT_TYPE: &str = "application/json";

/// Kind of mutation observed on a watched key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum EventKind {
    Put,
    Delete,
}

impl From<EventKind> for u8 {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Put => 0,
            EventKind::Delete => 1,
        }
    }
}

impl TryFrom<u8> for EventKind {
    type Error = UnknownEventKind;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EventKind::Put),
            1 => Ok(EventKind::Delete),
            other => Err(UnknownEventKind(other)),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Put => write!(f, "PUT"),
            EventKind::Delete => write!(f, "DELETE"),
        }
    }
}

#[derive(Error, Debug)]
#[error("unknown event kind {0}")]
pub struct UnknownEventKind(u8);

/// A single mutation observed on a watched key
///
/// For `Delete` events `value` holds the last value stored before the
/// deletion, so consumers can still identify the object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "ResType")]
    pub kind: EventKind,

    #[serde(rename = "ValueBytes", with = "base64_bytes")]
    pub value: Vec<u8>,

    #[serde(rename = "Key", default, skip_serializing_if = "String::is_empty")]
    pub key: String,

    /// Store revision at which the mutation committed (0 if unknown)
    #[serde(rename = "Revision", default)]
    pub revision: i64,
}

impl ChangeEvent {
    pub fn put(key: impl Into<String>, value: Vec<u8>, revision: i64) -> Self {
        Self {
            kind: EventKind::Put,
            value,
            key: key.into(),
            revision,
        }
    }

    pub fn delete(key: impl Into<String>, prev_value: Vec<u8>, revision: i64) -> Self {
        Self {
            kind: EventKind::Delete,
            value: prev_value,
            key: key.into(),
            revision,
        }
    }

    /// Encode as the JSON bus envelope
    pub fn to_envelope(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a JSON bus envelope
    pub fn from_envelope(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// serde helper: `Vec<u8>` as a standard base64 string
pub(crate) mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
