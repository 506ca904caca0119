//! Message codec shared by the delivery and publish paths
//!
//! Payloads are a closed union of raw bytes and structured JSON documents.
//! Decoding never fails: anything that does not parse as JSON is handed back
//! as the original bytes, so structured and unstructured messages can share
//! one topic.

use bytes::Bytes;
use serde_json::Value;

/// A message payload as seen by publishers and subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Opaque bytes, delivered unchanged
    Raw(Bytes),
    /// A structured JSON document
    Structured(Value),
}

impl Payload {
    /// Borrow the structured document, if this payload is one
    pub fn as_document(&self) -> Option<&Value> {
        match self {
            Payload::Structured(value) => Some(value),
            Payload::Raw(_) => None,
        }
    }

    /// Borrow the raw bytes, if this payload is unstructured
    pub fn as_raw(&self) -> Option<&Bytes> {
        match self {
            Payload::Raw(bytes) => Some(bytes),
            Payload::Structured(_) => None,
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, Payload::Structured(_))
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Structured(value)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Raw(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Raw(Bytes::from(bytes))
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Raw(Bytes::copy_from_slice(text.as_bytes()))
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Raw(Bytes::from(text))
    }
}

/// Decode an incoming payload (pure function)
///
/// Returns [`Payload::Structured`] when the bytes are valid JSON, and the
/// untouched bytes otherwise.
pub fn decode(bytes: &Bytes) -> Payload {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value) => Payload::Structured(value),
        Err(_) => Payload::Raw(bytes.clone()),
    }
}

/// Encode an outgoing payload (pure function)
///
/// Raw payloads pass through; structured payloads are serialized as JSON.
pub fn encode(payload: &Payload) -> Bytes {
    match payload {
        Payload::Raw(bytes) => bytes.clone(),
        // Serializing a `Value` cannot fail: every key is already a string.
        Payload::Structured(value) => Bytes::from(value.to_string()),
    }
}

/// Render a payload for log lines without assuming it is UTF-8
pub fn display_lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
