//! Envelope Codec
//!
//! Every message body exchanged by mqmx is one text-encoded `Envelope`.
//! The codec is pluggable; `JsonCodec` is the default.


use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::{InvocationResult, Request};
use crate::registry::Notification;

/// Codec error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The value could not be serialized
    Encode(String),
    /// The text is not a valid envelope
    Decode(String),
    /// Empty message body
    Empty,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Encode(msg) => write!(f, "encode failed: {}", msg),
            CodecError::Decode(msg) => write!(f, "decode failed: {}", msg),
            CodecError::Empty => write!(f, "empty message body"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Unit of exchange between clients and servers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "camelCase")]
pub enum Envelope {
    /// Request sent to the service destination
    Invocation(Request),
    /// Reply sent to the requester's reply channel
    Result(InvocationResult),
    /// Event forwarded to a subscriber's reply channel
    Notification {
        listener_id: String,
        notification: Notification,
    },
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Invocation(_) => "invocation",
            Envelope::Result(_) => "result",
            Envelope::Notification { .. } => "notification",
        }
    }
}

/// Text serialization of envelopes.
pub trait MessageCodec: Send + Sync {
    fn name(&self) -> &'static str;

    fn encode(&self, envelope: &Envelope) -> Result<String, CodecError>;

    fn decode(&self, text: &str) -> Result<Envelope, CodecError>;
}

/// JSON envelopes via serde_json
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, envelope: &Envelope) -> Result<String, CodecError> {
        serde_json::to_string(envelope).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, text: &str) -> Result<Envelope, CodecError> {
        if text.trim().is_empty() {
            return Err(CodecError::Empty);
        }
        serde_json::from_str(text).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
