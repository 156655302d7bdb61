//! Structured protocol errors and the wire error envelope.
//!
//! Any frame may carry an `error: {code, message}` sub-record. The dispatcher
//! turns such envelopes into a [`ProtocolError`] that keeps the full original
//! frame, so downstream handlers can inspect the message the error arrived on.

use serde::{Deserialize, Serialize};

use crate::messages::Message;

/// Wire error envelope carried inside a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    /// Numeric error code.
    pub code: u64,
    /// Human-readable description.
    pub message: String,
}

/// A structured protocol error: numeric code, message, and (when the error
/// was extracted from an inbound frame) the frame it arrived on.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct ProtocolError {
    pub code: u64,
    pub message: String,
    /// The full original frame, present when this error came off the wire.
    pub frame: Option<Box<Message>>,
}

impl ProtocolError {
    /// The server declared a protocol version other than 1.
    pub const INVALID_PROTOCOL_VERSION: u64 = 4019;
    /// The server-declared default OT type does not match the local default.
    pub const INVALID_DEFAULT_TYPE: u64 = 4020;
    /// The server-assigned client id is not a string.
    pub const INVALID_CLIENT_ID: u64 = 4021;
    /// A connection state transition not permitted by the state machine.
    pub const ILLEGAL_STATE_TRANSITION: u64 = 5007;

    /// Creates a locally constructed error with no originating frame.
    #[must_use]
    pub fn new(code: u64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            frame: None,
        }
    }

    /// Builds an error from a wire envelope, retaining the originating frame.
    #[must_use]
    pub fn from_envelope(data: &ErrorData, frame: &Message) -> Self {
        Self {
            code: data.code,
            message: data.message.clone(),
            frame: Some(Box::new(frame.clone())),
        }
    }
}
