//! `OpCast` Core -- wire message schemas, frame codec, and protocol errors.
//!
//! This crate provides the foundation layer shared by the `OpCast` client and
//! server:
//!
//! - **Messages** ([`messages`]): the action-tagged [`Message`] frame enum,
//!   bulk bodies, and the JSON codec
//! - **Errors** ([`error`]): the wire error envelope and structured
//!   [`ProtocolError`] with the core error codes
//! - **Types** ([`types`]): the canonical default OT type identifier

pub mod error;
pub mod messages;
pub mod types;

// Errors
pub use error::{ErrorData, ProtocolError};

// Messages
pub use messages::{decode, encode, BulkBody, CodecError, Message};

// Types
pub use types::DEFAULT_TYPE_URI;
