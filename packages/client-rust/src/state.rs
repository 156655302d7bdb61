//! Connection lifecycle states and the transition rules between them.
//!
//! State machine:
//!
//! - -> `Connecting` only from `Disconnected`, `Stopped`, or `Closed`
//! - -> `Connected` only from `Connecting`
//! - -> `Disconnected`, `Closed`, `Stopped` from any state (driven by the
//!   transport close callback)
//!
//! Same-state transitions are silent no-ops; anything else outside the table
//! is a programmer error surfaced with code 5007.

use std::fmt;

/// Lifecycle state of a [`Connection`](crate::Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// The socket is up (or coming up) and the server hello is awaited.
    Connecting,
    /// The server hello was accepted; frames may be sent.
    Connected,
    /// The transport dropped; the transport decides when to reconnect.
    Disconnected,
    /// The connection was closed deliberately.
    Closed,
    /// The server told the client to stop reconnecting.
    Stopped,
}

impl ConnectionState {
    /// Lowercase wire-style name of this state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Closed => "closed",
            ConnectionState::Stopped => "stopped",
        }
    }

    /// Whether the state machine permits moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        match next {
            ConnectionState::Connecting => matches!(
                self,
                ConnectionState::Disconnected | ConnectionState::Stopped | ConnectionState::Closed
            ),
            ConnectionState::Connected => self == ConnectionState::Connecting,
            ConnectionState::Disconnected
            | ConnectionState::Closed
            | ConnectionState::Stopped => true,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a transport close reason onto the state it drives.
///
/// Exactly four literals select `Closed` or `Stopped`; every other reason is
/// an unexpected drop and maps to `Disconnected`.
#[must_use]
pub fn state_for_close_reason(reason: &str) -> ConnectionState {
    match reason {
        "closed" | "Closed" => ConnectionState::Closed,
        "stopped" | "Stopped by server" => ConnectionState::Stopped,
        _ => ConnectionState::Disconnected,
    }
}
