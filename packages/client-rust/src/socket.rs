//! Contract a wire transport must satisfy to carry a connection.
//!
//! The adapter exposes the outbound half (ready-state query, send, close).
//! The inbound half -- open, message, error, close notifications -- is
//! delivered by the transport driver calling the corresponding
//! `socket_*` entry points on [`Connection`](crate::Connection).

/// Ready-state of the underlying socket at bind time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// The socket is being established.
    Opening,
    /// The socket is open for traffic.
    Open,
    /// The socket is shutting down.
    Closing,
    /// The socket is closed.
    Closed,
}

/// A bidirectional message socket, e.g. a WebSocket.
///
/// Used as `Arc<dyn SocketAdapter>`. Implementations decide when to
/// reconnect; the connection only reacts to the notifications the driver
/// delivers.
pub trait SocketAdapter: Send + Sync {
    /// Current ready-state, consulted when the connection binds.
    fn ready_state(&self) -> ReadyState;

    /// Sends one encoded frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot accept the frame. Send
    /// failures are logged by the connection, not surfaced.
    fn send(&self, frame: &str) -> anyhow::Result<()>;

    /// Closes the socket.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    struct NullSocket;

    impl SocketAdapter for NullSocket {
        fn ready_state(&self) -> ReadyState {
            ReadyState::Closed
        }

        fn send(&self, _frame: &str) -> anyhow::Result<()> {
            Ok(())
        }

        fn close(&self) {}
    }

    /// Verifies `Arc<dyn SocketAdapter>` compiles (object safety).
    #[test]
    fn socket_adapter_is_object_safe() {
        let socket: Arc<dyn SocketAdapter> = Arc::new(NullSocket);
        assert_eq!(socket.ready_state(), ReadyState::Closed);
    }
}
