//! Connection observers and fan-out.
//!
//! Defines [`ConnectionObserver`] for reacting to connection lifecycle and
//! traffic, and [`ObserverSet`] which fans notifications out to every
//! registered observer. All methods default to no-ops so observers implement
//! only what they care about.

use std::sync::Arc;

use opcast_core::{Message, ProtocolError};
use parking_lot::RwLock;

use crate::doc::DocHandle;
use crate::state::ConnectionState;

/// Mutable wrapper around an inbound frame, handed to receive observers
/// before dispatch. Taking `data` suppresses dispatch of the frame.
#[derive(Debug)]
pub struct ReceiveEnvelope {
    /// The decoded frame; `None` once an observer has consumed it.
    pub data: Option<Message>,
}

/// Observer for connection lifecycle and traffic.
///
/// Used as `Arc<dyn ConnectionObserver>`. The connection never holds its
/// internal lock while calling observers, so observers may call back into it.
#[allow(unused_variables)]
pub trait ConnectionObserver: Send + Sync {
    /// The connection entered `connecting`.
    fn on_connecting(&self, reason: Option<&str>) {}

    /// The connection entered `connected`.
    fn on_connected(&self, reason: Option<&str>) {}

    /// The connection entered `disconnected`.
    fn on_disconnected(&self, reason: Option<&str>) {}

    /// The connection entered `closed`.
    fn on_closed(&self, reason: Option<&str>) {}

    /// The connection entered `stopped`.
    fn on_stopped(&self, reason: Option<&str>) {}

    /// Any accepted state transition, fired after the state-named callback
    /// and after every document and query has been notified.
    fn on_state_changed(&self, state: ConnectionState, reason: Option<&str>) {}

    /// A protocol-level or dispatch error.
    fn on_error(&self, error: &ProtocolError) {}

    /// A transport-level error; the state is not changed by these.
    fn on_connection_error(&self, error: &anyhow::Error) {}

    /// An inbound frame, before dispatch. Take `envelope.data` to suppress
    /// dispatch.
    fn on_receive(&self, envelope: &mut ReceiveEnvelope) {}

    /// An outbound frame, before it is handed to the socket.
    fn on_send(&self, message: &Message) {}

    /// A document was constructed and registered.
    fn on_doc(&self, doc: &Arc<dyn DocHandle>) {}
}

/// Registered observers, notified in registration order.
#[derive(Default)]
pub(crate) struct ObserverSet {
    observers: RwLock<Vec<Arc<dyn ConnectionObserver>>>,
}

impl ObserverSet {
    pub fn add(&self, observer: Arc<dyn ConnectionObserver>) {
        self.observers.write().push(observer);
    }

    /// Runs `f` for every observer. The list lock is released before any
    /// observer runs, so observers may register further observers.
    pub fn for_each(&self, mut f: impl FnMut(&dyn ConnectionObserver)) {
        let snapshot = self.observers.read().clone();
        for observer in &snapshot {
            f(observer.as_ref());
        }
    }
}
