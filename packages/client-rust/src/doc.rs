//! Document collaborator contract.
//!
//! Document internals (snapshot, pending op queues, OT application) live
//! outside this crate. The connection only needs the surface below: identity,
//! reply handlers, reconnect notification, and quiescence reporting.

use std::sync::Arc;

use opcast_core::{Message, ProtocolError};
use serde_json::Value;

use crate::connection::Connection;

/// A document registered with a connection.
///
/// Used as `Arc<dyn DocHandle>`. Implementations keep a `Weak` back-reference
/// to the connection and drive their own fetch/subscribe/op traffic through
/// it; the connection forwards server replies back through these handlers.
pub trait DocHandle: Send + Sync {
    /// Collection this document belongs to.
    fn collection(&self) -> &str;

    /// Document id within the collection.
    fn id(&self) -> &str;

    /// Current snapshot version, if one is known yet.
    fn version(&self) -> Option<u64>;

    /// Called inside a bulk window whenever the connection changes state, so
    /// the document can re-fetch or re-subscribe after a reconnect.
    fn on_connection_state_changed(&self);

    /// Fetch reply: an error or the snapshot payload.
    fn handle_fetch(&self, error: Option<ProtocolError>, snapshot: Option<Value>);

    /// Subscribe reply: an error or the snapshot payload.
    fn handle_subscribe(&self, error: Option<ProtocolError>, snapshot: Option<Value>);

    /// Unsubscribe acknowledgement.
    fn handle_unsubscribe(&self, error: Option<ProtocolError>);

    /// An inbound op frame. A frame carrying an error envelope still arrives
    /// here together with the error; the document layer decides what to do.
    fn handle_op(&self, error: Option<ProtocolError>, message: &Message);

    /// Whether any fetch, subscribe, or write is still in flight.
    fn has_pending(&self) -> bool;

    /// Whether a write (op, create, delete) is still in flight.
    fn has_write_pending(&self) -> bool;

    /// Registers a one-shot callback for the next moment nothing is pending.
    /// If the document is already quiescent the callback fires immediately.
    fn once_nothing_pending(&self, callback: Box<dyn FnOnce() + Send>);
}

/// Constructs document handles on behalf of [`Connection::get`].
pub trait DocFactory: Send + Sync {
    /// Creates the handle for `(collection, id)`. The handle should hold a
    /// `Weak` reference to the connection.
    fn create(
        &self,
        connection: &Arc<Connection>,
        collection: &str,
        id: &str,
    ) -> Arc<dyn DocHandle>;
}

/// Write data for an outbound op frame. `op`, `create`, and `del` are
/// mutually exclusive; whichever is present is carried verbatim.
#[derive(Debug, Clone, Default)]
pub struct OpData {
    /// Source identity of the op, usually the client id it was created under.
    pub src: Option<String>,
    /// Connection-local op sequence number.
    pub seq: u64,
    /// An edit op body.
    pub op: Option<Value>,
    /// A create op body.
    pub create: Option<Value>,
    /// A delete marker.
    pub del: Option<bool>,
}
