//! Query collaborator contract.
//!
//! Like documents, query internals are external. The connection allocates
//! query ids, sends the initial `qf`/`qs` frame, routes replies and live
//! updates back by id, and notifies queries of state changes so subscribe
//! queries can re-send after a reconnect.

use opcast_core::ProtocolError;
use serde_json::Value;

/// Kind of query registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryAction {
    /// One-shot fetch (`qf`).
    Fetch,
    /// Live subscription (`qs`).
    Subscribe,
}

/// A query registered with a connection, used as `Arc<dyn QueryHandle>`.
pub trait QueryHandle: Send + Sync {
    /// The connection-assigned query id.
    fn id(&self) -> u64;

    /// Called inside a bulk window whenever the connection changes state.
    fn on_connection_state_changed(&self);

    /// Fetch or subscribe reply: error, result data, and driver extra.
    fn handle_response(
        &self,
        error: Option<ProtocolError>,
        data: Option<Value>,
        extra: Option<Value>,
    );

    /// A live update that carried an error envelope.
    fn handle_error(&self, error: ProtocolError);

    /// A live update: an optional diff against the last results and an
    /// optional driver extra.
    fn handle_diff(&self, diff: Option<Value>, extra: Option<Value>);

    /// Whether the query is still waiting for its results.
    fn has_pending(&self) -> bool;

    /// Registers a one-shot callback for the next moment the query is ready.
    /// If the query is already ready the callback fires immediately.
    fn once_ready(&self, callback: Box<dyn FnOnce() + Send>);
}
