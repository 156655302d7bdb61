//! Test doubles shared by the connection unit and integration tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use opcast_core::{decode, Message, ProtocolError, DEFAULT_TYPE_URI};
use parking_lot::Mutex;
use serde_json::Value;

use crate::connection::Connection;
use crate::doc::{DocFactory, DocHandle};
use crate::observer::{ConnectionObserver, ReceiveEnvelope};
use crate::query::QueryHandle;
use crate::socket::{ReadyState, SocketAdapter};
use crate::state::ConnectionState;

/// Socket double that records every frame it is asked to send.
pub struct MockSocket {
    ready: Mutex<ReadyState>,
    sent: Mutex<Vec<Message>>,
    pub close_calls: AtomicUsize,
}

impl MockSocket {
    pub fn with_state(state: ReadyState) -> Arc<Self> {
        Arc::new(Self {
            ready: Mutex::new(state),
            sent: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
        })
    }

    pub fn open() -> Arc<Self> {
        Self::with_state(ReadyState::Open)
    }

    pub fn sent_frames(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }
}

impl SocketAdapter for MockSocket {
    fn ready_state(&self) -> ReadyState {
        *self.ready.lock()
    }

    fn send(&self, frame: &str) -> anyhow::Result<()> {
        self.sent.lock().push(decode(frame)?);
        Ok(())
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Document double recording everything the connection forwards to it.
pub struct MockDoc {
    collection: String,
    id: String,
    pub version: Mutex<Option<u64>>,
    /// When set, the doc re-subscribes on state changes once sending is possible.
    pub resubscribe: AtomicBool,
    connection: Mutex<Option<Weak<Connection>>>,
    self_ref: Mutex<Option<Weak<MockDoc>>>,
    pub state_changes: AtomicUsize,
    pub fetches: Mutex<Vec<(Option<ProtocolError>, Option<Value>)>>,
    pub subscribes: Mutex<Vec<(Option<ProtocolError>, Option<Value>)>>,
    pub unsubscribes: Mutex<Vec<Option<ProtocolError>>>,
    pub ops: Mutex<Vec<(Option<ProtocolError>, Message)>>,
    pending: AtomicBool,
    write_pending: AtomicBool,
    nothing_pending_waiters: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl MockDoc {
    pub fn new(collection: &str, id: &str, version: Option<u64>) -> Arc<Self> {
        let doc = Arc::new(Self {
            collection: collection.to_string(),
            id: id.to_string(),
            version: Mutex::new(version),
            resubscribe: AtomicBool::new(false),
            connection: Mutex::new(None),
            self_ref: Mutex::new(None),
            state_changes: AtomicUsize::new(0),
            fetches: Mutex::new(Vec::new()),
            subscribes: Mutex::new(Vec::new()),
            unsubscribes: Mutex::new(Vec::new()),
            ops: Mutex::new(Vec::new()),
            pending: AtomicBool::new(false),
            write_pending: AtomicBool::new(false),
            nothing_pending_waiters: Mutex::new(Vec::new()),
        });
        *doc.self_ref.lock() = Some(Arc::downgrade(&doc));
        doc
    }

    pub fn attach(&self, connection: &Arc<Connection>) {
        *self.connection.lock() = Some(Arc::downgrade(connection));
    }

    pub fn as_handle(self: &Arc<Self>) -> Arc<dyn DocHandle> {
        Arc::clone(self) as Arc<dyn DocHandle>
    }

    pub fn set_pending(&self, pending: bool) {
        self.pending.store(pending, Ordering::SeqCst);
    }

    pub fn set_write_pending(&self, pending: bool) {
        self.write_pending.store(pending, Ordering::SeqCst);
    }

    /// Marks the doc quiescent and fires queued nothing-pending callbacks.
    pub fn settle(&self) {
        self.pending.store(false, Ordering::SeqCst);
        self.write_pending.store(false, Ordering::SeqCst);
        let waiters: Vec<_> = self.nothing_pending_waiters.lock().drain(..).collect();
        for waiter in waiters {
            waiter();
        }
    }
}

impl DocHandle for MockDoc {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> Option<u64> {
        *self.version.lock()
    }

    fn on_connection_state_changed(&self) {
        self.state_changes.fetch_add(1, Ordering::SeqCst);
        if self.resubscribe.load(Ordering::SeqCst) {
            let connection = self.connection.lock().clone().and_then(|weak| weak.upgrade());
            let this = self.self_ref.lock().clone().and_then(|weak| weak.upgrade());
            if let (Some(connection), Some(this)) = (connection, this) {
                if connection.can_send() {
                    let _ = connection.send_subscribe(&this.as_handle());
                }
            }
        }
    }

    fn handle_fetch(&self, error: Option<ProtocolError>, snapshot: Option<Value>) {
        self.fetches.lock().push((error, snapshot));
    }

    fn handle_subscribe(&self, error: Option<ProtocolError>, snapshot: Option<Value>) {
        self.subscribes.lock().push((error, snapshot));
    }

    fn handle_unsubscribe(&self, error: Option<ProtocolError>) {
        self.unsubscribes.lock().push(error);
    }

    fn handle_op(&self, error: Option<ProtocolError>, message: &Message) {
        self.ops.lock().push((error, message.clone()));
    }

    fn has_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    fn has_write_pending(&self) -> bool {
        self.write_pending.load(Ordering::SeqCst)
    }

    fn once_nothing_pending(&self, callback: Box<dyn FnOnce() + Send>) {
        if self.pending.load(Ordering::SeqCst) {
            self.nothing_pending_waiters.lock().push(callback);
        } else {
            callback();
        }
    }
}

/// Factory producing [`MockDoc`]s and remembering what it created.
#[derive(Default)]
pub struct MockDocFactory {
    pub created: Mutex<Vec<Arc<MockDoc>>>,
}

impl DocFactory for MockDocFactory {
    fn create(
        &self,
        connection: &Arc<Connection>,
        collection: &str,
        id: &str,
    ) -> Arc<dyn DocHandle> {
        let doc = MockDoc::new(collection, id, None);
        doc.attach(connection);
        self.created.lock().push(Arc::clone(&doc));
        doc
    }
}

/// Query double recording forwarded replies, errors, and diffs.
pub struct MockQuery {
    id: u64,
    pub state_changes: AtomicUsize,
    pub responses: Mutex<Vec<(Option<ProtocolError>, Option<Value>, Option<Value>)>>,
    pub errors: Mutex<Vec<ProtocolError>>,
    pub diffs: Mutex<Vec<(Option<Value>, Option<Value>)>>,
    pending: AtomicBool,
    ready_waiters: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl MockQuery {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            state_changes: AtomicUsize::new(0),
            responses: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            diffs: Mutex::new(Vec::new()),
            pending: AtomicBool::new(false),
            ready_waiters: Mutex::new(Vec::new()),
        })
    }

    pub fn as_handle(self: &Arc<Self>) -> Arc<dyn QueryHandle> {
        Arc::clone(self) as Arc<dyn QueryHandle>
    }

    pub fn set_pending(&self, pending: bool) {
        self.pending.store(pending, Ordering::SeqCst);
    }

    /// Marks the query ready and fires queued ready callbacks.
    pub fn ready(&self) {
        self.pending.store(false, Ordering::SeqCst);
        let waiters: Vec<_> = self.ready_waiters.lock().drain(..).collect();
        for waiter in waiters {
            waiter();
        }
    }
}

impl QueryHandle for MockQuery {
    fn id(&self) -> u64 {
        self.id
    }

    fn on_connection_state_changed(&self) {
        self.state_changes.fetch_add(1, Ordering::SeqCst);
    }

    fn handle_response(
        &self,
        error: Option<ProtocolError>,
        data: Option<Value>,
        extra: Option<Value>,
    ) {
        self.responses.lock().push((error, data, extra));
    }

    fn handle_error(&self, error: ProtocolError) {
        self.errors.lock().push(error);
    }

    fn handle_diff(&self, diff: Option<Value>, extra: Option<Value>) {
        self.diffs.lock().push((diff, extra));
    }

    fn has_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    fn once_ready(&self, callback: Box<dyn FnOnce() + Send>) {
        if self.pending.load(Ordering::SeqCst) {
            self.ready_waiters.lock().push(callback);
        } else {
            callback();
        }
    }
}

/// Observer double counting every callback and recording payloads.
#[derive(Default)]
pub struct RecordingObserver {
    pub connecting: AtomicUsize,
    pub connected: AtomicUsize,
    pub disconnected: AtomicUsize,
    pub closed: AtomicUsize,
    pub stopped: AtomicUsize,
    pub states: Mutex<Vec<(ConnectionState, Option<String>)>>,
    pub errors: Mutex<Vec<ProtocolError>>,
    pub connection_errors: AtomicUsize,
    pub receives: AtomicUsize,
    pub sends: Mutex<Vec<Message>>,
    pub docs: AtomicUsize,
}

impl ConnectionObserver for RecordingObserver {
    fn on_connecting(&self, _reason: Option<&str>) {
        self.connecting.fetch_add(1, Ordering::SeqCst);
    }

    fn on_connected(&self, _reason: Option<&str>) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnected(&self, _reason: Option<&str>) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_closed(&self, _reason: Option<&str>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_stopped(&self, _reason: Option<&str>) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }

    fn on_state_changed(&self, state: ConnectionState, reason: Option<&str>) {
        self.states
            .lock()
            .push((state, reason.map(ToString::to_string)));
    }

    fn on_error(&self, error: &ProtocolError) {
        self.errors.lock().push(error.clone());
    }

    fn on_connection_error(&self, _error: &anyhow::Error) {
        self.connection_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_receive(&self, _envelope: &mut ReceiveEnvelope) {
        self.receives.fetch_add(1, Ordering::SeqCst);
    }

    fn on_send(&self, message: &Message) {
        self.sends.lock().push(message.clone());
    }

    fn on_doc(&self, _doc: &Arc<dyn DocHandle>) {
        self.docs.fetch_add(1, Ordering::SeqCst);
    }
}

/// A valid server hello for the configured default type.
pub fn init_frame(client_id: &str) -> String {
    format!(r#"{{"a":"init","protocol":1,"type":"{DEFAULT_TYPE_URI}","id":"{client_id}"}}"#)
}
