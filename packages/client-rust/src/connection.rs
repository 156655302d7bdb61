//! The client connection: a long-lived, reconnecting session multiplexing
//! document and query subscriptions over one socket.
//!
//! All mutable state sits behind a single mutex. The lock is only ever held
//! for registry and state bookkeeping -- never across observer, document,
//! query, or socket callbacks -- so collaborators are free to call back into
//! the connection.

use std::any::Any;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use opcast_core::{decode, encode, BulkBody, Message, ProtocolError, DEFAULT_TYPE_URI};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::bulk::{BulkAccumulator, BulkAction};
use crate::doc::{DocFactory, DocHandle, OpData};
use crate::observer::{ConnectionObserver, ObserverSet, ReceiveEnvelope};
use crate::query::{QueryAction, QueryHandle};
use crate::socket::{ReadyState, SocketAdapter};
use crate::state::{state_for_close_reason, ConnectionState};

/// Opaque server-side agent reference, cleared whenever the session resets.
pub type AgentRef = Arc<dyn Any + Send + Sync>;

/// Configuration for a [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// URI the server-declared default OT type must match at handshake.
    pub default_type_uri: String,
    /// Log full frame contents at `info` level.
    pub debug: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            default_type_uri: DEFAULT_TYPE_URI.to_string(),
            debug: false,
        }
    }
}

struct ConnInner {
    state: ConnectionState,
    can_send: bool,
    seq: u64,
    client_id: Option<String>,
    agent: Option<AgentRef>,
    socket: Option<Arc<dyn SocketAdapter>>,
    docs: BTreeMap<String, BTreeMap<String, Arc<dyn DocHandle>>>,
    queries: BTreeMap<u64, Arc<dyn QueryHandle>>,
    next_query_id: u64,
    bulk: Option<BulkAccumulator>,
}

/// A client session with a collaboration server.
///
/// Documents and queries register here; the connection batches their
/// subscription traffic, routes server replies back to them, and keeps both
/// registries alive across reconnects so they can re-subscribe.
pub struct Connection {
    options: ConnectionOptions,
    doc_factory: Arc<dyn DocFactory>,
    observers: ObserverSet,
    /// Back-reference handed to doc factories and deferred tasks.
    self_ref: Weak<Connection>,
    inner: Mutex<ConnInner>,
}

impl Connection {
    /// Creates an unbound connection in the `disconnected` state.
    #[must_use]
    pub fn new(options: ConnectionOptions, doc_factory: Arc<dyn DocFactory>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            options,
            doc_factory,
            observers: ObserverSet::default(),
            self_ref: self_ref.clone(),
            inner: Mutex::new(ConnInner {
                state: ConnectionState::Disconnected,
                can_send: false,
                seq: 1,
                client_id: None,
                agent: None,
                socket: None,
                docs: BTreeMap::new(),
                queries: BTreeMap::new(),
                next_query_id: 1,
                bulk: None,
            }),
        })
    }

    fn arc(&self) -> Arc<Connection> {
        self.self_ref.upgrade().expect("connection is alive")
    }

    /// Registers an observer for lifecycle and traffic notifications.
    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.observers.add(observer);
    }

    /// Binds to a socket, closing any previously bound one. The initial
    /// state derives from the socket's ready-state: a socket that is opening
    /// or open starts at `connecting`, anything else at `disconnected`.
    pub fn bind_to_socket(&self, socket: Arc<dyn SocketAdapter>) {
        let state = match socket.ready_state() {
            ReadyState::Opening | ReadyState::Open => ConnectionState::Connecting,
            ReadyState::Closing | ReadyState::Closed => ConnectionState::Disconnected,
        };
        let previous = {
            let mut inner = self.inner.lock();
            let previous = inner.socket.take();
            inner.state = state;
            inner.can_send = false;
            inner.socket = Some(socket);
            previous
        };
        if let Some(previous) = previous {
            previous.close();
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Whether frames may be sent; true exactly while `connected`.
    #[must_use]
    pub fn can_send(&self) -> bool {
        self.inner.lock().can_send
    }

    /// The server-assigned client id, available once connected.
    #[must_use]
    pub fn client_id(&self) -> Option<String> {
        self.inner.lock().client_id.clone()
    }

    /// Current op sequence number (the one the next op will take).
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.inner.lock().seq
    }

    /// Hands out the next op sequence number.
    pub fn next_seq(&self) -> u64 {
        let mut inner = self.inner.lock();
        let seq = inner.seq;
        inner.seq += 1;
        seq
    }

    /// The agent reference, if one was attached.
    #[must_use]
    pub fn agent(&self) -> Option<AgentRef> {
        self.inner.lock().agent.clone()
    }

    /// Attaches an agent reference; it is dropped on every session reset.
    pub fn set_agent(&self, agent: AgentRef) {
        self.inner.lock().agent = Some(agent);
    }

    /// Closes the bound socket. The resulting close notification drives the
    /// state change.
    pub fn close(&self) {
        let socket = self.inner.lock().socket.clone();
        if let Some(socket) = socket {
            socket.close();
        }
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    pub(crate) fn set_state(&self, new_state: ConnectionState, reason: Option<&str>) {
        {
            let mut inner = self.inner.lock();
            let old = inner.state;
            if old == new_state {
                return;
            }
            if !old.can_transition_to(new_state) {
                drop(inner);
                self.emit_error(&ProtocolError::new(
                    ProtocolError::ILLEGAL_STATE_TRANSITION,
                    format!("Cannot transition directly from {old} to {new_state}"),
                ));
                return;
            }
            inner.state = new_state;
            inner.can_send = new_state == ConnectionState::Connected;
            if matches!(
                new_state,
                ConnectionState::Disconnected | ConnectionState::Closed | ConnectionState::Stopped
            ) {
                inner.seq = 1;
                inner.client_id = None;
                inner.agent = None;
            }
        }

        // Re-notify every query and document inside one bulk window so their
        // resubscribes coalesce into at most two frames per collection per
        // action.
        self.start_bulk();
        for query in self.queries_snapshot() {
            query.on_connection_state_changed();
        }
        for doc in self.docs_snapshot() {
            doc.on_connection_state_changed();
        }
        self.end_bulk();

        self.observers.for_each(|observer| match new_state {
            ConnectionState::Connecting => observer.on_connecting(reason),
            ConnectionState::Connected => observer.on_connected(reason),
            ConnectionState::Disconnected => observer.on_disconnected(reason),
            ConnectionState::Closed => observer.on_closed(reason),
            ConnectionState::Stopped => observer.on_stopped(reason),
        });
        self.observers
            .for_each(|observer| observer.on_state_changed(new_state, reason));
    }

    fn emit_error(&self, error: &ProtocolError) {
        self.observers.for_each(|observer| observer.on_error(error));
    }

    // -----------------------------------------------------------------------
    // Socket entry points
    // -----------------------------------------------------------------------

    /// The transport finished opening its socket; the server hello will
    /// promote the connection to `connected`.
    pub fn socket_opened(&self) {
        self.set_state(ConnectionState::Connecting, None);
    }

    /// The transport closed, with its reason.
    pub fn socket_closed(&self, reason: &str) {
        self.set_state(state_for_close_reason(reason), Some(reason));
    }

    /// The transport reported an error. State is not changed here; the
    /// subsequent close notification drives it.
    pub fn socket_error(&self, error: &anyhow::Error) {
        self.observers
            .for_each(|observer| observer.on_connection_error(error));
    }

    /// An inbound frame arrived. Undecodable frames are logged and dropped;
    /// decoded frames pass through receive observers (which may consume
    /// them) and then dispatch. Dispatch failures are re-emitted as errors
    /// on a later tick so they cannot be mistaken for decode failures.
    pub fn socket_message(&self, raw: &str) {
        let message = match decode(raw) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(%error, "dropping undecodable frame");
                return;
            }
        };
        if self.options.debug {
            tracing::info!(action = message.action(), frame = ?message, "receive");
        } else {
            tracing::debug!(action = message.action(), "receive");
        }

        let mut envelope = ReceiveEnvelope {
            data: Some(message),
        };
        self.observers
            .for_each(|observer| observer.on_receive(&mut envelope));
        let Some(message) = envelope.data.take() else {
            return;
        };

        if let Err(error) = self.dispatch(message) {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let connection = self.arc();
                    handle.spawn(async move { connection.emit_error(&error) });
                }
                // No runtime to defer onto; deliver inline.
                Err(_) => self.emit_error(&error),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------------

    fn dispatch(&self, message: Message) -> Result<(), ProtocolError> {
        match message {
            Message::Init { .. } => self.handle_init(message),
            Message::Fetch { .. } | Message::Subscribe { .. } | Message::Unsubscribe { .. } => {
                self.handle_doc_reply(message);
                Ok(())
            }
            Message::Op { .. } => {
                self.handle_op_message(&message);
                Ok(())
            }
            Message::BulkFetch { .. } => {
                self.handle_bulk_reply(BulkAction::Fetch, message);
                Ok(())
            }
            Message::BulkSubscribe { .. } => {
                self.handle_bulk_reply(BulkAction::Subscribe, message);
                Ok(())
            }
            Message::BulkUnsubscribe { .. } => {
                self.handle_bulk_reply(BulkAction::Unsubscribe, message);
                Ok(())
            }
            Message::QueryFetch { .. } | Message::QuerySubscribe { .. } => {
                self.handle_query_reply(message);
                Ok(())
            }
            Message::QueryUpdate { .. } => {
                self.handle_query_update(message);
                Ok(())
            }
            // Unsubscribe acknowledgement; nothing to route.
            Message::QueryUnsubscribe { .. } => Ok(()),
            Message::Unknown => {
                tracing::warn!("ignoring frame with unknown action");
                Ok(())
            }
        }
    }

    fn handle_init(&self, message: Message) -> Result<(), ProtocolError> {
        let Message::Init {
            protocol,
            default_type,
            id,
            ..
        } = message
        else {
            return Ok(());
        };
        if protocol != Some(1) {
            return Err(ProtocolError::new(
                ProtocolError::INVALID_PROTOCOL_VERSION,
                "Invalid protocol version",
            ));
        }
        if default_type.as_deref() != Some(self.options.default_type_uri.as_str()) {
            return Err(ProtocolError::new(
                ProtocolError::INVALID_DEFAULT_TYPE,
                "Invalid default type",
            ));
        }
        let Some(Value::String(client_id)) = id else {
            return Err(ProtocolError::new(
                ProtocolError::INVALID_CLIENT_ID,
                "Invalid client id",
            ));
        };
        self.inner.lock().client_id = Some(client_id);
        self.set_state(ConnectionState::Connected, None);
        Ok(())
    }

    fn extract_error(&self, message: &Message) -> Option<ProtocolError> {
        message
            .error()
            .map(|envelope| ProtocolError::from_envelope(envelope, message))
    }

    fn handle_doc_reply(&self, message: Message) {
        let error = self.extract_error(&message);
        match message {
            Message::Fetch {
                collection, id, data, ..
            } => {
                if let Some(doc) = self.lookup_doc(&collection, &id) {
                    doc.handle_fetch(error, data);
                }
            }
            Message::Subscribe {
                collection, id, data, ..
            } => {
                if let Some(doc) = self.lookup_doc(&collection, &id) {
                    doc.handle_subscribe(error, data);
                }
            }
            Message::Unsubscribe { collection, id, .. } => {
                if let Some(doc) = self.lookup_doc(&collection, &id) {
                    doc.handle_unsubscribe(error);
                }
            }
            _ => {}
        }
    }

    fn handle_op_message(&self, message: &Message) {
        let Message::Op { collection, id, .. } = message else {
            return;
        };
        let Some(doc) = self.lookup_doc(collection, id) else {
            return;
        };
        // An op with an error envelope still delivers; the doc decides.
        doc.handle_op(self.extract_error(message), message);
    }

    fn handle_bulk_reply(&self, action: BulkAction, message: Message) {
        let error = self.extract_error(&message);
        let (collection, body, data) = match message {
            Message::BulkFetch {
                collection, body, data, ..
            }
            | Message::BulkSubscribe {
                collection, body, data, ..
            }
            | Message::BulkUnsubscribe {
                collection, body, data, ..
            } => (collection, body, data),
            _ => return,
        };

        let forward = |doc: &Arc<dyn DocHandle>, payload: Option<Value>| match action {
            BulkAction::Fetch => doc.handle_fetch(error.clone(), payload),
            BulkAction::Subscribe => doc.handle_subscribe(error.clone(), payload),
            BulkAction::Unsubscribe => doc.handle_unsubscribe(error.clone()),
        };

        if let Some(data) = data {
            for (id, payload) in data {
                if let Some(doc) = self.lookup_doc(&collection, &id) {
                    forward(&doc, Some(payload));
                }
            }
        } else if let Some(BulkBody::Ids(ids)) = body {
            for id in ids {
                if let Some(doc) = self.lookup_doc(&collection, &id) {
                    forward(&doc, None);
                }
            }
        } else if let Some(BulkBody::Versions(versions)) = body {
            for id in versions.keys() {
                if let Some(doc) = self.lookup_doc(&collection, id) {
                    forward(&doc, None);
                }
            }
        } else {
            tracing::error!(%collection, ?action, "invalid bulk reply: no data and no id set");
        }
    }

    fn handle_query_reply(&self, message: Message) {
        let error = self.extract_error(&message);
        let (id, data, extra) = match message {
            Message::QueryFetch {
                id, data, extra, ..
            }
            | Message::QuerySubscribe {
                id, data, extra, ..
            } => (id, data, extra),
            _ => return,
        };
        if let Some(query) = self.lookup_query(id) {
            query.handle_response(error, data, extra);
        }
    }

    fn handle_query_update(&self, message: Message) {
        let error = self.extract_error(&message);
        let Message::QueryUpdate {
            id, diff, extra, ..
        } = message
        else {
            return;
        };
        let Some(query) = self.lookup_query(id) else {
            return;
        };
        match error {
            Some(error) => query.handle_error(error),
            None => query.handle_diff(diff, extra),
        }
    }

    // -----------------------------------------------------------------------
    // Document registry
    // -----------------------------------------------------------------------

    /// Returns the document for `(collection, id)`, constructing and
    /// registering it on first use. Idempotent: the same handle identity is
    /// returned until the document is destroyed.
    pub fn get(&self, collection: &str, id: &str) -> Arc<dyn DocHandle> {
        if let Some(existing) = self.lookup_doc(collection, id) {
            return existing;
        }
        let created = self.doc_factory.create(&self.arc(), collection, id);
        let (doc, inserted) = {
            let mut inner = self.inner.lock();
            let slot = inner.docs.entry(collection.to_string()).or_default();
            match slot.entry(id.to_string()) {
                Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
                Entry::Vacant(entry) => {
                    entry.insert(Arc::clone(&created));
                    (created, true)
                }
            }
        };
        if inserted {
            self.observers.for_each(|observer| observer.on_doc(&doc));
        }
        doc
    }

    /// Removes a document from the registry, pruning the collection entry
    /// when it empties.
    pub fn destroy_doc(&self, doc: &Arc<dyn DocHandle>) {
        let mut inner = self.inner.lock();
        let collection_empty = match inner.docs.get_mut(doc.collection()) {
            Some(docs) => {
                docs.remove(doc.id());
                docs.is_empty()
            }
            None => false,
        };
        if collection_empty {
            inner.docs.remove(doc.collection());
        }
    }

    fn lookup_doc(&self, collection: &str, id: &str) -> Option<Arc<dyn DocHandle>> {
        self.inner
            .lock()
            .docs
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(Arc::clone)
    }

    fn docs_snapshot(&self) -> Vec<Arc<dyn DocHandle>> {
        self.inner
            .lock()
            .docs
            .values()
            .flat_map(BTreeMap::values)
            .map(Arc::clone)
            .collect()
    }

    // -----------------------------------------------------------------------
    // Query registry
    // -----------------------------------------------------------------------

    /// Allocates a query id, constructs the handle through `factory`,
    /// registers it, and triggers the initial `qf`/`qs` send when the
    /// connection can send. Re-sends after a reconnect are the query's own
    /// responsibility, driven by its state-change notification.
    pub fn create_query(
        &self,
        action: QueryAction,
        collection: &str,
        query: Value,
        options: BTreeMap<String, Value>,
        factory: impl FnOnce(u64) -> Arc<dyn QueryHandle>,
    ) -> Arc<dyn QueryHandle> {
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_query_id;
            inner.next_query_id += 1;
            id
        };
        let handle = factory(id);
        let can_send = {
            let mut inner = self.inner.lock();
            inner.queries.insert(id, Arc::clone(&handle));
            inner.can_send
        };
        if can_send {
            self.send(Self::query_message(action, id, collection, query, options));
        }
        handle
    }

    fn query_message(
        action: QueryAction,
        id: u64,
        collection: &str,
        query: Value,
        options: BTreeMap<String, Value>,
    ) -> Message {
        let collection = Some(collection.to_string());
        let query = Some(query);
        match action {
            QueryAction::Fetch => Message::QueryFetch {
                id,
                collection,
                query,
                data: None,
                extra: None,
                error: None,
                options,
            },
            QueryAction::Subscribe => Message::QuerySubscribe {
                id,
                collection,
                query,
                data: None,
                extra: None,
                error: None,
                options,
            },
        }
    }

    /// Removes a query from the registry.
    pub fn destroy_query(&self, query: &Arc<dyn QueryHandle>) {
        self.inner.lock().queries.remove(&query.id());
    }

    fn lookup_query(&self, id: u64) -> Option<Arc<dyn QueryHandle>> {
        self.inner.lock().queries.get(&id).map(Arc::clone)
    }

    fn queries_snapshot(&self) -> Vec<Arc<dyn QueryHandle>> {
        self.inner.lock().queries.values().map(Arc::clone).collect()
    }

    // -----------------------------------------------------------------------
    // Outbound traffic
    // -----------------------------------------------------------------------

    /// Emits one frame: send observers first, then the socket. Send failures
    /// are logged, not surfaced.
    pub fn send(&self, message: Message) {
        if self.options.debug {
            tracing::info!(action = message.action(), frame = ?message, "send");
        } else {
            tracing::debug!(action = message.action(), "send");
        }
        self.observers.for_each(|observer| observer.on_send(&message));
        let socket = self.inner.lock().socket.clone();
        let Some(socket) = socket else {
            tracing::warn!(action = message.action(), "dropping frame: no socket bound");
            return;
        };
        match encode(&message) {
            Ok(text) => {
                if let Err(error) = socket.send(&text) {
                    tracing::warn!(%error, action = message.action(), "socket send failed");
                }
            }
            Err(error) => tracing::warn!(%error, "frame failed to encode"),
        }
    }

    /// Requests a fetch of `doc` at its current version. In a bulk window
    /// the request is recorded instead of sent; the return value reports
    /// whether this overwrote an earlier recording for the same document.
    pub fn send_fetch(&self, doc: &Arc<dyn DocHandle>) -> bool {
        self.send_doc_action(BulkAction::Fetch, doc, doc.version())
    }

    /// Requests a subscription for `doc` at its current version.
    pub fn send_subscribe(&self, doc: &Arc<dyn DocHandle>) -> bool {
        self.send_doc_action(BulkAction::Subscribe, doc, doc.version())
    }

    /// Cancels the subscription for `doc`.
    pub fn send_unsubscribe(&self, doc: &Arc<dyn DocHandle>) -> bool {
        self.send_doc_action(BulkAction::Unsubscribe, doc, None)
    }

    fn send_doc_action(
        &self,
        action: BulkAction,
        doc: &Arc<dyn DocHandle>,
        version: Option<u64>,
    ) -> bool {
        {
            let mut inner = self.inner.lock();
            ensure_doc(&mut inner, doc);
            if let Some(bulk) = inner.bulk.as_mut() {
                return bulk.record(action, doc.collection(), doc.id(), version);
            }
        }
        self.send(action.single_frame(doc.collection(), doc.id(), version));
        false
    }

    /// Sends an op for `doc`. Ops are never batched.
    pub fn send_op(&self, doc: &Arc<dyn DocHandle>, op: &OpData) {
        {
            let mut inner = self.inner.lock();
            ensure_doc(&mut inner, doc);
        }
        self.send(Message::Op {
            collection: doc.collection().to_string(),
            id: doc.id().to_string(),
            version: doc.version(),
            src: op.src.clone(),
            seq: Some(op.seq),
            op: op.op.clone(),
            create: op.create.clone(),
            del: op.del,
            error: None,
        });
    }

    /// Opens a bulk window; document actions coalesce until [`end_bulk`].
    /// Idempotent while a window is already open.
    ///
    /// [`end_bulk`]: Connection::end_bulk
    pub fn start_bulk(&self) {
        let mut inner = self.inner.lock();
        if inner.bulk.is_none() {
            inner.bulk = Some(BulkAccumulator::default());
        }
    }

    /// Closes the bulk window and sends the coalesced frames.
    pub fn end_bulk(&self) {
        let frames = self.inner.lock().bulk.take().map(BulkAccumulator::flush);
        if let Some(frames) = frames {
            for frame in frames {
                self.send(frame);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Quiescence
    // -----------------------------------------------------------------------

    /// Whether any registered document or query reports pending work.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.first_pending_doc().is_some() || self.first_pending_query().is_some()
    }

    /// Whether any registered document reports a pending write.
    #[must_use]
    pub fn has_write_pending(&self) -> bool {
        self.docs_snapshot()
            .iter()
            .any(|doc| doc.has_write_pending())
    }

    /// Resolves once no registered document or query reports pending work.
    ///
    /// Each wait is followed by a fresh scan from the top: settling one
    /// document or query may have queued new work elsewhere.
    pub async fn when_nothing_pending(&self) {
        loop {
            if let Some(doc) = self.first_pending_doc() {
                let (tx, rx) = oneshot::channel();
                doc.once_nothing_pending(Box::new(move || {
                    let _ = tx.send(());
                }));
                let _ = rx.await;
                tokio::task::yield_now().await;
                continue;
            }
            if let Some(query) = self.first_pending_query() {
                let (tx, rx) = oneshot::channel();
                query.once_ready(Box::new(move || {
                    let _ = tx.send(());
                }));
                let _ = rx.await;
                tokio::task::yield_now().await;
                continue;
            }
            tokio::task::yield_now().await;
            return;
        }
    }

    fn first_pending_doc(&self) -> Option<Arc<dyn DocHandle>> {
        self.docs_snapshot().into_iter().find(|doc| doc.has_pending())
    }

    fn first_pending_query(&self) -> Option<Arc<dyn QueryHandle>> {
        self.queries_snapshot()
            .into_iter()
            .find(|query| query.has_pending())
    }
}

fn ensure_doc(inner: &mut ConnInner, doc: &Arc<dyn DocHandle>) {
    inner
        .docs
        .entry(doc.collection().to_string())
        .or_default()
        .entry(doc.id().to_string())
        .or_insert_with(|| Arc::clone(doc));
}
