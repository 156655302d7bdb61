//! Channel fan-out with reference-counted transport subscriptions.
//!
//! One transport subscription is held per channel while at least one local
//! subscriber stream is alive on it. The `subscribed` map records channels
//! whose transport subscription has been confirmed; a channel may be absent
//! from it while a subscribe request is still in flight.
//!
//! The correctness-critical detail is in [`PubSub::remove_stream`]: when the
//! last stream on a channel closes, the confirmation flag is cleared inside
//! the same locked section that removes the channel entry, while the
//! transport unsubscribe runs asynchronously afterwards. A `subscribe` call
//! racing that unsubscribe therefore observes the cleared flag and performs
//! a fresh transport subscribe instead of attaching to a subscription that
//! is about to be torn down.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::memory::MemoryTransport;
use crate::stream::{OpStream, OpSubscription};
use crate::transport::PubSubTransport;

/// Configuration for a [`PubSub`].
#[derive(Debug, Clone, Default)]
pub struct PubSubOptions {
    /// Optional namespace prepended (space-separated) to every channel.
    pub prefix: Option<String>,
}

struct PubSubInner {
    next_stream_id: u64,
    streams_count: usize,
    streams: BTreeMap<String, BTreeMap<u64, OpStream>>,
    subscribed: BTreeMap<String, bool>,
}

/// Publish/subscribe fan-out over a pluggable channel transport.
pub struct PubSub {
    transport: Arc<dyn PubSubTransport>,
    prefix: Option<String>,
    self_ref: Weak<PubSub>,
    inner: Mutex<PubSubInner>,
}

impl PubSub {
    /// Creates a pubsub over the given transport.
    #[must_use]
    pub fn new(transport: Arc<dyn PubSubTransport>, options: PubSubOptions) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            transport,
            prefix: options.prefix,
            self_ref: self_ref.clone(),
            inner: Mutex::new(PubSubInner {
                next_stream_id: 1,
                streams_count: 0,
                streams: BTreeMap::new(),
                subscribed: BTreeMap::new(),
            }),
        })
    }

    /// Creates a pubsub over a process-local loopback transport.
    #[must_use]
    pub fn memory(options: PubSubOptions) -> Arc<Self> {
        let transport = Arc::new(MemoryTransport::default());
        let pubsub = Self::new(
            Arc::clone(&transport) as Arc<dyn PubSubTransport>,
            options,
        );
        transport.attach(&pubsub);
        pubsub
    }

    fn prefixed(&self, channel: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix} {channel}"),
            None => channel.to_string(),
        }
    }

    /// Publishes one payload to every listed channel.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if publishing fails.
    pub async fn publish(&self, channels: &[&str], data: &Value) -> anyhow::Result<()> {
        let channels: Vec<String> = channels
            .iter()
            .map(|channel| self.prefixed(channel))
            .collect();
        self.transport.publish(&channels, data).await
    }

    /// Opens a subscriber stream on a channel.
    ///
    /// When the channel's transport subscription is already confirmed the
    /// stream is delivered on a later tick without touching the transport;
    /// otherwise the transport subscribe runs first and the confirmation
    /// flag is set on success.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the subscribe fails; no stream is
    /// created in that case.
    pub async fn subscribe(&self, channel: &str) -> anyhow::Result<OpSubscription> {
        let channel = self.prefixed(channel);
        let already = self
            .inner
            .lock()
            .subscribed
            .get(&channel)
            .copied()
            .unwrap_or(false);
        if already {
            // Never resolve synchronously, even when no transport round-trip
            // is needed.
            tokio::task::yield_now().await;
            return Ok(self.create_stream(&channel));
        }
        self.transport.subscribe(&channel).await?;
        self.inner.lock().subscribed.insert(channel.clone(), true);
        Ok(self.create_stream(&channel))
    }

    /// Destroys every live stream. Subscribers see their streams end; each
    /// channel runs the normal last-stream teardown.
    pub fn close(&self) {
        let all: Vec<(String, u64)> = {
            let inner = self.inner.lock();
            inner
                .streams
                .iter()
                .flat_map(|(channel, streams)| {
                    streams.keys().map(move |id| (channel.clone(), *id))
                })
                .collect()
        };
        for (channel, id) in all {
            self.remove_stream(&channel, id);
        }
    }

    /// Delivers a payload from the transport to every subscriber stream on
    /// `channel` (already prefixed). Each stream receives its own copy, so
    /// one subscriber cannot mutate what another observes.
    pub fn emit(&self, channel: &str, data: &Value) {
        let streams: Vec<OpStream> = {
            let inner = self.inner.lock();
            inner
                .streams
                .get(channel)
                .map(|streams| streams.values().cloned().collect())
                .unwrap_or_default()
        };
        for stream in streams {
            let copy = data.clone();
            let collection = copy
                .get("c")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let doc_id = copy
                .get("d")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            stream.push_op(&collection, &doc_id, copy);
        }
    }

    /// Number of live subscriber streams across all channels.
    #[must_use]
    pub fn streams_count(&self) -> usize {
        self.inner.lock().streams_count
    }

    /// Whether the transport subscription for a channel is confirmed.
    #[must_use]
    pub fn is_subscribed(&self, channel: &str) -> bool {
        let channel = self.prefixed(channel);
        self.inner
            .lock()
            .subscribed
            .get(&channel)
            .copied()
            .unwrap_or(false)
    }

    fn create_stream(&self, channel: &str) -> OpSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_stream_id;
            inner.next_stream_id += 1;
            inner
                .streams
                .entry(channel.to_string())
                .or_default()
                .insert(id, OpStream::new(tx));
            inner.streams_count += 1;
            id
        };
        OpSubscription::new(id, channel.to_string(), rx, self.self_ref.clone())
    }

    pub(crate) fn remove_stream(&self, channel: &str, id: u64) {
        let last_on_channel = {
            let mut inner = self.inner.lock();
            let removed;
            let now_empty;
            match inner.streams.get_mut(channel) {
                Some(streams) => {
                    removed = streams.remove(&id).is_some();
                    now_empty = streams.is_empty();
                }
                None => return,
            }
            if !removed {
                return;
            }
            inner.streams_count -= 1;
            if now_empty {
                inner.streams.remove(channel);
                // Cleared synchronously: a subscribe racing the async
                // unsubscribe below must start a fresh transport subscribe.
                inner.subscribed.remove(channel);
            }
            now_empty
        };

        if last_on_channel {
            let transport = Arc::clone(&self.transport);
            let channel = channel.to_string();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(error) = transport.unsubscribe(&channel).await {
                            tracing::warn!(%error, %channel, "transport unsubscribe failed");
                        }
                    });
                }
                Err(_) => {
                    tracing::warn!(%channel, "no runtime; transport unsubscribe skipped");
                }
            }
        }
    }
}
