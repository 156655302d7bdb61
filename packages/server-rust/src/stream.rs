//! Subscriber streams: the per-subscriber delivery queue on a channel.
//!
//! Each subscription is split in two: [`OpStream`], the push half the pubsub
//! keeps in its registry, and [`OpSubscription`], the receiving half handed
//! to the subscriber. Dropping the subscription closes it; closing is
//! idempotent.

use std::sync::Weak;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::pubsub::PubSub;

/// One published payload, addressed by collection and document id.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOp {
    /// Collection of the document the payload concerns.
    pub collection: String,
    /// Document id the payload concerns.
    pub doc_id: String,
    /// The payload itself; each subscriber receives its own copy.
    pub payload: Value,
}

/// Push half of a subscriber stream, kept in the pubsub registry keyed by
/// its stream id.
#[derive(Debug, Clone)]
pub(crate) struct OpStream {
    tx: mpsc::UnboundedSender<StreamOp>,
}

impl OpStream {
    pub fn new(tx: mpsc::UnboundedSender<StreamOp>) -> Self {
        Self { tx }
    }

    /// Queues one payload. A subscriber that has already gone away is
    /// skipped silently.
    pub fn push_op(&self, collection: &str, doc_id: &str, payload: Value) {
        let _ = self.tx.send(StreamOp {
            collection: collection.to_string(),
            doc_id: doc_id.to_string(),
            payload,
        });
    }
}

/// Receiving half of a subscriber stream.
///
/// Ends (yields `None`) when the pubsub closes. Dropping it closes the
/// subscription, which tears down the channel's transport subscription once
/// the last stream on the channel is gone.
pub struct OpSubscription {
    id: u64,
    channel: String,
    rx: mpsc::UnboundedReceiver<StreamOp>,
    pubsub: Weak<PubSub>,
    closed: bool,
}

impl OpSubscription {
    pub(crate) fn new(
        id: u64,
        channel: String,
        rx: mpsc::UnboundedReceiver<StreamOp>,
        pubsub: Weak<PubSub>,
    ) -> Self {
        Self {
            id,
            channel,
            rx,
            pubsub,
            closed: false,
        }
    }

    /// Stream id, unique per pubsub instance.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receives the next payload; `None` once the stream is closed and
    /// drained.
    pub async fn recv(&mut self) -> Option<StreamOp> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<StreamOp> {
        self.rx.try_recv().ok()
    }

    /// Closes the subscription. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.rx.close();
        if let Some(pubsub) = self.pubsub.upgrade() {
            pubsub.remove_stream(&self.channel, self.id);
        }
    }
}

impl Drop for OpSubscription {
    fn drop(&mut self) {
        self.close();
    }
}
