//! Pluggable transport behind the pubsub fan-out.
//!
//! The transport owns the actual channel plumbing (Redis, in-memory, ...).
//! It receives publish and subscription-management calls from [`PubSub`] and
//! delivers inbound payloads by calling [`PubSub::emit`].
//!
//! [`PubSub`]: crate::pubsub::PubSub
//! [`PubSub::emit`]: crate::pubsub::PubSub::emit

use async_trait::async_trait;
use serde_json::Value;

/// Channel transport contract. Implementations: Redis, in-memory (tests and
/// single-process deployments).
///
/// Used as `Arc<dyn PubSubTransport>`. Channels arrive already prefixed.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Publishes one payload to every listed channel.
    async fn publish(&self, channels: &[String], data: &Value) -> anyhow::Result<()>;

    /// Establishes the transport subscription for a channel. Called once per
    /// channel while local streams exist on it.
    async fn subscribe(&self, channel: &str) -> anyhow::Result<()>;

    /// Tears down the transport subscription for a channel. Called after the
    /// last local stream on it has closed.
    async fn unsubscribe(&self, channel: &str) -> anyhow::Result<()>;
}
