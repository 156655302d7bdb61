//! Loopback transport for tests and single-process deployments.

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use serde_json::Value;

use crate::pubsub::PubSub;
use crate::transport::PubSubTransport;

/// Transport that fans publishes straight back into the local [`PubSub`].
///
/// Wired by [`PubSub::memory`]; holds only a weak reference so transport and
/// pubsub do not keep each other alive.
#[derive(Default)]
pub struct MemoryTransport {
    pubsub: OnceLock<Weak<PubSub>>,
}

impl MemoryTransport {
    pub(crate) fn attach(&self, pubsub: &Arc<PubSub>) {
        let _ = self.pubsub.set(Arc::downgrade(pubsub));
    }

    fn pubsub(&self) -> Option<Arc<PubSub>> {
        self.pubsub.get().and_then(Weak::upgrade)
    }
}

#[async_trait]
impl PubSubTransport for MemoryTransport {
    async fn publish(&self, channels: &[String], data: &Value) -> anyhow::Result<()> {
        if let Some(pubsub) = self.pubsub() {
            for channel in channels {
                pubsub.emit(channel, data);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, _channel: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn unsubscribe(&self, _channel: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
