use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

/// Callback invoked for each message observed on the cross-server channel.
pub type BroadcastCallback = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Optional cross-server coordination hook. cosync itself never fans out
/// across servers; this seam exists so a deployment can plug a broker in.
/// Failures are logged and swallowed, like storage.
#[async_trait]
pub trait PubSubAdapter: Send + Sync {
    async fn subscribe_to_broadcast(&self, callback: BroadcastCallback) -> Result<()>;

    async fn announce_presence(&self, server_id: &str, meta: serde_json::Value) -> Result<()>;

    async fn announce_shutdown(&self, server_id: &str) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

/// Default adapter: single-server deployments, everything is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPubSub;

#[async_trait]
impl PubSubAdapter for NoopPubSub {
    async fn subscribe_to_broadcast(&self, _callback: BroadcastCallback) -> Result<()> {
        Ok(())
    }

    async fn announce_presence(&self, server_id: &str, _meta: serde_json::Value) -> Result<()> {
        debug!(server_id, "pubsub: presence (noop)");
        Ok(())
    }

    async fn announce_shutdown(&self, server_id: &str) -> Result<()> {
        debug!(server_id, "pubsub: shutdown (noop)");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}
