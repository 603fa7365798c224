use std::sync::Arc;

use async_trait::async_trait;

use cosync_engine::DeliverySink;

use crate::registry::ConnectionRegistry;

/// Bridges the engine's delivery layer onto the connection registry: frames
/// go out through each connection's write loop, and the authenticated check
/// gates resends.
pub struct RegistrySink {
    registry: Arc<ConnectionRegistry>,
}

impl RegistrySink {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl DeliverySink for RegistrySink {
    async fn send(&self, connection_id: &str, frame: String) -> bool {
        self.registry.send_to(connection_id, &frame).await
    }

    async fn is_active(&self, connection_id: &str) -> bool {
        self.registry.is_authenticated(connection_id).await
    }
}
