use std::sync::Arc;
use std::time::{Duration, Instant};

use cosync_config::CosyncConfig;
use cosync_engine::{DeliveryConfig, DeliveryLayer, StorageAdapter, SyncCoordinator};

use crate::auth::TokenVerifier;
use crate::broadcast::RegistrySink;
use crate::registry::ConnectionRegistry;

/// Shared gateway runtime state, wrapped in Arc for use across async tasks.
pub struct GatewayState {
    /// All live WebSocket connections plus their indexes.
    pub registry: Arc<ConnectionRegistry>,
    /// Per-document replication state.
    pub coordinator: Arc<SyncCoordinator>,
    /// Batching + ACK-tracked outbound path.
    pub delivery: Arc<DeliveryLayer>,
    /// Auth hook.
    pub verifier: Arc<dyn TokenVerifier>,
    pub config: CosyncConfig,
    /// Server version string.
    pub version: String,
    /// Hostname for the health payload.
    pub hostname: String,
    pub started_at: Instant,
}

impl GatewayState {
    pub fn new(
        config: CosyncConfig,
        verifier: Arc<dyn TokenVerifier>,
        storage: Option<Arc<dyn StorageAdapter>>,
    ) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let coordinator = Arc::new(SyncCoordinator::new(storage));
        let delivery = DeliveryLayer::new(
            Arc::clone(&coordinator),
            Arc::new(RegistrySink::new(Arc::clone(&registry))),
            DeliveryConfig {
                batch_interval: Duration::from_millis(config.sync.batch_interval_ms),
                ack_timeout: Duration::from_millis(config.sync.ack_timeout_ms),
                max_retries: config.sync.max_retries,
            },
        );

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".into());

        Arc::new(Self {
            registry,
            coordinator,
            delivery,
            verifier,
            config,
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname,
            started_at: Instant::now(),
        })
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.config.sync.heartbeat_interval_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.config.sync.auth_timeout_ms)
    }
}
