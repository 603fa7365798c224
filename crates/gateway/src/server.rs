use std::sync::Arc;

use axum::{
    extract::State,
    extract::WebSocketUpgrade,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use cosync_common::time::epoch_millis;
use cosync_config::CosyncConfig;
use cosync_engine::pubsub::{NoopPubSub, PubSubAdapter};
use cosync_engine::{SqliteStorage, StorageAdapter};
use cosync_protocol::close;

use crate::auth::StaticTokenVerifier;
use crate::state::GatewayState;
use crate::ws::handle_connection;

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
struct AppState {
    gateway: Arc<GatewayState>,
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_upgrade_handler))
        .layer(cors)
        .with_state(AppState { gateway: state })
}

/// Start the sync gateway from loaded configuration. Blocks until shutdown.
pub async fn start_gateway(config: CosyncConfig) -> anyhow::Result<()> {
    let storage: Option<Arc<dyn StorageAdapter>> = match &config.storage.db_path {
        Some(path) => Some(Arc::new(SqliteStorage::open(path).await?)),
        None => None,
    };
    let verifier = Arc::new(StaticTokenVerifier::new(config.auth.token.clone()));
    let persistence = storage.is_some();

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let state = GatewayState::new(config, verifier, storage.clone());
    let app = build_gateway_app(Arc::clone(&state));

    // Cross-server coordination hook; a single-server deployment runs the
    // no-op adapter.
    let pubsub: Arc<dyn PubSubAdapter> = Arc::new(NoopPubSub);
    let server_id = state.hostname.clone();
    if let Err(error) = pubsub
        .announce_presence(&server_id, serde_json::json!({ "version": state.version }))
        .await
    {
        tracing::warn!(%error, "pubsub: presence announce failed");
    }

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    // Startup banner.
    info!("┌─────────────────────────────────────────────┐");
    info!("│  cosync gateway v{}                      │", state.version);
    info!("│  listening on {}             │", addr);
    info!(
        "│  persistence: {}                          │",
        if persistence { "sqlite" } else { "off   " }
    );
    info!("└─────────────────────────────────────────────┘");

    // Run the server; on ctrl-c, close every session with 1001 first.
    let shutdown_state = Arc::clone(&state);
    let shutdown_pubsub = Arc::clone(&pubsub);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("gateway: shutting down");
            let _ = shutdown_pubsub.announce_shutdown(&server_id).await;
            shutdown_state
                .registry
                .close_all(close::GOING_AWAY, "server shutting down")
                .await;
        })
        .await?;

    if let Some(storage) = storage {
        let _ = storage.disconnect().await;
    }
    let _ = pubsub.disconnect().await;
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let gateway = &state.gateway;
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": epoch_millis(),
        "version": gateway.version,
        "uptime": gateway.started_at.elapsed().as_secs(),
        "connections": {
            "totalConnections": gateway.registry.connection_count().await,
            "totalUsers": gateway.registry.principal_count().await,
            "totalClients": gateway.registry.client_count().await,
        },
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state.gateway))
}
