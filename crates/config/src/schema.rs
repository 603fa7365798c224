use serde::Deserialize;

use cosync_protocol::{
    ACK_TIMEOUT_MS, AUTH_TIMEOUT_MS, BATCH_INTERVAL_MS, HEARTBEAT_INTERVAL_MS, MAX_RETRIES,
};

/// Top-level configuration. Every section and field is optional in the
/// file; defaults come from the protocol constants.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CosyncConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub storage: StorageSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connections beyond this are rejected with close code 1008.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncSection {
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            batch_interval_ms: default_batch_interval_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            max_retries: default_max_retries(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthSection {
    /// Shared token for the static verifier. Absent means the gateway runs
    /// open with anonymous read/write principals.
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageSection {
    /// Path to the SQLite database. Absent disables persistence.
    #[serde(default)]
    pub db_path: Option<String>,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    18900
}

fn default_max_connections() -> usize {
    1024
}

fn default_batch_interval_ms() -> u64 {
    BATCH_INTERVAL_MS
}

fn default_ack_timeout_ms() -> u64 {
    ACK_TIMEOUT_MS
}

fn default_max_retries() -> u32 {
    MAX_RETRIES
}

fn default_heartbeat_interval_ms() -> u64 {
    HEARTBEAT_INTERVAL_MS
}

fn default_auth_timeout_ms() -> u64 {
    AUTH_TIMEOUT_MS
}
