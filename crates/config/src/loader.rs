use std::path::Path;

use tracing::{debug, warn};

use crate::schema::CosyncConfig;

/// Load configuration: `COSYNC_CONFIG` path if set, else `cosync.toml` in
/// the working directory, else defaults. A broken file is logged and
/// ignored rather than aborting startup. Environment overrides apply last.
pub fn discover_and_load() -> CosyncConfig {
    let path = std::env::var("COSYNC_CONFIG").unwrap_or_else(|_| "cosync.toml".to_string());
    let mut config = load_file(Path::new(&path));
    apply_env_overrides(&mut config);
    config
}

fn load_file(path: &Path) -> CosyncConfig {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => {
            debug!(path = %path.display(), "config: no file, using defaults");
            return CosyncConfig::default();
        }
    };
    match toml::from_str(&text) {
        Ok(config) => {
            debug!(path = %path.display(), "config: loaded");
            config
        }
        Err(error) => {
            warn!(path = %path.display(), %error, "config: parse failed, using defaults");
            CosyncConfig::default()
        }
    }
}

fn apply_env_overrides(config: &mut CosyncConfig) {
    if let Ok(bind) = std::env::var("COSYNC_BIND") {
        config.server.bind = bind;
    }
    if let Ok(port) = std::env::var("COSYNC_PORT") {
        match port.parse() {
            Ok(port) => config.server.port = port,
            Err(_) => warn!(port, "config: COSYNC_PORT is not a valid port"),
        }
    }
    if let Ok(max) = std::env::var("COSYNC_MAX_CONNECTIONS") {
        match max.parse() {
            Ok(max) => config.server.max_connections = max,
            Err(_) => warn!(max, "config: COSYNC_MAX_CONNECTIONS is not a number"),
        }
    }
    if let Ok(token) = std::env::var("COSYNC_TOKEN") {
        config.auth.token = Some(token);
    }
    if let Ok(db_path) = std::env::var("COSYNC_DB") {
        config.storage.db_path = Some(db_path);
    }
}
