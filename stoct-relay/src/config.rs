//! Relay server configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen_addr: String,
    pub storage_path: PathBuf,
    /// Largest encrypted blob accepted by `POST /v1/put`.
    pub max_blob_bytes: usize,
    /// Largest request body of any kind.
    pub max_request_bytes: usize,
    /// Per-user budget; 0 disables rate limiting.
    pub rate_limit_per_minute: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8744".to_string(),
            storage_path: PathBuf::from("stoct-relay.db"),
            max_blob_bytes: 5 * 1024 * 1024,
            max_request_bytes: 5 * 1024 * 1024 + 64 * 1024,
            rate_limit_per_minute: 120,
        }
    }
}

impl RelayConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml_dep::from_str(&content)?;
        Ok(config)
    }
}
