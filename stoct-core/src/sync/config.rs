//! Client-side sync configuration.

use crate::crypto::kdf::DEFAULT_PBKDF2_ITERATIONS;
use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Where and how this installation talks to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay base URL. `None` means sync is not configured.
    pub endpoint: Option<String>,
    /// Per-request timeout.
    pub timeout_secs: u64,
    /// PBKDF2 iterations for newly initialized vaults.
    pub kdf_iterations: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: 20,
            kdf_iterations: DEFAULT_PBKDF2_ITERATIONS,
        }
    }
}

impl ClientConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Storage(format!("Read {}: {}", path.display(), e)))?;
        toml_dep::from_str(&content)
            .map_err(|e| SyncError::Storage(format!("Parse {}: {}", path.display(), e)))
    }

    /// Load from a TOML file if present, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
