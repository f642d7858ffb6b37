//! Persisted client sync state.

use crate::crypto::VaultKey;
use crate::sync::models::SyncStatus;
use crate::sync::settings::SettingsStore;
use crate::{Result, SyncError};
use base64::Engine;
use zeroize::Zeroizing;

const KEY_ENABLED: &str = "stoct.sync.enabled";
const KEY_USER_ID: &str = "stoct.sync.user_id";
const KEY_VERSION_TOKEN: &str = "stoct.sync.version_token";
const KEY_VERSION: &str = "stoct.sync.version";
const KEY_LAST_SYNC_AT: &str = "stoct.sync.last_sync_at";
const KEY_VAULT_KEY: &str = "stoct.sync.vault_key";

const ALL_KEYS: [&str; 6] = [
    KEY_ENABLED,
    KEY_USER_ID,
    KEY_VERSION_TOKEN,
    KEY_VERSION,
    KEY_LAST_SYNC_AT,
    KEY_VAULT_KEY,
];

/// Sync state of this installation. Only [`crate::SyncManager`] writes it.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    pub enabled: bool,
    pub user_id: Option<String>,
    pub version_token: Option<String>,
    pub version: u64,
    /// Unix milliseconds of the last successful push or pull.
    pub last_sync_at: Option<i64>,
    pub vault_key: Option<VaultKey>,
}

impl SyncState {
    /// Load from the settings store. Missing keys yield the default.
    pub fn load(store: &dyn SettingsStore) -> Result<Self> {
        let enabled = store.get(KEY_ENABLED)?.as_deref() == Some("true");
        let version = store
            .get(KEY_VERSION)?
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|e| SyncError::Storage(format!("Invalid stored version: {}", e)))
            })
            .transpose()?
            .unwrap_or(0);
        let last_sync_at = store
            .get(KEY_LAST_SYNC_AT)?
            .map(|v| {
                v.parse::<i64>()
                    .map_err(|e| SyncError::Storage(format!("Invalid stored timestamp: {}", e)))
            })
            .transpose()?;
        let vault_key = store
            .get(KEY_VAULT_KEY)?
            .map(|encoded| {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| SyncError::Storage(format!("Invalid stored vault key: {}", e)))?;
                VaultKey::from_slice(&bytes)
                    .map_err(|e| SyncError::Storage(format!("Invalid stored vault key: {}", e)))
            })
            .transpose()?;

        Ok(Self {
            enabled,
            user_id: store.get(KEY_USER_ID)?,
            version_token: store.get(KEY_VERSION_TOKEN)?,
            version,
            last_sync_at,
            vault_key,
        })
    }

    /// Write every field in one batch, removing keys whose value is absent.
    pub fn save(&self, store: &dyn SettingsStore) -> Result<()> {
        let version = self.version.to_string();
        let last_sync_at = self.last_sync_at.map(|t| t.to_string());
        let encoded_key = self
            .vault_key
            .as_ref()
            .map(|k| Zeroizing::new(base64::engine::general_purpose::STANDARD.encode(k.as_bytes())));

        store.apply(&[
            (KEY_ENABLED, Some(if self.enabled { "true" } else { "false" })),
            (KEY_USER_ID, self.user_id.as_deref()),
            (KEY_VERSION_TOKEN, self.version_token.as_deref()),
            (KEY_VERSION, Some(version.as_str())),
            (KEY_LAST_SYNC_AT, last_sync_at.as_deref()),
            (KEY_VAULT_KEY, encoded_key.as_deref().map(String::as_str)),
        ])
    }

    /// Remove every persisted field.
    pub fn clear(store: &dyn SettingsStore) -> Result<()> {
        let changes: [(&str, Option<&str>); 6] = ALL_KEYS.map(|key| (key, None));
        store.apply(&changes)
    }

    /// Whether pushes and pulls have everything they need.
    pub fn is_ready(&self) -> bool {
        self.enabled && self.user_id.is_some() && self.vault_key.is_some()
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            enabled: self.enabled,
            user_id: self.user_id.clone(),
            version: self.version,
            last_sync_at: self.last_sync_at,
            has_vault_key: self.vault_key.is_some(),
        }
    }
}
