//! stoct core library
//!
//! Zero-knowledge synchronization of an encrypted card vault with a minimal
//! storage relay. The relay only ever sees an opaque KDF descriptor, a
//! wrapped vault key and an encrypted blob.
//!
//! - [`crypto`]: KEK derivation, vault key wrapping, vault encryption
//! - [`sync`]: wire models, HTTP transport, local sync state, [`SyncManager`]
//! - [`vault`]: the card set, its merge rules, and local vault sources

pub mod crypto;
pub mod sync;
pub mod vault;

pub use crypto::{CryptoError, KdfDescriptor, Kek, VaultKey};
pub use sync::{
    ClientConfig, HttpTransport, MemorySettings, SettingsStore, SqliteSettings, SyncManager,
    SyncState, SyncStatus, SyncTransport,
};
pub use vault::{Card, CardSet, FileVault, MemoryVault, MergeReport, VaultSource};

use thiserror::Error;

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by the transport and the sync manager.
///
/// Callers match on the variant; the display strings are for logs only. See
/// [`SyncError::user_message`] for the text a UI should present.
#[derive(Error, Debug)]
pub enum SyncError {
    /// No connectivity, DNS failure or timeout.
    #[error("Network error: {0}")]
    Network(String),

    /// Rate limit or storage cap hit on the relay.
    #[error("Sync quota exceeded")]
    QuotaExceeded,

    /// Transient relay outage.
    #[error("Sync service unavailable")]
    ServiceUnavailable,

    /// No vault or no blob on the relay yet.
    #[error("Not found")]
    NotFound,

    /// The presented version token is stale.
    #[error("Version precondition failed")]
    PreconditionFailed,

    /// Vault already initialized, or still conflicting after the single retry.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Wrong secret or corrupted ciphertext.
    #[error("Authentication failed")]
    AuthenticationFailure,

    /// No relay endpoint configured.
    #[error("Sync is not configured")]
    NotConfigured,

    /// Unexpected status or malformed response from the relay.
    #[error("Unexpected relay response: {0}")]
    Unknown(String),

    #[error("Crypto error: {0}")]
    Crypto(CryptoError),

    #[error("Local storage error: {0}")]
    Storage(String),

    #[error("Vault import failed: {0}")]
    Import(String),
}

impl From<CryptoError> for SyncError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::AuthenticationFailed => Self::AuthenticationFailure,
            other => Self::Crypto(other),
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl SyncError {
    /// Whether the operation can simply be tried again later with local data intact.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::QuotaExceeded | Self::ServiceUnavailable
        )
    }

    /// Message a UI should show for this error.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::QuotaExceeded | Self::ServiceUnavailable => {
                "Sync is temporarily unavailable. Your data is safe on this device and sync will resume."
            }
            Self::Network(_) => {
                "You appear to be offline. Your data is safe on this device and sync will resume."
            }
            Self::AuthenticationFailure => "Wrong password.",
            Self::NotFound => "No synced vault was found.",
            Self::PreconditionFailed | Self::Conflict(_) => {
                "Your vault was changed on another device. Try syncing again."
            }
            Self::NotConfigured => "Sync is not set up on this device.",
            Self::Unknown(_) | Self::Crypto(_) | Self::Storage(_) | Self::Import(_) => {
                "Sync failed."
            }
        }
    }
}
