//! Relay storage model types.

use serde_json::Value;

/// One user's metadata row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMeta {
    /// Client KDF descriptor, kept verbatim.
    pub kdf: Value,
    pub wrapped_vault_key: String,
    pub etag: String,
    pub version: u64,
}

/// The current blob together with the revision it belongs to.
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub bytes: Vec<u8>,
    pub etag: String,
    pub version: u64,
    pub kdf: Value,
}

/// Revision assigned by an accepted write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub etag: String,
    pub version: u64,
}
