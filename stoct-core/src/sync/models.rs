//! Sync data models: wire format and transport results.

use crate::crypto::KdfDescriptor;
use serde::{Deserialize, Serialize};

/// Version token of the blob in a download or upload response.
pub const ETAG_HEADER: &str = "x-stoct-etag";
/// Version counter of the blob in a download or upload response.
pub const VERSION_HEADER: &str = "x-stoct-v";
/// JSON-encoded KDF descriptor in a download response.
pub const KDF_HEADER: &str = "x-stoct-kdf";

/// `POST /v1/init` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitVaultRequest {
    pub user_id: String,
    pub kdf: KdfDescriptor,
    /// Base64 of `nonce || wrapped key || tag`.
    pub wrapped_vault_key: String,
}

/// `POST /v1/init` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitVaultResponse {
    pub etag: String,
}

/// `GET /v1/meta` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaResponse {
    pub has_vault: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdf: Option<KdfDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped_vault_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

/// `POST /v1/put` response body (mirrors the response headers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutResponse {
    pub etag: String,
    pub version: u64,
}

/// What the relay holds for a user, as seen by [`crate::sync::SyncTransport::fetch_meta`].
#[derive(Debug, Clone, Default)]
pub struct RemoteMeta {
    pub exists: bool,
    pub kdf: Option<KdfDescriptor>,
    /// Base64 wrapped vault key.
    pub wrapped_vault_key: Option<String>,
    pub version_token: Option<String>,
    pub version: Option<u64>,
}

impl From<MetaResponse> for RemoteMeta {
    fn from(meta: MetaResponse) -> Self {
        Self {
            exists: meta.has_vault,
            kdf: meta.kdf,
            wrapped_vault_key: meta.wrapped_vault_key,
            version_token: meta.etag,
            version: meta.version,
        }
    }
}

/// Encrypted blob plus the revision it belongs to.
#[derive(Debug, Clone)]
pub struct DownloadedBlob {
    /// `nonce(12) || ciphertext || tag(16)`
    pub bytes: Vec<u8>,
    pub version_token: String,
    pub version: u64,
    pub kdf: Option<KdfDescriptor>,
}

/// Revision accepted by the relay. Exactly what the next upload must present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub version_token: String,
    pub version: u64,
}

/// Snapshot of local sync state for display.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    pub enabled: bool,
    pub user_id: Option<String>,
    pub version: u64,
    pub last_sync_at: Option<i64>,
    pub has_vault_key: bool,
}
