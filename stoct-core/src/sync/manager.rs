//! Sync manager: orchestrates initialize/push/pull against the relay.
//!
//! Every operation works on a staged copy of [`SyncState`] and persists it
//! only once the whole operation has succeeded, so a failed call never leaves
//! a half-updated installation behind.

use crate::crypto::kdf::DEFAULT_PBKDF2_ITERATIONS;
use crate::crypto::{
    decrypt_vault, encrypt_vault, unwrap_vault_key, wrap_vault_key, CryptoError, KdfDescriptor,
    Kek, VaultKey,
};
use crate::sync::client::SyncTransport;
use crate::sync::models::{InitVaultRequest, Revision, SyncStatus};
use crate::sync::settings::SettingsStore;
use crate::sync::state::SyncState;
use crate::vault::{MergeReport, VaultSource};
use crate::{Result, SyncError};
use base64::Engine;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Result of a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Sync disabled or key material absent; nothing was sent.
    Skipped,
    /// The relay accepted the blob. `merged` is set when a stale token forced
    /// a pull before the retry.
    Pushed {
        version: u64,
        merged: Option<MergeReport>,
    },
}

/// Result of a pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// Sync disabled; nothing was fetched.
    Skipped,
    /// The relay has metadata but no blob yet.
    Empty,
    Pulled { version: u64, report: MergeReport },
}

/// Client-side sync service. Construct one per installation and share it by
/// reference; concurrent calls on one instance are serialized.
pub struct SyncManager<T, S, V> {
    transport: Option<T>,
    settings: S,
    vault: V,
    kdf_iterations: u32,
    state: Mutex<SyncState>,
}

impl<T, S, V> SyncManager<T, S, V>
where
    T: SyncTransport,
    S: SettingsStore,
    V: VaultSource,
{
    /// Create a manager, loading persisted state from `settings`.
    ///
    /// `transport` is `None` when no relay endpoint is configured.
    pub fn new(transport: Option<T>, settings: S, vault: V) -> Result<Self> {
        let state = SyncState::load(&settings)?;
        Ok(Self {
            transport,
            settings,
            vault,
            kdf_iterations: DEFAULT_PBKDF2_ITERATIONS,
            state: Mutex::new(state),
        })
    }

    /// PBKDF2 iteration count for vaults created by [`Self::initialize_sync`].
    pub fn with_kdf_iterations(mut self, iterations: u32) -> Self {
        self.kdf_iterations = iterations;
        self
    }

    pub fn vault(&self) -> &V {
        &self.vault
    }

    pub async fn status(&self) -> SyncStatus {
        self.state.lock().await.status()
    }

    /// Create a new remote vault protected by `secret` and seed it with the
    /// local vault. Returns the new user id.
    pub async fn initialize_sync(&self, secret: &str) -> Result<String> {
        let transport = self.transport()?;
        let mut state = self.state.lock().await;

        let vault_key = VaultKey::generate();
        let descriptor = KdfDescriptor::pbkdf2(self.kdf_iterations)?;
        let kek = derive_kek(descriptor.clone(), secret).await?;
        let wrapped = wrap_vault_key(&vault_key, &kek)?;

        let user_id = Uuid::new_v4().to_string();
        let request = InitVaultRequest {
            user_id: user_id.clone(),
            kdf: descriptor,
            wrapped_vault_key: base64::engine::general_purpose::STANDARD.encode(&wrapped),
        };
        let version_token = transport.init_vault(&request).await?;
        info!(%user_id, "Remote vault created");

        let mut draft = SyncState {
            enabled: true,
            user_id: Some(user_id.clone()),
            version_token: Some(version_token),
            version: 1,
            last_sync_at: None,
            vault_key: Some(vault_key),
        };
        self.push_staged(transport, &mut draft).await?;
        self.commit(&mut state, draft)?;

        Ok(user_id)
    }

    /// Join an existing remote vault from this installation.
    ///
    /// Fails with [`SyncError::AuthenticationFailure`] if `secret` does not
    /// unwrap the stored vault key.
    pub async fn connect_existing(&self, user_id: &str, secret: &str) -> Result<PullOutcome> {
        let transport = self.transport()?;
        let mut state = self.state.lock().await;

        let meta = transport.fetch_meta(user_id).await?;
        if !meta.exists {
            return Err(SyncError::NotFound);
        }
        let descriptor = meta
            .kdf
            .ok_or_else(|| SyncError::Unknown("Metadata without KDF descriptor".to_string()))?;
        let wrapped = meta
            .wrapped_vault_key
            .ok_or_else(|| SyncError::Unknown("Metadata without wrapped key".to_string()))
            .and_then(|encoded| {
                base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| SyncError::Unknown(format!("Invalid wrapped key encoding: {}", e)))
            })?;
        let version_token = meta
            .version_token
            .ok_or_else(|| SyncError::Unknown("Metadata without version token".to_string()))?;

        let kek = derive_kek(descriptor, secret).await?;
        let vault_key = unwrap_vault_key(&wrapped, &kek)?;

        let mut draft = SyncState {
            enabled: true,
            user_id: Some(user_id.to_string()),
            version_token: Some(version_token),
            version: meta.version.unwrap_or(1),
            last_sync_at: None,
            vault_key: Some(vault_key),
        };
        let outcome = match self.pull_staged(transport, &mut draft).await {
            Ok(report) => PullOutcome::Pulled {
                version: draft.version,
                report,
            },
            Err(SyncError::NotFound) => PullOutcome::Empty,
            Err(e) => return Err(e),
        };
        self.commit(&mut state, draft)?;
        info!(%user_id, "Connected to existing remote vault");

        Ok(outcome)
    }

    /// Upload the full local vault.
    ///
    /// On a stale version token this pulls once, then retries once. A second
    /// stale token is reported as [`SyncError::Conflict`].
    pub async fn push_to_cloud(&self) -> Result<PushOutcome> {
        let mut state = self.state.lock().await;
        if !state.is_ready() {
            debug!("Sync not enabled, skipping push");
            return Ok(PushOutcome::Skipped);
        }
        let transport = self.transport()?;

        let mut draft = state.clone();
        let outcome = self.push_staged(transport, &mut draft).await?;
        self.commit(&mut state, draft)?;
        Ok(outcome)
    }

    /// Download, decrypt and import the remote vault.
    pub async fn pull_from_cloud(&self) -> Result<PullOutcome> {
        let mut state = self.state.lock().await;
        if !state.is_ready() {
            debug!("Sync not enabled, skipping pull");
            return Ok(PullOutcome::Skipped);
        }
        let transport = self.transport()?;

        let mut draft = state.clone();
        let report = self.pull_staged(transport, &mut draft).await?;
        let version = draft.version;
        self.commit(&mut state, draft)?;
        Ok(PullOutcome::Pulled { version, report })
    }

    /// Forget all local sync state. The remote vault is left untouched.
    pub async fn disable_sync(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        SyncState::clear(&self.settings)?;
        *state = SyncState::default();
        info!("Sync disabled, local sync state cleared");
        Ok(())
    }

    // --- Internal helpers ---

    fn transport(&self) -> Result<&T> {
        self.transport.as_ref().ok_or(SyncError::NotConfigured)
    }

    fn commit(&self, state: &mut SyncState, draft: SyncState) -> Result<()> {
        draft.save(&self.settings)?;
        *state = draft;
        Ok(())
    }

    async fn push_staged(&self, transport: &T, draft: &mut SyncState) -> Result<PushOutcome> {
        match self.upload_once(transport, draft).await {
            Ok(revision) => Ok(PushOutcome::Pushed {
                version: revision.version,
                merged: None,
            }),
            Err(SyncError::PreconditionFailed) => {
                warn!(
                    user_id = draft.user_id.as_deref().unwrap_or_default(),
                    "Version token stale, pulling before retrying push"
                );
                let report = self.pull_staged(transport, draft).await?;
                match self.upload_once(transport, draft).await {
                    Ok(revision) => Ok(PushOutcome::Pushed {
                        version: revision.version,
                        merged: Some(report),
                    }),
                    Err(SyncError::PreconditionFailed) => Err(SyncError::Conflict(
                        "Remote vault changed again while retrying push".to_string(),
                    )),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn upload_once(&self, transport: &T, draft: &mut SyncState) -> Result<Revision> {
        let (user_id, vault_key) = ready_parts(draft)?;
        let token = draft
            .version_token
            .clone()
            .ok_or_else(|| SyncError::Storage("No version token recorded".to_string()))?;

        let plaintext = Zeroizing::new(self.vault.serialize_vault()?);
        let blob = encrypt_vault(&plaintext, &vault_key)?;

        let revision = transport.upload_blob(&user_id, &blob, &token).await?;
        debug!(%user_id, version = revision.version, "Blob uploaded");

        draft.version_token = Some(revision.version_token.clone());
        draft.version = revision.version;
        draft.last_sync_at = Some(chrono::Utc::now().timestamp_millis());
        Ok(revision)
    }

    async fn pull_staged(&self, transport: &T, draft: &mut SyncState) -> Result<MergeReport> {
        let (user_id, vault_key) = ready_parts(draft)?;

        let blob = transport.download_blob(&user_id).await?;
        let plaintext = Zeroizing::new(decrypt_vault(&blob.bytes, &vault_key)?);
        let report = self.vault.import_vault(&plaintext)?;
        debug!(%user_id, version = blob.version, ?report, "Blob imported");

        draft.version_token = Some(blob.version_token);
        draft.version = blob.version;
        draft.last_sync_at = Some(chrono::Utc::now().timestamp_millis());
        Ok(report)
    }
}

fn ready_parts(draft: &SyncState) -> Result<(String, VaultKey)> {
    match (&draft.user_id, &draft.vault_key) {
        (Some(user_id), Some(key)) => Ok((user_id.clone(), key.clone())),
        _ => Err(SyncError::NotConfigured),
    }
}

/// Run the (deliberately slow) KDF on the blocking pool.
async fn derive_kek(descriptor: KdfDescriptor, secret: &str) -> Result<Kek> {
    let secret = Zeroizing::new(secret.as_bytes().to_vec());
    tokio::task::spawn_blocking(move || descriptor.derive(&secret))
        .await
        .map_err(|e| SyncError::Crypto(CryptoError::KdfFailed(format!("KDF task failed: {}", e))))?
        .map_err(SyncError::from)
}
