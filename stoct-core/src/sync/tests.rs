//! SyncManager against an in-process relay with compare-and-swap semantics.

use super::*;
use crate::crypto::kdf::MIN_PBKDF2_ITERATIONS;
use crate::crypto::{wrap_vault_key, KdfDescriptor, VaultKey};
use crate::sync::models::InitVaultRequest;
use crate::vault::{Card, MemoryVault};
use crate::{Result, SyncError};
use async_trait::async_trait;
use base64::Engine;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const SECRET: &str = "correct horse battery staple";

#[derive(Clone, Copy)]
enum Outage {
    Network,
    Quota,
}

struct StoredVault {
    kdf: KdfDescriptor,
    wrapped_vault_key: String,
    etag: String,
    version: u64,
    blob: Option<Vec<u8>>,
}

#[derive(Default)]
struct RelayInner {
    vaults: HashMap<String, StoredVault>,
    next_etag: u64,
    forced_stale: usize,
    outage: Option<Outage>,
    uploads: usize,
}

impl RelayInner {
    fn fresh_etag(&mut self) -> String {
        self.next_etag += 1;
        format!("etag-{}", self.next_etag)
    }

    fn check_outage(&self) -> Result<()> {
        match self.outage {
            Some(Outage::Network) => Err(SyncError::Network("connection refused".to_string())),
            Some(Outage::Quota) => Err(SyncError::QuotaExceeded),
            None => Ok(()),
        }
    }
}

/// Shared handle; clones talk to the same relay, like two devices would.
#[derive(Clone, Default)]
struct FakeRelay {
    inner: Arc<Mutex<RelayInner>>,
}

impl FakeRelay {
    fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut RelayInner) -> R) -> R {
        f(&mut self.inner.lock().unwrap())
    }

    /// Answer the next `n` uploads with a stale-token rejection.
    fn force_stale(&self, n: usize) {
        self.with(|r| r.forced_stale = n);
    }

    fn set_outage(&self, outage: Option<Outage>) {
        self.with(|r| r.outage = outage);
    }

    fn uploads(&self) -> usize {
        self.with(|r| r.uploads)
    }

    fn version(&self, user_id: &str) -> Option<u64> {
        self.with(|r| r.vaults.get(user_id).map(|v| v.version))
    }

    fn blob(&self, user_id: &str) -> Option<Vec<u8>> {
        self.with(|r| r.vaults.get(user_id).and_then(|v| v.blob.clone()))
    }

    fn tamper(&self, user_id: &str) {
        self.with(|r| {
            if let Some(blob) = r.vaults.get_mut(user_id).and_then(|v| v.blob.as_mut()) {
                let last = blob.len() - 1;
                blob[last] ^= 0x01;
            }
        });
    }
}

#[async_trait]
impl SyncTransport for FakeRelay {
    async fn init_vault(&self, request: &InitVaultRequest) -> Result<String> {
        self.with(|r| {
            r.check_outage()?;
            if r.vaults.contains_key(&request.user_id) {
                return Err(SyncError::Conflict("Vault already exists".to_string()));
            }
            let etag = r.fresh_etag();
            r.vaults.insert(
                request.user_id.clone(),
                StoredVault {
                    kdf: request.kdf.clone(),
                    wrapped_vault_key: request.wrapped_vault_key.clone(),
                    etag: etag.clone(),
                    version: 1,
                    blob: None,
                },
            );
            Ok(etag)
        })
    }

    async fn fetch_meta(&self, user_id: &str) -> Result<RemoteMeta> {
        self.with(|r| {
            r.check_outage()?;
            Ok(match r.vaults.get(user_id) {
                Some(v) => RemoteMeta {
                    exists: true,
                    kdf: Some(v.kdf.clone()),
                    wrapped_vault_key: Some(v.wrapped_vault_key.clone()),
                    version_token: Some(v.etag.clone()),
                    version: Some(v.version),
                },
                None => RemoteMeta::default(),
            })
        })
    }

    async fn download_blob(&self, user_id: &str) -> Result<DownloadedBlob> {
        self.with(|r| {
            r.check_outage()?;
            let vault = r.vaults.get(user_id).ok_or(SyncError::NotFound)?;
            let bytes = vault.blob.clone().ok_or(SyncError::NotFound)?;
            Ok(DownloadedBlob {
                bytes,
                version_token: vault.etag.clone(),
                version: vault.version,
                kdf: Some(vault.kdf.clone()),
            })
        })
    }

    async fn upload_blob(
        &self,
        user_id: &str,
        bytes: &[u8],
        expected_token: &str,
    ) -> Result<Revision> {
        self.with(|r| {
            r.check_outage()?;
            if r.forced_stale > 0 {
                r.forced_stale -= 1;
                return Err(SyncError::PreconditionFailed);
            }
            let etag = r.fresh_etag();
            let vault = r.vaults.get_mut(user_id).ok_or(SyncError::NotFound)?;
            if vault.etag != expected_token {
                return Err(SyncError::PreconditionFailed);
            }
            vault.blob = Some(bytes.to_vec());
            vault.etag = etag.clone();
            vault.version += 1;
            let version = vault.version;
            r.uploads += 1;
            Ok(Revision {
                version_token: etag,
                version,
            })
        })
    }
}

type Device = SyncManager<FakeRelay, MemorySettings, MemoryVault>;

fn device(relay: &FakeRelay) -> Device {
    SyncManager::new(Some(relay.clone()), MemorySettings::new(), MemoryVault::new())
        .unwrap()
        .with_kdf_iterations(MIN_PBKDF2_ITERATIONS)
}

fn card_names(device: &Device) -> Vec<String> {
    let mut names: Vec<_> = device
        .vault()
        .snapshot()
        .unwrap()
        .live()
        .map(|c| c.name.clone())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn initialize_seeds_remote_vault() {
    let relay = FakeRelay::new();
    let phone = device(&relay);
    phone.vault().upsert(Card::new("Library", "29384756")).unwrap();

    let user_id = phone.initialize_sync(SECRET).await.unwrap();

    let status = phone.status().await;
    assert!(status.enabled);
    assert!(status.has_vault_key);
    assert_eq!(status.user_id.as_deref(), Some(user_id.as_str()));
    // init creates version 1, the seeding upload makes it 2
    assert_eq!(status.version, 2);
    assert_eq!(relay.version(&user_id), Some(2));
    assert!(status.last_sync_at.is_some());

    // The relay only holds ciphertext.
    let blob = relay.blob(&user_id).unwrap();
    assert!(!blob.windows(7).any(|w| w == b"Library"));
}

#[tokio::test]
async fn initialize_without_endpoint_is_not_configured() {
    let phone: Device =
        SyncManager::new(None, MemorySettings::new(), MemoryVault::new()).unwrap();

    assert!(matches!(
        phone.initialize_sync(SECRET).await,
        Err(SyncError::NotConfigured)
    ));
    assert!(matches!(
        phone.connect_existing("someone", SECRET).await,
        Err(SyncError::NotConfigured)
    ));
    // Disabled sync short-circuits before the transport is consulted.
    assert_eq!(phone.push_to_cloud().await.unwrap(), PushOutcome::Skipped);
}

#[tokio::test]
async fn failed_initialize_persists_nothing() {
    let relay = FakeRelay::new();
    relay.set_outage(Some(Outage::Network));
    let phone = device(&relay);

    let err = phone.initialize_sync(SECRET).await.unwrap_err();
    assert!(err.is_transient());

    let status = phone.status().await;
    assert!(!status.enabled);
    assert!(status.user_id.is_none());
    assert!(!status.has_vault_key);
}

#[tokio::test]
async fn push_and_pull_skipped_when_disabled() {
    let relay = FakeRelay::new();
    let phone = device(&relay);
    phone.vault().upsert(Card::new("Gym", "A-1001")).unwrap();

    assert_eq!(phone.push_to_cloud().await.unwrap(), PushOutcome::Skipped);
    assert_eq!(phone.pull_from_cloud().await.unwrap(), PullOutcome::Skipped);
    assert_eq!(relay.uploads(), 0);
}

#[tokio::test]
async fn second_device_connects_and_pulls() {
    let relay = FakeRelay::new();
    let phone = device(&relay);
    phone.vault().upsert(Card::new("Library", "29384756")).unwrap();
    let user_id = phone.initialize_sync(SECRET).await.unwrap();

    let tablet = device(&relay);
    let outcome = tablet.connect_existing(&user_id, SECRET).await.unwrap();
    match outcome {
        PullOutcome::Pulled { version, report } => {
            assert_eq!(version, 2);
            assert_eq!(report.added, 1);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(card_names(&tablet), vec!["Library"]);

    let status = tablet.status().await;
    assert!(status.enabled);
    assert_eq!(status.version, 2);
}

#[tokio::test]
async fn connect_with_wrong_secret_fails_cleanly() {
    let relay = FakeRelay::new();
    let phone = device(&relay);
    let user_id = phone.initialize_sync(SECRET).await.unwrap();

    let tablet = device(&relay);
    let result = tablet.connect_existing(&user_id, "wrong secret").await;
    assert!(matches!(result, Err(SyncError::AuthenticationFailure)));

    let status = tablet.status().await;
    assert!(!status.enabled);
    assert!(!status.has_vault_key);
}

#[tokio::test]
async fn connect_to_unknown_user_is_not_found() {
    let relay = FakeRelay::new();
    let tablet = device(&relay);
    assert!(matches!(
        tablet.connect_existing("nobody", SECRET).await,
        Err(SyncError::NotFound)
    ));
}

#[tokio::test]
async fn connect_before_first_upload_is_empty() {
    let relay = FakeRelay::new();

    // Another client initialized but never uploaded a blob.
    let descriptor = KdfDescriptor::pbkdf2(MIN_PBKDF2_ITERATIONS).unwrap();
    let kek = descriptor.derive(SECRET.as_bytes()).unwrap();
    let wrapped = wrap_vault_key(&VaultKey::generate(), &kek).unwrap();
    relay
        .init_vault(&InitVaultRequest {
            user_id: "u1".to_string(),
            kdf: descriptor,
            wrapped_vault_key: base64::engine::general_purpose::STANDARD.encode(wrapped),
        })
        .await
        .unwrap();

    let tablet = device(&relay);
    assert_eq!(
        tablet.connect_existing("u1", SECRET).await.unwrap(),
        PullOutcome::Empty
    );
    let status = tablet.status().await;
    assert!(status.enabled);
    assert_eq!(status.version, 1);

    // The first push from here goes through on the init token.
    assert!(matches!(
        tablet.push_to_cloud().await.unwrap(),
        PushOutcome::Pushed { version: 2, merged: None }
    ));
}

#[tokio::test]
async fn stale_token_pulls_merges_and_retries() {
    let relay = FakeRelay::new();
    let phone = device(&relay);
    phone.vault().upsert(Card::new("Library", "1")).unwrap();
    let user_id = phone.initialize_sync(SECRET).await.unwrap();

    let tablet = device(&relay);
    tablet.connect_existing(&user_id, SECRET).await.unwrap();

    tablet.vault().upsert(Card::new("Tablet card", "2")).unwrap();
    assert!(matches!(
        tablet.push_to_cloud().await.unwrap(),
        PushOutcome::Pushed { version: 3, merged: None }
    ));

    // The phone still holds the version 2 token.
    phone.vault().upsert(Card::new("Phone card", "3")).unwrap();
    match phone.push_to_cloud().await.unwrap() {
        PushOutcome::Pushed { version, merged } => {
            assert_eq!(version, 4);
            assert_eq!(merged.unwrap().added, 1);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(
        card_names(&phone),
        vec!["Library", "Phone card", "Tablet card"]
    );

    tablet.pull_from_cloud().await.unwrap();
    assert_eq!(card_names(&tablet), card_names(&phone));
    assert_eq!(tablet.status().await.version, 4);
}

#[tokio::test]
async fn repeated_stale_token_is_conflict() {
    let relay = FakeRelay::new();
    let phone = device(&relay);
    let user_id = phone.initialize_sync(SECRET).await.unwrap();
    let before = phone.status().await;

    relay.force_stale(2);
    phone.vault().upsert(Card::new("Gym", "A-1001")).unwrap();
    let result = phone.push_to_cloud().await;
    assert!(matches!(result, Err(SyncError::Conflict(_))), "{:?}", result);

    let after = phone.status().await;
    assert_eq!(after.version, before.version);
    assert_eq!(relay.version(&user_id), Some(2));

    // Nothing stuck: the next push goes through.
    assert!(matches!(
        phone.push_to_cloud().await.unwrap(),
        PushOutcome::Pushed { version: 3, .. }
    ));
}

#[tokio::test]
async fn outage_leaves_state_untouched() {
    let relay = FakeRelay::new();
    let phone = device(&relay);
    phone.initialize_sync(SECRET).await.unwrap();
    let before = phone.status().await;

    phone.vault().upsert(Card::new("Gym", "A-1001")).unwrap();
    for outage in [Outage::Network, Outage::Quota] {
        relay.set_outage(Some(outage));
        let err = phone.push_to_cloud().await.unwrap_err();
        assert!(err.is_transient(), "{:?}", err);
        assert!(err.user_message().contains("safe on this device"));

        let status = phone.status().await;
        assert_eq!(status.version, before.version);
        assert_eq!(status.last_sync_at, before.last_sync_at);
    }

    relay.set_outage(None);
    assert!(matches!(
        phone.push_to_cloud().await.unwrap(),
        PushOutcome::Pushed { version: 3, .. }
    ));
}

#[tokio::test]
async fn tampered_blob_is_rejected_without_import() {
    let relay = FakeRelay::new();
    let phone = device(&relay);
    let user_id = phone.initialize_sync(SECRET).await.unwrap();

    let tablet = device(&relay);
    tablet.connect_existing(&user_id, SECRET).await.unwrap();
    assert!(card_names(&tablet).is_empty());

    // The remote now holds a card the tablet has never seen.
    phone.vault().upsert(Card::new("Library", "1")).unwrap();
    phone.push_to_cloud().await.unwrap();
    assert_eq!(relay.version(&user_id), Some(tablet.status().await.version + 1));

    let before = tablet.status().await;
    relay.tamper(&user_id);
    assert!(matches!(
        tablet.pull_from_cloud().await,
        Err(SyncError::AuthenticationFailure)
    ));

    assert!(card_names(&tablet).is_empty());
    let after = tablet.status().await;
    assert_eq!(after.version, before.version);
    assert_eq!(after.last_sync_at, before.last_sync_at);
    assert!(after.enabled);
}

#[tokio::test]
async fn disable_clears_local_state_only() {
    let relay = FakeRelay::new();
    let phone = device(&relay);
    let user_id = phone.initialize_sync(SECRET).await.unwrap();

    phone.disable_sync().await.unwrap();
    let status = phone.status().await;
    assert!(!status.enabled);
    assert!(status.user_id.is_none());
    assert!(!status.has_vault_key);
    assert_eq!(status.version, 0);

    assert_eq!(phone.push_to_cloud().await.unwrap(), PushOutcome::Skipped);
    assert_eq!(relay.version(&user_id), Some(2));

    // Reconnecting with the secret restores access.
    phone.connect_existing(&user_id, SECRET).await.unwrap();
    assert!(phone.status().await.enabled);
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("settings.db");
    let relay = FakeRelay::new();

    let user_id = {
        let phone = SyncManager::new(
            Some(relay.clone()),
            SqliteSettings::open(&db).unwrap(),
            MemoryVault::new(),
        )
        .unwrap()
        .with_kdf_iterations(MIN_PBKDF2_ITERATIONS);
        phone.initialize_sync(SECRET).await.unwrap()
    };

    let phone = SyncManager::new(
        Some(relay.clone()),
        SqliteSettings::open(&db).unwrap(),
        MemoryVault::new(),
    )
    .unwrap();
    let status = phone.status().await;
    assert!(status.enabled);
    assert_eq!(status.user_id.as_deref(), Some(user_id.as_str()));
    assert_eq!(status.version, 2);

    phone.vault().upsert(Card::new("Gym", "A-1001")).unwrap();
    assert!(matches!(
        phone.push_to_cloud().await.unwrap(),
        PushOutcome::Pushed { version: 3, .. }
    ));

    phone.disable_sync().await.unwrap();
    drop(phone);
    let reopened: SyncManager<FakeRelay, _, _> = SyncManager::new(
        Some(relay),
        SqliteSettings::open(&db).unwrap(),
        MemoryVault::new(),
    )
    .unwrap();
    assert!(!reopened.status().await.enabled);
}
