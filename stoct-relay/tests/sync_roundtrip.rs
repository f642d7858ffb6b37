//! Real relay on an ephemeral port, driven by the stoct-core client.

use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use stoct_core::crypto::kdf::MIN_PBKDF2_ITERATIONS;
use stoct_core::sync::models::InitVaultRequest;
use stoct_core::sync::{PullOutcome, PushOutcome, SyncTransport};
use stoct_core::{
    Card, HttpTransport, KdfDescriptor, MemorySettings, MemoryVault, SyncError, SyncManager,
};
use stoct_relay::{build_router, RelayConfig, VaultStore};

const SECRET: &str = "tr0ub4dor&3";

type Device = SyncManager<HttpTransport, MemorySettings, MemoryVault>;

async fn spawn_relay(config: RelayConfig) -> String {
    let store = VaultStore::in_memory().unwrap();
    let app = build_router(store, &config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    format!("http://{}", addr)
}

fn device(base_url: &str) -> Device {
    let transport = HttpTransport::new(base_url, Duration::from_secs(10)).unwrap();
    SyncManager::new(Some(transport), MemorySettings::new(), MemoryVault::new())
        .unwrap()
        .with_kdf_iterations(MIN_PBKDF2_ITERATIONS)
}

fn names(device: &Device) -> Vec<String> {
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
async fn two_devices_sync_through_relay() {
    let base_url = spawn_relay(RelayConfig::default()).await;

    let phone = device(&base_url);
    phone.vault().upsert(Card::new("Library", "29384756")).unwrap();
    let user_id = phone.initialize_sync(SECRET).await.unwrap();
    assert_eq!(phone.status().await.version, 2);

    let tablet = device(&base_url);
    assert!(matches!(
        tablet.connect_existing(&user_id, SECRET).await.unwrap(),
        PullOutcome::Pulled { version: 2, .. }
    ));
    assert_eq!(names(&tablet), vec!["Library"]);

    tablet.vault().upsert(Card::new("Gym", "A-1001")).unwrap();
    assert!(matches!(
        tablet.push_to_cloud().await.unwrap(),
        PushOutcome::Pushed { version: 3, merged: None }
    ));

    // The phone's token is stale now: its push pulls, merges and retries.
    phone.vault().upsert(Card::new("Coffee", "9988")).unwrap();
    match phone.push_to_cloud().await.unwrap() {
        PushOutcome::Pushed { version, merged } => {
            assert_eq!(version, 4);
            assert_eq!(merged.map(|r| r.added), Some(1));
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    tablet.pull_from_cloud().await.unwrap();
    assert_eq!(names(&tablet), vec!["Coffee", "Gym", "Library"]);
    assert_eq!(names(&phone), names(&tablet));
}

#[tokio::test]
async fn wrong_secret_cannot_connect() {
    let base_url = spawn_relay(RelayConfig::default()).await;

    let phone = device(&base_url);
    let user_id = phone.initialize_sync(SECRET).await.unwrap();

    let intruder = device(&base_url);
    assert!(matches!(
        intruder.connect_existing(&user_id, "guess").await,
        Err(SyncError::AuthenticationFailure)
    ));
    assert!(!intruder.status().await.enabled);
}

#[tokio::test]
async fn transport_maps_relay_statuses() {
    let base_url = spawn_relay(RelayConfig {
        max_blob_bytes: 64,
        ..RelayConfig::default()
    })
    .await;
    let transport = HttpTransport::new(&base_url, Duration::from_secs(10)).unwrap();

    let meta = transport.fetch_meta("nobody").await.unwrap();
    assert!(!meta.exists);
    assert!(matches!(
        transport.download_blob("nobody").await,
        Err(SyncError::NotFound)
    ));

    let phone = device(&base_url);
    let user_id = phone.initialize_sync(SECRET).await.unwrap();
    let meta = transport.fetch_meta(&user_id).await.unwrap();
    assert!(meta.exists);
    assert_eq!(meta.version, Some(2));

    assert!(matches!(
        transport.upload_blob(&user_id, b"blob", "stale-token").await,
        Err(SyncError::PreconditionFailed)
    ));
    let token = meta.version_token.unwrap();
    assert!(matches!(
        transport.upload_blob(&user_id, &[0u8; 65], &token).await,
        Err(SyncError::QuotaExceeded)
    ));
}

#[tokio::test]
async fn non_ascii_kdf_descriptor_downloads() {
    let base_url = spawn_relay(RelayConfig::default()).await;
    let transport = HttpTransport::new(&base_url, Duration::from_secs(10)).unwrap();

    let mut params = serde_json::Map::new();
    params.insert("iterations".to_string(), json!(MIN_PBKDF2_ITERATIONS));
    params.insert("label".to_string(), json!("café"));
    let token = transport
        .init_vault(&InitVaultRequest {
            user_id: "u-utf8".to_string(),
            kdf: KdfDescriptor {
                algorithm: "PBKDF2-SHA256".to_string(),
                salt: Some("c2FsdA==".to_string()),
                params,
            },
            wrapped_vault_key: "d3JhcHBlZA==".to_string(),
        })
        .await
        .unwrap();
    let revision = transport
        .upload_blob("u-utf8", b"ciphertext", &token)
        .await
        .unwrap();

    let blob = transport.download_blob("u-utf8").await.unwrap();
    assert_eq!(blob.version, revision.version);
    assert_eq!(blob.bytes, b"ciphertext");
    assert_eq!(blob.kdf.unwrap().params["label"], "café");
}

#[tokio::test]
async fn rate_limited_push_is_transient() {
    let base_url = spawn_relay(RelayConfig {
        rate_limit_per_minute: 2,
        ..RelayConfig::default()
    })
    .await;

    // init carries no user parameter and is keyed by address; the seeding
    // upload takes the first of the user's two tokens.
    let phone = device(&base_url);
    phone.initialize_sync(SECRET).await.unwrap();
    let before = phone.status().await;

    phone.push_to_cloud().await.unwrap();
    let err = phone.push_to_cloud().await.unwrap_err();
    assert!(matches!(err, SyncError::QuotaExceeded));
    assert!(err.is_transient());
    assert_eq!(phone.status().await.version, before.version + 1);
}
