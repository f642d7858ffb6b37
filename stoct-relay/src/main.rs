//! stoct relay server binary.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use stoct_relay::{build_router, RelayConfig, VaultStore};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stoct-relay", about = "stoct vault sync relay server")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Listen address override
    #[arg(short, long)]
    listen: Option<String>,

    /// Database path override
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Maximum blob size in bytes
    #[arg(long)]
    max_blob_bytes: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut cfg = if cli.config.exists() {
        RelayConfig::load(&cli.config)?
    } else {
        tracing::info!("No config file found, using defaults");
        RelayConfig::default()
    };

    if let Some(listen) = cli.listen {
        cfg.listen_addr = listen;
    }
    if let Some(database) = cli.database {
        cfg.storage_path = database;
    }
    if let Some(max) = cli.max_blob_bytes {
        cfg.max_blob_bytes = max;
        cfg.max_request_bytes = cfg.max_request_bytes.max(max);
    }

    tracing::info!(
        listen = %cfg.listen_addr,
        storage = %cfg.storage_path.display(),
        "Starting stoct relay"
    );

    let store = VaultStore::open(&cfg.storage_path)?;
    let app = build_router(store, &cfg);

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
