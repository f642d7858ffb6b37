use anyhow::{anyhow, bail, Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use stoct_core::sync::{PullOutcome, PushOutcome};
use stoct_core::{
    Card, ClientConfig, FileVault, HttpTransport, SqliteSettings, SyncError, SyncManager,
};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Environment variable consulted before prompting for the sync secret.
const SECRET_ENV: &str = "STOCT_SECRET";

/// stoct - end-to-end encrypted card vault with cloud sync
#[derive(Parser)]
#[command(name = "stoct")]
#[command(about = "End-to-end encrypted card vault with cloud sync", long_about = None)]
struct Cli {
    /// Data directory (defaults to the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Relay URL, overrides stoct.toml
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a remote vault and upload the local cards
    Init,

    /// Join an existing remote vault from this device
    Connect {
        /// User ID printed by `init` on the first device
        user_id: String,
    },

    /// Upload local cards
    Push,

    /// Download and merge remote cards
    Pull,

    /// Show sync status
    Status,

    /// Forget sync state on this device (remote vault is kept)
    Disable,

    /// Add a card
    Add {
        /// Display name
        #[arg(long)]
        name: String,

        /// Card number or barcode payload
        #[arg(long)]
        code: String,

        /// Barcode format, e.g. code128 or qr
        #[arg(long)]
        format: Option<String>,

        /// Notes
        #[arg(long)]
        notes: Option<String>,
    },

    /// Remove a card
    Remove {
        /// Card ID
        id: Uuid,
    },

    /// List cards
    List,
}

type Manager = SyncManager<HttpTransport, SqliteSettings, FileVault>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .ok_or_else(|| anyhow!("No data directory on this platform, use --data-dir"))?
            .join("stoct"),
    };
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Creating {}", data_dir.display()))?;

    let mut config = ClientConfig::load_or_default(&data_dir.join("stoct.toml"))?;
    if cli.endpoint.is_some() {
        config.endpoint = cli.endpoint;
    }

    let manager = open_manager(&data_dir, &config)?;

    match cli.command {
        Commands::Init => {
            let secret = read_secret(true)?;
            let user_id = manager.initialize_sync(&secret).await.map_err(sync_error)?;
            info!(%user_id, "Sync initialized");
            println!("Sync enabled. User ID: {}", user_id);
            println!("Use `stoct connect {}` on your other devices.", user_id);
        }
        Commands::Connect { user_id } => {
            let secret = read_secret(false)?;
            match manager
                .connect_existing(&user_id, &secret)
                .await
                .map_err(sync_error)?
            {
                PullOutcome::Pulled { version, report } => println!(
                    "Connected at version {}: {} added, {} updated, {} deleted",
                    version, report.added, report.updated, report.deleted
                ),
                PullOutcome::Empty => println!("Connected. The remote vault is still empty."),
                PullOutcome::Skipped => {}
            }
        }
        Commands::Push => match manager.push_to_cloud().await.map_err(sync_error)? {
            PushOutcome::Skipped => println!("Sync is not enabled on this device."),
            PushOutcome::Pushed { version, merged } => {
                if let Some(report) = merged {
                    println!(
                        "Merged remote changes first: {} added, {} updated, {} deleted",
                        report.added, report.updated, report.deleted
                    );
                }
                println!("Pushed version {}", version);
            }
        },
        Commands::Pull => match manager.pull_from_cloud().await.map_err(sync_error)? {
            PullOutcome::Skipped => println!("Sync is not enabled on this device."),
            PullOutcome::Empty => println!("The remote vault is empty."),
            PullOutcome::Pulled { version, report } => println!(
                "Pulled version {}: {} added, {} updated, {} deleted",
                version, report.added, report.updated, report.deleted
            ),
        },
        Commands::Status => {
            let status = manager.status().await;
            println!(
                "Endpoint:  {}",
                config.endpoint.as_deref().unwrap_or("(not configured)")
            );
            println!("Enabled:   {}", status.enabled);
            if let Some(user_id) = &status.user_id {
                println!("User ID:   {}", user_id);
                println!("Version:   {}", status.version);
            }
            let last_sync = status
                .last_sync_at
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            println!("Last sync: {}", last_sync);
            println!("Cards:     {}", manager.vault().snapshot()?.len());
        }
        Commands::Disable => {
            manager.disable_sync().await?;
            println!("Sync disabled on this device.");
        }
        Commands::Add {
            name,
            code,
            format,
            notes,
        } => {
            let mut card = Card::new(name, code);
            card.format = format;
            card.notes = notes;
            let id = card.id;
            manager.vault().upsert(card)?;
            println!("Added {}", id);
        }
        Commands::Remove { id } => {
            if !manager.vault().remove(&id)? {
                bail!("No card with id {}", id);
            }
            println!("Removed {}", id);
        }
        Commands::List => {
            let cards = manager.vault().snapshot()?;
            if cards.is_empty() {
                println!("No cards.");
            }
            for card in cards.live() {
                println!("{}  {:<24} {}", card.id, card.name, card.code);
            }
        }
    }

    Ok(())
}

fn open_manager(data_dir: &Path, config: &ClientConfig) -> Result<Manager> {
    let transport = HttpTransport::from_config(config)?;
    let settings = SqliteSettings::open(&data_dir.join("settings.db"))?;
    let vault = FileVault::open(&data_dir.join("cards.json"))?;
    Ok(SyncManager::new(transport, settings, vault)?.with_kdf_iterations(config.kdf_iterations))
}

fn read_secret(confirm: bool) -> Result<String> {
    if let Ok(secret) = std::env::var(SECRET_ENV) {
        return check_secret(secret).with_context(|| format!("{} is set", SECRET_ENV));
    }
    let secret = check_secret(rpassword::prompt_password("Sync password: ")?)?;
    if confirm && rpassword::prompt_password("Confirm password: ")? != secret {
        bail!("Passwords do not match");
    }
    Ok(secret)
}

fn check_secret(secret: String) -> Result<String> {
    if secret.is_empty() {
        bail!("Password must not be empty");
    }
    Ok(secret)
}

fn sync_error(e: SyncError) -> anyhow::Error {
    anyhow!("{} ({})", e.user_message(), e)
}
