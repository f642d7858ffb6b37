//! E2E encrypted vault sync.
//!
//! Implements zero-knowledge synchronization with a blind relay:
//! - Whole-vault AES-256-GCM blobs under a random vault key
//! - Vault key wrapped under a KEK derived from the user secret
//! - Optimistic concurrency through an opaque version token (`If-Match`)
//! - One pull-then-retry on a stale token, last-writer-wins after merge

pub mod client;
pub mod config;
pub mod conflict;
pub mod manager;
pub mod models;
pub mod settings;
pub mod state;
#[cfg(test)]
mod tests;

pub use client::{HttpTransport, SyncTransport};
pub use config::ClientConfig;
pub use conflict::ConflictResolver;
pub use manager::{PullOutcome, PushOutcome, SyncManager};
pub use models::{DownloadedBlob, RemoteMeta, Revision, SyncStatus};
pub use settings::{MemorySettings, SettingsStore, SqliteSettings};
pub use state::SyncState;
