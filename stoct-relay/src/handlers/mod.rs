//! HTTP handlers.

pub mod vault;

use crate::storage::VaultStore;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub store: VaultStore,
    pub max_blob_bytes: usize,
}
