//! stoct relay
//!
//! Blind storage endpoint for stoct vault sync. The relay keeps one opaque KDF
//! descriptor, one wrapped vault key and one encrypted blob per user, and
//! accepts blob writes only from a client presenting the current etag. It
//! never sees key material or plaintext.

pub mod config;
pub mod error;
pub mod handlers;
pub mod rate_limit;
pub mod server;
pub mod storage;

pub use config::RelayConfig;
pub use error::RelayError;
pub use server::build_router;
pub use storage::VaultStore;
