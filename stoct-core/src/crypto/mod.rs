//! Cryptographic primitives for vault sync.
//!
//! This module provides:
//! - KEK derivation from a user secret (PBKDF2-SHA256, Argon2id, HKDF-SHA256)
//! - Vault key generation and AES-256-GCM key wrapping
//! - AES-256-GCM encryption of the serialized vault payload

pub mod cipher;
pub mod kdf;
pub mod keyring;

pub use cipher::{decrypt_vault, encrypt_vault, NONCE_LEN, TAG_LEN};
pub use kdf::{derive_kek, KdfDescriptor};
pub use keyring::{unwrap_vault_key, wrap_vault_key, Kek, VaultKey};

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Unsupported key derivation algorithm: {0}")]
    UnsupportedKdf(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    /// Wrong key, tampered data or truncated input. Deliberately carries no detail.
    #[error("Authentication failed - wrong secret or corrupted data")]
    AuthenticationFailed,
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
