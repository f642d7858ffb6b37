//! Key hierarchy for vault sync.
//!
//! Secret → KDF → KEK → wraps → vault key → encrypts → vault blob.
//!
//! Only the wrapped vault key ever leaves the device. There is no separate
//! password verifier: a wrong secret is detected when unwrapping fails.

use crate::crypto::cipher::{open, seal};
use crate::crypto::{CryptoError, Result};
use aes_gcm::{
    aead::{KeyInit, OsRng},
    Aes256Gcm,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key-encryption key derived from the user secret.
///
/// Never persisted; lives only long enough to wrap or unwrap the vault key.
#[derive(ZeroizeOnDrop)]
pub struct Kek {
    key: [u8; 32],
}

impl Kek {
    /// Create a KEK from raw bytes
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Get a reference to the key bytes (use sparingly)
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

/// The symmetric key that encrypts the vault blob.
#[derive(Clone)]
pub struct VaultKey {
    key: [u8; 32],
}

impl VaultKey {
    /// Generate a new random vault key
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        Self { key: key.into() }
    }

    /// Create a vault key from raw bytes
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Create a vault key from a slice, checking its length
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            got: bytes.len(),
        })?;
        Ok(Self { key })
    }

    /// Get the raw key bytes (use sparingly)
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl Drop for VaultKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VaultKey([redacted])")
    }
}

/// Wrap the vault key under the KEK.
///
/// Returns `nonce(12) || encrypted_key || auth_tag(16)`, ready for base64
/// encoding and upload.
pub fn wrap_vault_key(vault_key: &VaultKey, kek: &Kek) -> Result<Vec<u8>> {
    seal(kek.as_bytes(), vault_key.as_bytes())
        .map_err(|e| CryptoError::EncryptionFailed(format!("Failed to wrap vault key: {}", e)))
}

/// Unwrap a vault key produced by [`wrap_vault_key`].
///
/// Every failure is reported as [`CryptoError::AuthenticationFailed`] so a
/// caller cannot tell a wrong secret from a damaged record.
pub fn unwrap_vault_key(wrapped: &[u8], kek: &Kek) -> Result<VaultKey> {
    let mut key_bytes = open(kek.as_bytes(), wrapped)?;
    let vault_key = VaultKey::from_slice(&key_bytes).map_err(|_| CryptoError::AuthenticationFailed);
    key_bytes.zeroize();
    vault_key
}
