//! AES-256-GCM encryption of the serialized vault.
//!
//! Wire format: `nonce(12) || ciphertext || auth_tag(16)`. The same framing
//! is used for the wrapped vault key in [`crate::crypto::keyring`].

use crate::crypto::keyring::VaultKey;
use crate::crypto::{CryptoError, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Encrypt the serialized vault with the vault key.
///
/// Every call draws a fresh random nonce; reusing a nonce under the same key
/// breaks GCM entirely.
pub fn encrypt_vault(plaintext: &[u8], vault_key: &VaultKey) -> Result<Vec<u8>> {
    seal(vault_key.as_bytes(), plaintext)
}

/// Decrypt a vault blob produced by [`encrypt_vault`].
///
/// Wrong key, corrupted bytes and truncated blobs all fail with
/// [`CryptoError::AuthenticationFailed`].
pub fn decrypt_vault(blob: &[u8], vault_key: &VaultKey) -> Result<Vec<u8>> {
    open(vault_key.as_bytes(), blob)
}

pub(crate) fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    // aes-gcm appends the tag, so this is ciphertext || tag
    let ciphertext_with_tag = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(format!("{}", e)))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext_with_tag.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext_with_tag);
    Ok(out)
}

pub(crate) fn open(key: &[u8; 32], blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::AuthenticationFailed);
    }

    let (nonce_bytes, ciphertext_with_tag) = blob.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(key.into());

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext_with_tag)
        .map_err(|_| CryptoError::AuthenticationFailed)
}
