//! Key-encryption-key derivation.
//!
//! The descriptor stored next to the wrapped vault key is schema-free: an
//! `algorithm` tag, an optional base64 `salt`, and whatever parameters that
//! algorithm needs, flattened into the same JSON object:
//!
//! ```json
//! { "algorithm": "PBKDF2-SHA256", "salt": "q1x...==", "iterations": 310000 }
//! ```
//!
//! The relay never parses it, so new algorithms need no server change.

use crate::crypto::keyring::Kek;
use crate::crypto::{CryptoError, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine;
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use zeroize::Zeroize;

pub const PBKDF2_SHA256: &str = "PBKDF2-SHA256";
pub const ARGON2ID: &str = "argon2id";
pub const HKDF_SHA256: &str = "HKDF-SHA256";

/// Salt length for freshly created descriptors.
pub const SALT_LEN: usize = 16;
/// Floor for new PBKDF2 descriptors.
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 310_000;

const HKDF_INFO: &[u8] = b"stoct-kek-v1";

/// Describes how the client turned a secret into its KEK.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KdfDescriptor {
    pub algorithm: String,

    /// Base64 salt. Absent for hardware-bound derivation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,

    /// Algorithm-specific parameters.
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argon2Cost {
    /// Memory cost in KiB
    pub memory_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for Argon2Cost {
    fn default() -> Self {
        Self {
            memory_kib: 65_536, // 64 MB
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl Argon2Cost {
    /// Verify that parameters are within acceptable ranges
    pub fn validate(&self) -> Result<()> {
        if self.memory_kib < 19_456 {
            return Err(CryptoError::KdfFailed(
                "Memory cost too low (minimum: 19 MiB)".to_string(),
            ));
        }
        if self.time_cost < 1 {
            return Err(CryptoError::KdfFailed(
                "Time cost too low (minimum: 1)".to_string(),
            ));
        }
        if self.parallelism < 1 {
            return Err(CryptoError::KdfFailed(
                "Parallelism too low (minimum: 1)".to_string(),
            ));
        }
        Ok(())
    }
}

impl KdfDescriptor {
    /// New PBKDF2-SHA256 descriptor with a fresh random salt.
    pub fn pbkdf2(iterations: u32) -> Result<Self> {
        if iterations < MIN_PBKDF2_ITERATIONS {
            return Err(CryptoError::KdfFailed(format!(
                "Iteration count too low (minimum: {})",
                MIN_PBKDF2_ITERATIONS
            )));
        }
        let mut params = Map::new();
        params.insert("iterations".to_string(), Value::from(iterations));
        Ok(Self {
            algorithm: PBKDF2_SHA256.to_string(),
            salt: Some(encode_salt(&random_salt())),
            params,
        })
    }

    /// New Argon2id descriptor with a fresh random salt.
    pub fn argon2id(cost: Argon2Cost) -> Result<Self> {
        cost.validate()?;
        let mut params = Map::new();
        params.insert("memoryKib".to_string(), Value::from(cost.memory_kib));
        params.insert("timeCost".to_string(), Value::from(cost.time_cost));
        params.insert("parallelism".to_string(), Value::from(cost.parallelism));
        Ok(Self {
            algorithm: ARGON2ID.to_string(),
            salt: Some(encode_salt(&random_salt())),
            params,
        })
    }

    /// HKDF descriptor for secrets that are already high-entropy key material,
    /// e.g. a value released by a platform authenticator.
    pub fn hkdf_sha256(salt: Option<&[u8]>) -> Self {
        Self {
            algorithm: HKDF_SHA256.to_string(),
            salt: salt.map(encode_salt),
            params: Map::new(),
        }
    }

    /// Decoded salt bytes, if any.
    pub fn salt_bytes(&self) -> Result<Option<Vec<u8>>> {
        self.salt
            .as_deref()
            .map(|s| {
                base64::engine::general_purpose::STANDARD
                    .decode(s)
                    .map_err(|e| CryptoError::KdfFailed(format!("Invalid salt encoding: {}", e)))
            })
            .transpose()
    }

    /// Derive the KEK for `secret` as this descriptor prescribes.
    pub fn derive(&self, secret: &[u8]) -> Result<Kek> {
        match self.algorithm.as_str() {
            PBKDF2_SHA256 => {
                let salt = self.required_salt()?;
                let iterations = self.u32_param("iterations")?;
                derive_kek(secret, &salt, iterations)
            }
            ARGON2ID => {
                let salt = self.required_salt()?;
                let cost = Argon2Cost {
                    memory_kib: self.u32_param("memoryKib")?,
                    time_cost: self.u32_param("timeCost")?,
                    parallelism: self.u32_param("parallelism")?,
                };
                derive_kek_argon2id(secret, &salt, cost)
            }
            HKDF_SHA256 => derive_kek_hkdf(secret, self.salt_bytes()?.as_deref()),
            other => Err(CryptoError::UnsupportedKdf(other.to_string())),
        }
    }

    fn required_salt(&self) -> Result<Vec<u8>> {
        self.salt_bytes()?
            .ok_or_else(|| CryptoError::KdfFailed(format!("{} requires a salt", self.algorithm)))
    }

    fn u32_param(&self, name: &str) -> Result<u32> {
        self.params
            .get(name)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| CryptoError::KdfFailed(format!("Missing or invalid parameter: {}", name)))
    }
}

/// Derive a 32-byte KEK with PBKDF2-HMAC-SHA256.
///
/// # Arguments
/// * `secret` - The user secret (password or passcode) as bytes
/// * `salt` - Per-vault random salt, at least 16 bytes
/// * `iterations` - Recorded iteration count
pub fn derive_kek(secret: &[u8], salt: &[u8], iterations: u32) -> Result<Kek> {
    if salt.len() < SALT_LEN {
        return Err(CryptoError::KdfFailed(format!(
            "Salt too short: {} bytes (minimum: {})",
            salt.len(),
            SALT_LEN
        )));
    }
    if iterations == 0 {
        return Err(CryptoError::KdfFailed(
            "Iteration count must be positive".to_string(),
        ));
    }

    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret, salt, iterations, &mut key);
    let kek = Kek::from_bytes(key);
    key.zeroize();
    Ok(kek)
}

/// Derive a 32-byte KEK with Argon2id.
pub fn derive_kek_argon2id(secret: &[u8], salt: &[u8], cost: Argon2Cost) -> Result<Kek> {
    cost.validate()?;

    let params = Params::new(cost.memory_kib, cost.time_cost, cost.parallelism, Some(32))
        .map_err(|e| CryptoError::KdfFailed(format!("Invalid parameters: {}", e)))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(secret, salt, &mut key)
        .map_err(|e| CryptoError::KdfFailed(format!("Hashing failed: {}", e)))?;
    let kek = Kek::from_bytes(key);
    key.zeroize();
    Ok(kek)
}

/// Derive a 32-byte KEK from high-entropy input with HKDF-SHA256.
pub fn derive_kek_hkdf(secret: &[u8], salt: Option<&[u8]>) -> Result<Kek> {
    if secret.len() < 16 {
        return Err(CryptoError::KdfFailed(
            "HKDF input must be at least 16 bytes of key material".to_string(),
        ));
    }

    let hkdf = Hkdf::<Sha256>::new(salt, secret);
    let mut key = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut key)
        .map_err(|e| CryptoError::KdfFailed(format!("HKDF expand failed: {}", e)))?;
    let kek = Kek::from_bytes(key);
    key.zeroize();
    Ok(kek)
}

fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

fn encode_salt(salt: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(salt)
}
