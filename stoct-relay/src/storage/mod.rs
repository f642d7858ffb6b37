//! SQLite storage backend for the relay.
//!
//! One metadata row and at most one blob per user. Every blob write is a
//! compare-and-swap on the stored etag, run in a single transaction under
//! the connection mutex.

pub mod models;

use crate::error::RelayError;
use base64::Engine;
use chrono::Utc;
use models::{Revision, StoredBlob, StoredMeta};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use subtle::ConstantTimeEq;

/// Random bytes behind each etag.
const ETAG_BYTES: usize = 32;

/// Thread-safe vault storage.
#[derive(Clone)]
pub struct VaultStore {
    conn: Arc<Mutex<Connection>>,
}

impl VaultStore {
    pub fn open(path: &Path) -> Result<Self, anyhow::Error> {
        let conn = Connection::open(path)?;
        // journal_mode answers with a row, so it cannot go through execute()
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, anyhow::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, anyhow::Error> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&self) -> Result<(), anyhow::Error> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS vault_meta (
                user_id TEXT PRIMARY KEY,
                kdf TEXT NOT NULL,
                wrapped_vault_key TEXT NOT NULL,
                etag TEXT NOT NULL,
                version INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS vault_blobs (
                user_id TEXT PRIMARY KEY,
                blob BLOB NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES vault_meta(user_id)
            );",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, RelayError> {
        self.conn
            .lock()
            .map_err(|e| RelayError::Internal(format!("Lock error: {}", e)))
    }

    /// Create metadata for a new user at version 1. No blob is stored yet.
    pub fn init(
        &self,
        user_id: &str,
        kdf: &Value,
        wrapped_vault_key: &str,
    ) -> Result<Revision, RelayError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM vault_meta WHERE user_id = ?1)",
            [user_id],
            |row| row.get(0),
        )?;
        if exists {
            return Err(RelayError::Conflict("Vault already exists".to_string()));
        }

        let etag = new_etag();
        let now = Utc::now().timestamp_millis();
        tx.execute(
            "INSERT INTO vault_meta (user_id, kdf, wrapped_vault_key, etag, version, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
            params![user_id, serde_json::to_string(kdf)?, wrapped_vault_key, etag, now],
        )?;
        tx.commit()?;

        Ok(Revision { etag, version: 1 })
    }

    pub fn meta(&self, user_id: &str) -> Result<Option<StoredMeta>, RelayError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT kdf, wrapped_vault_key, etag, version
                 FROM vault_meta WHERE user_id = ?1",
                [user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(
            |(kdf, wrapped_vault_key, etag, version)| -> Result<StoredMeta, RelayError> {
                Ok(StoredMeta {
                    kdf: serde_json::from_str(&kdf)?,
                    wrapped_vault_key,
                    etag,
                    version: version as u64,
                })
            },
        )
        .transpose()
    }

    /// Current blob. `NotFound` both for unknown users and before the first upload.
    pub fn download(&self, user_id: &str) -> Result<StoredBlob, RelayError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT b.blob, m.etag, m.version, m.kdf
                 FROM vault_blobs b JOIN vault_meta m ON m.user_id = b.user_id
                 WHERE b.user_id = ?1",
                [user_id],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| RelayError::NotFound("No vault blob".to_string()))?;

        let (bytes, etag, version, kdf) = row;
        Ok(StoredBlob {
            bytes,
            etag,
            version: version as u64,
            kdf: serde_json::from_str(&kdf)?,
        })
    }

    /// Replace the blob iff `expected_etag` is the current etag.
    ///
    /// On success the etag is regenerated and the version bumped by one in the
    /// same transaction as the blob write.
    pub fn upload(
        &self,
        user_id: &str,
        expected_etag: &str,
        bytes: &[u8],
    ) -> Result<Revision, RelayError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let (current_etag, version): (String, i64) = tx
            .query_row(
                "SELECT etag, version FROM vault_meta WHERE user_id = ?1",
                [user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| RelayError::NotFound("Unknown user".to_string()))?;

        if !bool::from(expected_etag.as_bytes().ct_eq(current_etag.as_bytes())) {
            return Err(RelayError::PreconditionFailed);
        }

        let etag = new_etag();
        let next_version = version + 1;
        let now = Utc::now().timestamp_millis();
        tx.execute(
            "UPDATE vault_meta SET etag = ?1, version = ?2, updated_at = ?3 WHERE user_id = ?4",
            params![etag, next_version, now, user_id],
        )?;
        tx.execute(
            "INSERT INTO vault_blobs (user_id, blob, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET blob = excluded.blob, updated_at = excluded.updated_at",
            params![user_id, bytes, now],
        )?;
        tx.commit()?;

        Ok(Revision {
            etag,
            version: next_version as u64,
        })
    }
}

fn new_etag() -> String {
    let mut bytes = [0u8; ETAG_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
