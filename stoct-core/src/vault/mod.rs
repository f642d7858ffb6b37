//! Local card vault: the payload that gets encrypted and synced.
//!
//! The sync manager only needs [`VaultSource`]: serialize everything, and
//! import (merge) a decrypted remote copy. [`MemoryVault`] and [`FileVault`]
//! implement it over a [`CardSet`].


use crate::sync::conflict::{ConflictResolver, Resolution};
use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Serialized vault format version.
pub const VAULT_SCHEMA_VERSION: u32 = 1;

/// A stored card. Deleted cards stay as tombstones so a merge cannot
/// resurrect them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: Uuid,
    pub name: String,
    /// Barcode / card number payload.
    pub code: String,
    /// Barcode symbology hint, e.g. `code128` or `qr`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Unix milliseconds of the last local change.
    pub updated_at: i64,
    #[serde(default)]
    pub deleted: bool,
}

impl Card {
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            code: code.into(),
            format: None,
            notes: None,
            updated_at: now_millis(),
            deleted: false,
        }
    }
}

/// Counts of what an import changed locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Remote copies that lost to a newer local card.
    pub kept_local: usize,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        self.added + self.updated + self.deleted > 0
    }
}

#[derive(Serialize, Deserialize)]
struct VaultDocument {
    schema: u32,
    cards: Vec<Card>,
}

/// The full card set, tombstones included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardSet {
    cards: BTreeMap<Uuid, Card>,
}

impl CardSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a card, stamping it with the current time.
    pub fn upsert(&mut self, mut card: Card) {
        card.updated_at = now_millis().max(card.updated_at);
        self.cards.insert(card.id, card);
    }

    /// Tombstone a card. Returns false if no live card has that id.
    pub fn remove(&mut self, id: &Uuid) -> bool {
        match self.cards.get_mut(id) {
            Some(card) if !card.deleted => {
                card.deleted = true;
                card.updated_at = now_millis().max(card.updated_at + 1);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<&Card> {
        self.cards.get(id).filter(|c| !c.deleted)
    }

    /// Live cards, ordered by id.
    pub fn live(&self) -> impl Iterator<Item = &Card> {
        self.cards.values().filter(|c| !c.deleted)
    }

    pub fn len(&self) -> usize {
        self.live().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let doc = VaultDocument {
            schema: VAULT_SCHEMA_VERSION,
            cards: self.cards.values().cloned().collect(),
        };
        serde_json::to_vec(&doc).map_err(|e| SyncError::Import(format!("Serialize vault: {}", e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let doc: VaultDocument = serde_json::from_slice(bytes)
            .map_err(|e| SyncError::Import(format!("Invalid vault payload: {}", e)))?;
        if doc.schema > VAULT_SCHEMA_VERSION {
            return Err(SyncError::Import(format!(
                "Unsupported vault schema {} (this build reads up to {})",
                doc.schema, VAULT_SCHEMA_VERSION
            )));
        }
        Ok(Self {
            cards: doc.cards.into_iter().map(|c| (c.id, c)).collect(),
        })
    }

    /// Merge a remote card set into this one.
    ///
    /// Union by id; where both sides have a card the newer `updated_at` wins
    /// (see [`ConflictResolver`]). Merging the same remote twice changes
    /// nothing the second time.
    pub fn merge(&mut self, remote: CardSet) -> MergeReport {
        let mut report = MergeReport::default();

        for (id, remote_card) in remote.cards {
            match self.cards.get(&id) {
                None => {
                    if !remote_card.deleted {
                        report.added += 1;
                    }
                    self.cards.insert(id, remote_card);
                }
                Some(local) if *local == remote_card => {}
                Some(local) => match ConflictResolver::resolve(local, &remote_card) {
                    Resolution::AcceptRemote => {
                        if remote_card.deleted && !local.deleted {
                            report.deleted += 1;
                        } else if !remote_card.deleted && local.deleted {
                            report.added += 1;
                        } else {
                            report.updated += 1;
                        }
                        self.cards.insert(id, remote_card);
                    }
                    Resolution::KeepLocal => report.kept_local += 1,
                },
            }
        }

        report
    }
}

/// Local vault as seen by the sync manager.
pub trait VaultSource: Send + Sync {
    /// Serialize the entire local vault.
    fn serialize_vault(&self) -> Result<Vec<u8>>;

    /// Merge a decrypted remote vault into local state.
    fn import_vault(&self, payload: &[u8]) -> Result<MergeReport>;
}

/// Card vault held in memory.
#[derive(Default)]
pub struct MemoryVault {
    cards: Mutex<CardSet>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cards(cards: CardSet) -> Self {
        Self {
            cards: Mutex::new(cards),
        }
    }

    /// Copy of the current card set.
    pub fn snapshot(&self) -> Result<CardSet> {
        Ok(self.lock()?.clone())
    }

    pub fn upsert(&self, card: Card) -> Result<()> {
        self.lock()?.upsert(card);
        Ok(())
    }

    pub fn remove(&self, id: &Uuid) -> Result<bool> {
        Ok(self.lock()?.remove(id))
    }

    fn lock(&self) -> Result<MutexGuard<'_, CardSet>> {
        self.cards
            .lock()
            .map_err(|e| SyncError::Storage(format!("Lock error: {}", e)))
    }
}

impl VaultSource for MemoryVault {
    fn serialize_vault(&self) -> Result<Vec<u8>> {
        self.lock()?.to_bytes()
    }

    fn import_vault(&self, payload: &[u8]) -> Result<MergeReport> {
        let remote = CardSet::from_bytes(payload)?;
        Ok(self.lock()?.merge(remote))
    }
}

/// Card vault persisted as a JSON file, rewritten on every change.
pub struct FileVault {
    path: PathBuf,
    cards: Mutex<CardSet>,
}

impl FileVault {
    /// Open the vault file, starting empty if it does not exist.
    pub fn open(path: &Path) -> Result<Self> {
        let cards = if path.exists() {
            let bytes = std::fs::read(path)
                .map_err(|e| SyncError::Storage(format!("Read {}: {}", path.display(), e)))?;
            CardSet::from_bytes(&bytes)?
        } else {
            CardSet::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            cards: Mutex::new(cards),
        })
    }

    pub fn snapshot(&self) -> Result<CardSet> {
        Ok(self.lock()?.clone())
    }

    pub fn upsert(&self, card: Card) -> Result<()> {
        let mut cards = self.lock()?;
        cards.upsert(card);
        self.persist(&cards)
    }

    pub fn remove(&self, id: &Uuid) -> Result<bool> {
        let mut cards = self.lock()?;
        let removed = cards.remove(id);
        if removed {
            self.persist(&cards)?;
        }
        Ok(removed)
    }

    fn lock(&self) -> Result<MutexGuard<'_, CardSet>> {
        self.cards
            .lock()
            .map_err(|e| SyncError::Storage(format!("Lock error: {}", e)))
    }

    // Write-then-rename so a crash never leaves a half-written vault.
    fn persist(&self, cards: &CardSet) -> Result<()> {
        let bytes = cards.to_bytes()?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)
            .and_then(|_| std::fs::rename(&tmp, &self.path))
            .map_err(|e| SyncError::Storage(format!("Write {}: {}", self.path.display(), e)))
    }
}

impl VaultSource for FileVault {
    fn serialize_vault(&self) -> Result<Vec<u8>> {
        self.lock()?.to_bytes()
    }

    fn import_vault(&self, payload: &[u8]) -> Result<MergeReport> {
        let remote = CardSet::from_bytes(payload)?;
        let mut cards = self.lock()?;
        let report = cards.merge(remote);
        if report.changed() {
            self.persist(&cards)?;
        }
        Ok(report)
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
