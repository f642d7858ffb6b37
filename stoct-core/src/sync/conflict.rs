//! Last-Write-Wins resolution between two copies of the same card.

use crate::vault::Card;

/// Conflict resolution outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Accept the remote card (remote is newer).
    AcceptRemote,
    /// Keep the local card (local is newer or equal).
    KeepLocal,
}

pub struct ConflictResolver;

impl ConflictResolver {
    /// Resolve a conflict between local and remote versions of a card.
    ///
    /// LWW rules:
    /// 1. Higher `updated_at` wins.
    /// 2. On equal timestamps a tombstone beats a live card, so a delete made
    ///    in the same millisecond as an edit is not undone.
    /// 3. Otherwise keep local (local-preference tie-break).
    pub fn resolve(local: &Card, remote: &Card) -> Resolution {
        if remote.updated_at > local.updated_at {
            Resolution::AcceptRemote
        } else if remote.updated_at == local.updated_at && remote.deleted && !local.deleted {
            Resolution::AcceptRemote
        } else {
            Resolution::KeepLocal
        }
    }
}
