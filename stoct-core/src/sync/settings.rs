//! Local key-value settings stores backing persisted sync state.

use crate::Result;
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// String key-value storage trusted to hold the vault key.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;

    /// Set (`Some`) or remove (`None`) several keys as one unit.
    ///
    /// The default applies them one at a time; persistent stores should
    /// override it so a failure leaves none of the changes behind.
    fn apply(&self, changes: &[(&str, Option<&str>)]) -> Result<()> {
        for (key, value) in changes {
            match value {
                Some(value) => self.set(key, value)?,
                None => self.remove(key)?,
            }
        }
        Ok(())
    }
}

/// In-memory settings, for tests and embedders with their own persistence.
#[derive(Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.values
            .lock()
            .map_err(|e| crate::SyncError::Storage(format!("Lock error: {}", e)))
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn apply(&self, changes: &[(&str, Option<&str>)]) -> Result<()> {
        let mut values = self.lock()?;
        for (key, value) in changes {
            match value {
                Some(value) => values.insert(key.to_string(), value.to_string()),
                None => values.remove(*key),
            };
        }
        Ok(())
    }
}

/// SQLite-backed settings in a single `settings` table.
pub struct SqliteSettings {
    conn: Mutex<Connection>,
}

impl SqliteSettings {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        // journal_mode reports the resulting mode as a row
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| crate::SyncError::Storage(format!("Lock error: {}", e)))
    }
}

impl SettingsStore for SqliteSettings {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn()?
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM settings WHERE key = ?1", [key])?;
        Ok(())
    }

    fn apply(&self, changes: &[(&str, Option<&str>)]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for (key, value) in changes {
            match value {
                Some(value) => tx.execute(
                    "INSERT INTO settings (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    rusqlite::params![key, value],
                )?,
                None => tx.execute("DELETE FROM settings WHERE key = ?1", [key])?,
            };
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn SettingsStore) {
        assert_eq!(store.get("a").unwrap(), None);
        store.set("a", "1").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
        store.set("a", "2").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("2"));
        store.remove("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        store.remove("never-set").unwrap();

        store.set("gone", "x").unwrap();
        store
            .apply(&[("b", Some("1")), ("c", Some("2")), ("gone", None), ("b", Some("3"))])
            .unwrap();
        assert_eq!(store.get("b").unwrap().as_deref(), Some("3"));
        assert_eq!(store.get("c").unwrap().as_deref(), Some("2"));
        assert_eq!(store.get("gone").unwrap(), None);
    }

    #[test]
    fn memory_settings() {
        exercise(&MemorySettings::new());
    }

    #[test]
    fn sqlite_settings_in_memory() {
        exercise(&SqliteSettings::in_memory().unwrap());
    }

    #[test]
    fn sqlite_apply_is_all_or_nothing() {
        let store = SqliteSettings::in_memory().unwrap();
        store.set("a", "old").unwrap();
        store.set("b", "kept").unwrap();
        store
            .conn()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER refuse_boom BEFORE INSERT ON settings
                 WHEN NEW.key = 'boom'
                 BEGIN SELECT RAISE(ABORT, 'refused'); END;",
            )
            .unwrap();

        let result = store.apply(&[("a", Some("new")), ("b", None), ("boom", Some("x"))]);
        assert!(result.is_err());
        assert_eq!(store.get("a").unwrap().as_deref(), Some("old"));
        assert_eq!(store.get("b").unwrap().as_deref(), Some("kept"));
        assert_eq!(store.get("boom").unwrap(), None);
    }

    #[test]
    fn sqlite_settings_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.db");

        SqliteSettings::open(&path).unwrap().set("k", "v").unwrap();
        let reopened = SqliteSettings::open(&path).unwrap();
        assert_eq!(reopened.get("k").unwrap().as_deref(), Some("v"));
    }
}
