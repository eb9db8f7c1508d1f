//! Plain key/value settings persistence backed by SQLite.
//!
//! Holds non-secret state: the wrapped master key, KDF parameters, panel
//! base URL, client id, scope list. Secret material never lands here, it
//! belongs in the vault's `secrets` table.

use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

/// Key/value settings store.
///
/// # Schema
/// ```sql
/// CREATE TABLE settings (
///     key TEXT PRIMARY KEY,
///     value TEXT NOT NULL
/// );
/// ```
///
/// # Thread Safety
/// - Connection is wrapped in Mutex for safe concurrent access
/// - SQLite itself is thread-safe with serialized mode
pub struct SettingsStore {
    conn: Mutex<Connection>,
}

impl SettingsStore {
    /// Creates or opens a settings store at the given database path.
    pub fn new<P: AsRef<Path>>(db_path: P) -> rusqlite::Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Returns the value for a key, or `None` if unset.
    pub fn get(&self, key: &str) -> rusqlite::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;

        if let Some(row) = rows.next()? {
            Ok(Some(row.get(0)?))
        } else {
            Ok(None)
        }
    }

    /// Sets a key to a value (upsert).
    pub fn set(&self, key: &str, value: &str) -> rusqlite::Result<()> {
        self.conn.lock().unwrap().execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Sets several keys in a single transaction (all-or-nothing).
    pub fn set_many(&self, entries: &[(&str, String)]) -> rusqlite::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for (key, value) in entries {
            tx.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
        }
        tx.commit()
    }

    /// Deletes a key.
    ///
    /// Returns `true` if the key existed.
    pub fn delete(&self, key: &str) -> rusqlite::Result<bool> {
        let rows_affected = self
            .conn
            .lock()
            .unwrap()
            .execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(rows_affected > 0)
    }

    /// Deletes several keys in a single transaction.
    pub fn delete_many(&self, keys: &[&str]) -> rusqlite::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for key in keys {
            tx.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        }
        tx.commit()
    }
}
