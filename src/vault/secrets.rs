//! Named secret records, encrypted at rest.
//!
//! Each record is one named secret (client secret, persisted token) stored
//! as AES-256-GCM ciphertext with its own nonce. Decrypted values are held
//! in a TTL cache so hot paths do not hit the cipher for every request, and
//! are zeroed when evicted or dropped.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

use super::aead::AeadManager;
use super::VaultError;

/// Redacted view of a secret for status endpoints.
///
/// Exposes the trailing four characters only, enough for an operator to
/// recognize which credential is installed.
#[derive(Debug, Clone)]
pub struct SecretStatus {
    pub last4: String,
    pub updated_at: DateTime<Utc>,
}

struct CachedSecret {
    plaintext: Zeroizing<String>,
    cached_at: Instant,
}

/// Encrypted secret storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE secrets (
///     name TEXT PRIMARY KEY,
///     nonce TEXT NOT NULL,       -- Base64, unique per write
///     ciphertext TEXT NOT NULL,  -- Base64 AES-256-GCM output
///     updated_at TEXT NOT NULL   -- ISO 8601 timestamp
/// );
/// ```
///
/// # Security
/// - Plaintext exists only inside a call and in the TTL cache
/// - Cache entries and returned values are zeroed on drop
/// - Writes invalidate the cache entry so reads never serve stale values
///
/// # Thread Safety
/// - Connection and cache are Mutex-wrapped for safe concurrent access
pub struct SecretService {
    conn: Mutex<Connection>,
    aead: AeadManager,
    cache: Mutex<HashMap<String, CachedSecret>>,
    cache_ttl: Duration,
}

impl SecretService {
    /// Creates or opens the secret store.
    ///
    /// # Arguments
    /// * `db_path` - Path to SQLite database file
    /// * `aead` - Cipher bound to the master data key
    /// * `cache_ttl` - How long decrypted values stay cached
    pub fn new<P: AsRef<Path>>(
        db_path: P,
        aead: AeadManager,
        cache_ttl: Duration,
    ) -> Result<Self, VaultError> {
        let conn = Connection::open(db_path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS secrets (
                name TEXT PRIMARY KEY,
                nonce TEXT NOT NULL,
                ciphertext TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            aead,
            cache: Mutex::new(HashMap::new()),
            cache_ttl,
        })
    }

    /// Stores a secret (upsert), taking ownership of the plaintext.
    ///
    /// The plaintext buffer is zeroed before this returns.
    pub fn set(&self, name: &str, plaintext: String) -> Result<(), VaultError> {
        let plaintext = Zeroizing::new(plaintext);
        let (ciphertext, nonce) = self.aead.encrypt(plaintext.as_bytes())?;
        let now = Utc::now().to_rfc3339();

        self.conn.lock().unwrap().execute(
            "INSERT INTO secrets (name, nonce, ciphertext, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                 nonce = excluded.nonce,
                 ciphertext = excluded.ciphertext,
                 updated_at = excluded.updated_at",
            params![name, nonce, ciphertext, now],
        )?;

        // Next read decrypts the fresh record
        self.cache.lock().unwrap().remove(name);

        Ok(())
    }

    /// Decrypts a secret for immediate use.
    ///
    /// Serves from the TTL cache when fresh, otherwise decrypts the stored
    /// record and refills the cache.
    ///
    /// # Returns
    /// * `Ok(Some(plaintext))` - Zeroed on drop
    /// * `Ok(None)` - No such secret
    /// * `Err(VaultError::Authentication)` - Wrong key or tampered record
    pub fn decrypt_for_use(&self, name: &str) -> Result<Option<Zeroizing<String>>, VaultError> {
        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get(name) {
                if entry.cached_at.elapsed() < self.cache_ttl {
                    return Ok(Some(entry.plaintext.clone()));
                }
                cache.remove(name);
            }
        }

        let row = {
            let conn = self.conn.lock().unwrap();
            let mut stmt =
                conn.prepare("SELECT nonce, ciphertext FROM secrets WHERE name = ?1")?;
            let mut rows = stmt.query(params![name])?;

            match rows.next()? {
                Some(row) => {
                    let nonce: String = row.get(0)?;
                    let ciphertext: String = row.get(1)?;
                    Some((nonce, ciphertext))
                }
                None => None,
            }
        };

        let Some((nonce, ciphertext)) = row else {
            return Ok(None);
        };

        let plaintext_bytes = self.aead.decrypt(&ciphertext, &nonce)?;
        let plaintext = std::str::from_utf8(&plaintext_bytes)
            .map_err(|_| VaultError::Crypto("secret is not valid UTF-8".to_string()))?;
        let value = Zeroizing::new(plaintext.to_string());

        self.cache.lock().unwrap().insert(
            name.to_string(),
            CachedSecret {
                plaintext: value.clone(),
                cached_at: Instant::now(),
            },
        );

        Ok(Some(value))
    }

    /// Returns a redacted status for a secret, or `None` if unset.
    pub fn status(&self, name: &str) -> Result<Option<SecretStatus>, VaultError> {
        let updated_at = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare("SELECT updated_at FROM secrets WHERE name = ?1")?;
            let mut rows = stmt.query(params![name])?;

            match rows.next()? {
                Some(row) => {
                    let raw: String = row.get(0)?;
                    DateTime::parse_from_rfc3339(&raw)
                        .map(|dt| dt.with_timezone(&Utc))
                        .map_err(|e| {
                            VaultError::Serialization(format!("invalid updated_at: {}", e))
                        })?
                }
                None => return Ok(None),
            }
        };

        let Some(value) = self.decrypt_for_use(name)? else {
            return Ok(None);
        };

        Ok(Some(SecretStatus {
            last4: last4(&value),
            updated_at,
        }))
    }

    /// Returns whether a secret exists, without decrypting it.
    pub fn exists(&self, name: &str) -> Result<bool, VaultError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT 1 FROM secrets WHERE name = ?1")?;
        let mut rows = stmt.query(params![name])?;
        Ok(rows.next()?.is_some())
    }

    /// Deletes a secret and its cache entry.
    ///
    /// Returns `true` if the secret existed.
    pub fn delete(&self, name: &str) -> Result<bool, VaultError> {
        let rows_affected = self
            .conn
            .lock()
            .unwrap()
            .execute("DELETE FROM secrets WHERE name = ?1", params![name])?;

        self.cache.lock().unwrap().remove(name);

        Ok(rows_affected > 0)
    }
}

fn last4(value: &str) -> String {
    let skip = value.chars().count().saturating_sub(4);
    value.chars().skip(skip).collect()
}
