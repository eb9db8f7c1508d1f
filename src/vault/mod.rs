//! Encrypted secret storage with a wrapped master key.
//!
//! Secrets are encrypted at rest with AES-256-GCM under a random 256-bit
//! master data key. The master key itself never touches disk in the clear:
//! it is wrapped (encrypted) with a key-encryption key derived from the
//! operator-supplied node secret via Argon2id.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       MasterKeyManager                   │
//! │  - Argon2id KDF (node secret → KEK)      │
//! │  - Generate / unwrap / rewrap master key │
//! └─────────────────────────────────────────┘
//!          ↓ (data-key cipher)
//! ┌─────────────────────────────────────────┐
//! │       SecretService                      │
//! │  - Named secret records                  │
//! │  - Decrypt cache with TTL                │
//! │  - Redacted status (last 4 chars)        │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       AeadManager                        │
//! │  - AES-256-GCM                           │
//! │  - Unique nonce per record               │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SQLite Database                    │
//! │  - settings: wrapped key + KDF params    │
//! │  - secrets: ciphertext at rest           │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use panel_sync::settings::SettingsStore;
//! use panel_sync::vault::{MasterKeyManager, SecretService};
//!
//! # fn main() -> anyhow::Result<()> {
//! let settings = Arc::new(SettingsStore::new("panel-sync.db")?);
//!
//! // First boot generates and wraps a fresh master key; later boots unwrap it
//! let node_secret = std::env::var("PANEL_SYNC_NODE_SECRET")?;
//! let keys = MasterKeyManager::load(Arc::clone(&settings), &node_secret)?;
//!
//! let secrets = SecretService::new("panel-sync.db", keys.aead(), Duration::from_secs(600))?;
//! secrets.set("panel.client_secret", "s3cret-value".to_string())?;
//!
//! if let Some(value) = secrets.decrypt_for_use("panel.client_secret")? {
//!     println!("secret ends with ...{}", &value[value.len() - 4..]);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - Master key is random, never derived from the node secret directly
//! - Rotating the node secret rewraps the master key; stored secrets stay valid
//! - Every record has a unique nonce (never reused)
//! - Authenticated encryption (tampering and wrong keys detected, not garbled)
//! - Decrypted plaintext is zeroed when dropped

use thiserror::Error;

mod aead;
mod master_key;
mod secrets;

pub use aead::AeadManager;
pub use master_key::{KeyHealth, MasterKeyManager};
pub use secrets::{SecretService, SecretStatus};

/// Errors from vault operations.
///
/// `Authentication` is deliberately distinct from `Storage` and `Crypto`:
/// it means the key material is wrong or the data was tampered with, and
/// callers surface it differently from an unreadable database.
#[derive(Debug, Error)]
pub enum VaultError {
    /// AEAD authentication failed: wrong key or tampered data
    #[error("decryption failed: wrong key or corrupted data")]
    Authentication,

    /// Node secret rejected before any key derivation
    #[error("node secret must be at least {min} characters, got {len}")]
    NodeSecretTooShort { min: usize, len: usize },

    /// Key derivation or cipher failure
    #[error("crypto error: {0}")]
    Crypto(String),

    /// SQLite failure
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Stored structure (JSON, timestamp) failed to parse
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Base64 decoding of stored fields failed
    #[error("encoding error: {0}")]
    Encoding(#[from] base64::DecodeError),
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::Serialization(e.to_string())
    }
}
