//! AES-256-GCM primitive shared by the master key loader and secret service.
//!
//! Every record is encrypted with a fresh random nonce. Ciphertext and nonce
//! are base64-encoded for storage in SQLite TEXT columns.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use zeroize::Zeroizing;

use super::VaultError;

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
pub const NONCE_SIZE: usize = 12;

/// AES-256-GCM cipher bound to one key.
///
/// # Security
/// - Uses a cryptographically secure random nonce per encryption (never reuse)
/// - Authenticated encryption (tampering detected)
/// - The key is held in memory only and zeroed when the cipher is dropped
#[derive(Clone)]
pub struct AeadManager {
    cipher: Aes256Gcm,
}

impl AeadManager {
    /// Creates a cipher from a 32-byte key.
    pub fn new(key: &[u8]) -> Result<Self, VaultError> {
        if key.len() != KEY_SIZE {
            return Err(VaultError::Crypto(format!(
                "encryption key must be {} bytes (256 bits), got {}",
                KEY_SIZE,
                key.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| VaultError::Crypto(format!("failed to create cipher: {}", e)))?;

        Ok(Self { cipher })
    }

    /// Encrypts plaintext with a random nonce.
    ///
    /// # Returns
    /// * `Ok((ciphertext, nonce))` - Both base64-encoded for storage
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(String, String), VaultError> {
        // Random nonce (never reuse!)
        let nonce_bytes = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext_bytes = self
            .cipher
            .encrypt(&nonce_bytes, plaintext)
            .map_err(|e| VaultError::Crypto(format!("encryption failed: {}", e)))?;

        let ciphertext = BASE64.encode(&ciphertext_bytes);
        let nonce = BASE64.encode(&nonce_bytes);

        Ok((ciphertext, nonce))
    }

    /// Decrypts a base64 ciphertext/nonce pair.
    ///
    /// # Returns
    /// * `Ok(plaintext)` - Zeroed on drop
    /// * `Err(VaultError::Authentication)` - Wrong key, corrupted, or tampered
    pub fn decrypt(
        &self,
        ciphertext: &str,
        nonce: &str,
    ) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let ciphertext_bytes = BASE64.decode(ciphertext)?;
        let nonce_bytes = BASE64.decode(nonce)?;

        if nonce_bytes.len() != NONCE_SIZE {
            return Err(VaultError::Crypto(format!(
                "invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            )));
        }

        let nonce = Nonce::from_slice(&nonce_bytes);

        // AEAD reports wrong-key and tampering identically, on purpose
        let plaintext_bytes = self
            .cipher
            .decrypt(nonce, ciphertext_bytes.as_ref())
            .map_err(|_| VaultError::Authentication)?;

        Ok(Zeroizing::new(plaintext_bytes))
    }
}
