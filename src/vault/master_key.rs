//! Master key generation, wrapping, and rotation.
//!
//! The 256-bit master data key is random and encrypts all secret records.
//! It is stored wrapped: encrypted under a key-encryption key (KEK) derived
//! from the node secret with Argon2id. Rotating the node secret only rewraps
//! the master key, so existing ciphertexts never need re-encryption.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

use super::aead::{AeadManager, KEY_SIZE};
use super::VaultError;
use crate::settings::SettingsStore;

/// Minimum node secret length, rejected below this
const MIN_NODE_SECRET_LEN: usize = 16;

/// Recommended node secret length, warned below this
const RECOMMENDED_NODE_SECRET_LEN: usize = 32;

/// Size of the KDF salt in bytes
const SALT_SIZE: usize = 16;

/// Argon2id memory cost in KiB (64 MiB)
const ARGON2_M_COST_KIB: u32 = 64 * 1024;

/// Argon2id iteration count
const ARGON2_T_COST: u32 = 1;

/// Argon2id parallelism
const ARGON2_P_COST: u32 = 4;

/// Settings key holding the wrapped master key (JSON)
const WRAPPED_KEY_SETTING: &str = "vault.wrapped_key";

/// Settings key holding the KDF parameters (JSON)
const KDF_PARAMS_SETTING: &str = "vault.kdf_params";

/// Known plaintext round-tripped at load time to verify the unwrapped key
const SELF_TEST_PLAINTEXT: &[u8] = b"panel-sync-vault-self-test";

/// Wrapped master key as persisted in settings.
#[derive(Debug, Serialize, Deserialize)]
struct WrappedKey {
    nonce: String,
    ciphertext: String,
}

/// KDF parameters as persisted in settings.
#[derive(Debug, Serialize, Deserialize)]
struct KdfParams {
    salt: String,
}

/// Raw master key bytes, zeroed on drop.
struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    fn from_slice(slice: &[u8]) -> Result<Self, VaultError> {
        if slice.len() != KEY_SIZE {
            return Err(VaultError::Crypto(format!(
                "unwrapped master key must be {} bytes, got {}",
                KEY_SIZE,
                slice.len()
            )));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// Reported by `MasterKeyManager::health` for diagnostics endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct KeyHealth {
    pub wrapped_key_present: bool,
    pub kdf: &'static str,
    pub aead: &'static str,
}

/// Loads, generates, and rotates the vault master key.
///
/// # Security
/// - The KEK is derived with Argon2id (64 MiB, t=1, p=4) and a random salt
/// - The master key is random, never a direct derivation of the node secret
/// - A wrong node secret fails with `VaultError::Authentication`, never with
///   silently garbled data (GCM authenticates)
/// - Key material lives in memory only and is zeroed on drop
pub struct MasterKeyManager {
    settings: Arc<SettingsStore>,
    master_key: MasterKey,
    aead: AeadManager,
}

// Key material never rides along into logs via {:?}
impl fmt::Debug for MasterKeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKeyManager")
            .field("master_key", &"***")
            .finish_non_exhaustive()
    }
}

impl MasterKeyManager {
    /// Loads the master key, generating and wrapping a fresh one on first boot.
    ///
    /// # Arguments
    /// * `settings` - Store holding the wrapped key and KDF parameters
    /// * `node_secret` - Operator-supplied secret, at least 16 characters
    ///
    /// # Returns
    /// * `Ok(MasterKeyManager)` - Key unwrapped and self-tested
    /// * `Err(VaultError::NodeSecretTooShort)` - Secret rejected before any derivation
    /// * `Err(VaultError::Authentication)` - Wrong node secret or tampered wrapped key
    pub fn load(settings: Arc<SettingsStore>, node_secret: &str) -> Result<Self, VaultError> {
        check_node_secret(node_secret)?;

        let master_key = match settings.get(WRAPPED_KEY_SETTING)? {
            Some(wrapped_json) => {
                let wrapped: WrappedKey = serde_json::from_str(&wrapped_json)?;
                let params_json = settings.get(KDF_PARAMS_SETTING)?.ok_or_else(|| {
                    VaultError::Crypto("KDF parameters missing for wrapped master key".to_string())
                })?;
                let params: KdfParams = serde_json::from_str(&params_json)?;
                let salt = BASE64.decode(&params.salt)?;

                let kek = derive_kek(node_secret, &salt)?;
                let kek_aead = AeadManager::new(&kek[..])?;
                let key_bytes = kek_aead.decrypt(&wrapped.ciphertext, &wrapped.nonce)?;

                let master = MasterKey::from_slice(&key_bytes)?;
                debug!("Unwrapped existing vault master key");
                master
            }
            None => {
                info!("No wrapped master key found, generating a new one");
                generate_and_wrap(&settings, node_secret)?
            }
        };

        let aead = AeadManager::new(&master_key.bytes)?;
        self_test(&aead)?;

        Ok(Self {
            settings,
            master_key,
            aead,
        })
    }

    /// Rewraps the master key under a new node secret.
    ///
    /// Generates a fresh salt, derives a new KEK, and persists the new
    /// wrapped key and KDF parameters in a single transaction. Stored
    /// secrets are untouched: the master key itself does not change.
    pub fn rewrap(&self, new_node_secret: &str) -> Result<(), VaultError> {
        check_node_secret(new_node_secret)?;

        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);

        let wrapped = wrap_master_key(&self.master_key, new_node_secret, &salt)?;
        let params = KdfParams {
            salt: BASE64.encode(salt),
        };

        self.settings.set_many(&[
            (WRAPPED_KEY_SETTING, serde_json::to_string(&wrapped)?),
            (KDF_PARAMS_SETTING, serde_json::to_string(&params)?),
        ])?;

        info!("Rewrapped vault master key under new node secret");
        Ok(())
    }

    /// Reports key material presence without exposing any of it.
    pub fn health(&self) -> Result<KeyHealth, VaultError> {
        Ok(KeyHealth {
            wrapped_key_present: self.settings.get(WRAPPED_KEY_SETTING)?.is_some(),
            kdf: "argon2id",
            aead: "aes-256-gcm",
        })
    }

    /// Returns a cipher handle bound to the master data key.
    ///
    /// This is what the secret service encrypts records with.
    pub fn aead(&self) -> AeadManager {
        self.aead.clone()
    }
}

fn check_node_secret(node_secret: &str) -> Result<(), VaultError> {
    if node_secret.len() < MIN_NODE_SECRET_LEN {
        return Err(VaultError::NodeSecretTooShort {
            min: MIN_NODE_SECRET_LEN,
            len: node_secret.len(),
        });
    }
    if node_secret.len() < RECOMMENDED_NODE_SECRET_LEN {
        warn!(
            len = node_secret.len(),
            recommended = RECOMMENDED_NODE_SECRET_LEN,
            "Node secret is shorter than recommended"
        );
    }
    Ok(())
}

/// Derives the KEK from the node secret with Argon2id.
fn derive_kek(node_secret: &str, salt: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>, VaultError> {
    let params = Params::new(ARGON2_M_COST_KIB, ARGON2_T_COST, ARGON2_P_COST, Some(KEY_SIZE))
        .map_err(|e| VaultError::Crypto(format!("invalid KDF parameters: {}", e)))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut kek = Zeroizing::new([0u8; KEY_SIZE]);
    argon2
        .hash_password_into(node_secret.as_bytes(), salt, kek.as_mut_slice())
        .map_err(|e| VaultError::Crypto(format!("key derivation failed: {}", e)))?;

    Ok(kek)
}

fn wrap_master_key(
    master: &MasterKey,
    node_secret: &str,
    salt: &[u8],
) -> Result<WrappedKey, VaultError> {
    let kek = derive_kek(node_secret, salt)?;
    let kek_aead = AeadManager::new(&kek[..])?;
    let (ciphertext, nonce) = kek_aead.encrypt(&master.bytes)?;
    Ok(WrappedKey { nonce, ciphertext })
}

fn generate_and_wrap(
    settings: &SettingsStore,
    node_secret: &str,
) -> Result<MasterKey, VaultError> {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);

    let mut key_bytes = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key_bytes);
    let master = MasterKey { bytes: key_bytes };
    key_bytes.zeroize();

    let wrapped = wrap_master_key(&master, node_secret, &salt)?;
    let params = KdfParams {
        salt: BASE64.encode(salt),
    };

    settings.set_many(&[
        (WRAPPED_KEY_SETTING, serde_json::to_string(&wrapped)?),
        (KDF_PARAMS_SETTING, serde_json::to_string(&params)?),
    ])?;

    Ok(master)
}

/// Round-trips a known plaintext to catch corrupted key material at load time.
fn self_test(aead: &AeadManager) -> Result<(), VaultError> {
    let (ciphertext, nonce) = aead.encrypt(SELF_TEST_PLAINTEXT)?;
    let roundtrip = aead.decrypt(&ciphertext, &nonce)?;
    if roundtrip.as_slice() != SELF_TEST_PLAINTEXT {
        return Err(VaultError::Crypto(
            "master key self-test round-trip mismatch".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &str = "correct-horse-battery-staple-9000";
    const OTHER_SECRET: &str = "a-completely-different-node-secret";

    fn test_settings() -> Arc<SettingsStore> {
        Arc::new(SettingsStore::new(":memory:").expect("Failed to create settings"))
    }

    #[test]
    fn test_first_boot_generates_and_persists() {
        let settings = test_settings();

        let manager = MasterKeyManager::load(Arc::clone(&settings), TEST_SECRET).unwrap();

        assert!(settings.get(WRAPPED_KEY_SETTING).unwrap().is_some());
        assert!(settings.get(KDF_PARAMS_SETTING).unwrap().is_some());

        let health = manager.health().unwrap();
        assert!(health.wrapped_key_present);
        assert_eq!(health.kdf, "argon2id");
    }

    #[test]
    fn test_reload_unwraps_same_key() {
        let settings = test_settings();

        let first = MasterKeyManager::load(Arc::clone(&settings), TEST_SECRET).unwrap();
        let (ciphertext, nonce) = first.aead().encrypt(b"survives reload").unwrap();

        let second = MasterKeyManager::load(Arc::clone(&settings), TEST_SECRET).unwrap();
        let plaintext = second.aead().decrypt(&ciphertext, &nonce).unwrap();

        assert_eq!(plaintext.as_slice(), b"survives reload");
    }

    #[test]
    fn test_wrong_node_secret_fails_authentication() {
        let settings = test_settings();
        MasterKeyManager::load(Arc::clone(&settings), TEST_SECRET).unwrap();

        let err = MasterKeyManager::load(Arc::clone(&settings), OTHER_SECRET).unwrap_err();
        assert!(matches!(err, VaultError::Authentication));
    }

    #[test]
    fn test_short_node_secret_rejected_before_generation() {
        let settings = test_settings();

        let err = MasterKeyManager::load(Arc::clone(&settings), "too-short").unwrap_err();
        assert!(matches!(err, VaultError::NodeSecretTooShort { .. }));

        // Nothing was written
        assert!(settings.get(WRAPPED_KEY_SETTING).unwrap().is_none());
    }

    #[test]
    fn test_rewrap_rotates_wrapping_only() {
        let settings = test_settings();

        let manager = MasterKeyManager::load(Arc::clone(&settings), TEST_SECRET).unwrap();
        let (ciphertext, nonce) = manager.aead().encrypt(b"pre-rotation data").unwrap();

        manager.rewrap(OTHER_SECRET).unwrap();

        // Old secret no longer unwraps
        let err = MasterKeyManager::load(Arc::clone(&settings), TEST_SECRET).unwrap_err();
        assert!(matches!(err, VaultError::Authentication));

        // New secret unwraps the same master key, so old ciphertext decrypts
        let reloaded = MasterKeyManager::load(Arc::clone(&settings), OTHER_SECRET).unwrap();
        let plaintext = reloaded.aead().decrypt(&ciphertext, &nonce).unwrap();
        assert_eq!(plaintext.as_slice(), b"pre-rotation data");
    }

    #[test]
    fn test_rewrap_rejects_short_secret() {
        let settings = test_settings();
        let manager = MasterKeyManager::load(Arc::clone(&settings), TEST_SECRET).unwrap();

        let err = manager.rewrap("nope").unwrap_err();
        assert!(matches!(err, VaultError::NodeSecretTooShort { .. }));

        // Old secret still works
        MasterKeyManager::load(settings, TEST_SECRET).unwrap();
    }

    #[test]
    fn test_tampered_wrapped_key_fails_authentication() {
        let settings = test_settings();
        MasterKeyManager::load(Arc::clone(&settings), TEST_SECRET).unwrap();

        // Replace the wrapped key with garbage of the right shape
        let bogus = WrappedKey {
            nonce: BASE64.encode([0u8; 12]),
            ciphertext: BASE64.encode([0u8; 48]),
        };
        settings
            .set(WRAPPED_KEY_SETTING, &serde_json::to_string(&bogus).unwrap())
            .unwrap();

        let err = MasterKeyManager::load(settings, TEST_SECRET).unwrap_err();
        assert!(matches!(err, VaultError::Authentication));
    }

    #[test]
    fn test_missing_kdf_params_is_crypto_error() {
        let settings = test_settings();
        MasterKeyManager::load(Arc::clone(&settings), TEST_SECRET).unwrap();

        settings.delete(KDF_PARAMS_SETTING).unwrap();

        let err = MasterKeyManager::load(settings, TEST_SECRET).unwrap_err();
        assert!(matches!(err, VaultError::Crypto(_)));
    }

    #[test]
    fn test_debug_masks_key_material() {
        let settings = test_settings();
        let manager = MasterKeyManager::load(settings, TEST_SECRET).unwrap();

        let formatted = format!("{:?}", manager);
        assert!(formatted.contains("***"));
        assert!(!formatted.contains(TEST_SECRET));
    }
}
