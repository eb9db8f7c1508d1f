//! End-to-end vault lifecycle: first boot, reload, node secret rotation,
//! and fail-closed behavior on wrong key material.

use panel_sync::settings::SettingsStore;
use panel_sync::vault::{MasterKeyManager, SecretService, VaultError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const NODE_SECRET: &str = "orchard-falcon-ledger-midnight-42";
const ROTATED_SECRET: &str = "granite-harbor-signal-daybreak-77";

fn create_db(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("node.db")
}

fn open_secrets(db: &Path, keys: &MasterKeyManager) -> SecretService {
    SecretService::new(db, keys.aead(), Duration::from_secs(600)).unwrap()
}

#[test]
fn test_first_boot_persists_wrapped_key_and_reload_reuses_it() {
    let dir = tempfile::tempdir().unwrap();
    let db = create_db(&dir);
    let settings = Arc::new(SettingsStore::new(&db).unwrap());

    let keys = MasterKeyManager::load(Arc::clone(&settings), NODE_SECRET).unwrap();
    let health = keys.health().unwrap();
    assert!(health.wrapped_key_present);

    let secrets = open_secrets(&db, &keys);
    secrets
        .set("panel.client_secret", "super-secret-value".to_string())
        .unwrap();
    drop(secrets);
    drop(keys);

    // Same database, fresh process
    let keys = MasterKeyManager::load(Arc::clone(&settings), NODE_SECRET).unwrap();
    let secrets = open_secrets(&db, &keys);
    let value = secrets
        .decrypt_for_use("panel.client_secret")
        .unwrap()
        .unwrap();
    assert_eq!(value.as_str(), "super-secret-value");
}

#[test]
fn test_wrong_node_secret_fails_closed() {
    let dir = tempfile::tempdir().unwrap();
    let db = create_db(&dir);
    let settings = Arc::new(SettingsStore::new(&db).unwrap());

    let keys = MasterKeyManager::load(Arc::clone(&settings), NODE_SECRET).unwrap();
    drop(keys);

    let err = MasterKeyManager::load(Arc::clone(&settings), ROTATED_SECRET).unwrap_err();
    assert!(matches!(err, VaultError::Authentication), "got {:?}", err);

    // The failed attempt must not corrupt the stored key material
    MasterKeyManager::load(Arc::clone(&settings), NODE_SECRET).unwrap();
}

#[test]
fn test_short_node_secret_rejected_before_any_write() {
    let dir = tempfile::tempdir().unwrap();
    let db = create_db(&dir);
    let settings = Arc::new(SettingsStore::new(&db).unwrap());

    let err = MasterKeyManager::load(Arc::clone(&settings), "short").unwrap_err();
    assert!(matches!(err, VaultError::NodeSecretTooShort { .. }));

    // A later load with a proper secret starts from a clean slate
    MasterKeyManager::load(Arc::clone(&settings), NODE_SECRET).unwrap();
}

#[test]
fn test_rotation_rewraps_without_touching_secret_records() {
    let dir = tempfile::tempdir().unwrap();
    let db = create_db(&dir);
    let settings = Arc::new(SettingsStore::new(&db).unwrap());

    let keys = MasterKeyManager::load(Arc::clone(&settings), NODE_SECRET).unwrap();
    let secrets = open_secrets(&db, &keys);
    secrets
        .set("panel.client_secret", "original-value".to_string())
        .unwrap();
    secrets
        .set("smtp.password", "mail-room-key".to_string())
        .unwrap();

    keys.rewrap(ROTATED_SECRET).unwrap();

    // The handle that was open during the rotation keeps working: the
    // master key itself never changed
    assert_eq!(
        secrets
            .decrypt_for_use("panel.client_secret")
            .unwrap()
            .unwrap()
            .as_str(),
        "original-value"
    );
    drop(secrets);
    drop(keys);

    // The old node secret no longer unlocks the vault
    let err = MasterKeyManager::load(Arc::clone(&settings), NODE_SECRET).unwrap_err();
    assert!(matches!(err, VaultError::Authentication), "got {:?}", err);

    // The rotated secret decrypts records written before the rotation
    let keys = MasterKeyManager::load(Arc::clone(&settings), ROTATED_SECRET).unwrap();
    let secrets = open_secrets(&db, &keys);
    assert_eq!(
        secrets
            .decrypt_for_use("panel.client_secret")
            .unwrap()
            .unwrap()
            .as_str(),
        "original-value"
    );
    assert_eq!(
        secrets
            .decrypt_for_use("smtp.password")
            .unwrap()
            .unwrap()
            .as_str(),
        "mail-room-key"
    );
}

#[test]
fn test_nothing_on_disk_contains_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let db = create_db(&dir);
    let settings = Arc::new(SettingsStore::new(&db).unwrap());

    let keys = MasterKeyManager::load(Arc::clone(&settings), NODE_SECRET).unwrap();
    let secrets = open_secrets(&db, &keys);
    secrets
        .set("panel.client_secret", "hunter2-classified-material".to_string())
        .unwrap();

    let conn = rusqlite::Connection::open(&db).unwrap();

    let mut stmt = conn.prepare("SELECT key, value FROM settings").unwrap();
    let settings_rows: Vec<(String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert!(!settings_rows.is_empty());
    for (key, value) in &settings_rows {
        assert!(
            !value.contains("hunter2-classified-material"),
            "plaintext secret leaked into settings row {}",
            key
        );
        assert!(
            !value.contains(NODE_SECRET),
            "node secret leaked into settings row {}",
            key
        );
    }

    let mut stmt = conn
        .prepare("SELECT name, nonce, ciphertext FROM secrets")
        .unwrap();
    let secret_rows: Vec<(String, String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(secret_rows.len(), 1);
    for (_, nonce, ciphertext) in &secret_rows {
        assert!(!nonce.contains("hunter2-classified-material"));
        assert!(!ciphertext.contains("hunter2-classified-material"));
    }
}
