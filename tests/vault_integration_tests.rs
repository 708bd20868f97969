//! Vault lifecycle tests against real stores and real time.

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use wallet_custody::core::{CustodyError, VaultConfig};
use wallet_custody::storage::{JsonFileStore, MemoryStore, SecretStore};
use wallet_custody::vault::SecureVault;

fn fast_config(auto_lock_secs: u64) -> VaultConfig {
    VaultConfig {
        auto_lock_secs,
        kdf_iterations: 1,
    }
}

/// Slow enough that a concurrent `lock()` always lands inside the KDF.
fn slow_kdf_config() -> VaultConfig {
    VaultConfig {
        auto_lock_secs: 60,
        kdf_iterations: 50_000,
    }
}

/// MemoryStore that fails writes to keys starting with an armed prefix.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_prefix: Mutex<Option<String>>,
}

impl FlakyStore {
    fn arm(&self, prefix: &str) {
        *self.fail_prefix.lock() = Some(prefix.to_string());
    }

    fn disarm(&self) {
        *self.fail_prefix.lock() = None;
    }
}

impl SecretStore for FlakyStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CustodyError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), CustodyError> {
        if let Some(prefix) = self.fail_prefix.lock().as_deref() {
            if key.starts_with(prefix) {
                return Err(CustodyError::Storage("disk full".to_string()));
            }
        }
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), CustodyError> {
        self.inner.remove(key)
    }

    fn keys(&self) -> Result<Vec<String>, CustodyError> {
        self.inner.keys()
    }
}

#[tokio::test]
async fn test_auto_lock_after_inactivity() {
    let vault = SecureVault::open(Arc::new(MemoryStore::new()), fast_config(1)).unwrap();
    vault.enable("password1").await.unwrap();
    vault.set("k", b"v").await.unwrap();
    assert!(!vault.is_locked());

    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert!(vault.is_locked());
    assert!(matches!(vault.get("k").await, Err(CustodyError::VaultLocked)));

    vault.unlock("password1").await.unwrap();
    assert_eq!(&vault.get("k").await.unwrap().unwrap()[..], b"v");
}

#[tokio::test]
async fn test_activity_pushes_deadline() {
    let vault = SecureVault::open(Arc::new(MemoryStore::new()), fast_config(1)).unwrap();
    vault.enable("password1").await.unwrap();
    vault.set("k", b"v").await.unwrap();

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(vault.get("k").await.unwrap().is_some());
    }
    assert!(!vault.is_locked());

    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert!(vault.is_locked());
}

#[tokio::test]
async fn test_manual_lock_disarms_timer() {
    let vault = SecureVault::open(Arc::new(MemoryStore::new()), fast_config(1)).unwrap();
    vault.enable("password1").await.unwrap();
    vault.lock();
    assert!(vault.status().auto_lock_deadline.is_none());

    // A fresh session gets its own full window.
    tokio::time::sleep(Duration::from_millis(700)).await;
    vault.unlock("password1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!vault.is_locked());
}

#[tokio::test]
async fn test_change_password_reencrypts_everything() {
    let store = Arc::new(MemoryStore::new());
    let vault = SecureVault::open(store.clone(), fast_config(60)).unwrap();
    vault.enable("password1").await.unwrap();
    vault.set("a", b"alpha").await.unwrap();
    vault.set("b", b"beta").await.unwrap();
    let before = store.get("vault/a").unwrap();

    vault.change_password("password1", "password2").await.unwrap();
    assert!(!vault.is_locked());
    assert_ne!(store.get("vault/a").unwrap(), before);
    assert!(store.keys().unwrap().iter().all(|k| !k.starts_with("staging/")));
    assert_eq!(store.get("meta/commit").unwrap(), None);

    vault.lock();
    assert!(matches!(vault.unlock("password1").await, Err(CustodyError::Decryption)));
    vault.unlock("password2").await.unwrap();
    assert_eq!(&vault.get("a").await.unwrap().unwrap()[..], b"alpha");
    assert_eq!(&vault.get("b").await.unwrap().unwrap()[..], b"beta");
}

#[tokio::test]
async fn test_change_password_wrong_old_password() {
    let vault = SecureVault::open(Arc::new(MemoryStore::new()), fast_config(60)).unwrap();
    vault.enable("password1").await.unwrap();
    let err = vault.change_password("password9", "password2").await.unwrap_err();
    assert!(matches!(err, CustodyError::Decryption));
    vault.lock();
    vault.unlock("password1").await.unwrap();
}

#[tokio::test]
async fn test_change_password_while_locked() {
    let vault = SecureVault::open(Arc::new(MemoryStore::new()), fast_config(60)).unwrap();
    vault.enable("password1").await.unwrap();
    vault.set("k", b"v").await.unwrap();
    vault.lock();

    vault.change_password("password1", "password2").await.unwrap();
    assert!(!vault.is_locked());
    assert_eq!(&vault.get("k").await.unwrap().unwrap()[..], b"v");
}

#[tokio::test]
async fn test_failed_staging_keeps_old_password() {
    let store = Arc::new(FlakyStore::default());
    let vault = SecureVault::open(store.clone(), fast_config(60)).unwrap();
    vault.enable("password1").await.unwrap();
    vault.set("k", b"v").await.unwrap();

    store.arm("staging/vault/");
    let err = vault.change_password("password1", "password2").await.unwrap_err();
    assert_eq!(err.code(), "STORAGE_ERROR");
    store.disarm();

    assert!(store.keys().unwrap().iter().all(|k| !k.starts_with("staging/")));
    assert_eq!(store.get("meta/commit").unwrap(), None);

    let reopened = SecureVault::open(store.clone(), fast_config(60)).unwrap();
    assert!(matches!(reopened.unlock("password2").await, Err(CustodyError::Decryption)));
    reopened.unlock("password1").await.unwrap();
    assert_eq!(&reopened.get("k").await.unwrap().unwrap()[..], b"v");
}

#[tokio::test]
async fn test_interrupted_commit_rolls_forward_on_open() {
    let store = Arc::new(FlakyStore::default());
    let vault = SecureVault::open(store.clone(), fast_config(60)).unwrap();
    vault.enable("password1").await.unwrap();
    vault.set("a", b"alpha").await.unwrap();
    vault.set("b", b"beta").await.unwrap();

    // The marker lands, then copying records over the live ones fails.
    store.arm("vault/");
    assert!(vault.change_password("password1", "password2").await.is_err());
    store.disarm();
    assert!(store.get("meta/commit").unwrap().is_some());
    drop(vault);

    let reopened = SecureVault::open(store.clone(), fast_config(60)).unwrap();
    assert!(reopened.is_locked());
    assert_eq!(store.get("meta/commit").unwrap(), None);
    assert!(store.keys().unwrap().iter().all(|k| !k.starts_with("staging/")));

    assert!(matches!(reopened.unlock("password1").await, Err(CustodyError::Decryption)));
    reopened.unlock("password2").await.unwrap();
    assert_eq!(&reopened.get("a").await.unwrap().unwrap()[..], b"alpha");
    assert_eq!(&reopened.get("b").await.unwrap().unwrap()[..], b"beta");
}

#[tokio::test]
async fn test_json_store_vault_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vault.json");

    {
        let vault = SecureVault::open(Arc::new(JsonFileStore::open(&path).unwrap()), fast_config(60)).unwrap();
        vault.set("plain-before-enable", b"p").await.unwrap();
        vault.enable("password1").await.unwrap();
        vault.set("k", b"v").await.unwrap();
    }

    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(!raw.contains("\"plain/"));
    assert!(raw.contains("meta/canary"));

    let vault = SecureVault::open(Arc::new(JsonFileStore::open(&path).unwrap()), fast_config(60)).unwrap();
    assert!(vault.status().encryption_enabled);
    assert!(vault.is_locked());
    vault.unlock("password1").await.unwrap();
    assert_eq!(vault.keys().unwrap(), vec!["k".to_string(), "plain-before-enable".to_string()]);
    assert_eq!(&vault.get("plain-before-enable").await.unwrap().unwrap()[..], b"p");
}

#[tokio::test]
async fn test_unlock_requires_encryption() {
    let vault = SecureVault::open(Arc::new(MemoryStore::new()), fast_config(60)).unwrap();
    assert_eq!(vault.unlock("password1").await.unwrap_err().code(), "VALIDATION_ERROR");
    assert_eq!(
        vault.change_password("password1", "password2").await.unwrap_err().code(),
        "VALIDATION_ERROR"
    );
}

#[tokio::test]
async fn test_interrupted_enable_binds_first_password() {
    let store = Arc::new(FlakyStore::default());
    let vault = SecureVault::open(store.clone(), fast_config(60)).unwrap();
    vault.set("a", b"alpha").await.unwrap();
    vault.set("b", b"beta").await.unwrap();

    // "a" migrates, "b" does not.
    store.arm("vault/b");
    assert_eq!(vault.enable("password1").await.unwrap_err().code(), "STORAGE_ERROR");
    store.disarm();

    let status = vault.status();
    assert!(status.encryption_enabled);
    assert!(status.is_locked);
    assert_eq!(vault.enable("password2").await.unwrap_err().code(), "VALIDATION_ERROR");
    assert!(matches!(vault.unlock("password2").await, Err(CustodyError::Decryption)));

    vault.unlock("password1").await.unwrap();
    assert_eq!(store.get("plain/b").unwrap(), None);
    assert_eq!(&vault.get("a").await.unwrap().unwrap()[..], b"alpha");
    assert_eq!(&vault.get("b").await.unwrap().unwrap()[..], b"beta");
}

#[tokio::test]
async fn test_unapplied_commit_is_finished_by_unlock() {
    let store = Arc::new(FlakyStore::default());
    let vault = SecureVault::open(store.clone(), fast_config(60)).unwrap();
    vault.enable("password1").await.unwrap();
    vault.set("a", b"alpha").await.unwrap();
    vault.set("b", b"beta").await.unwrap();

    store.arm("vault/");
    assert_eq!(
        vault.change_password("password1", "password2").await.unwrap_err().code(),
        "STORAGE_ERROR"
    );
    store.disarm();
    assert!(vault.is_locked());
    assert!(matches!(vault.get("a").await, Err(CustodyError::VaultLocked)));

    // Same process, no reopen.
    assert!(matches!(vault.unlock("password1").await, Err(CustodyError::Decryption)));
    assert_eq!(store.get("meta/commit").unwrap(), None);
    vault.unlock("password2").await.unwrap();
    assert_eq!(&vault.get("a").await.unwrap().unwrap()[..], b"alpha");
    assert_eq!(&vault.get("b").await.unwrap().unwrap()[..], b"beta");
}

#[tokio::test]
async fn test_change_password_short_new_password() {
    let store = Arc::new(MemoryStore::new());
    let vault = SecureVault::open(store.clone(), fast_config(60)).unwrap();
    vault.enable("password1").await.unwrap();
    vault.set("k", b"v").await.unwrap();
    let canary = store.get("meta/canary").unwrap();
    let record = store.get("vault/k").unwrap();

    let err = vault.change_password("password1", "short").await.unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");

    assert!(!vault.is_locked());
    assert_eq!(store.get("meta/canary").unwrap(), canary);
    assert_eq!(store.get("vault/k").unwrap(), record);
    vault.lock();
    vault.unlock("password1").await.unwrap();
    assert_eq!(&vault.get("k").await.unwrap().unwrap()[..], b"v");
}

#[tokio::test]
async fn test_mnemonic_backup_scenario() {
    let vault = SecureVault::open(Arc::new(MemoryStore::new()), fast_config(60)).unwrap();
    let mnemonic = b"abandon ability able about above absent absorb abstract absurd abuse access accident";
    vault.enable("correcthorse").await.unwrap();
    vault.set("mnemonicBackup", mnemonic).await.unwrap();
    vault.lock();

    assert!(matches!(vault.get("mnemonicBackup").await, Err(CustodyError::VaultLocked)));
    assert!(matches!(vault.unlock("wrong1234").await, Err(CustodyError::Decryption)));
    vault.unlock("correcthorse").await.unwrap();
    assert_eq!(&vault.get("mnemonicBackup").await.unwrap().unwrap()[..], &mnemonic[..]);
}

#[tokio::test]
async fn test_lock_during_set_discards_write() {
    let store = Arc::new(MemoryStore::new());
    let vault = SecureVault::open(store.clone(), slow_kdf_config()).unwrap();
    vault.enable("password1").await.unwrap();

    let pending = {
        let vault = vault.clone();
        tokio::spawn(async move { vault.set("k", b"v").await })
    };
    // Let the write snapshot the session and park on the KDF.
    tokio::task::yield_now().await;
    vault.lock();

    assert!(matches!(pending.await.unwrap(), Err(CustodyError::VaultLocked)));
    assert_eq!(store.get("vault/k").unwrap(), None);
    assert_eq!(store.get("plain/k").unwrap(), None);
}

#[tokio::test]
async fn test_lock_during_get_discards_read() {
    let vault = SecureVault::open(Arc::new(MemoryStore::new()), slow_kdf_config()).unwrap();
    vault.enable("password1").await.unwrap();
    vault.set("k", b"v").await.unwrap();

    let pending = {
        let vault = vault.clone();
        tokio::spawn(async move { vault.get("k").await })
    };
    tokio::task::yield_now().await;
    vault.lock();

    assert!(matches!(pending.await.unwrap(), Err(CustodyError::VaultLocked)));
}
