//! Password-protected secret vault.
//!
//! States: encryption disabled (plaintext, always accessible), then
//! `Locked` / `Unlocked` once a password has been set with [`SecureVault::enable`].
//!
//! Storage namespaces:
//! - `plain/<key>`   plaintext values while encryption is disabled
//! - `vault/<key>`   encrypted [`record::SecretRecord`] blobs
//! - `staging/...`   write-ahead copies during a password change
//! - `meta/canary`   encrypted known value used to check the password
//! - `meta/commit`   password-change commit marker
//!
//! Every call suspends at most at the KDF, which runs on `spawn_blocking`.
//! Operations snapshot the password and the unlock epoch first; if a
//! `lock()` lands while the KDF runs the result is discarded.

pub mod auto_lock;
pub mod migration;
pub mod record;

use crate::core::config::VaultConfig;
use crate::core::errors::{CustodyError, CustodyResult};
use crate::core::validation::{validate_password, validate_vault_key};
use crate::security::secret::{password_bytes, vec_to_secret, SecretVec};
use crate::storage::SecretStore;
use parking_lot::Mutex;
use record::SecretRecord;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub(crate) const PLAIN_NS: &str = "plain/";
pub(crate) const VAULT_NS: &str = "vault/";
pub(crate) const STAGING_NS: &str = "staging/";
pub(crate) const CANARY_KEY: &str = "meta/canary";
pub(crate) const COMMIT_KEY: &str = "meta/commit";

const CANARY_PLAINTEXT: &[u8] = b"wallet-custody-canary-v1";

/// Point-in-time view of the vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaultStatus {
    pub is_locked: bool,
    pub encryption_enabled: bool,
    /// When the vault will lock itself if nothing else happens.
    pub auto_lock_deadline: Option<Instant>,
}

pub(crate) struct VaultState {
    encryption_enabled: bool,
    locked: bool,
    password: Option<SecretString>,
    epoch: u64,
    last_activity: Instant,
    timer: Option<JoinHandle<()>>,
}

impl VaultState {
    /// Drop the password and start a new epoch.
    pub(crate) fn lock_now(&mut self) {
        self.password = None;
        self.locked = true;
        self.epoch += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn is_idle(&self, timeout: Duration) -> bool {
        Instant::now() >= self.last_activity + timeout
    }

    fn expire_if_idle(&mut self, timeout: Duration) {
        if self.encryption_enabled && !self.locked && self.is_idle(timeout) {
            info!("Vault idle for {:?}, locking", timeout);
            self.lock_now();
        }
    }
}

pub(crate) struct VaultInner {
    store: Arc<dyn SecretStore>,
    config: VaultConfig,
    pub(crate) state: Mutex<VaultState>,
    /// Serializes writers against a password change.
    write_gate: tokio::sync::Mutex<()>,
}

impl Drop for VaultInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.password = None;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}

enum Access {
    Plain,
    Encrypted { password: SecretVec, epoch: u64 },
}

/// Encrypted local secret vault.
#[derive(Clone)]
pub struct SecureVault {
    inner: Arc<VaultInner>,
}

impl std::fmt::Debug for SecureVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureVault")
            .field("status", &self.status())
            .finish()
    }
}

impl SecureVault {
    /// Open a vault over `store`.
    ///
    /// Finishes or discards an interrupted password change, then starts
    /// `Locked` if a canary exists and in plaintext mode otherwise.
    pub fn open(store: Arc<dyn SecretStore>, config: VaultConfig) -> CustodyResult<Self> {
        migration::recover(store.as_ref())?;
        let encryption_enabled = store.get(CANARY_KEY)?.is_some();
        info!(
            "Vault opened ({})",
            if encryption_enabled { "locked" } else { "encryption disabled" }
        );
        Ok(Self {
            inner: Arc::new(VaultInner {
                store,
                config,
                state: Mutex::new(VaultState {
                    encryption_enabled,
                    locked: encryption_enabled,
                    password: None,
                    epoch: 0,
                    last_activity: Instant::now(),
                    timer: None,
                }),
                write_gate: tokio::sync::Mutex::new(()),
            }),
        })
    }

    fn timeout(&self) -> Duration {
        self.inner.config.auto_lock_timeout()
    }

    fn iterations(&self) -> u32 {
        self.inner.config.kdf_iterations
    }

    pub fn status(&self) -> VaultStatus {
        let mut state = self.inner.state.lock();
        state.expire_if_idle(self.timeout());
        let unlocked = state.encryption_enabled && !state.locked;
        VaultStatus {
            is_locked: state.locked,
            encryption_enabled: state.encryption_enabled,
            auto_lock_deadline: unlocked.then(|| state.last_activity + self.timeout()),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.status().is_locked
    }

    /// Turn on encryption with `password`.
    ///
    /// Writes the canary, migrates every plaintext record and leaves the
    /// vault unlocked. Once the canary is written the vault is bound to
    /// `password`: if migration then fails the vault is left enabled and
    /// `Locked`, and [`SecureVault::unlock`] with the same password finishes
    /// the migration.
    pub async fn enable(&self, password: &str) -> CustodyResult<()> {
        validate_password(password)?;
        let _gate = self.inner.write_gate.lock().await;
        if self.inner.state.lock().encryption_enabled || self.inner.store.get(CANARY_KEY)?.is_some() {
            return Err(CustodyError::Validation("encryption already enabled".to_string()));
        }

        let secret = crate::security::secret::password(password);
        let pw = password_bytes(&secret);
        let iterations = self.iterations();
        let canary_pw = pw.clone();
        let canary = tokio::task::spawn_blocking(move || {
            SecretRecord::seal(CANARY_KEY, CANARY_PLAINTEXT, &canary_pw, iterations)
        })
        .await??;
        self.inner.store.set(CANARY_KEY, &canary.to_blob())?;

        if let Err(e) = migration::migrate_plaintext(&self.inner.store, &pw, iterations).await {
            warn!("Enabling encryption interrupted: {}", e.code());
            let mut state = self.inner.state.lock();
            state.encryption_enabled = true;
            state.lock_now();
            return Err(e);
        }

        self.start_session(secret);
        info!("Vault encryption enabled");
        Ok(())
    }

    /// Unlock with `password`. Any failure is a single generic `Decryption`.
    ///
    /// A committed but unapplied password change is finished first, so the
    /// canary and the records always agree on the password.
    pub async fn unlock(&self, password: &str) -> CustodyResult<()> {
        if !self.inner.state.lock().encryption_enabled {
            return Err(CustodyError::Validation("encryption is not enabled".to_string()));
        }
        let _gate = self.inner.write_gate.lock().await;
        migration::recover(self.inner.store.as_ref())?;

        let secret = crate::security::secret::password(password);
        self.verify_password(password_bytes(&secret)).await?;

        let already_unlocked = {
            let mut state = self.inner.state.lock();
            state.expire_if_idle(self.timeout());
            !state.locked
        };
        if already_unlocked {
            let mut state = self.inner.state.lock();
            state.password = Some(secret);
            state.last_activity = Instant::now();
            debug!("Vault already unlocked, activity refreshed");
        } else {
            self.start_session(secret);
            info!("Vault unlocked");
        }

        // Leftover plaintext from an interrupted enable.
        if let Access::Encrypted { password, .. } = self.snapshot()? {
            migration::migrate_plaintext(&self.inner.store, &password, self.iterations()).await?;
        }
        Ok(())
    }

    /// Forget the password. Idempotent; a no-op while encryption is disabled.
    pub fn lock(&self) {
        let mut state = self.inner.state.lock();
        if state.encryption_enabled && !state.locked {
            state.lock_now();
            info!("Vault locked");
        }
    }

    pub async fn set(&self, key: &str, value: &[u8]) -> CustodyResult<()> {
        validate_vault_key(key)?;
        let _gate = self.inner.write_gate.lock().await;
        let (password, epoch) = match self.snapshot()? {
            Access::Plain => {
                self.inner.store.set(&format!("{}{}", PLAIN_NS, key), value)?;
                return Ok(());
            }
            Access::Encrypted { password, epoch } => (password, epoch),
        };

        let iterations = self.iterations();
        let name = key.to_string();
        let value = vec_to_secret(value.to_vec());
        let record = tokio::task::spawn_blocking(move || {
            SecretRecord::seal(&name, &value, &password, iterations)
        })
        .await??;

        self.commit(epoch, || {
            self.inner
                .store
                .set(&format!("{}{}", VAULT_NS, key), &record.to_blob())?;
            self.inner.store.remove(&format!("{}{}", PLAIN_NS, key))
        })?;
        debug!("Stored vault record {}", key);
        Ok(())
    }

    pub async fn get(&self, key: &str) -> CustodyResult<Option<SecretVec>> {
        validate_vault_key(key)?;
        let (password, epoch) = match self.snapshot()? {
            Access::Plain => {
                return Ok(self
                    .inner
                    .store
                    .get(&format!("{}{}", PLAIN_NS, key))?
                    .map(vec_to_secret));
            }
            Access::Encrypted { password, epoch } => (password, epoch),
        };

        let Some(blob) = self.inner.store.get(&format!("{}{}", VAULT_NS, key))? else {
            self.commit(epoch, || Ok(()))?;
            return Ok(None);
        };
        let record = SecretRecord::from_blob(key, &blob)?;
        let iterations = self.iterations();
        let opened = tokio::task::spawn_blocking(move || record.open(&password, iterations)).await?;

        // A lock or password change since the snapshot wins over the decrypt result.
        self.commit(epoch, || Ok(()))?;
        Ok(Some(opened?))
    }

    pub async fn remove(&self, key: &str) -> CustodyResult<()> {
        validate_vault_key(key)?;
        let _gate = self.inner.write_gate.lock().await;
        match self.snapshot()? {
            Access::Plain => self.inner.store.remove(&format!("{}{}", PLAIN_NS, key)),
            Access::Encrypted { epoch, .. } => self.commit(epoch, || {
                self.inner.store.remove(&format!("{}{}", VAULT_NS, key))?;
                self.inner.store.remove(&format!("{}{}", PLAIN_NS, key))
            }),
        }
    }

    /// User-visible keys, sorted. Requires the vault to be unlocked when
    /// encryption is enabled.
    pub fn keys(&self) -> CustodyResult<Vec<String>> {
        let store = self.inner.store.as_ref();
        let mut names = migration::names_in(store, PLAIN_NS)?;
        if let Access::Encrypted { epoch, .. } = self.snapshot()? {
            names.extend(migration::names_in(store, VAULT_NS)?);
            self.commit(epoch, || Ok(()))?;
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Re-encrypt every record under `new`.
    ///
    /// `old` is checked like [`SecureVault::unlock`]. On success the vault is
    /// unlocked with the new password under a new epoch, so reads that
    /// snapshotted the old password are discarded. If applying a committed
    /// change fails the vault locks; the next unlock finishes the change.
    pub async fn change_password(&self, old: &str, new: &str) -> CustodyResult<()> {
        validate_password(new)?;
        if !self.inner.state.lock().encryption_enabled {
            return Err(CustodyError::Validation("encryption is not enabled".to_string()));
        }
        let _gate = self.inner.write_gate.lock().await;
        migration::recover(self.inner.store.as_ref())?;

        let old_pw = password_bytes(&crate::security::secret::password(old));
        self.verify_password(old_pw.clone()).await?;
        let epoch = self.inner.state.lock().epoch;

        let new_secret = crate::security::secret::password(new);
        let new_pw = password_bytes(&new_secret);
        let store = &self.inner.store;
        let staged = match migration::stage_reencryption(
            store,
            &old_pw,
            &new_pw,
            self.iterations(),
            CANARY_PLAINTEXT,
        )
        .await
        {
            Ok(n) => n,
            Err(e) => {
                warn!("Password change aborted while staging: {}", e.code());
                let _ = migration::discard_staging(store.as_ref());
                return Err(e);
            }
        };

        // Commit point.
        {
            let state = self.inner.state.lock();
            if state.epoch != epoch {
                drop(state);
                let _ = migration::discard_staging(store.as_ref());
                return Err(CustodyError::VaultLocked);
            }
            store.set(COMMIT_KEY, b"1").map_err(|e| {
                let _ = migration::discard_staging(store.as_ref());
                e
            })?;
        }
        if let Err(e) = migration::roll_forward(store.as_ref()) {
            warn!("Password change committed but not applied: {}", e.code());
            let mut state = self.inner.state.lock();
            if !state.locked {
                state.lock_now();
            }
            return Err(e);
        }

        self.start_session(new_secret);
        info!("Vault password changed ({} records re-encrypted)", staged);
        Ok(())
    }

    async fn verify_password(&self, password: SecretVec) -> CustodyResult<()> {
        let blob = self
            .inner
            .store
            .get(CANARY_KEY)?
            .ok_or(CustodyError::Decryption)?;
        let canary = SecretRecord::from_blob(CANARY_KEY, &blob)?;
        let iterations = self.iterations();
        let plaintext =
            tokio::task::spawn_blocking(move || canary.open(&password, iterations)).await??;
        if &plaintext[..] != CANARY_PLAINTEXT {
            return Err(CustodyError::Decryption);
        }
        Ok(())
    }

    /// Unlock with a verified password, bump the epoch and arm the timer.
    fn start_session(&self, password: SecretString) {
        let mut state = self.inner.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.encryption_enabled = true;
        state.locked = false;
        state.password = Some(password);
        state.epoch += 1;
        state.last_activity = Instant::now();
        state.timer = Some(auto_lock::spawn(
            Arc::downgrade(&self.inner),
            state.epoch,
            self.timeout(),
        ));
    }

    fn snapshot(&self) -> CustodyResult<Access> {
        let mut state = self.inner.state.lock();
        if !state.encryption_enabled {
            return Ok(Access::Plain);
        }
        state.expire_if_idle(self.timeout());
        match (&state.password, state.locked) {
            (Some(p), false) => Ok(Access::Encrypted {
                password: password_bytes(p),
                epoch: state.epoch,
            }),
            _ => Err(CustodyError::VaultLocked),
        }
    }

    /// Re-check the epoch, apply `write`, and record activity, all under
    /// the state lock.
    fn commit<F>(&self, epoch: u64, write: F) -> CustodyResult<()>
    where
        F: FnOnce() -> CustodyResult<()>,
    {
        let mut state = self.inner.state.lock();
        state.expire_if_idle(self.timeout());
        if state.locked || state.epoch != epoch {
            debug!("Vault locked during operation, result discarded");
            return Err(CustodyError::VaultLocked);
        }
        write()?;
        state.last_activity = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn config() -> VaultConfig {
        VaultConfig {
            auto_lock_secs: 60,
            kdf_iterations: 1,
        }
    }

    fn open() -> (Arc<MemoryStore>, SecureVault) {
        let store = Arc::new(MemoryStore::new());
        let vault = SecureVault::open(store.clone(), config()).unwrap();
        (store, vault)
    }

    #[tokio::test]
    async fn test_plaintext_mode() {
        let (store, vault) = open();
        assert!(!vault.status().encryption_enabled);
        vault.set("k", b"v").await.unwrap();
        assert_eq!(store.get("plain/k").unwrap(), Some(b"v".to_vec()));
        vault.lock();
        assert_eq!(&vault.get("k").await.unwrap().unwrap()[..], b"v");
    }

    #[tokio::test]
    async fn test_enable_migrates_plaintext() {
        let (store, vault) = open();
        vault.set("k", b"v").await.unwrap();
        vault.enable("password1").await.unwrap();
        assert_eq!(store.get("plain/k").unwrap(), None);
        assert!(store.get("vault/k").unwrap().is_some());
        assert_eq!(&vault.get("k").await.unwrap().unwrap()[..], b"v");
    }

    #[tokio::test]
    async fn test_enable_policy() {
        let (_, vault) = open();
        assert_eq!(vault.enable("short").await.unwrap_err().code(), "VALIDATION_ERROR");
        assert!(!vault.status().encryption_enabled);
        vault.enable("password1").await.unwrap();
        assert_eq!(
            vault.enable("password2").await.unwrap_err().code(),
            "VALIDATION_ERROR"
        );
    }

    #[tokio::test]
    async fn test_locked_operations_fail() {
        let (_, vault) = open();
        vault.enable("password1").await.unwrap();
        vault.lock();
        vault.lock();
        assert!(matches!(vault.get("k").await, Err(CustodyError::VaultLocked)));
        assert!(matches!(vault.set("k", b"v").await, Err(CustodyError::VaultLocked)));
        assert!(matches!(vault.remove("k").await, Err(CustodyError::VaultLocked)));
        assert!(matches!(vault.keys(), Err(CustodyError::VaultLocked)));
    }

    #[tokio::test]
    async fn test_unlock_wrong_password() {
        let (_, vault) = open();
        vault.enable("password1").await.unwrap();
        vault.lock();
        let err = vault.unlock("password2").await.unwrap_err();
        assert!(matches!(err, CustodyError::Decryption));
        assert!(vault.is_locked());
        vault.unlock("password1").await.unwrap();
        assert!(!vault.is_locked());
    }

    #[tokio::test]
    async fn test_reserved_key_rejected_before_io() {
        let (_, vault) = open();
        vault.enable("password1").await.unwrap();
        vault.lock();
        // validation wins over the lock check
        assert_eq!(
            vault.get("meta/canary").await.unwrap_err().code(),
            "VALIDATION_ERROR"
        );
    }

    #[tokio::test]
    async fn test_keys_and_remove() {
        let (_, vault) = open();
        vault.enable("password1").await.unwrap();
        vault.set("b", b"2").await.unwrap();
        vault.set("a", b"1").await.unwrap();
        assert_eq!(vault.keys().unwrap(), vec!["a".to_string(), "b".to_string()]);
        vault.remove("a").await.unwrap();
        assert_eq!(vault.keys().unwrap(), vec!["b".to_string()]);
        assert!(vault.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_deadline() {
        let (_, vault) = open();
        assert_eq!(vault.status().auto_lock_deadline, None);
        vault.enable("password1").await.unwrap();
        let deadline = vault.status().auto_lock_deadline.unwrap();
        assert!(deadline > Instant::now());
        vault.lock();
        assert_eq!(vault.status().auto_lock_deadline, None);
    }

    #[tokio::test]
    async fn test_reopen_starts_locked() {
        let (store, vault) = open();
        vault.enable("password1").await.unwrap();
        vault.set("k", b"v").await.unwrap();
        drop(vault);
        let vault = SecureVault::open(store, config()).unwrap();
        assert!(vault.is_locked());
        vault.unlock("password1").await.unwrap();
        assert_eq!(&vault.get("k").await.unwrap().unwrap()[..], b"v");
    }
}
