//! Record migrations: plaintext to encrypted, and the write-ahead
//! re-encryption used by password changes.
//!
//! Password change protocol:
//! 1. re-encrypt every record (and a new canary) into `staging/`
//! 2. write `meta/commit`
//! 3. copy staged records over the live ones, then drop staging and the marker
//!
//! A crash before step 2 leaves the old password valid; [`recover`] discards
//! the partial staging. A crash after step 2 is rolled forward by [`recover`],
//! which runs on open and again before every unlock and password change.
//!
//! Enabling encryption writes the canary before migrating, so a partial
//! migration is finished by the next unlock with the same password.

use super::record::SecretRecord;
use super::{CANARY_KEY, COMMIT_KEY, PLAIN_NS, STAGING_NS, VAULT_NS};
use crate::core::errors::CustodyError;
use crate::security::secret::SecretVec;
use crate::storage::SecretStore;
use std::sync::Arc;
use tracing::{info, warn};

/// What [`recover`] did on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Clean,
    RolledForward(usize),
    Discarded(usize),
}

/// Finish or undo an interrupted password change.
pub fn recover(store: &dyn SecretStore) -> Result<Recovery, CustodyError> {
    if store.get(COMMIT_KEY)?.is_some() {
        let n = roll_forward(store)?;
        warn!("Completed interrupted password change ({} records)", n);
        return Ok(Recovery::RolledForward(n));
    }
    let n = discard_staging(store)?;
    if n > 0 {
        warn!("Discarded {} staged records from an aborted password change", n);
        return Ok(Recovery::Discarded(n));
    }
    Ok(Recovery::Clean)
}

/// Copy every staged record over its live key, then clear staging and the marker.
pub fn roll_forward(store: &dyn SecretStore) -> Result<usize, CustodyError> {
    let staged = staged_keys(store)?;
    for staged_key in &staged {
        let live_key = &staged_key[STAGING_NS.len()..];
        if let Some(blob) = store.get(staged_key)? {
            store.set(live_key, &blob)?;
        }
    }
    for staged_key in &staged {
        store.remove(staged_key)?;
    }
    store.remove(COMMIT_KEY)?;
    Ok(staged.len())
}

pub fn discard_staging(store: &dyn SecretStore) -> Result<usize, CustodyError> {
    let staged = staged_keys(store)?;
    for key in &staged {
        store.remove(key)?;
    }
    Ok(staged.len())
}

fn staged_keys(store: &dyn SecretStore) -> Result<Vec<String>, CustodyError> {
    Ok(store
        .keys()?
        .into_iter()
        .filter(|k| k.starts_with(STAGING_NS))
        .collect())
}

/// Logical names of the records stored under `namespace`.
pub(crate) fn names_in(store: &dyn SecretStore, namespace: &str) -> Result<Vec<String>, CustodyError> {
    Ok(store
        .keys()?
        .into_iter()
        .filter_map(|k| k.strip_prefix(namespace).map(str::to_string))
        .collect())
}

/// Encrypt every `plain/` record, write it under `vault/`, then delete the original.
pub(crate) async fn migrate_plaintext(
    store: &Arc<dyn SecretStore>,
    password: &SecretVec,
    iterations: u32,
) -> Result<usize, CustodyError> {
    let names = names_in(store.as_ref(), PLAIN_NS)?;
    for name in &names {
        let plain_key = format!("{}{}", PLAIN_NS, name);
        let Some(value) = store.get(&plain_key)? else {
            continue;
        };
        let value = crate::security::secret::vec_to_secret(value);
        let password = password.clone();
        let record_name = name.clone();
        let record = tokio::task::spawn_blocking(move || {
            SecretRecord::seal(&record_name, &value, &password, iterations)
        })
        .await??;
        store.set(&format!("{}{}", VAULT_NS, name), &record.to_blob())?;
        store.remove(&plain_key)?;
    }
    if !names.is_empty() {
        info!("Migrated {} plaintext records into the vault", names.len());
    }
    Ok(names.len())
}

/// Re-encrypt every live record and the canary from `old` to `new` into staging.
pub(crate) async fn stage_reencryption(
    store: &Arc<dyn SecretStore>,
    old: &SecretVec,
    new: &SecretVec,
    iterations: u32,
    canary_plaintext: &'static [u8],
) -> Result<usize, CustodyError> {
    discard_staging(store.as_ref())?;

    let names = names_in(store.as_ref(), VAULT_NS)?;
    for name in &names {
        let live_key = format!("{}{}", VAULT_NS, name);
        let Some(blob) = store.get(&live_key)? else {
            continue;
        };
        let record = SecretRecord::from_blob(name, &blob)?;
        let (old, new) = (old.clone(), new.clone());
        let restaged = tokio::task::spawn_blocking(move || {
            let plaintext = record.open(&old, iterations)?;
            SecretRecord::seal(&record.key, &plaintext, &new, iterations)
        })
        .await??;
        store.set(&format!("{}{}", STAGING_NS, live_key), &restaged.to_blob())?;
    }

    let new = new.clone();
    let canary = tokio::task::spawn_blocking(move || {
        SecretRecord::seal(CANARY_KEY, canary_plaintext, &new, iterations)
    })
    .await??;
    store.set(&format!("{}{}", STAGING_NS, CANARY_KEY), &canary.to_blob())?;
    Ok(names.len())
}
