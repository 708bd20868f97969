//! Hardware wallet integration.
//!
//! Two device families sit behind one [`HardwareDriver`] trait:
//! - `trezor`: vendor bridge daemon reached over HTTP
//! - `ledger`: framed APDU protocol over USB HID
//!
//! The [`manager::HardwareWalletManager`] composes registered drivers and is
//! what the rest of the crate talks to.

pub mod events;
pub mod ledger;
pub mod manager;
pub mod transaction;
pub mod trezor;

use crate::core::bip44::{DerivationPath, COIN_TYPE};
use crate::core::errors::{CustodyError, CustodyResult};
use crate::crypto::Signature;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub use events::HardwareEvent;
pub use ledger::LedgerDriver;
pub use manager::HardwareWalletManager;
pub use trezor::TrezorDriver;

/// Supported device families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Ledger,
    Trezor,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Ledger => write!(f, "ledger"),
            DeviceType::Trezor => write!(f, "trezor"),
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = CustodyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ledger" => Ok(DeviceType::Ledger),
            "trezor" => Ok(DeviceType::Trezor),
            other => Err(CustodyError::Validation(format!("unknown device type: {}", other))),
        }
    }
}

/// A connected device session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceHandle {
    pub device_id: String,
    pub model: String,
    pub firmware_version: String,
    pub device_type: DeviceType,
    pub coin_type: u32,
    pub active_path: DerivationPath,
}

impl DeviceHandle {
    pub fn new(device_type: DeviceType, device_id: String, model: String, firmware_version: String) -> Self {
        Self {
            device_id,
            model,
            firmware_version,
            device_type,
            coin_type: COIN_TYPE,
            active_path: DerivationPath::default(),
        }
    }
}

/// Public key and address at a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DerivedAddress {
    pub path: DerivationPath,
    /// Compressed SEC1 public key
    #[serde(serialize_with = "serialize_hex")]
    pub public_key: Vec<u8>,
    pub address: String,
}

impl DerivedAddress {
    /// Build from any public key encoding; the key is stored compressed.
    pub fn from_public_key(path: DerivationPath, public_key: &[u8]) -> CustodyResult<Self> {
        let compressed = crate::crypto::keys::compress_public_key(public_key)?;
        Ok(Self {
            path,
            address: crate::crypto::derive_address(&compressed)?,
            public_key: compressed.to_vec(),
        })
    }
}

pub(crate) fn serialize_hex<S: serde::Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}

/// Uniform device capability.
#[async_trait]
pub trait HardwareDriver: Send + Sync {
    fn device_type(&self) -> DeviceType;

    /// Whether the host can reach this device family at all.
    async fn is_supported(&self) -> bool;

    async fn connect(&self) -> CustodyResult<DeviceHandle>;

    async fn get_address(&self, path: &DerivationPath, show_on_device: bool) -> CustodyResult<DerivedAddress>;

    /// Sign the canonical payload bytes. The device hashes with SHA-256.
    async fn sign(&self, payload: &[u8], path: &DerivationPath) -> CustodyResult<Signature>;

    async fn verify_address_on_device(&self, path: &DerivationPath) -> CustodyResult<DerivedAddress>;

    async fn disconnect(&self) -> CustodyResult<()>;

    fn is_connected(&self) -> bool;
}

/// Take the one exchange slot of a session, or fail fast.
pub(crate) fn try_exclusive(slot: &Arc<Semaphore>) -> CustodyResult<OwnedSemaphorePermit> {
    slot.clone()
        .try_acquire_owned()
        .map_err(|_| CustodyError::Transport("device busy".to_string()))
}

/// Reject a device that reports a different address than the one derived
/// from the public key it returned.
pub(crate) fn check_reported_address(derived: &DerivedAddress, reported: &str) -> CustodyResult<()> {
    if derived.address != reported {
        tracing::warn!(
            "Device reported address {} but its public key derives {}",
            reported,
            derived.address
        );
        return Err(CustodyError::Transport("device address mismatch".to_string()));
    }
    Ok(())
}

/// Per-path key of the simulated devices: `sha256(seed || serialized path)`.
pub(crate) fn simulated_private_key(seed: &[u8; 32], path: &DerivationPath) -> crate::security::secret::SecretVec {
    use crate::security::secret::vec_to_secret;
    let mut material = vec_to_secret(seed.to_vec());
    material.extend_from_slice(&path.to_bytes());
    vec_to_secret(crate::crypto::sha256(&material).to_vec())
}
