//! Hardware wallet manager
//!
//! Owns the registered drivers and the one active device session, and is the
//! only place that emits [`HardwareEvent`]s.
//!
//! A lost link is reported as `Disconnected` at once. When enabled, a single
//! reconnect runs in the background after `reconnect_delay`; it holds only a
//! `Weak` reference to the session slot and never replaces a device that
//! was connected in the meantime.

use super::events::{ConnectionFailure, EventBus, HardwareEvent};
use super::transaction::{SignatureResult, TransactionFields, UnsignedTransaction};
use super::{DerivedAddress, DeviceHandle, DeviceType, HardwareDriver};
use crate::core::bip44::DerivationPath;
use crate::core::config::HardwareConfig;
use crate::core::errors::{CustodyError, CustodyResult};
use crate::crypto::{self, sha256};
use crate::security::redaction::short_hex;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Shows the exact bytes about to be signed and asks the user to approve.
///
/// Called before any device traffic; returning `false` aborts the signing
/// with `UserRejected`.
#[async_trait]
pub trait PayloadPreview: Send + Sync {
    async fn confirm(&self, payload: &[u8], hash: &[u8; 32]) -> bool;
}

/// Preview hook that approves everything. For tests and headless use.
pub struct AutoApprove;

#[async_trait]
impl PayloadPreview for AutoApprove {
    async fn confirm(&self, _payload: &[u8], _hash: &[u8; 32]) -> bool {
        true
    }
}

/// Reconnection policy
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_delay: Duration::from_millis(1000),
        }
    }
}

impl From<&HardwareConfig> for ManagerConfig {
    fn from(config: &HardwareConfig) -> Self {
        Self {
            auto_reconnect: config.auto_reconnect,
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

struct ActiveDevice {
    driver: Arc<dyn HardwareDriver>,
    handle: DeviceHandle,
}

type ActiveSlot = Mutex<Option<ActiveDevice>>;

/// Hardware wallet manager
pub struct HardwareWalletManager {
    drivers: RwLock<HashMap<DeviceType, Arc<dyn HardwareDriver>>>,
    active: Arc<ActiveSlot>,
    preview: RwLock<Option<Arc<dyn PayloadPreview>>>,
    events: EventBus,
    config: ManagerConfig,
}

impl HardwareWalletManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
            active: Arc::new(Mutex::new(None)),
            preview: RwLock::new(None),
            events: EventBus::default(),
            config,
        }
    }

    /// Register a driver, replacing any previous one of the same type.
    pub fn register(&self, driver: Arc<dyn HardwareDriver>) {
        let device_type = driver.device_type();
        debug!("Registered {} driver", device_type);
        self.drivers.write().insert(device_type, driver);
    }

    pub fn set_preview(&self, preview: Arc<dyn PayloadPreview>) {
        *self.preview.write() = Some(preview);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HardwareEvent> {
        self.events.subscribe()
    }

    pub fn active_device(&self) -> Option<DeviceHandle> {
        self.active.lock().as_ref().map(|a| a.handle.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.active.lock().is_some()
    }

    pub async fn connect(&self, device_type: DeviceType) -> CustodyResult<DeviceHandle> {
        let driver = self
            .drivers
            .read()
            .get(&device_type)
            .cloned()
            .ok_or_else(|| CustodyError::Validation(format!("no driver registered for {}", device_type)))?;
        if !driver.is_supported().await {
            return Err(CustodyError::Validation(format!(
                "{} devices are not supported on this host",
                device_type
            )));
        }

        let previous = self.active.lock().take();
        if let Some(previous) = previous {
            let _ = previous.driver.disconnect().await;
            self.events.publish(HardwareEvent::Disconnected {
                device_type: previous.handle.device_type,
            });
        }

        self.events.publish(HardwareEvent::Connecting { device_type });
        match driver.connect().await {
            Ok(handle) => {
                info!("Connected {} ({})", handle.model, handle.device_id);
                *self.active.lock() = Some(ActiveDevice {
                    driver,
                    handle: handle.clone(),
                });
                self.events.publish(HardwareEvent::Connected { device: handle.clone() });
                Ok(handle)
            }
            Err(e) => {
                warn!("Connecting {} failed: {}", device_type, e.detail().unwrap_or(e.code()));
                self.events.publish(error_event(Some(ConnectionFailure::from_error(&e)), &e));
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self) -> CustodyResult<()> {
        let active = self.active.lock().take();
        if let Some(active) = active {
            active.driver.disconnect().await?;
            self.events.publish(HardwareEvent::Disconnected {
                device_type: active.handle.device_type,
            });
        }
        Ok(())
    }

    /// Path used by signing until changed.
    pub fn set_active_path(&self, path: DerivationPath) -> CustodyResult<()> {
        let mut active = self.active.lock();
        let active = active.as_mut().ok_or_else(not_connected)?;
        active.handle.active_path = path;
        Ok(())
    }

    pub async fn get_address(&self, path: &DerivationPath, show_on_device: bool) -> CustodyResult<DerivedAddress> {
        self.with_device(|driver| async move { driver.get_address(path, show_on_device).await })
            .await
    }

    pub async fn verify_address_on_device(&self, path: &DerivationPath) -> CustodyResult<DerivedAddress> {
        self.with_device(|driver| async move { driver.verify_address_on_device(path).await })
            .await
    }

    pub fn build_unsigned_transaction(&self, fields: &TransactionFields) -> CustodyResult<UnsignedTransaction> {
        UnsignedTransaction::build(fields)
    }

    pub async fn sign_transaction(&self, fields: &TransactionFields) -> CustodyResult<SignatureResult> {
        let unsigned = self.build_unsigned_transaction(fields)?;
        self.sign_unsigned(&unsigned).await
    }

    /// Submittable transaction: the unsigned fields plus `signature` and `publicKey`.
    pub fn combine_signature(
        &self,
        unsigned: &UnsignedTransaction,
        signed: &SignatureResult,
    ) -> CustodyResult<serde_json::Value> {
        super::transaction::combine_signature(unsigned, signed)
    }

    /// Sign an already built payload.
    pub async fn sign_unsigned(&self, unsigned: &UnsignedTransaction) -> CustodyResult<SignatureResult> {
        self.sign_payload(&unsigned.canonical, unsigned.hash).await
    }

    /// Sign arbitrary bytes; the device signs their SHA-256.
    pub async fn sign_message(&self, message: &[u8]) -> CustodyResult<SignatureResult> {
        self.sign_payload(message, sha256(message)).await
    }

    async fn sign_payload(&self, payload: &[u8], hash: [u8; 32]) -> CustodyResult<SignatureResult> {
        let (device_type, path) = {
            let active = self.active.lock();
            let active = active.as_ref().ok_or_else(not_connected)?;
            (active.handle.device_type, active.handle.active_path)
        };

        self.confirm_payload(payload, &hash).await?;

        self.events.publish(HardwareEvent::Signing {
            device_type,
            payload_hash: hash.to_vec(),
        });
        let result = self.sign_on_device(payload, &path).await;
        match result {
            Ok(signed) => {
                self.events.publish(HardwareEvent::Signed {
                    payload_hash: signed.payload_hash.clone(),
                    timestamp: Utc::now(),
                });
                Ok(signed)
            }
            Err(e) => {
                self.events.publish(error_event(None, &e));
                Err(e)
            }
        }
    }

    /// Hand `(payload, hash)` to the preview hook, if one is set.
    ///
    /// Every signing path calls this before touching a key, software or
    /// hardware. A declined preview is `UserRejected` and emits `Error`.
    pub async fn confirm_payload(&self, payload: &[u8], hash: &[u8; 32]) -> CustodyResult<()> {
        let preview = self.preview.read().clone();
        if let Some(preview) = preview {
            if !preview.confirm(payload, hash).await {
                let err = CustodyError::UserRejected("payload declined in preview".to_string());
                self.events.publish(error_event(None, &err));
                return Err(err);
            }
        }
        Ok(())
    }

    async fn sign_on_device(&self, payload: &[u8], path: &DerivationPath) -> CustodyResult<SignatureResult> {
        let derived = self
            .with_device(|driver| async move { driver.get_address(path, false).await })
            .await?;
        let signature = self
            .with_device(|driver| async move { driver.sign(payload, path).await })
            .await?;

        let payload_hash = sha256(payload);
        if !crypto::verify(signature.as_bytes(), &payload_hash, &derived.public_key) {
            warn!("Device signature over {} does not verify", short_hex(&payload_hash));
            return Err(CustodyError::SigningFailed(
                "device signature does not match its public key".to_string(),
            ));
        }
        info!("Signed payload {}", short_hex(&payload_hash));
        Ok(SignatureResult {
            signature,
            public_key: derived.public_key,
            path: *path,
            payload_hash: payload_hash.to_vec(),
        })
    }

    /// Run `op` against the active driver; a lost link triggers recovery.
    async fn with_device<T, F, Fut>(&self, op: F) -> CustodyResult<T>
    where
        F: FnOnce(Arc<dyn HardwareDriver>) -> Fut,
        Fut: Future<Output = CustodyResult<T>>,
    {
        let driver = self
            .active
            .lock()
            .as_ref()
            .map(|a| a.driver.clone())
            .ok_or_else(not_connected)?;
        let result = op(driver.clone()).await;
        if let Err(CustodyError::DeviceNotConnected(_)) = &result {
            self.recover_link(driver);
        }
        result
    }

    /// Drop the session and report it; schedule one reconnect if enabled.
    fn recover_link(&self, driver: Arc<dyn HardwareDriver>) {
        let lost = {
            let mut active = self.active.lock();
            match active.as_ref() {
                Some(current) if Arc::ptr_eq(&current.driver, &driver) => active.take(),
                _ => None,
            }
        };
        let Some(lost) = lost else {
            return;
        };
        let device_type = lost.handle.device_type;
        warn!("{} link lost", device_type);
        self.events.publish(HardwareEvent::Disconnected { device_type });

        if self.config.auto_reconnect {
            tokio::spawn(reconnect_once(
                Arc::downgrade(&self.active),
                self.events.clone(),
                driver,
                lost.handle.active_path,
                self.config.reconnect_delay,
            ));
        }
    }
}

/// The single background reconnect attempt after a lost link.
async fn reconnect_once(
    slot: Weak<ActiveSlot>,
    events: EventBus,
    driver: Arc<dyn HardwareDriver>,
    active_path: DerivationPath,
    delay: Duration,
) {
    tokio::time::sleep(delay).await;
    let Some(active) = slot.upgrade() else {
        return;
    };
    if active.lock().is_some() {
        debug!("Another device is active, reconnect skipped");
        return;
    }
    drop(active);

    let device_type = driver.device_type();
    info!("Reconnecting {}...", device_type);
    match driver.connect().await {
        Ok(mut handle) => {
            handle.active_path = active_path;
            let Some(slot) = slot.upgrade() else {
                return;
            };
            {
                let mut active = slot.lock();
                if active.is_some() {
                    debug!("Another device connected during reconnect, keeping it");
                    return;
                }
                *active = Some(ActiveDevice {
                    driver,
                    handle: handle.clone(),
                });
            }
            info!("Reconnected {} ({})", handle.model, handle.device_id);
            events.publish(HardwareEvent::Connected { device: handle });
        }
        Err(e) => {
            warn!("Reconnect failed: {}", e.code());
            events.publish(error_event(Some(ConnectionFailure::from_error(&e)), &e));
        }
    }
}

fn error_event(kind: Option<ConnectionFailure>, err: &CustodyError) -> HardwareEvent {
    HardwareEvent::Error {
        kind,
        code: err.code().to_string(),
        message: err.to_string(),
    }
}

impl Default for HardwareWalletManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

fn not_connected() -> CustodyError {
    CustodyError::DeviceNotConnected("no active hardware wallet".to_string())
}
