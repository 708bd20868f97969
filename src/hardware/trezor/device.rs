//! Trezor device management
//!
//! Drives the device through the bridge: Initialize/Features on connect,
//! GetPublicKey for addresses, GetAddress to display, SignMessage over the
//! SHA-256 digest of the payload to sign.

use super::messages::{self, Features, MessageType, TrezorMessage};
use super::transport::BridgeTransport;
use crate::core::bip44::DerivationPath;
use crate::core::errors::{CustodyError, CustodyResult};
use crate::crypto::{sha256, Signature};
use crate::hardware::{
    check_reported_address, try_exclusive, DerivedAddress, DeviceHandle, DeviceType, HardwareDriver,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Upper bound on ButtonRequest round trips within one call.
const MAX_INTERACTIONS: usize = 16;

struct TrezorSession {
    id: String,
    handle: DeviceHandle,
    slot: Arc<Semaphore>,
}

/// Trezor device
pub struct TrezorDriver {
    bridge: Arc<dyn BridgeTransport>,
    session: Mutex<Option<TrezorSession>>,
}

impl TrezorDriver {
    pub fn new(bridge: Arc<dyn BridgeTransport>) -> Self {
        Self {
            bridge,
            session: Mutex::new(None),
        }
    }

    fn active(&self) -> CustodyResult<(String, Arc<Semaphore>)> {
        self.session
            .lock()
            .as_ref()
            .map(|s| (s.id.clone(), s.slot.clone()))
            .ok_or_else(|| CustodyError::DeviceNotConnected("no Trezor session".to_string()))
    }

    fn observe<T>(&self, result: CustodyResult<T>) -> CustodyResult<T> {
        if let Err(CustodyError::DeviceNotConnected(detail)) = &result {
            warn!("Trezor session lost: {}", detail);
            self.session.lock().take();
        }
        result
    }

    /// Send `message` and answer button prompts until a final reply arrives.
    ///
    /// A PIN prompt is cancelled: PIN entry happens on the device, not here.
    async fn call(&self, session: &str, message: TrezorMessage, signing: bool) -> CustodyResult<TrezorMessage> {
        let mut outgoing = message;
        for _ in 0..MAX_INTERACTIONS {
            let reply = self.bridge.call(session, &outgoing).await?;
            match reply.msg_type {
                MessageType::ButtonRequest => {
                    debug!("Waiting for confirmation on the Trezor");
                    outgoing = TrezorMessage::empty(MessageType::ButtonAck);
                }
                MessageType::PinMatrixRequest => {
                    if let Err(e) = self.bridge.call(session, &TrezorMessage::empty(MessageType::Cancel)).await {
                        debug!("Cancel after PIN prompt failed: {}", e.code());
                    }
                    return Err(CustodyError::DeviceLocked("unlock the device with its PIN".to_string()));
                }
                MessageType::Failure => {
                    let (code, text) = messages::parse_failure(&reply.payload);
                    return Err(messages::failure_to_error(code, &text, signing));
                }
                _ => return Ok(reply),
            }
        }
        Err(CustodyError::Transport("too many device interactions".to_string()))
    }

    fn expect(reply: &TrezorMessage, expected: MessageType) -> CustodyResult<()> {
        if reply.msg_type != expected {
            return Err(CustodyError::Transport(format!(
                "expected {:?}, got {:?}",
                expected, reply.msg_type
            )));
        }
        Ok(())
    }

    async fn public_key(&self, session: &str, path: &DerivationPath) -> CustodyResult<Vec<u8>> {
        let reply = self.call(session, TrezorMessage::get_public_key(path), false).await?;
        Self::expect(&reply, MessageType::PublicKey)?;
        messages::parse_public_key(&reply.payload)
    }

    async fn address(&self, path: &DerivationPath, show_on_device: bool) -> CustodyResult<DerivedAddress> {
        let (session, slot) = self.active()?;
        let _permit = try_exclusive(&slot)?;
        let result = async {
            let public_key = self.public_key(&session, path).await?;
            let derived = DerivedAddress::from_public_key(*path, &public_key)?;
            if show_on_device {
                let reply = self
                    .call(&session, TrezorMessage::get_address(path, true), false)
                    .await?;
                Self::expect(&reply, MessageType::Address)?;
                check_reported_address(&derived, &messages::parse_address(&reply.payload)?)?;
            }
            Ok(derived)
        }
        .await;
        self.observe(result)
    }
}

#[async_trait]
impl HardwareDriver for TrezorDriver {
    fn device_type(&self) -> DeviceType {
        DeviceType::Trezor
    }

    async fn is_supported(&self) -> bool {
        match self.bridge.version().await {
            Ok(version) => {
                debug!("Trezor bridge {}", version);
                true
            }
            Err(_) => false,
        }
    }

    async fn connect(&self) -> CustodyResult<DeviceHandle> {
        info!("Connecting Trezor hardware wallet...");
        let device = self
            .bridge
            .enumerate()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CustodyError::DeviceNotConnected("no Trezor device found".to_string()))?;
        let session = self.bridge.acquire(&device.path, device.session.as_deref()).await?;

        let features = match self
            .call(&session, TrezorMessage::empty(MessageType::Initialize), false)
            .await
            .and_then(|reply| {
                Self::expect(&reply, MessageType::Features)?;
                Features::parse(&reply.payload)
            }) {
            Ok(f) if f.initialized => f,
            Ok(_) => {
                let _ = self.bridge.release(&session).await;
                return Err(CustodyError::AppNotOpen("device is not initialized".to_string()));
            }
            Err(e) => {
                let _ = self.bridge.release(&session).await;
                return Err(e);
            }
        };

        info!("Trezor: {} model {} v{}", features.vendor, features.model, features.firmware_version());
        let handle = DeviceHandle::new(
            DeviceType::Trezor,
            features
                .device_id
                .clone()
                .unwrap_or_else(|| format!("trezor-{}", uuid::Uuid::new_v4())),
            format!("Trezor Model {}", features.model),
            features.firmware_version(),
        );
        *self.session.lock() = Some(TrezorSession {
            id: session,
            handle: handle.clone(),
            slot: Arc::new(Semaphore::new(1)),
        });
        Ok(handle)
    }

    async fn get_address(&self, path: &DerivationPath, show_on_device: bool) -> CustodyResult<DerivedAddress> {
        self.address(path, show_on_device).await
    }

    /// Sends the payload's SHA-256 in `SignMessage`; the chain app signs that
    /// digest directly, matching what the manager verifies.
    async fn sign(&self, payload: &[u8], path: &DerivationPath) -> CustodyResult<Signature> {
        let (session, slot) = self.active()?;
        let _permit = try_exclusive(&slot)?;
        let digest = sha256(payload);
        let result = self
            .call(&session, TrezorMessage::sign_message(path, &digest), true)
            .await;
        let reply = self.observe(result)?;
        Self::expect(&reply, MessageType::MessageSignature)
            .and_then(|_| messages::parse_message_signature(&reply.payload))
            .and_then(|raw| Signature::from_recoverable(&raw))
            .map_err(|e| CustodyError::SigningFailed(format!("device signature: {}", e.detail().unwrap_or(""))))
    }

    async fn verify_address_on_device(&self, path: &DerivationPath) -> CustodyResult<DerivedAddress> {
        self.address(path, true).await
    }

    async fn disconnect(&self) -> CustodyResult<()> {
        let session = self.session.lock().take();
        if let Some(session) = session {
            if let Err(e) = self.bridge.release(&session.id).await {
                warn!("Releasing Trezor session failed: {}", e.code());
            }
            info!("Trezor {} disconnected", session.handle.device_id);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.lock().is_some()
    }
}
