//! In-process stand-in for the Trezor bridge and the device behind it.

use super::messages::{self, failure, Features, MessageType, TrezorMessage};
use super::transport::{BridgeDevice, BridgeTransport};
use crate::core::bip44::DerivationPath;
use crate::core::errors::{CustodyError, CustodyResult};
use crate::crypto::keys::{derive_address, derive_public_key, sign_hash_recoverable};
use crate::crypto::signature_utils::negate_s;
use crate::hardware::simulated_private_key;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Bridge path of the single simulated device.
pub const SIMULATED_DEVICE_PATH: &str = "sim-1";

struct BridgeState {
    running: bool,
    present: bool,
    initialized: bool,
    pin_locked: bool,
    reject_next: bool,
    high_s: bool,
    misreport_address: bool,
    delay: Duration,
    next_session: u64,
    session: Option<String>,
    pending: Option<TrezorMessage>,
    calls: Vec<MessageType>,
}

/// Simulated trezord with one device attached.
///
/// Display and signing requests go through a ButtonRequest/ButtonAck round
/// trip like on the device.
#[derive(Clone)]
pub struct SimulatedBridge {
    seed: [u8; 32],
    state: Arc<Mutex<BridgeState>>,
}

impl SimulatedBridge {
    pub fn new(seed: [u8; 32]) -> Self {
        Self {
            seed,
            state: Arc::new(Mutex::new(BridgeState {
                running: true,
                present: true,
                initialized: true,
                pin_locked: false,
                reject_next: false,
                high_s: false,
                misreport_address: false,
                delay: Duration::ZERO,
                next_session: 1,
                session: None,
                pending: None,
                calls: Vec::new(),
            })),
        }
    }

    /// Stop answering, as if the daemon was not running.
    pub fn set_running(&self, running: bool) {
        self.state.lock().running = running;
    }

    /// Unplug or replug the device. Unplugging ends the current session.
    pub fn set_present(&self, present: bool) {
        let mut state = self.state.lock();
        state.present = present;
        if !present {
            state.session = None;
            state.pending = None;
        }
    }

    pub fn set_initialized(&self, initialized: bool) {
        self.state.lock().initialized = initialized;
    }

    pub fn set_pin_locked(&self, locked: bool) {
        self.state.lock().pin_locked = locked;
    }

    /// The next button confirmation is declined.
    pub fn reject_next(&self) {
        self.state.lock().reject_next = true;
    }

    pub fn set_high_s(&self, high_s: bool) {
        self.state.lock().high_s = high_s;
    }

    pub fn set_misreport_address(&self, on: bool) {
        self.state.lock().misreport_address = on;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }

    /// Message types received through `/call`, in order.
    pub fn calls(&self) -> Vec<MessageType> {
        self.state.lock().calls.clone()
    }

    pub fn active_session(&self) -> Option<String> {
        self.state.lock().session.clone()
    }

    pub fn public_key(&self, path: &DerivationPath) -> CustodyResult<Vec<u8>> {
        derive_public_key(&simulated_private_key(&self.seed, path), true)
    }

    pub fn address(&self, path: &DerivationPath) -> CustodyResult<String> {
        derive_address(&self.public_key(path)?)
    }

    fn reachable(state: &BridgeState) -> CustodyResult<()> {
        if !state.running {
            return Err(CustodyError::DeviceNotConnected("bridge unreachable".to_string()));
        }
        Ok(())
    }

    /// Queue `reply` behind a button confirmation.
    fn confirm(state: &mut BridgeState, reply: TrezorMessage) -> TrezorMessage {
        state.pending = Some(if std::mem::take(&mut state.reject_next) {
            TrezorMessage::failure(failure::ACTION_CANCELLED, "Action cancelled by user")
        } else {
            reply
        });
        TrezorMessage::new(MessageType::ButtonRequest, messages::encode_uint_field(1, 8))
    }

    fn handle(&self, state: &mut BridgeState, message: &TrezorMessage) -> CustodyResult<TrezorMessage> {
        let protected = matches!(
            message.msg_type,
            MessageType::GetPublicKey | MessageType::GetAddress | MessageType::SignMessage
        );
        if protected && state.pin_locked {
            return Ok(TrezorMessage::new(MessageType::PinMatrixRequest, messages::encode_uint_field(1, 1)));
        }

        let reply = match message.msg_type {
            MessageType::Initialize => {
                state.pending = None;
                let features = Features {
                    vendor: "trezor.io".to_string(),
                    version: (2, 6, 0),
                    device_id: Some("SIMULATED0001".to_string()),
                    label: Some("Simulated".to_string()),
                    initialized: state.initialized,
                    model: "T".to_string(),
                };
                TrezorMessage::new(MessageType::Features, features.encode())
            }
            MessageType::ButtonAck => state.pending.take().unwrap_or_else(|| {
                TrezorMessage::failure(failure::UNEXPECTED_MESSAGE, "Unexpected message")
            }),
            MessageType::Cancel => {
                state.pending = None;
                TrezorMessage::failure(failure::ACTION_CANCELLED, "Cancelled")
            }
            MessageType::GetPublicKey => {
                let path = messages::decode_address_n(&message.payload)?;
                TrezorMessage::new(MessageType::PublicKey, messages::encode_public_key(&self.public_key(&path)?))
            }
            MessageType::GetAddress => {
                let path = messages::decode_address_n(&message.payload)?;
                let mut address = self.address(&path)?;
                if state.misreport_address {
                    address.replace_range(2..4, if &address[2..4] == "00" { "11" } else { "00" });
                }
                let reply = TrezorMessage::new(
                    MessageType::Address,
                    messages::encode_bytes_field(1, address.as_bytes()),
                );
                if messages::find_varint(&message.payload, 3)?.unwrap_or(0) != 0 {
                    Self::confirm(state, reply)
                } else {
                    reply
                }
            }
            MessageType::SignMessage => {
                let path = messages::decode_address_n(&message.payload)?;
                let digest = messages::find_bytes(&message.payload, 2)?.unwrap_or_default();
                if digest.len() != 32 {
                    TrezorMessage::failure(failure::DATA_ERROR, "Expected a 32-byte digest")
                } else {
                    let mut signature = sign_hash_recoverable(digest, &simulated_private_key(&self.seed, &path))?;
                    if state.high_s {
                        let mut compact = [0u8; 64];
                        compact.copy_from_slice(&signature[1..]);
                        signature[1..].copy_from_slice(&negate_s(&compact));
                    }
                    let mut payload = messages::encode_bytes_field(1, self.address(&path)?.as_bytes());
                    payload.extend(messages::encode_bytes_field(2, &signature));
                    Self::confirm(state, TrezorMessage::new(MessageType::MessageSignature, payload))
                }
            }
            _ => TrezorMessage::failure(failure::UNEXPECTED_MESSAGE, "Unexpected message"),
        };
        Ok(reply)
    }
}

#[async_trait]
impl BridgeTransport for SimulatedBridge {
    async fn version(&self) -> CustodyResult<String> {
        Self::reachable(&self.state.lock())?;
        Ok("2.0.33-sim".to_string())
    }

    async fn enumerate(&self) -> CustodyResult<Vec<BridgeDevice>> {
        let state = self.state.lock();
        Self::reachable(&state)?;
        if !state.present {
            return Ok(Vec::new());
        }
        Ok(vec![BridgeDevice {
            path: SIMULATED_DEVICE_PATH.to_string(),
            session: state.session.clone(),
            vendor: 0x1209,
            product: 0x53C1,
        }])
    }

    async fn acquire(&self, path: &str, previous: Option<&str>) -> CustodyResult<String> {
        let mut state = self.state.lock();
        Self::reachable(&state)?;
        if !state.present || path != SIMULATED_DEVICE_PATH {
            return Err(CustodyError::DeviceNotConnected("device not found".to_string()));
        }
        if state.session.as_deref() != previous {
            return Err(CustodyError::DeviceNotConnected("wrong previous session".to_string()));
        }
        let session = state.next_session.to_string();
        state.next_session += 1;
        state.session = Some(session.clone());
        Ok(session)
    }

    async fn call(&self, session: &str, message: &TrezorMessage) -> CustodyResult<TrezorMessage> {
        let delay = self.state.lock().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        Self::reachable(&state)?;
        if state.session.as_deref() != Some(session) {
            return Err(CustodyError::DeviceNotConnected("session not found".to_string()));
        }
        state.calls.push(message.msg_type);
        debug!("Simulated bridge handling {:?}", message.msg_type);
        // The device answers malformed requests with a Failure rather than
        // dropping the session.
        match self.handle(&mut state, message) {
            Ok(reply) => Ok(reply),
            Err(_) => Ok(TrezorMessage::failure(failure::DATA_ERROR, "Invalid request")),
        }
    }

    async fn release(&self, session: &str) -> CustodyResult<()> {
        let mut state = self.state.lock();
        Self::reachable(&state)?;
        if state.session.as_deref() != Some(session) {
            return Err(CustodyError::DeviceNotConnected("session not found".to_string()));
        }
        state.session = None;
        state.pending = None;
        Ok(())
    }
}
