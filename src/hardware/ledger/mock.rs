//! In-process Ledger chain app.
//!
//! Speaks the same APDU frames as the device, holds one secp256k1 key per
//! path (derived from a seed) and can be scripted to reject, lock, stall or
//! misbehave. Used by the integration tests and the CLI `--simulate` mode.

use super::apdu::{status, ApduCommand, ApduInstruction, ApduResponse, P1_FIRST_CHUNK, P2_LAST};
use super::transport::{ApduTransport, LedgerLink};
use crate::core::bip44::DerivationPath;
use crate::core::errors::{CustodyError, CustodyResult};
use crate::crypto::keys::{derive_address, derive_public_key, sha256};
use crate::crypto::signature_utils::negate_s;
use crate::hardware::simulated_private_key;
use crate::security::secret::SecretVec;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const SIMULATED_APP_NAME: &str = "Axiom";

struct PendingSign {
    path: DerivationPath,
    payload: Vec<u8>,
}

struct SimState {
    seed: [u8; 32],
    delay: Mutex<Duration>,
    scripted: Mutex<VecDeque<u16>>,
    present: AtomicBool,
    app_open: AtomicBool,
    locked: AtomicBool,
    high_s: AtomicBool,
    misreport_address: AtomicBool,
    pending: Mutex<Option<PendingSign>>,
    frames: Mutex<Vec<Vec<u8>>>,
    exchanges: AtomicUsize,
}

/// Simulated Ledger device running the chain app.
#[derive(Clone)]
pub struct SimulatedLedger {
    state: Arc<SimState>,
}

impl SimulatedLedger {
    pub fn new(seed: [u8; 32]) -> Self {
        Self {
            state: Arc::new(SimState {
                seed,
                delay: Mutex::new(Duration::ZERO),
                scripted: Mutex::new(VecDeque::new()),
                present: AtomicBool::new(true),
                app_open: AtomicBool::new(true),
                locked: AtomicBool::new(false),
                high_s: AtomicBool::new(false),
                misreport_address: AtomicBool::new(false),
                pending: Mutex::new(None),
                frames: Mutex::new(Vec::new()),
                exchanges: AtomicUsize::new(0),
            }),
        }
    }

    /// Wait this long inside every exchange, like a user reading the screen.
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock() = delay;
    }

    /// Answer the next exchange with `status_word` instead of processing it.
    pub fn script_status(&self, status_word: u16) {
        self.state.scripted.lock().push_back(status_word);
    }

    /// The next exchange is declined on the device.
    pub fn reject_next(&self) {
        self.script_status(status::USER_REJECTED);
    }

    pub fn set_present(&self, present: bool) {
        self.state.present.store(present, Ordering::SeqCst);
    }

    pub fn set_app_open(&self, open: bool) {
        self.state.app_open.store(open, Ordering::SeqCst);
    }

    pub fn set_locked(&self, locked: bool) {
        self.state.locked.store(locked, Ordering::SeqCst);
    }

    /// Return signatures in their high-S form.
    pub fn set_high_s(&self, high_s: bool) {
        self.state.high_s.store(high_s, Ordering::SeqCst);
    }

    /// Report an address that does not belong to the returned public key.
    pub fn set_misreport_address(&self, on: bool) {
        self.state.misreport_address.store(on, Ordering::SeqCst);
    }

    /// Raw command frames received so far.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.state.frames.lock().clone()
    }

    pub fn exchange_count(&self) -> usize {
        self.state.exchanges.load(Ordering::SeqCst)
    }

    fn private_key(&self, path: &DerivationPath) -> SecretVec {
        simulated_private_key(&self.state.seed, path)
    }

    pub fn public_key(&self, path: &DerivationPath) -> CustodyResult<Vec<u8>> {
        derive_public_key(&self.private_key(path), true)
    }

    pub fn address(&self, path: &DerivationPath) -> CustodyResult<String> {
        derive_address(&self.public_key(path)?)
    }

    /// Handle one raw command frame and return the raw response.
    pub fn process(&self, frame: &[u8]) -> Vec<u8> {
        self.state.frames.lock().push(frame.to_vec());
        self.respond(frame).to_bytes()
    }

    fn respond(&self, frame: &[u8]) -> ApduResponse {
        let command = match ApduCommand::from_bytes(frame) {
            Ok(c) => c,
            Err(_) => return ApduResponse::new(vec![], status::WRONG_LENGTH),
        };
        if let Some(sw) = self.state.scripted.lock().pop_front() {
            debug!("Simulated Ledger answering with scripted {:04X}", sw);
            self.state.pending.lock().take();
            return ApduResponse::new(vec![], sw);
        }
        if command.cla != 0xE0 {
            return ApduResponse::new(vec![], status::CLA_NOT_SUPPORTED);
        }
        if !self.state.app_open.load(Ordering::SeqCst) {
            return ApduResponse::new(vec![], status::APP_NOT_OPEN);
        }
        if self.state.locked.load(Ordering::SeqCst) {
            return ApduResponse::new(vec![], status::DEVICE_LOCKED);
        }

        let result = match ApduInstruction::from_byte(command.ins) {
            Some(ApduInstruction::GetAppConfiguration) => Ok(self.app_configuration()),
            Some(ApduInstruction::GetPublicKey) | Some(ApduInstruction::DisplayAddress) => {
                self.public_key_reply(&command.data)
            }
            Some(ApduInstruction::SignTransaction) => self.sign_step(&command),
            None => Err(status::INS_NOT_SUPPORTED),
        };
        match result {
            Ok(data) => ApduResponse::new(data, status::OK),
            Err(sw) => ApduResponse::new(vec![], sw),
        }
    }

    fn app_configuration(&self) -> Vec<u8> {
        let mut data = vec![0x00, 1, 2, 0, SIMULATED_APP_NAME.len() as u8];
        data.extend_from_slice(SIMULATED_APP_NAME.as_bytes());
        data
    }

    fn public_key_reply(&self, data: &[u8]) -> Result<Vec<u8>, u16> {
        let path = DerivationPath::from_bytes(data).map_err(|_| status::WRONG_DATA)?;
        let public_key = self.public_key(&path).map_err(|_| status::WRONG_DATA)?;
        let mut address = derive_address(&public_key).map_err(|_| status::WRONG_DATA)?;
        if self.state.misreport_address.load(Ordering::SeqCst) {
            address.replace_range(2..4, if &address[2..4] == "00" { "11" } else { "00" });
        }
        let mut reply = vec![public_key.len() as u8];
        reply.extend_from_slice(&public_key);
        reply.push(address.len() as u8);
        reply.extend_from_slice(address.as_bytes());
        Ok(reply)
    }

    fn sign_step(&self, command: &ApduCommand) -> Result<Vec<u8>, u16> {
        let mut pending = self.state.pending.lock();
        if command.p1 == P1_FIRST_CHUNK {
            let path = DerivationPath::from_bytes(&command.data).map_err(|_| status::WRONG_DATA)?;
            *pending = Some(PendingSign {
                path,
                payload: Vec::new(),
            });
        } else {
            pending
                .as_mut()
                .ok_or(status::WRONG_DATA)?
                .payload
                .extend_from_slice(&command.data);
        }
        if command.p2 != P2_LAST {
            return Ok(vec![]);
        }

        let job = pending.take().ok_or(status::WRONG_DATA)?;
        let hash = sha256(&job.payload);
        let sig = crate::crypto::sign_hash(&hash, &self.private_key(&job.path))
            .map_err(|_| status::WRONG_DATA)?;
        let compact = if self.state.high_s.load(Ordering::SeqCst) {
            negate_s(sig.as_bytes())
        } else {
            sig.to_bytes()
        };
        let der = secp256k1::ecdsa::Signature::from_compact(&compact)
            .map_err(|_| status::WRONG_DATA)?
            .serialize_der()
            .to_vec();
        Ok(der)
    }
}

#[async_trait]
impl ApduTransport for SimulatedLedger {
    async fn exchange(&self, command: &ApduCommand) -> CustodyResult<ApduResponse> {
        if !self.state.present.load(Ordering::SeqCst) {
            return Err(CustodyError::DeviceNotConnected("simulated device unplugged".to_string()));
        }
        self.state.exchanges.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let frame = command.to_bytes()?;
        ApduResponse::from_bytes(&self.process(&frame))
    }
}

#[async_trait]
impl LedgerLink for SimulatedLedger {
    async fn is_available(&self) -> bool {
        self.state.present.load(Ordering::SeqCst)
    }

    async fn open(&self) -> CustodyResult<Arc<dyn ApduTransport>> {
        if !self.state.present.load(Ordering::SeqCst) {
            return Err(CustodyError::DeviceNotConnected("no Ledger device found".to_string()));
        }
        Ok(Arc::new(self.clone()))
    }
}
