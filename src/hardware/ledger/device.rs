//! Ledger device management
//!
//! Drives the chain app over any [`ApduTransport`].

use super::apdu::{
    ApduClass, ApduCommand, ApduInstruction, MAX_APDU_DATA, P1_CONFIRM, P1_FIRST_CHUNK,
    P1_MORE_CHUNK, P1_SILENT, P2_LAST, P2_MORE,
};
use super::transport::{ApduTransport, LedgerLink};
use crate::core::bip44::DerivationPath;
use crate::core::errors::{CustodyError, CustodyResult};
use crate::crypto::Signature;
use crate::hardware::{
    check_reported_address, try_exclusive, DerivedAddress, DeviceHandle, DeviceType, HardwareDriver,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Ledger application info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerAppInfo {
    pub name: String,
    pub version: String,
    pub flags: u8,
}

impl LedgerAppInfo {
    /// `flags || major || minor || patch || [name_len || name]`
    pub fn parse(data: &[u8]) -> CustodyResult<Self> {
        if data.len() < 4 {
            return Err(CustodyError::Transport("app configuration incomplete".to_string()));
        }
        let version = format!("{}.{}.{}", data[1], data[2], data[3]);
        let name = match data.get(4) {
            Some(&len) if data.len() >= 5 + len as usize => {
                String::from_utf8_lossy(&data[5..5 + len as usize]).to_string()
            }
            _ => "Unknown".to_string(),
        };
        Ok(Self {
            name,
            version,
            flags: data[0],
        })
    }
}

/// Split a GetPublicKey / DisplayAddress reply: `len || pubkey || len || ascii address`.
pub fn parse_public_key_reply(data: &[u8]) -> CustodyResult<(Vec<u8>, String)> {
    let malformed = || CustodyError::Transport("malformed public key reply".to_string());
    let pk_len = *data.first().ok_or_else(malformed)? as usize;
    let pk_end = 1 + pk_len;
    let addr_len = *data.get(pk_end).ok_or_else(malformed)? as usize;
    let addr_end = pk_end + 1 + addr_len;
    if data.len() != addr_end {
        return Err(malformed());
    }
    let address = std::str::from_utf8(&data[pk_end + 1..addr_end])
        .map_err(|_| malformed())?
        .to_string();
    Ok((data[1..pk_end].to_vec(), address))
}

struct LedgerSession {
    transport: Arc<dyn ApduTransport>,
    handle: DeviceHandle,
    slot: Arc<Semaphore>,
}

/// Ledger device
pub struct LedgerDriver {
    link: Arc<dyn LedgerLink>,
    session: Mutex<Option<LedgerSession>>,
}

impl LedgerDriver {
    pub fn new(link: Arc<dyn LedgerLink>) -> Self {
        Self {
            link,
            session: Mutex::new(None),
        }
    }

    fn active(&self) -> CustodyResult<(Arc<dyn ApduTransport>, Arc<Semaphore>)> {
        self.session
            .lock()
            .as_ref()
            .map(|s| (s.transport.clone(), s.slot.clone()))
            .ok_or_else(|| CustodyError::DeviceNotConnected("no Ledger session".to_string()))
    }

    /// Drop the session when the link is gone.
    fn observe<T>(&self, result: CustodyResult<T>) -> CustodyResult<T> {
        if let Err(CustodyError::DeviceNotConnected(detail)) = &result {
            warn!("Ledger link lost: {}", detail);
            self.session.lock().take();
        }
        result
    }

    async fn get_app_configuration(transport: &dyn ApduTransport) -> CustodyResult<LedgerAppInfo> {
        let command = ApduCommand::new(
            ApduClass::Standard,
            ApduInstruction::GetAppConfiguration,
            0x00,
            0x00,
            vec![],
        );
        let data = transport.exchange(&command).await?.into_result(false)?;
        let info = LedgerAppInfo::parse(&data)?;
        info!("Ledger app: {} v{}", info.name, info.version);
        Ok(info)
    }

    async fn request_address(
        &self,
        ins: ApduInstruction,
        p1: u8,
        path: &DerivationPath,
    ) -> CustodyResult<DerivedAddress> {
        let (transport, slot) = self.active()?;
        let _permit = try_exclusive(&slot)?;
        let command = ApduCommand::new(ApduClass::Standard, ins, p1, 0x00, path.to_bytes());
        let data = self.observe(transport.exchange(&command).await)?.into_result(false)?;
        let (public_key, reported) = parse_public_key_reply(&data)?;
        let derived = DerivedAddress::from_public_key(*path, &public_key)?;
        check_reported_address(&derived, &reported)?;
        Ok(derived)
    }

    /// Frames for SignTransaction: the path alone, then the payload in
    /// chunks of at most 255 bytes. The last frame carries `P2_LAST`.
    pub fn sign_frames(payload: &[u8], path: &DerivationPath) -> Vec<ApduCommand> {
        let chunks: Vec<&[u8]> = payload.chunks(MAX_APDU_DATA).collect();
        let mut frames = Vec::with_capacity(1 + chunks.len());
        let first_p2 = if chunks.is_empty() { P2_LAST } else { P2_MORE };
        frames.push(ApduCommand::new(
            ApduClass::Standard,
            ApduInstruction::SignTransaction,
            P1_FIRST_CHUNK,
            first_p2,
            path.to_bytes(),
        ));
        for (i, chunk) in chunks.iter().enumerate() {
            let p2 = if i + 1 == chunks.len() { P2_LAST } else { P2_MORE };
            frames.push(ApduCommand::new(
                ApduClass::Standard,
                ApduInstruction::SignTransaction,
                P1_MORE_CHUNK,
                p2,
                chunk.to_vec(),
            ));
        }
        frames
    }
}

#[async_trait]
impl HardwareDriver for LedgerDriver {
    fn device_type(&self) -> DeviceType {
        DeviceType::Ledger
    }

    async fn is_supported(&self) -> bool {
        self.link.is_available().await
    }

    async fn connect(&self) -> CustodyResult<DeviceHandle> {
        info!("Connecting Ledger hardware wallet...");
        let transport = self.link.open().await?;
        let app = Self::get_app_configuration(transport.as_ref()).await?;

        let handle = DeviceHandle::new(
            DeviceType::Ledger,
            format!("ledger-{}", uuid::Uuid::new_v4()),
            format!("Ledger ({})", app.name),
            app.version,
        );
        *self.session.lock() = Some(LedgerSession {
            transport,
            handle: handle.clone(),
            slot: Arc::new(Semaphore::new(1)),
        });
        Ok(handle)
    }

    async fn get_address(&self, path: &DerivationPath, show_on_device: bool) -> CustodyResult<DerivedAddress> {
        let p1 = if show_on_device { P1_CONFIRM } else { P1_SILENT };
        self.request_address(ApduInstruction::GetPublicKey, p1, path).await
    }

    async fn sign(&self, payload: &[u8], path: &DerivationPath) -> CustodyResult<Signature> {
        let (transport, slot) = self.active()?;
        let _permit = try_exclusive(&slot)?;

        let frames = Self::sign_frames(payload, path);
        let count = frames.len();
        let mut last = Vec::new();
        for (i, frame) in frames.iter().enumerate() {
            debug!("Sending sign frame {}/{}", i + 1, count);
            last = self.observe(transport.exchange(frame).await)?.into_result(true)?;
        }
        Signature::from_der(&last)
            .map_err(|e| CustodyError::SigningFailed(format!("device signature: {}", e.detail().unwrap_or(""))))
    }

    async fn verify_address_on_device(&self, path: &DerivationPath) -> CustodyResult<DerivedAddress> {
        self.request_address(ApduInstruction::DisplayAddress, P1_CONFIRM, path).await
    }

    async fn disconnect(&self) -> CustodyResult<()> {
        if let Some(session) = self.session.lock().take() {
            info!("Ledger {} disconnected", session.handle.device_id);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.lock().is_some()
    }
}
