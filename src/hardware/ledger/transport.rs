//! Ledger transport layer
//!
//! APDUs travel over USB HID in 64-byte packets:
//! `channel(2) || tag(1) || sequence(2) || [total length(2) on the first packet] || data`.
//! The framing is pure and lives here; the HID device itself is behind the
//! `ledger` feature.

use super::apdu::{ApduCommand, ApduResponse};
use crate::core::errors::{CustodyError, CustodyResult};
use async_trait::async_trait;
use std::sync::Arc;

/// Ledger USB vendor id
pub const LEDGER_VENDOR_ID: u16 = 0x2C97;
pub const LEDGER_USAGE_PAGE: u16 = 0xFFA0;

/// HID packet size
pub const HID_PACKET_SIZE: usize = 64;

/// APDU channel
const CHANNEL: u16 = 0x0101;

/// HID command tag
const TAG_APDU: u8 = 0x05;

const FIRST_HEADER: usize = 7;
const NEXT_HEADER: usize = 5;
const MAX_PACKETS: u16 = 128;

/// One APDU round trip.
#[async_trait]
pub trait ApduTransport: Send + Sync {
    async fn exchange(&self, command: &ApduCommand) -> CustodyResult<ApduResponse>;
}

/// Opens a transport once the host has authorized the device.
#[async_trait]
pub trait LedgerLink: Send + Sync {
    /// A matching device is visible to the host.
    async fn is_available(&self) -> bool;

    async fn open(&self) -> CustodyResult<Arc<dyn ApduTransport>>;
}

/// Split a serialized APDU into HID packets.
pub fn wrap_apdu(apdu: &[u8]) -> Vec<[u8; HID_PACKET_SIZE]> {
    let mut packets = Vec::new();
    let mut offset = 0;
    let mut sequence = 0u16;

    loop {
        let mut packet = [0u8; HID_PACKET_SIZE];
        packet[0..2].copy_from_slice(&CHANNEL.to_be_bytes());
        packet[2] = TAG_APDU;
        packet[3..5].copy_from_slice(&sequence.to_be_bytes());

        let header = if sequence == 0 {
            packet[5..7].copy_from_slice(&(apdu.len() as u16).to_be_bytes());
            FIRST_HEADER
        } else {
            NEXT_HEADER
        };
        let chunk = (HID_PACKET_SIZE - header).min(apdu.len() - offset);
        packet[header..header + chunk].copy_from_slice(&apdu[offset..offset + chunk]);
        offset += chunk;
        packets.push(packet);
        sequence += 1;

        if offset >= apdu.len() {
            break;
        }
    }
    packets
}

/// Reassembles a response from HID packets.
#[derive(Debug, Default)]
pub struct HidReassembler {
    expected: Option<usize>,
    sequence: u16,
    data: Vec<u8>,
}

impl HidReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one packet. Returns the full response once complete.
    ///
    /// Packets for another channel or tag are ignored; a sequence gap is an error.
    pub fn push(&mut self, packet: &[u8]) -> CustodyResult<Option<Vec<u8>>> {
        if packet.len() < NEXT_HEADER {
            return Err(CustodyError::Transport("HID packet too short".to_string()));
        }
        let channel = u16::from_be_bytes([packet[0], packet[1]]);
        if channel != CHANNEL || packet[2] != TAG_APDU {
            return Ok(None);
        }
        let sequence = u16::from_be_bytes([packet[3], packet[4]]);
        if sequence != self.sequence {
            return Err(CustodyError::Transport(format!(
                "HID sequence mismatch: expected {}, got {}",
                self.sequence, sequence
            )));
        }
        if self.sequence >= MAX_PACKETS {
            return Err(CustodyError::Transport("too many HID packets".to_string()));
        }

        if sequence == 0 {
            if packet.len() < FIRST_HEADER {
                return Err(CustodyError::Transport("HID packet too short".to_string()));
            }
            self.expected = Some(u16::from_be_bytes([packet[5], packet[6]]) as usize);
            self.data.extend_from_slice(&packet[FIRST_HEADER..]);
        } else {
            self.data.extend_from_slice(&packet[NEXT_HEADER..]);
        }
        self.sequence += 1;

        match self.expected {
            Some(len) if self.data.len() >= len => {
                let mut out = std::mem::take(&mut self.data);
                out.truncate(len);
                Ok(Some(out))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(feature = "ledger")]
pub use hid::{HidLink, HidTransport};

#[cfg(feature = "ledger")]
mod hid {
    use super::*;
    use hidapi::{HidApi, HidDevice};
    use parking_lot::Mutex;
    use std::time::Duration;
    use tracing::{debug, info, warn};

    /// Ledger HID transport
    pub struct HidTransport {
        device: Arc<Mutex<HidDevice>>,
        timeout: Duration,
    }

    impl HidTransport {
        /// Open the first Ledger on the bus. Blocking.
        pub fn open(timeout: Duration) -> CustodyResult<Self> {
            info!("Connecting to Ledger device...");

            let api = HidApi::new()
                .map_err(|e| CustodyError::Transport(format!("HID API init failed: {}", e)))?;

            let info = api
                .device_list()
                .find(|d| d.vendor_id() == LEDGER_VENDOR_ID && d.usage_page() == LEDGER_USAGE_PAGE)
                .ok_or_else(|| CustodyError::DeviceNotConnected("no Ledger device found".to_string()))?;

            let device = info
                .open_device(&api)
                .map_err(|e| CustodyError::DeviceNotConnected(format!("open failed: {}", e)))?;

            if let Some(product) = info.product_string() {
                info!("Connected to {}", product);
            }

            Ok(Self {
                device: Arc::new(Mutex::new(device)),
                timeout,
            })
        }

        fn exchange_blocking(device: &HidDevice, apdu: &[u8], timeout: Duration) -> CustodyResult<Vec<u8>> {
            for (i, packet) in wrap_apdu(apdu).iter().enumerate() {
                let mut report = Vec::with_capacity(HID_PACKET_SIZE + 1);
                report.push(0x00); // report id
                report.extend_from_slice(packet);
                debug!("Writing HID packet {}", i);
                device
                    .write(&report)
                    .map_err(|e| CustodyError::DeviceNotConnected(format!("HID write failed: {}", e)))?;
            }

            let mut reassembler = HidReassembler::new();
            loop {
                let mut packet = [0u8; HID_PACKET_SIZE];
                let read = device
                    .read_timeout(&mut packet, timeout.as_millis().min(i32::MAX as u128) as i32)
                    .map_err(|e| CustodyError::DeviceNotConnected(format!("HID read failed: {}", e)))?;
                if read == 0 {
                    return Err(CustodyError::Transport("HID read timed out".to_string()));
                }
                if let Some(response) = reassembler.push(&packet[..read])? {
                    return Ok(response);
                }
            }
        }
    }

    #[async_trait]
    impl ApduTransport for HidTransport {
        async fn exchange(&self, command: &ApduCommand) -> CustodyResult<ApduResponse> {
            let apdu = command.to_bytes()?;
            let device = self.device.clone();
            let timeout = self.timeout;
            let raw = tokio::task::spawn_blocking(move || {
                let device = device.lock();
                Self::exchange_blocking(&device, &apdu, timeout)
            })
            .await??;
            let response = ApduResponse::from_bytes(&raw)?;
            if !response.is_success() {
                warn!(
                    "APDU failed: {:04X} - {}",
                    response.status_code(),
                    response.error_description()
                );
            }
            Ok(response)
        }
    }

    /// Opens [`HidTransport`]s.
    pub struct HidLink {
        timeout: Duration,
    }

    impl HidLink {
        pub fn new(timeout: Duration) -> Self {
            Self { timeout }
        }
    }

    #[async_trait]
    impl LedgerLink for HidLink {
        async fn is_available(&self) -> bool {
            tokio::task::spawn_blocking(|| {
                HidApi::new()
                    .map(|api| {
                        api.device_list().any(|d| {
                            d.vendor_id() == LEDGER_VENDOR_ID && d.usage_page() == LEDGER_USAGE_PAGE
                        })
                    })
                    .unwrap_or(false)
            })
            .await
            .unwrap_or(false)
        }

        async fn open(&self) -> CustodyResult<Arc<dyn ApduTransport>> {
            let timeout = self.timeout;
            let transport = tokio::task::spawn_blocking(move || HidTransport::open(timeout)).await??;
            Ok(Arc::new(transport))
        }
    }
}
