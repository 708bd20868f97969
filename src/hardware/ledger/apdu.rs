//! APDU (Application Protocol Data Unit) frames
//!
//! `CLA || INS || P1 || P2 || Lc || data`, answered by `data || SW1 || SW2`.

use crate::core::errors::CustodyError;
use tracing::debug;

/// Largest payload a single short APDU can carry.
pub const MAX_APDU_DATA: usize = 255;

/// P1 for GetPublicKey: show and confirm on the device screen.
pub const P1_CONFIRM: u8 = 0x01;
/// P1 for GetPublicKey: silent.
pub const P1_SILENT: u8 = 0x00;
/// P1 for SignTransaction: first chunk, carries the path.
pub const P1_FIRST_CHUNK: u8 = 0x00;
/// P1 for SignTransaction: continuation chunk.
pub const P1_MORE_CHUNK: u8 = 0x80;
/// P2 for SignTransaction: more chunks follow.
pub const P2_MORE: u8 = 0x00;
/// P2 for SignTransaction: last chunk.
pub const P2_LAST: u8 = 0x80;

/// APDU class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApduClass {
    /// Application class used by the chain app
    Standard = 0xE0,
}

/// APDU instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApduInstruction {
    GetAppConfiguration = 0x06,
    GetPublicKey = 0x40,
    DisplayAddress = 0x42,
    SignTransaction = 0x44,
}

impl ApduInstruction {
    pub fn from_byte(ins: u8) -> Option<Self> {
        match ins {
            0x06 => Some(Self::GetAppConfiguration),
            0x40 => Some(Self::GetPublicKey),
            0x42 => Some(Self::DisplayAddress),
            0x44 => Some(Self::SignTransaction),
            _ => None,
        }
    }
}

/// Status words the chain app returns.
pub mod status {
    pub const OK: u16 = 0x9000;
    pub const USER_REJECTED: u16 = 0x6985;
    pub const SECURITY_STATUS: u16 = 0x6982;
    pub const DEVICE_LOCKED: u16 = 0x5515;
    pub const INS_NOT_SUPPORTED: u16 = 0x6D00;
    pub const CLA_NOT_SUPPORTED: u16 = 0x6E00;
    pub const APP_NOT_OPEN: u16 = 0x6511;
    pub const WRONG_APP: u16 = 0x6E01;
    pub const WRONG_LENGTH: u16 = 0x6700;
    pub const WRONG_DATA: u16 = 0x6A80;
    pub const WRONG_P1P2: u16 = 0x6B00;
}

/// APDU command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduCommand {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
}

impl ApduCommand {
    pub fn new(cla: ApduClass, ins: ApduInstruction, p1: u8, p2: u8, data: Vec<u8>) -> Self {
        Self {
            cla: cla as u8,
            ins: ins as u8,
            p1,
            p2,
            data,
        }
    }

    /// Serialize. Data longer than one `Lc` byte can describe is rejected.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CustodyError> {
        if self.data.len() > MAX_APDU_DATA {
            return Err(CustodyError::Validation(format!(
                "APDU data of {} bytes exceeds {}",
                self.data.len(),
                MAX_APDU_DATA
            )));
        }
        let mut bytes = Vec::with_capacity(5 + self.data.len());
        bytes.push(self.cla);
        bytes.push(self.ins);
        bytes.push(self.p1);
        bytes.push(self.p2);
        bytes.push(self.data.len() as u8);
        bytes.extend_from_slice(&self.data);

        debug!(
            "APDU command: CLA={:02X} INS={:02X} P1={:02X} P2={:02X} Lc={}",
            self.cla,
            self.ins,
            self.p1,
            self.p2,
            self.data.len()
        );
        Ok(bytes)
    }

    /// Parse a frame; the declared `Lc` must match the bytes that follow.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CustodyError> {
        if bytes.len() < 5 {
            return Err(CustodyError::Transport("APDU command too short".to_string()));
        }
        let lc = bytes[4] as usize;
        if lc != bytes.len() - 5 {
            return Err(CustodyError::Transport(format!(
                "APDU Lc {} does not match {} data bytes",
                lc,
                bytes.len() - 5
            )));
        }
        Ok(Self {
            cla: bytes[0],
            ins: bytes[1],
            p1: bytes[2],
            p2: bytes[3],
            data: bytes[5..].to_vec(),
        })
    }
}

/// APDU response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    pub data: Vec<u8>,
    pub sw1: u8,
    pub sw2: u8,
}

impl ApduResponse {
    pub fn new(data: Vec<u8>, status_word: u16) -> Self {
        Self {
            data,
            sw1: (status_word >> 8) as u8,
            sw2: (status_word & 0xFF) as u8,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CustodyError> {
        if bytes.len() < 2 {
            return Err(CustodyError::Transport("APDU response too short".to_string()));
        }

        let len = bytes.len();
        let sw1 = bytes[len - 2];
        let sw2 = bytes[len - 1];
        let data = bytes[..len - 2].to_vec();

        debug!("APDU response: SW1={:02X} SW2={:02X} DataLen={}", sw1, sw2, data.len());

        Ok(Self { data, sw1, sw2 })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.data.clone();
        bytes.push(self.sw1);
        bytes.push(self.sw2);
        bytes
    }

    pub fn is_success(&self) -> bool {
        self.status_code() == status::OK
    }

    pub fn status_code(&self) -> u16 {
        ((self.sw1 as u16) << 8) | (self.sw2 as u16)
    }

    pub fn error_description(&self) -> String {
        match self.status_code() {
            status::OK => "success".to_string(),
            status::USER_REJECTED => "conditions of use not satisfied".to_string(),
            status::SECURITY_STATUS => "security status not satisfied".to_string(),
            status::DEVICE_LOCKED => "device locked".to_string(),
            status::INS_NOT_SUPPORTED => "instruction not supported".to_string(),
            status::CLA_NOT_SUPPORTED => "class not supported".to_string(),
            status::APP_NOT_OPEN => "application not open".to_string(),
            status::WRONG_APP => "wrong application".to_string(),
            status::WRONG_LENGTH => "wrong length".to_string(),
            status::WRONG_DATA => "invalid data".to_string(),
            status::WRONG_P1P2 => "invalid parameters".to_string(),
            other => format!("unknown status: {:04X}", other),
        }
    }

    /// Map the status word into the error taxonomy.
    ///
    /// `signing` selects `SigningFailed` over `Transport` for unknown codes.
    pub fn into_result(self, signing: bool) -> Result<Vec<u8>, CustodyError> {
        let detail = self.error_description();
        match self.status_code() {
            status::OK => Ok(self.data),
            status::USER_REJECTED => Err(CustodyError::UserRejected(detail)),
            status::SECURITY_STATUS | status::DEVICE_LOCKED => Err(CustodyError::DeviceLocked(detail)),
            status::INS_NOT_SUPPORTED
            | status::CLA_NOT_SUPPORTED
            | status::APP_NOT_OPEN
            | status::WRONG_APP => Err(CustodyError::AppNotOpen(detail)),
            _ if signing => Err(CustodyError::SigningFailed(detail)),
            _ => Err(CustodyError::Transport(detail)),
        }
    }
}
