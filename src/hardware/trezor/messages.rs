//! Trezor wire messages
//!
//! `type:u16be || length:u32be || protobuf payload`. Only the handful of
//! messages the driver needs are encoded, by hand, with the helpers below.

use crate::core::bip44::DerivationPath;
use crate::core::errors::{CustodyError, CustodyResult};

/// Message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    Initialize = 0,
    Success = 2,
    Failure = 3,
    GetPublicKey = 11,
    PublicKey = 12,
    Features = 17,
    PinMatrixRequest = 18,
    Cancel = 20,
    ButtonRequest = 26,
    ButtonAck = 27,
    GetAddress = 29,
    Address = 30,
    SignMessage = 38,
    MessageSignature = 40,
}

impl MessageType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Initialize),
            2 => Some(Self::Success),
            3 => Some(Self::Failure),
            11 => Some(Self::GetPublicKey),
            12 => Some(Self::PublicKey),
            17 => Some(Self::Features),
            18 => Some(Self::PinMatrixRequest),
            20 => Some(Self::Cancel),
            26 => Some(Self::ButtonRequest),
            27 => Some(Self::ButtonAck),
            29 => Some(Self::GetAddress),
            30 => Some(Self::Address),
            38 => Some(Self::SignMessage),
            40 => Some(Self::MessageSignature),
            _ => None,
        }
    }
}

/// `Failure.code` values reported by the firmware.
pub mod failure {
    pub const UNEXPECTED_MESSAGE: u64 = 1;
    pub const DATA_ERROR: u64 = 3;
    pub const ACTION_CANCELLED: u64 = 4;
    pub const PIN_EXPECTED: u64 = 5;
    pub const PIN_CANCELLED: u64 = 6;
    pub const PIN_INVALID: u64 = 7;
    pub const PROCESS_ERROR: u64 = 9;
    pub const NOT_INITIALIZED: u64 = 11;
    pub const PIN_MISMATCH: u64 = 12;
    pub const INVALID_SESSION: u64 = 14;
    pub const FIRMWARE_ERROR: u64 = 99;
}

/// Trezor message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrezorMessage {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl TrezorMessage {
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    pub fn empty(msg_type: MessageType) -> Self {
        Self::new(msg_type, Vec::new())
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(6 + self.payload.len());
        buf.extend_from_slice(&(self.msg_type as u16).to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// The declared length must match the payload exactly.
    pub fn deserialize(data: &[u8]) -> CustodyResult<Self> {
        if data.len() < 6 {
            return Err(CustodyError::Transport("bridge message too short".to_string()));
        }
        let raw_type = u16::from_be_bytes([data[0], data[1]]);
        let msg_type = MessageType::from_u16(raw_type)
            .ok_or_else(|| CustodyError::Transport(format!("unknown message type: {}", raw_type)))?;
        let len = u32::from_be_bytes([data[2], data[3], data[4], data[5]]) as usize;
        if data.len() != 6 + len {
            return Err(CustodyError::Transport("bridge message length mismatch".to_string()));
        }
        Ok(Self {
            msg_type,
            payload: data[6..].to_vec(),
        })
    }

    pub fn get_public_key(path: &DerivationPath) -> Self {
        Self::new(MessageType::GetPublicKey, encode_address_n(path))
    }

    pub fn get_address(path: &DerivationPath, show_display: bool) -> Self {
        let mut payload = encode_address_n(path);
        payload.extend(encode_bool_field(3, show_display));
        Self::new(MessageType::GetAddress, payload)
    }

    /// `SignMessage` as the chain's firmware app implements it: the device
    /// signs `message` as a 32-byte digest, with no message prefix and no
    /// second hash. Stock coin apps prefix and re-hash, so their signatures
    /// would not verify against the payload hash.
    pub fn sign_message(path: &DerivationPath, message: &[u8]) -> Self {
        let mut payload = encode_address_n(path);
        payload.extend(encode_bytes_field(2, message));
        Self::new(MessageType::SignMessage, payload)
    }

    pub fn failure(code: u64, message: &str) -> Self {
        let mut payload = encode_uint_field(1, code);
        payload.extend(encode_bytes_field(2, message.as_bytes()));
        Self::new(MessageType::Failure, payload)
    }
}

/// Repeated `address_n` (field 1) for a path.
pub fn encode_address_n(path: &DerivationPath) -> Vec<u8> {
    let mut buf = Vec::new();
    for index in path.to_indices() {
        buf.extend(encode_uint_field(1, index as u64));
    }
    buf
}

/// Read `address_n` back into a path.
pub fn decode_address_n(payload: &[u8]) -> CustodyResult<DerivationPath> {
    let mut indices = Vec::with_capacity(5);
    for field in ProtoReader::new(payload) {
        if let (1, FieldValue::Varint(v)) = field? {
            indices.push(u32::try_from(v).map_err(|_| bad_field("address_n"))?);
        }
    }
    let mut bytes = vec![indices.len() as u8];
    for index in indices {
        bytes.extend_from_slice(&index.to_be_bytes());
    }
    DerivationPath::from_bytes(&bytes)
}

pub fn encode_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

pub fn decode_varint(data: &[u8]) -> CustodyResult<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
        shift += 7;
        if shift >= 64 {
            return Err(CustodyError::Transport("varint overflow".to_string()));
        }
    }
    Err(CustodyError::Transport("truncated varint".to_string()))
}

pub fn encode_uint_field(field_num: u32, value: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_varint(&mut buf, (field_num << 3) as u64);
    encode_varint(&mut buf, value);
    buf
}

pub fn encode_bool_field(field_num: u32, value: bool) -> Vec<u8> {
    encode_uint_field(field_num, value as u64)
}

pub fn encode_bytes_field(field_num: u32, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_varint(&mut buf, ((field_num << 3) | 2) as u64);
    encode_varint(&mut buf, value.len() as u64);
    buf.extend_from_slice(value);
    buf
}

/// One decoded protobuf field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
}

/// Iterates `(field number, value)` pairs. Fixed-width wire types are
/// skipped; none of the messages used here carry them.
pub struct ProtoReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ProtoReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_varint(&mut self) -> CustodyResult<u64> {
        let (value, used) = decode_varint(&self.data[self.pos..])?;
        self.pos += used;
        Ok(value)
    }

    fn take(&mut self, len: usize) -> CustodyResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| CustodyError::Transport("truncated protobuf field".to_string()))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn next_field(&mut self) -> CustodyResult<Option<(u32, FieldValue<'a>)>> {
        loop {
            if self.pos >= self.data.len() {
                return Ok(None);
            }
            let key = self.read_varint()?;
            let field = (key >> 3) as u32;
            match key & 0x07 {
                0 => return Ok(Some((field, FieldValue::Varint(self.read_varint()?)))),
                2 => {
                    let len = self.read_varint()? as usize;
                    return Ok(Some((field, FieldValue::Bytes(self.take(len)?))));
                }
                1 => {
                    self.take(8)?;
                }
                5 => {
                    self.take(4)?;
                }
                other => {
                    return Err(CustodyError::Transport(format!("unsupported wire type {}", other)));
                }
            }
        }
    }
}

impl<'a> Iterator for ProtoReader<'a> {
    type Item = CustodyResult<(u32, FieldValue<'a>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_field() {
            Ok(Some(field)) => Some(Ok(field)),
            Ok(None) => None,
            Err(e) => {
                self.pos = self.data.len();
                Some(Err(e))
            }
        }
    }
}

fn bad_field(name: &str) -> CustodyError {
    CustodyError::Transport(format!("malformed {} field", name))
}

/// First varint with this field number.
pub fn find_varint(payload: &[u8], field_num: u32) -> CustodyResult<Option<u64>> {
    for field in ProtoReader::new(payload) {
        if let (n, FieldValue::Varint(v)) = field? {
            if n == field_num {
                return Ok(Some(v));
            }
        }
    }
    Ok(None)
}

/// First length-delimited field with this number.
pub fn find_bytes(payload: &[u8], field_num: u32) -> CustodyResult<Option<&[u8]>> {
    for field in ProtoReader::new(payload) {
        if let (n, FieldValue::Bytes(b)) = field? {
            if n == field_num {
                return Ok(Some(b));
            }
        }
    }
    Ok(None)
}

fn find_string(payload: &[u8], field_num: u32) -> CustodyResult<Option<String>> {
    Ok(find_bytes(payload, field_num)?.map(|b| String::from_utf8_lossy(b).to_string()))
}

/// Subset of `Features`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Features {
    pub vendor: String,
    pub version: (u32, u32, u32),
    pub device_id: Option<String>,
    pub label: Option<String>,
    pub initialized: bool,
    pub model: String,
}

impl Features {
    pub fn parse(payload: &[u8]) -> CustodyResult<Self> {
        let version_part = |n| -> CustodyResult<u32> { Ok(find_varint(payload, n)?.unwrap_or(0) as u32) };
        Ok(Self {
            vendor: find_string(payload, 1)?.unwrap_or_else(|| "trezor.io".to_string()),
            version: (version_part(2)?, version_part(3)?, version_part(4)?),
            device_id: find_string(payload, 6)?,
            label: find_string(payload, 10)?,
            initialized: find_varint(payload, 12)?.unwrap_or(1) != 0,
            model: find_string(payload, 21)?.unwrap_or_else(|| "1".to_string()),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = encode_bytes_field(1, self.vendor.as_bytes());
        buf.extend(encode_uint_field(2, self.version.0 as u64));
        buf.extend(encode_uint_field(3, self.version.1 as u64));
        buf.extend(encode_uint_field(4, self.version.2 as u64));
        if let Some(id) = &self.device_id {
            buf.extend(encode_bytes_field(6, id.as_bytes()));
        }
        if let Some(label) = &self.label {
            buf.extend(encode_bytes_field(10, label.as_bytes()));
        }
        buf.extend(encode_bool_field(12, self.initialized));
        buf.extend(encode_bytes_field(21, self.model.as_bytes()));
        buf
    }

    pub fn firmware_version(&self) -> String {
        format!("{}.{}.{}", self.version.0, self.version.1, self.version.2)
    }
}

/// `PublicKey.node.public_key`
pub fn parse_public_key(payload: &[u8]) -> CustodyResult<Vec<u8>> {
    let node = find_bytes(payload, 1)?.ok_or_else(|| bad_field("node"))?;
    Ok(find_bytes(node, 6)?.ok_or_else(|| bad_field("public_key"))?.to_vec())
}

pub fn encode_public_key(public_key: &[u8]) -> Vec<u8> {
    let mut node = encode_uint_field(1, 5);
    node.extend(encode_bytes_field(6, public_key));
    encode_bytes_field(1, &node)
}

/// `Address.address`
pub fn parse_address(payload: &[u8]) -> CustodyResult<String> {
    find_string(payload, 1)?.ok_or_else(|| bad_field("address"))
}

/// `MessageSignature.signature`
pub fn parse_message_signature(payload: &[u8]) -> CustodyResult<Vec<u8>> {
    Ok(find_bytes(payload, 2)?.ok_or_else(|| bad_field("signature"))?.to_vec())
}

/// `Failure.code` and `Failure.message`
pub fn parse_failure(payload: &[u8]) -> (u64, String) {
    let code = find_varint(payload, 1).ok().flatten().unwrap_or(0);
    let message = find_string(payload, 2).ok().flatten().unwrap_or_default();
    (code, message)
}

/// Map a firmware `Failure` into the error taxonomy.
pub fn failure_to_error(code: u64, message: &str, signing: bool) -> CustodyError {
    let detail = if message.is_empty() {
        format!("failure code {}", code)
    } else {
        message.to_string()
    };
    match code {
        failure::ACTION_CANCELLED | failure::PIN_CANCELLED => CustodyError::UserRejected(detail),
        failure::PIN_EXPECTED | failure::PIN_INVALID | failure::PIN_MISMATCH => {
            CustodyError::DeviceLocked(detail)
        }
        failure::NOT_INITIALIZED => CustodyError::AppNotOpen(detail),
        failure::INVALID_SESSION => CustodyError::DeviceNotConnected(detail),
        _ if signing => CustodyError::SigningFailed(detail),
        _ => CustodyError::Transport(detail),
    }
}
