//! BIP44 derivation paths for the chain's coin type.
//!
//! Path format: `m/44'/22593'/account'/change/address_index`
//!
//! Only this shape is accepted. Anything else is rejected with
//! `CustodyError::Validation` before it can reach a device.

use crate::core::errors::CustodyError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

/// BIP44 purpose constant.
pub const PURPOSE: u32 = 44;

/// Registered coin type of the chain.
pub const COIN_TYPE: u32 = 22593;

/// Hardened index offset.
pub const HARDENED: u32 = 0x8000_0000;

static PATH_GRAMMAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^m/44['h]/22593['h]/(0|[1-9][0-9]{0,9})['h]/([01])/(0|[1-9][0-9]{0,9})$")
        .expect("hardcoded path regex should always compile")
});

/// BIP44 derivation path structure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DerivationPath {
    /// Account index (hardened)
    pub account: u32,
    /// External/internal chain (0=external, 1=internal change)
    pub change: u32,
    /// Address index within the chain
    pub address_index: u32,
}

impl DerivationPath {
    /// Build a path from its variable components.
    pub fn new(account: u32, change: u32, address_index: u32) -> Result<Self, CustodyError> {
        if account >= HARDENED || address_index >= HARDENED {
            return Err(CustodyError::Validation(
                "path index out of range".to_string(),
            ));
        }
        if change > 1 {
            return Err(CustodyError::Validation(
                "change must be 0 or 1".to_string(),
            ));
        }
        Ok(Self {
            account,
            change,
            address_index,
        })
    }

    /// Parse and validate a textual path such as `m/44'/22593'/0'/0/0`.
    pub fn parse(path: &str) -> Result<Self, CustodyError> {
        let caps = PATH_GRAMMAR
            .captures(path)
            .ok_or_else(|| CustodyError::Validation(format!("malformed derivation path: {}", path)))?;

        let component = |i: usize| -> Result<u32, CustodyError> {
            caps[i]
                .parse::<u32>()
                .map_err(|_| CustodyError::Validation(format!("path index out of range: {}", path)))
        };

        Self::new(component(1)?, component(2)?, component(3)?)
    }

    /// Generate complete derivation path indices
    pub fn to_indices(&self) -> [u32; 5] {
        [
            HARDENED | PURPOSE,
            HARDENED | COIN_TYPE,
            HARDENED | self.account,
            self.change,
            self.address_index,
        ]
    }

    /// Depth-prefixed big-endian serialization used in APDU frames.
    pub fn to_bytes(&self) -> Vec<u8> {
        let indices = self.to_indices();
        let mut bytes = Vec::with_capacity(1 + indices.len() * 4);
        bytes.push(indices.len() as u8);
        for index in indices {
            bytes.extend_from_slice(&index.to_be_bytes());
        }
        bytes
    }

    /// Inverse of [`DerivationPath::to_bytes`], with the same validation as `parse`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CustodyError> {
        let malformed = || CustodyError::Validation("malformed serialized path".to_string());
        if bytes.len() != 1 + 5 * 4 || bytes[0] != 5 {
            return Err(malformed());
        }
        let mut indices = [0u32; 5];
        for (i, chunk) in bytes[1..].chunks_exact(4).enumerate() {
            indices[i] = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        if indices[0] != HARDENED | PURPOSE
            || indices[1] != HARDENED | COIN_TYPE
            || indices[2] & HARDENED == 0
        {
            return Err(malformed());
        }
        Self::new(indices[2] & !HARDENED, indices[3], indices[4])
    }
}

impl Default for DerivationPath {
    /// `m/44'/22593'/0'/0/0`
    fn default() -> Self {
        Self {
            account: 0,
            change: 0,
            address_index: 0,
        }
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "m/{}'/{}'/{}'/{}/{}",
            PURPOSE, COIN_TYPE, self.account, self.change, self.address_index
        )
    }
}

impl serde::Serialize for DerivationPath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl FromStr for DerivationPath {
    type Err = CustodyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
