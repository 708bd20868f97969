//! ECDSA signature value object and low-S normalization.

use crate::core::errors::CustodyError;
use serde::{Serialize, Serializer};
use std::fmt;

/// Order of the secp256k1 group, big-endian.
pub const CURVE_ORDER: [u8; 32] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE,
    0xBA, 0xAE, 0xDC, 0xE6, 0xAF, 0x48, 0xA0, 0x3B, 0xBF, 0xD2, 0x5E, 0x8C, 0xD0, 0x36, 0x41, 0x41,
];

/// 64-byte compact `(r, s)` signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    bytes: [u8; 64],
}

impl Signature {
    /// Parse a compact `r‖s` signature. The value is kept as given; call
    /// [`Signature::normalize_low_s`] to canonicalize.
    pub fn from_compact(bytes: &[u8]) -> Result<Self, CustodyError> {
        if bytes.len() != 64 {
            return Err(CustodyError::Validation(format!(
                "signature must be 64 bytes, got {}",
                bytes.len()
            )));
        }
        secp256k1::ecdsa::Signature::from_compact(bytes)
            .map_err(|e| CustodyError::Validation(format!("invalid signature: {}", e)))?;
        let mut out = [0u8; 64];
        out.copy_from_slice(bytes);
        Ok(Self { bytes: out })
    }

    /// Strict DER parse, normalized to low-S.
    pub fn from_der(der: &[u8]) -> Result<Self, CustodyError> {
        let sig = secp256k1::ecdsa::Signature::from_der(der)
            .map_err(|e| CustodyError::Validation(format!("invalid DER signature: {}", e)))?;
        Ok(Self {
            bytes: ensure_low_s(&sig.serialize_compact()),
        })
    }

    /// Parse the 65-byte `header‖r‖s` recoverable form, normalized to low-S.
    ///
    /// The header is `27 + recovery_id`, plus 4 for compressed keys.
    pub fn from_recoverable(bytes: &[u8]) -> Result<Self, CustodyError> {
        if bytes.len() != 65 {
            return Err(CustodyError::Validation(format!(
                "recoverable signature must be 65 bytes, got {}",
                bytes.len()
            )));
        }
        if !(27..=34).contains(&bytes[0]) {
            return Err(CustodyError::Validation(format!(
                "invalid recovery header {}",
                bytes[0]
            )));
        }
        Ok(Self::from_compact(&bytes[1..])?.normalize_low_s())
    }

    pub(crate) fn from_secp(sig: &secp256k1::ecdsa::Signature) -> Self {
        Self {
            bytes: ensure_low_s(&sig.serialize_compact()),
        }
    }

    /// Canonical form with `s <= n/2`. `r` is never changed.
    pub fn normalize_low_s(&self) -> Self {
        Self {
            bytes: ensure_low_s(&self.bytes),
        }
    }

    pub fn is_low_s(&self) -> bool {
        is_low_s(&self.bytes)
    }

    pub fn r(&self) -> &[u8] {
        &self.bytes[..32]
    }

    pub fn s(&self) -> &[u8] {
        &self.bytes[32..]
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        self.bytes
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// Ensure ECDSA signature uses low-S value (s <= n/2) to avoid malleability.
pub fn ensure_low_s(compact_sig: &[u8; 64]) -> [u8; 64] {
    if let Ok(mut sig) = secp256k1::ecdsa::Signature::from_compact(compact_sig) {
        sig.normalize_s();
        sig.serialize_compact()
    } else {
        *compact_sig
    }
}

/// `true` when `s <= n/2`.
pub fn is_low_s(compact_sig: &[u8; 64]) -> bool {
    ensure_low_s(compact_sig) == *compact_sig
}

/// Replace `s` with `n - s`. Both forms verify against the same key; only
/// the low one is accepted by `verify`.
pub fn negate_s(compact_sig: &[u8; 64]) -> [u8; 64] {
    let mut out = *compact_sig;
    let mut borrow = 0i16;
    for i in (0..32).rev() {
        let diff = CURVE_ORDER[i] as i16 - compact_sig[32 + i] as i16 - borrow;
        if diff < 0 {
            out[32 + i] = (diff + 256) as u8;
            borrow = 1;
        } else {
            out[32 + i] = diff as u8;
            borrow = 0;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{Message, Secp256k1, SecretKey};

    fn sample() -> [u8; 64] {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[1u8; 32]).expect("secret key");
        let message = Message::from_slice(&[2u8; 32]).expect("msg");
        secp.sign_ecdsa(&message, &sk).serialize_compact()
    }

    #[test]
    fn test_ensure_low_s() {
        let low = sample();
        assert!(is_low_s(&low));
        let high = negate_s(&low);
        assert!(!is_low_s(&high));
        let normalized = ensure_low_s(&high);
        assert_eq!(normalized, low);
        // r untouched
        assert_eq!(&normalized[..32], &high[..32]);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let sig = Signature::from_compact(&negate_s(&sample())).unwrap();
        let once = sig.normalize_low_s();
        assert_eq!(once, once.normalize_low_s());
        assert!(once.is_low_s());
    }

    #[test]
    fn test_der_roundtrip_normalizes() {
        let high = negate_s(&sample());
        let der = secp256k1::ecdsa::Signature::from_compact(&high)
            .unwrap()
            .serialize_der()
            .to_vec();
        let parsed = Signature::from_der(&der).unwrap();
        assert!(parsed.is_low_s());
        assert_eq!(parsed.to_bytes(), sample());
    }

    #[test]
    fn test_der_rejects_malformed() {
        assert!(Signature::from_der(&[]).is_err());
        assert!(Signature::from_der(&[0x30, 0x02, 0x02, 0x00]).is_err());
        let mut der = secp256k1::ecdsa::Signature::from_compact(&sample())
            .unwrap()
            .serialize_der()
            .to_vec();
        der[1] = der[1].wrapping_add(1); // declared length no longer matches
        assert!(Signature::from_der(&der).is_err());
    }

    #[test]
    fn test_recoverable_form() {
        let mut rec = vec![31u8];
        rec.extend_from_slice(&negate_s(&sample()));
        let sig = Signature::from_recoverable(&rec).unwrap();
        assert_eq!(sig.to_bytes(), sample());

        rec[0] = 5;
        assert!(Signature::from_recoverable(&rec).is_err());
        assert!(Signature::from_recoverable(&rec[..64]).is_err());
    }

    #[test]
    fn test_from_compact_length() {
        assert!(Signature::from_compact(&[0u8; 63]).is_err());
    }

    #[test]
    fn test_serialize_as_hex() {
        let sig = Signature::from_compact(&sample()).unwrap();
        let json = serde_json::to_string(&sig).unwrap();
        assert_eq!(json, format!("\"{}\"", hex::encode(sample())));
    }
}
