//! secp256k1 key, address and signature primitives.
//!
//! Every function checks input lengths before touching the curve library,
//! so a malformed key or hash is always a `Validation` error and never a
//! cryptographic failure.

use crate::core::errors::CustodyError;
use crate::crypto::signature_utils::Signature;
use once_cell::sync::Lazy;
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

/// Human-readable address prefix of the chain.
pub const ADDRESS_PREFIX: &str = "ax";

/// Number of hash bytes kept in an address.
pub const ADDRESS_HASH_LEN: usize = 20;

static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

pub(crate) fn secp() -> &'static Secp256k1<All> {
    &SECP
}

/// SHA-256 digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn check_private_key(private_key: &[u8]) -> Result<SecretKey, CustodyError> {
    if private_key.len() != 32 {
        return Err(CustodyError::Validation(format!(
            "private key must be 32 bytes, got {}",
            private_key.len()
        )));
    }
    SecretKey::from_slice(private_key)
        .map_err(|_| CustodyError::Validation("private key out of range".to_string()))
}

fn check_hash(hash: &[u8]) -> Result<Message, CustodyError> {
    if hash.len() != 32 {
        return Err(CustodyError::Validation(format!(
            "hash must be 32 bytes, got {}",
            hash.len()
        )));
    }
    Message::from_slice(hash).map_err(|e| CustodyError::Validation(e.to_string()))
}

/// Parse a 33-byte compressed or 65-byte uncompressed SEC1 public key.
pub fn parse_public_key(public_key: &[u8]) -> Result<PublicKey, CustodyError> {
    if public_key.len() != 33 && public_key.len() != 65 {
        return Err(CustodyError::Validation(format!(
            "public key must be 33 or 65 bytes, got {}",
            public_key.len()
        )));
    }
    PublicKey::from_slice(public_key)
        .map_err(|_| CustodyError::Validation("public key is not on the curve".to_string()))
}

/// Compressed SEC1 form of either public key encoding.
pub fn compress_public_key(public_key: &[u8]) -> Result<[u8; 33], CustodyError> {
    Ok(parse_public_key(public_key)?.serialize())
}

/// Derive the public key for a 32-byte private key.
///
/// # Arguments
/// * `private_key` - raw scalar, never logged
/// * `compressed` - 33-byte output when true, 65-byte otherwise
pub fn derive_public_key(private_key: &[u8], compressed: bool) -> Result<Vec<u8>, CustodyError> {
    let sk = check_private_key(private_key)?;
    let pk = PublicKey::from_secret_key(secp(), &sk);
    Ok(if compressed {
        pk.serialize().to_vec()
    } else {
        pk.serialize_uncompressed().to_vec()
    })
}

/// `"ax"` + hex of the first 20 bytes of SHA-256 over the compressed key.
pub fn derive_address(public_key: &[u8]) -> Result<String, CustodyError> {
    let compressed = compress_public_key(public_key)?;
    let digest = sha256(&compressed);
    Ok(format!(
        "{}{}",
        ADDRESS_PREFIX,
        hex::encode(&digest[..ADDRESS_HASH_LEN])
    ))
}

/// Deterministic (RFC 6979) ECDSA signature over a 32-byte hash, low-S.
pub fn sign_hash(hash: &[u8], private_key: &[u8]) -> Result<Signature, CustodyError> {
    let message = check_hash(hash)?;
    let sk = check_private_key(private_key)?;
    let sig = secp().sign_ecdsa(&message, &sk);
    Ok(Signature::from_secp(&sig))
}

/// 65-byte `header‖r‖s` recoverable signature, header `31 + recovery_id`
/// (compressed-key form).
pub fn sign_hash_recoverable(hash: &[u8], private_key: &[u8]) -> Result<[u8; 65], CustodyError> {
    let message = check_hash(hash)?;
    let sk = check_private_key(private_key)?;
    let (recovery_id, compact) = secp()
        .sign_ecdsa_recoverable(&message, &sk)
        .serialize_compact();
    let mut out = [0u8; 65];
    out[0] = 31 + recovery_id.to_i32() as u8;
    out[1..].copy_from_slice(&compact);
    Ok(out)
}

/// Verify a compact signature. Malformed input of any kind yields `false`.
///
/// Only low-S signatures verify.
pub fn verify(signature: &[u8], hash: &[u8], public_key: &[u8]) -> bool {
    if signature.len() != 64 {
        return false;
    }
    let Ok(message) = check_hash(hash) else {
        return false;
    };
    let Ok(pk) = parse_public_key(public_key) else {
        return false;
    };
    let Ok(sig) = secp256k1::ecdsa::Signature::from_compact(signature) else {
        return false;
    };
    secp().verify_ecdsa(&message, &sig, &pk).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::signature_utils::negate_s;
    use proptest::prelude::*;

    const KEY: [u8; 32] = [7u8; 32];

    #[test]
    fn test_address_shape() {
        let pk = derive_public_key(&KEY, true).unwrap();
        let addr = derive_address(&pk).unwrap();
        assert_eq!(addr.len(), 42);
        assert!(addr.starts_with("ax"));
        assert!(addr[2..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_address_same_for_both_encodings() {
        let compressed = derive_public_key(&KEY, true).unwrap();
        let uncompressed = derive_public_key(&KEY, false).unwrap();
        assert_eq!(compressed.len(), 33);
        assert_eq!(uncompressed.len(), 65);
        assert_eq!(
            derive_address(&compressed).unwrap(),
            derive_address(&uncompressed).unwrap()
        );
    }

    #[test]
    fn test_sign_is_deterministic() {
        let hash = sha256(b"payload");
        let a = sign_hash(&hash, &KEY).unwrap();
        let b = sign_hash(&hash, &KEY).unwrap();
        assert_eq!(a, b);
        assert!(a.is_low_s());
    }

    #[test]
    fn test_sign_then_verify() {
        let hash = sha256(b"payload");
        let pk = derive_public_key(&KEY, true).unwrap();
        let sig = sign_hash(&hash, &KEY).unwrap();
        assert!(verify(sig.as_bytes(), &hash, &pk));
        assert!(!verify(sig.as_bytes(), &sha256(b"other"), &pk));
    }

    #[test]
    fn test_verify_rejects_high_s() {
        let hash = sha256(b"payload");
        let pk = derive_public_key(&KEY, true).unwrap();
        let sig = sign_hash(&hash, &KEY).unwrap();
        assert!(!verify(&negate_s(sig.as_bytes()), &hash, &pk));
    }

    #[test]
    fn test_recoverable_matches_plain_signature() {
        let hash = sha256(b"payload");
        let recoverable = sign_hash_recoverable(&hash, &KEY).unwrap();
        assert!((31..=34).contains(&recoverable[0]));
        let parsed = Signature::from_recoverable(&recoverable).unwrap();
        assert_eq!(parsed, sign_hash(&hash, &KEY).unwrap());
    }

    #[test]
    fn test_verify_never_errors_on_garbage() {
        assert!(!verify(&[0u8; 10], &[0u8; 32], &[2u8; 33]));
        assert!(!verify(&[1u8; 64], &[0u8; 31], &[2u8; 33]));
        assert!(!verify(&[1u8; 64], &[0u8; 32], &[9u8; 33]));
        assert!(!verify(&[0xFFu8; 64], &[0u8; 32], &derive_public_key(&KEY, true).unwrap()));
    }

    #[test]
    fn test_length_contracts() {
        assert_eq!(derive_public_key(&[1u8; 31], true).unwrap_err().code(), "VALIDATION_ERROR");
        assert_eq!(sign_hash(&[0u8; 33], &KEY).unwrap_err().code(), "VALIDATION_ERROR");
        assert_eq!(sign_hash(&[0u8; 32], &[0u8; 32]).unwrap_err().code(), "VALIDATION_ERROR");
        assert_eq!(derive_address(&[2u8; 34]).unwrap_err().code(), "VALIDATION_ERROR");
    }

    proptest! {
        #[test]
        fn prop_sign_verify(seed in any::<[u8; 32]>(), msg in proptest::collection::vec(any::<u8>(), 0..128)) {
            prop_assume!(SecretKey::from_slice(&seed).is_ok());
            let hash = sha256(&msg);
            let sig = sign_hash(&hash, &seed).unwrap();
            let pk = derive_public_key(&seed, false).unwrap();
            prop_assert!(sig.is_low_s());
            prop_assert!(verify(sig.as_bytes(), &hash, &pk));
        }
    }
}
