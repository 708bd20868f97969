use crate::core::errors::CustodyError;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

/// Salt length for every vault record.
pub const SALT_LEN: usize = 16;

/// AES-GCM nonce length.
pub const NONCE_LEN: usize = 12;

/// Derive a 256-bit key with PBKDF2-HMAC-SHA256.
///
/// CPU bound; async callers run it on `spawn_blocking`.
pub fn derive_key(
    password: &[u8],
    salt: &[u8],
    iterations: u32,
) -> Result<Zeroizing<[u8; 32]>, CustodyError> {
    if iterations == 0 {
        return Err(CustodyError::Validation("iterations must be positive".to_string()));
    }
    if salt.is_empty() {
        return Err(CustodyError::Validation("salt must not be empty".to_string()));
    }
    debug!("Using PBKDF2 with {} iterations", iterations);

    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut *key);
    Ok(key)
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc7914_vector() {
        // PBKDF2-HMAC-SHA256("passwd", "salt", 1)
        let key = derive_key(b"passwd", b"salt", 1).unwrap();
        assert_eq!(
            hex::encode(&key[..16]),
            "55ac046e56e3089fec1691c22544b605"
        );
    }

    #[test]
    fn test_deterministic_and_salted() {
        let a = derive_key(b"password", b"salt-one", 10).unwrap();
        let b = derive_key(b"password", b"salt-one", 10).unwrap();
        let c = derive_key(b"password", b"salt-two", 10).unwrap();
        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
    }

    #[test]
    fn test_rejects_bad_params() {
        assert!(derive_key(b"pw", b"salt", 0).is_err());
        assert!(derive_key(b"pw", b"", 1).is_err());
    }

    #[test]
    fn test_random_material_differs() {
        assert_ne!(generate_salt(), generate_salt());
        assert_ne!(generate_nonce(), generate_nonce());
    }
}
