//! Encrypted record format.
//!
//! Blob layout: `salt(16) || nonce(12) || ciphertext` where the ciphertext
//! carries the 16-byte GCM tag. The logical key is bound as associated
//! data, so a blob copied under another name fails to open.

use crate::core::errors::CustodyError;
use crate::crypto::kdf::{self, NONCE_LEN, SALT_LEN};
use crate::security::secret::{vec_to_secret, SecretVec};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};

/// GCM authentication tag length.
pub const TAG_LEN: usize = 16;

/// One encrypted secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRecord {
    pub key: String,
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl SecretRecord {
    /// Encrypt `plaintext` under `password` with a fresh salt and nonce.
    ///
    /// # Security
    /// - PBKDF2-HMAC-SHA256 key, zeroized on return
    /// - AES-256-GCM, the tag is the only password check
    pub fn seal(
        key: &str,
        plaintext: &[u8],
        password: &[u8],
        iterations: u32,
    ) -> Result<Self, CustodyError> {
        let salt = kdf::generate_salt();
        let nonce = kdf::generate_nonce();
        let derived = kdf::derive_key(password, &salt, iterations)?;
        let cipher = Aes256Gcm::new_from_slice(&derived[..])
            .map_err(|_| CustodyError::Internal("invalid key length".to_string()))?;
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| CustodyError::Internal("encryption failed".to_string()))?;
        Ok(Self {
            key: key.to_string(),
            salt,
            nonce,
            ciphertext,
        })
    }

    /// Decrypt. Wrong password and tampered data both yield `Decryption`.
    pub fn open(&self, password: &[u8], iterations: u32) -> Result<SecretVec, CustodyError> {
        let derived = kdf::derive_key(password, &self.salt, iterations)?;
        let cipher =
            Aes256Gcm::new_from_slice(&derived[..]).map_err(|_| CustodyError::Decryption)?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&self.nonce),
                Payload {
                    msg: &self.ciphertext,
                    aad: self.key.as_bytes(),
                },
            )
            .map_err(|_| CustodyError::Decryption)?;
        Ok(vec_to_secret(plaintext))
    }

    pub fn to_blob(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + self.ciphertext.len());
        blob.extend_from_slice(&self.salt);
        blob.extend_from_slice(&self.nonce);
        blob.extend_from_slice(&self.ciphertext);
        blob
    }

    /// Split a stored blob. A blob too short to hold a tag is reported as
    /// `Decryption`, same as any other corruption.
    pub fn from_blob(key: &str, blob: &[u8]) -> Result<Self, CustodyError> {
        if blob.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
            return Err(CustodyError::Decryption);
        }
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&blob[..SALT_LEN]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&blob[SALT_LEN..SALT_LEN + NONCE_LEN]);
        Ok(Self {
            key: key.to_string(),
            salt,
            nonce,
            ciphertext: blob[SALT_LEN + NONCE_LEN..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITER: u32 = 2;

    #[test]
    fn test_seal_open() {
        let record = SecretRecord::seal("seed", b"top secret", b"password1", ITER).unwrap();
        assert_eq!(record.ciphertext.len(), b"top secret".len() + TAG_LEN);
        let blob = record.to_blob();
        let parsed = SecretRecord::from_blob("seed", &blob).unwrap();
        assert_eq!(&parsed.open(b"password1", ITER).unwrap()[..], b"top secret");
    }

    #[test]
    fn test_wrong_password_and_tamper_are_indistinguishable() {
        let record = SecretRecord::seal("seed", b"top secret", b"password1", ITER).unwrap();
        let wrong = record.open(b"password2", ITER).unwrap_err();

        let mut blob = record.to_blob();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        let tampered = SecretRecord::from_blob("seed", &blob)
            .unwrap()
            .open(b"password1", ITER)
            .unwrap_err();

        assert_eq!(wrong.to_string(), tampered.to_string());
        assert_eq!(wrong.detail(), None);
        assert_eq!(tampered.detail(), None);
    }

    #[test]
    fn test_key_is_bound() {
        let record = SecretRecord::seal("a", b"v", b"password1", ITER).unwrap();
        let moved = SecretRecord::from_blob("b", &record.to_blob()).unwrap();
        assert!(moved.open(b"password1", ITER).is_err());
    }

    #[test]
    fn test_fresh_salt_and_nonce() {
        let a = SecretRecord::seal("k", b"v", b"password1", ITER).unwrap();
        let b = SecretRecord::seal("k", b"v", b"password1", ITER).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_short_blob() {
        assert_eq!(
            SecretRecord::from_blob("k", &[0u8; 43]).unwrap_err().code(),
            "DECRYPTION_ERROR"
        );
    }
}
