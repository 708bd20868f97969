//! Small helpers and aliases for secret buffers that must be zeroized on drop.
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

/// Common alias for secret byte buffers which will be zeroed when dropped.
pub type SecretVec = Zeroizing<Vec<u8>>;

/// Convert a Vec<u8> into a `SecretVec` which will be zeroized on drop.
pub fn vec_to_secret(v: Vec<u8>) -> SecretVec {
    Zeroizing::new(v)
}

/// Wrap a password so it is zeroized on drop and never printed by `Debug`.
pub fn password(s: &str) -> SecretString {
    SecretString::new(s.to_string())
}

/// Copy the password bytes into a zeroizing buffer for the KDF.
pub fn password_bytes(p: &SecretString) -> SecretVec {
    vec_to_secret(p.expose_secret().as_bytes().to_vec())
}
