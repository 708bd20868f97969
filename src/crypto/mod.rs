pub mod kdf;
pub mod keys;
pub mod signature_utils;

pub use self::keys::{derive_address, derive_public_key, sha256, sign_hash, verify};
pub use self::signature_utils::Signature;
