// src/security/mod.rs
//! Secret-handling helpers shared by the vault and the drivers.

pub mod redaction;
pub mod secret;

// Redaction helpers to avoid accidental secret prints
pub use redaction::{redact_body, short_hex};
// Secret buffer alias re-export
pub use secret::SecretVec;
