//! Error taxonomy shared by the vault, the device drivers and the manager.
//!
//! Every variant renders as a short, non-technical message followed by its
//! taxonomy code. The optional detail string is meant for `tracing` debug
//! output only and must never carry secret material.

use thiserror::Error;

/// Custom error type for custody operations.
#[derive(Debug, Error)]
pub enum CustodyError {
    /// Malformed input: derivation path, key length, password policy.
    #[error("The request was not valid (VALIDATION_ERROR)")]
    Validation(String),
    /// The vault is locked and must be unlocked first.
    #[error("The vault is locked (VAULT_LOCKED)")]
    VaultLocked,
    /// Wrong password or corrupted ciphertext; intentionally carries no detail.
    #[error("The data could not be decrypted (DECRYPTION_ERROR)")]
    Decryption,
    /// No device session is available.
    #[error("The hardware wallet is not connected (DEVICE_NOT_CONNECTED)")]
    DeviceNotConnected(String),
    /// The user declined the request on the device or in the preview.
    #[error("The request was rejected (USER_REJECTED)")]
    UserRejected(String),
    /// The device is PIN locked.
    #[error("The hardware wallet is locked (DEVICE_LOCKED)")]
    DeviceLocked(String),
    /// The chain application is not open on the device.
    #[error("Open the wallet app on your device (APP_NOT_OPEN)")]
    AppNotOpen(String),
    /// Link level failure, including a busy device.
    #[error("Communication with the device failed (TRANSPORT_ERROR)")]
    Transport(String),
    /// Catch-all for signing failures.
    #[error("Signing failed (SIGNING_FAILED)")]
    SigningFailed(String),
    /// Persistence backend failure.
    #[error("Secure storage is unavailable (STORAGE_ERROR)")]
    Storage(String),
    /// Invalid configuration.
    #[error("The configuration is invalid (CONFIG_ERROR)")]
    Config(String),
    /// Internal errors (task join failures and the like).
    #[error("An internal error occurred (INTERNAL_ERROR)")]
    Internal(String),
}

/// Convenience alias used across the crate.
pub type CustodyResult<T> = Result<T, CustodyError>;

impl CustodyError {
    /// Stable taxonomy code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::VaultLocked => "VAULT_LOCKED",
            Self::Decryption => "DECRYPTION_ERROR",
            Self::DeviceNotConnected(_) => "DEVICE_NOT_CONNECTED",
            Self::UserRejected(_) => "USER_REJECTED",
            Self::DeviceLocked(_) => "DEVICE_LOCKED",
            Self::AppNotOpen(_) => "APP_NOT_OPEN",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::SigningFailed(_) => "SIGNING_FAILED",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Internal detail for debug logging.
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::VaultLocked | Self::Decryption => None,
            Self::Validation(d)
            | Self::DeviceNotConnected(d)
            | Self::UserRejected(d)
            | Self::DeviceLocked(d)
            | Self::AppNotOpen(d)
            | Self::Transport(d)
            | Self::SigningFailed(d)
            | Self::Storage(d)
            | Self::Config(d)
            | Self::Internal(d) => Some(d.as_str()),
        }
    }

    /// Errors raised by the device or its link, as opposed to caller input.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            Self::DeviceNotConnected(_)
                | Self::UserRejected(_)
                | Self::DeviceLocked(_)
                | Self::AppNotOpen(_)
                | Self::Transport(_)
        )
    }
}

impl From<std::io::Error> for CustodyError {
    fn from(err: std::io::Error) -> Self {
        CustodyError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for CustodyError {
    fn from(err: serde_json::Error) -> Self {
        CustodyError::Storage(err.to_string())
    }
}

impl From<tokio::task::JoinError> for CustodyError {
    fn from(err: tokio::task::JoinError) -> Self {
        CustodyError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_message_plus_code() {
        let err = CustodyError::Validation("path component 3 not hardened".to_string());
        assert_eq!(err.to_string(), "The request was not valid (VALIDATION_ERROR)");
    }

    #[test]
    fn test_display_never_echoes_detail() {
        let err = CustodyError::Transport("hid write failed: secret-ish detail".to_string());
        assert!(!err.to_string().contains("secret-ish"));
        assert_eq!(err.detail(), Some("hid write failed: secret-ish detail"));
    }

    #[test]
    fn test_decryption_has_no_detail() {
        assert_eq!(CustodyError::Decryption.detail(), None);
        assert_eq!(CustodyError::Decryption.code(), "DECRYPTION_ERROR");
    }

    #[test]
    fn test_device_error_classification() {
        assert!(CustodyError::UserRejected("x".into()).is_device_error());
        assert!(!CustodyError::VaultLocked.is_device_error());
        assert!(!CustodyError::Validation("x".into()).is_device_error());
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: CustodyError = io.into();
        assert_eq!(err.code(), "STORAGE_ERROR");
    }
}
