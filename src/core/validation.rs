use crate::core::errors::CustodyError;

/// Minimum accepted vault password length, counted in characters.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Maximum accepted vault key length.
pub const MAX_KEY_LEN: usize = 128;

/// Namespaces owned by the vault itself. User keys may not start with these.
pub const RESERVED_PREFIXES: [&str; 4] = ["plain/", "vault/", "staging/", "meta/"];

/// Validates a vault password against the length policy.
pub fn validate_password(password: &str) -> Result<(), CustodyError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(CustodyError::Validation(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

/// Validates a user-visible vault key.
pub fn validate_vault_key(key: &str) -> Result<(), CustodyError> {
    if key.is_empty() {
        return Err(CustodyError::Validation("vault key is empty".to_string()));
    }
    if key.chars().count() > MAX_KEY_LEN {
        return Err(CustodyError::Validation(format!(
            "vault key longer than {} characters",
            MAX_KEY_LEN
        )));
    }
    if RESERVED_PREFIXES.iter().any(|p| key.starts_with(p)) {
        return Err(CustodyError::Validation(format!(
            "vault key uses a reserved prefix: {}",
            key
        )));
    }
    Ok(())
}

/// Rejects empty or whitespace-only required fields.
pub fn require_non_empty(field: &str, value: &str) -> Result<(), CustodyError> {
    if value.trim().is_empty() {
        return Err(CustodyError::Validation(format!("{} is required", field)));
    }
    Ok(())
}
