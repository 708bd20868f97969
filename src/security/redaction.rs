// Simple helpers to avoid accidental printing of secrets in logs/tests.
use std::env;

/// Redact a text body unless DEV_PRINT_SECRETS=1 is set in the environment.
/// By default this returns a short placeholder containing only the length.
pub fn redact_body(s: &str) -> String {
    if dev_print_enabled() {
        return s.to_string();
    }
    format!("<redacted len={}>", s.len())
}

/// Short form of a hash or public key for log lines: first and last four bytes.
pub fn short_hex(bytes: &[u8]) -> String {
    if bytes.len() <= 8 {
        return hex::encode(bytes);
    }
    format!(
        "{}..{}",
        hex::encode(&bytes[..4]),
        hex::encode(&bytes[bytes.len() - 4..])
    )
}

fn dev_print_enabled() -> bool {
    env::var("DEV_PRINT_SECRETS").ok().as_deref() == Some("1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_hex() {
        assert_eq!(short_hex(&[1, 2]), "0102");
        assert_eq!(short_hex(&[0xAA; 32]), "aaaaaaaa..aaaaaaaa");
    }

    #[test]
    fn test_redaction_hides_content() {
        if env::var("DEV_PRINT_SECRETS").is_ok() {
            return;
        }
        assert_eq!(redact_body("topsecret"), "<redacted len=9>");
    }
}
