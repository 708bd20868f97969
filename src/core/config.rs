use crate::core::errors::CustodyError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Vault configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Inactivity window before the vault locks itself (seconds)
    #[serde(default = "VaultConfig::default_auto_lock_secs")]
    pub auto_lock_secs: u64,

    /// PBKDF2 iteration count
    #[serde(default = "VaultConfig::default_kdf_iterations")]
    pub kdf_iterations: u32,
}

impl VaultConfig {
    fn default_auto_lock_secs() -> u64 { crate::vault::auto_lock::DEFAULT_AUTO_LOCK.as_secs() }
    fn default_kdf_iterations() -> u32 { 600_000 }

    pub fn auto_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.auto_lock_secs)
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            auto_lock_secs: Self::default_auto_lock_secs(),
            kdf_iterations: Self::default_kdf_iterations(),
        }
    }
}

/// Hardware configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Base URL of the vendor bridge daemon
    #[serde(default = "HardwareConfig::default_bridge_url")]
    pub bridge_url: String,

    /// Per-exchange transport timeout (milliseconds)
    #[serde(default = "HardwareConfig::default_device_timeout_ms")]
    pub device_timeout_ms: u64,

    /// Attempt a single reconnect when a device drops
    #[serde(default = "HardwareConfig::default_auto_reconnect")]
    pub auto_reconnect: bool,

    /// Delay before that reconnect (milliseconds)
    #[serde(default = "HardwareConfig::default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Default derivation path for new sessions
    #[serde(default = "HardwareConfig::default_path")]
    pub default_path: String,
}

impl HardwareConfig {
    fn default_bridge_url() -> String { "http://127.0.0.1:21325".to_string() }
    fn default_device_timeout_ms() -> u64 { 120_000 }
    fn default_auto_reconnect() -> bool { true }
    fn default_reconnect_delay_ms() -> u64 { 1_000 }
    fn default_path() -> String { "m/44'/22593'/0'/0/0".to_string() }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.device_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            bridge_url: Self::default_bridge_url(),
            device_timeout_ms: Self::default_device_timeout_ms(),
            auto_reconnect: Self::default_auto_reconnect(),
            reconnect_delay_ms: Self::default_reconnect_delay_ms(),
            default_path: Self::default_path(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustodyConfig {
    #[serde(default)]
    pub vault: VaultConfig,

    #[serde(default)]
    pub hardware: HardwareConfig,
}

impl CustodyConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, CustodyError> {
        toml::from_str(raw).map_err(|e| CustodyError::Config(e.to_string()))
    }

    /// Load from a TOML file, then apply environment overrides.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, CustodyError> {
        let mut config = match path {
            Some(p) if p.exists() => {
                info!("Loading configuration from {}", p.display());
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| CustodyError::Config(format!("{}: {}", p.display(), e)))?;
                Self::from_toml_str(&raw)?
            }
            _ => Self::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CUSTODY_*` overrides through a variable lookup.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), CustodyError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CUSTODY_AUTO_LOCK_SECS") {
            self.vault.auto_lock_secs = parse_env("CUSTODY_AUTO_LOCK_SECS", &v)?;
        }
        if let Some(v) = lookup("CUSTODY_KDF_ITERATIONS") {
            self.vault.kdf_iterations = parse_env("CUSTODY_KDF_ITERATIONS", &v)?;
        }
        if let Some(v) = lookup("CUSTODY_BRIDGE_URL") {
            self.hardware.bridge_url = v;
        }
        if let Some(v) = lookup("CUSTODY_RECONNECT") {
            self.hardware.auto_reconnect = parse_env("CUSTODY_RECONNECT", &v)?;
        }
        if let Some(v) = lookup("CUSTODY_RECONNECT_DELAY_MS") {
            self.hardware.reconnect_delay_ms = parse_env("CUSTODY_RECONNECT_DELAY_MS", &v)?;
        }
        debug!("Effective configuration: {:?}", self);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), CustodyError> {
        if self.vault.kdf_iterations == 0 {
            return Err(CustodyError::Config("kdf_iterations must be positive".to_string()));
        }
        if self.vault.auto_lock_secs == 0 {
            return Err(CustodyError::Config("auto_lock_secs must be positive".to_string()));
        }
        if !self.hardware.bridge_url.starts_with("http://")
            && !self.hardware.bridge_url.starts_with("https://")
        {
            return Err(CustodyError::Config(format!(
                "bridge_url must be an http(s) URL: {}",
                self.hardware.bridge_url
            )));
        }
        crate::core::bip44::DerivationPath::parse(&self.hardware.default_path)
            .map_err(|_| CustodyError::Config("default_path is not a valid derivation path".to_string()))?;
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, CustodyError> {
    value
        .trim()
        .parse()
        .map_err(|_| CustodyError::Config(format!("{} has an invalid value", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = CustodyConfig::default();
        assert_eq!(config.vault.auto_lock_timeout(), Duration::from_secs(900));
        assert_eq!(config.vault.kdf_iterations, 600_000);
        assert!(config.hardware.auto_reconnect);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = CustodyConfig::from_toml_str(
            r#"
            [vault]
            auto_lock_secs = 60

            [hardware]
            bridge_url = "http://localhost:9999"
            "#,
        )
        .unwrap();
        assert_eq!(config.vault.auto_lock_secs, 60);
        assert_eq!(config.vault.kdf_iterations, 600_000);
        assert_eq!(config.hardware.bridge_url, "http://localhost:9999");
        assert_eq!(config.hardware.reconnect_delay_ms, 1_000);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CUSTODY_AUTO_LOCK_SECS", "30"),
            ("CUSTODY_KDF_ITERATIONS", "1000"),
            ("CUSTODY_RECONNECT", "false"),
            ("CUSTODY_RECONNECT_DELAY_MS", "5"),
        ]
        .into_iter()
        .collect();
        let mut config = CustodyConfig::default();
        config
            .apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.vault.auto_lock_secs, 30);
        assert_eq!(config.vault.kdf_iterations, 1000);
        assert!(!config.hardware.auto_reconnect);
        assert_eq!(config.hardware.reconnect_delay_ms, 5);
    }

    #[test]
    fn test_bad_env_value_is_config_error() {
        let mut config = CustodyConfig::default();
        let err = config
            .apply_env_overrides(|k| (k == "CUSTODY_KDF_ITERATIONS").then(|| "lots".to_string()))
            .unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = CustodyConfig::default();
        config.vault.kdf_iterations = 0;
        assert!(config.validate().is_err());

        let mut config = CustodyConfig::default();
        config.hardware.bridge_url = "ftp://x".to_string();
        assert!(config.validate().is_err());

        let mut config = CustodyConfig::default();
        config.hardware.default_path = "m/44'/60'/0'/0/0".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = CustodyConfig::load(Some(&path)).unwrap();
        assert_eq!(config.vault.auto_lock_secs, 900);
    }
}
