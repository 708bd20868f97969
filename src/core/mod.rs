pub mod bip44;
pub mod config;
pub mod errors;
pub mod validation;

pub use bip44::DerivationPath;
pub use config::{CustodyConfig, HardwareConfig, VaultConfig};
pub use errors::{CustodyError, CustodyResult};
