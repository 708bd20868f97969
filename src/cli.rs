use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Secret custody and hardware signing CLI (library-facing definitions)
#[derive(Debug, Parser)]
#[command(name = "custody", about = "Local secret vault and hardware wallet signing", version)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Vault storage file
    #[arg(long, global = true, default_value = "custody-vault.json")]
    pub store: PathBuf,

    /// Use in-process simulated devices instead of real hardware
    #[arg(long, global = true)]
    pub simulate: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Vault management. Passwords are read from CUSTODY_PASSWORD and
    /// CUSTODY_NEW_PASSWORD.
    #[command(subcommand)]
    Vault(VaultCommand),
    /// Derivation path utilities
    #[command(subcommand)]
    Path(PathCommand),
    /// Address of a hex-encoded SEC1 public key
    Address {
        public_key: String,
    },
    /// Hardware wallet operations
    #[command(subcommand)]
    Device(DeviceCommand),
    /// Sign a transfer with the connected device, or the vault key without one
    Sign(SignArgs),
}

#[derive(Debug, Subcommand)]
pub enum VaultCommand {
    /// Turn on encryption with CUSTODY_PASSWORD
    Enable,
    /// Store a value
    Put { key: String, value: String },
    /// Print a value
    Get { key: String },
    /// Delete a value
    Rm { key: String },
    /// List keys
    List,
    /// Re-encrypt everything under CUSTODY_NEW_PASSWORD
    ChangePassword,
    /// Store the hex-encoded software signing key
    ImportKey { private_key: String },
    /// Lock state and encryption mode
    Status,
}

#[derive(Debug, Subcommand)]
pub enum PathCommand {
    /// Validate and normalize a derivation path
    Check { path: String },
}

#[derive(Debug, Clone, Args)]
pub struct DeviceArgs {
    /// `ledger` or `trezor`
    #[arg(long = "type", default_value = "ledger")]
    pub device_type: String,

    /// Derivation path, defaults to the configured one
    #[arg(long)]
    pub path: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum DeviceCommand {
    /// Connect and print the device handle
    Connect(DeviceArgs),
    /// Print the address at a path
    Address {
        #[command(flatten)]
        device: DeviceArgs,
        /// Also show it on the device screen
        #[arg(long)]
        show: bool,
    },
    /// Display the address on the device for confirmation
    Verify(DeviceArgs),
}

#[derive(Debug, Args)]
pub struct SignArgs {
    #[arg(long)]
    pub from: String,
    #[arg(long)]
    pub to: String,
    #[arg(long)]
    pub amount: String,
    /// Extra payload fields as a JSON object
    #[arg(long)]
    pub extra: Option<String>,
    /// Sign on this device type instead of with the vault key
    #[arg(long)]
    pub device: Option<String>,
    /// Derivation path for device signing
    #[arg(long)]
    pub path: Option<String>,
}
