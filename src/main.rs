// src/main.rs
//! `custody` command line entry point.
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use std::io::{BufRead, Write};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use wallet_custody::cli::{Cli, Commands, DeviceArgs, DeviceCommand, PathCommand, SignArgs, VaultCommand};
use wallet_custody::core::{CustodyConfig, DerivationPath};
use wallet_custody::hardware::ledger::{LedgerDriver, SimulatedLedger};
use wallet_custody::hardware::manager::{ManagerConfig, PayloadPreview};
use wallet_custody::hardware::transaction::TransactionFields;
use wallet_custody::hardware::trezor::{HttpBridge, SimulatedBridge, TrezorDriver};
use wallet_custody::hardware::{DeviceType, HardwareWalletManager};
use wallet_custody::service::SigningCoordinator;
use wallet_custody::storage::JsonFileStore;
use wallet_custody::vault::SecureVault;

/// Seed of the simulated devices used with `--simulate`.
const SIMULATED_SEED: [u8; 32] = [0x5A; 32];

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    let config = CustodyConfig::load(cli.config.as_deref()).context("loading configuration")?;
    info!("custody v{}", env!("CARGO_PKG_VERSION"));

    match &cli.command {
        Commands::Vault(cmd) => run_vault(&cli, &config, cmd).await,
        Commands::Path(PathCommand::Check { path }) => {
            let parsed = DerivationPath::parse(path)?;
            println!("{}", parsed);
            Ok(())
        }
        Commands::Address { public_key } => {
            let bytes = hex::decode(public_key.trim_start_matches("0x")).context("public key is not hex")?;
            println!("{}", wallet_custody::crypto::derive_address(&bytes)?);
            Ok(())
        }
        Commands::Device(cmd) => run_device(&cli, &config, cmd).await,
        Commands::Sign(args) => run_sign(&cli, &config, args).await,
    }
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn env_password(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| anyhow!("{} is not set", name))
}

async fn open_vault(cli: &Cli, config: &CustodyConfig) -> Result<SecureVault> {
    let store = Arc::new(JsonFileStore::open(&cli.store)?);
    let vault = SecureVault::open(store, config.vault.clone())?;
    if vault.status().encryption_enabled {
        vault.unlock(&env_password("CUSTODY_PASSWORD")?).await?;
    }
    Ok(vault)
}

async fn run_vault(cli: &Cli, config: &CustodyConfig, cmd: &VaultCommand) -> Result<()> {
    if let VaultCommand::Enable = cmd {
        let store = Arc::new(JsonFileStore::open(&cli.store)?);
        let vault = SecureVault::open(store, config.vault.clone())?;
        vault.enable(&env_password("CUSTODY_PASSWORD")?).await?;
        println!("encryption enabled");
        return Ok(());
    }

    let vault = open_vault(cli, config).await?;
    match cmd {
        VaultCommand::Enable => unreachable!("handled above"),
        VaultCommand::Put { key, value } => vault.set(key, value.as_bytes()).await?,
        VaultCommand::Get { key } => match vault.get(key).await? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => bail!("no value stored under {}", key),
        },
        VaultCommand::Rm { key } => vault.remove(key).await?,
        VaultCommand::List => {
            for key in vault.keys()? {
                println!("{}", key);
            }
        }
        VaultCommand::ChangePassword => {
            vault
                .change_password(
                    &env_password("CUSTODY_PASSWORD")?,
                    &env_password("CUSTODY_NEW_PASSWORD")?,
                )
                .await?;
            println!("password changed");
        }
        VaultCommand::ImportKey { private_key } => {
            let key = zeroize::Zeroizing::new(hex::decode(private_key).context("private key is not hex")?);
            let coordinator = SigningCoordinator::new(vault.clone(), Arc::new(HardwareWalletManager::default()));
            println!("{}", coordinator.import_signing_key(&key).await?);
        }
        VaultCommand::Status => {
            let status = vault.status();
            println!(
                "encryption_enabled={} locked={}",
                status.encryption_enabled, status.is_locked
            );
        }
    }
    vault.lock();
    Ok(())
}

/// Prints the payload to stderr and asks for confirmation on stdin.
struct TerminalPreview;

#[async_trait]
impl PayloadPreview for TerminalPreview {
    async fn confirm(&self, payload: &[u8], hash: &[u8; 32]) -> bool {
        eprintln!("Payload: {}", String::from_utf8_lossy(payload));
        eprintln!("SHA-256: {}", hex::encode(hash));
        eprint!("Sign this payload? [y/N] ");
        let _ = std::io::stderr().flush();
        tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).ok();
            matches!(line.trim(), "y" | "Y" | "yes")
        })
        .await
        .unwrap_or(false)
    }
}

fn build_manager(cli: &Cli, config: &CustodyConfig) -> Result<HardwareWalletManager> {
    let manager = HardwareWalletManager::new(ManagerConfig::from(&config.hardware));
    if cli.simulate {
        manager.register(Arc::new(LedgerDriver::new(Arc::new(SimulatedLedger::new(SIMULATED_SEED)))));
        manager.register(Arc::new(TrezorDriver::new(Arc::new(SimulatedBridge::new(SIMULATED_SEED)))));
    } else {
        #[cfg(feature = "ledger")]
        manager.register(Arc::new(LedgerDriver::new(Arc::new(
            wallet_custody::hardware::ledger::HidLink::new(config.hardware.device_timeout()),
        ))));
        manager.register(Arc::new(TrezorDriver::new(Arc::new(HttpBridge::new(
            &config.hardware.bridge_url,
            config.hardware.device_timeout(),
        )?))));
    }
    manager.set_preview(Arc::new(TerminalPreview));
    Ok(manager)
}

fn resolve_path(config: &CustodyConfig, path: Option<&str>) -> Result<DerivationPath> {
    Ok(DerivationPath::parse(path.unwrap_or(&config.hardware.default_path))?)
}

async fn connect(manager: &HardwareWalletManager, config: &CustodyConfig, args: &DeviceArgs) -> Result<DerivationPath> {
    let device_type: DeviceType = args.device_type.parse()?;
    let path = resolve_path(config, args.path.as_deref())?;
    manager.connect(device_type).await?;
    manager.set_active_path(path)?;
    Ok(path)
}

async fn run_device(cli: &Cli, config: &CustodyConfig, cmd: &DeviceCommand) -> Result<()> {
    let manager = build_manager(cli, config)?;
    match cmd {
        DeviceCommand::Connect(args) => {
            connect(&manager, config, args).await?;
            let handle = manager.active_device().ok_or_else(|| anyhow!("device dropped"))?;
            println!("{}", serde_json::to_string_pretty(&handle)?);
        }
        DeviceCommand::Address { device, show } => {
            let path = connect(&manager, config, device).await?;
            let derived = manager.get_address(&path, *show).await?;
            println!("{}", serde_json::to_string_pretty(&derived)?);
        }
        DeviceCommand::Verify(args) => {
            let path = connect(&manager, config, args).await?;
            let derived = manager.verify_address_on_device(&path).await?;
            println!("{}", serde_json::to_string_pretty(&derived)?);
        }
    }
    manager.disconnect().await?;
    Ok(())
}

async fn run_sign(cli: &Cli, config: &CustodyConfig, args: &SignArgs) -> Result<()> {
    let extra = match &args.extra {
        Some(raw) => serde_json::from_str(raw).context("--extra must be a JSON object")?,
        None => Default::default(),
    };
    let fields = TransactionFields {
        from: args.from.clone(),
        to: args.to.clone(),
        amount: args.amount.clone(),
        extra,
    };

    let manager = Arc::new(build_manager(cli, config)?);
    let vault = match &args.device {
        Some(device_type) => {
            let device = DeviceArgs {
                device_type: device_type.clone(),
                path: args.path.clone(),
            };
            connect(&manager, config, &device).await?;
            let store = Arc::new(JsonFileStore::open(&cli.store)?);
            SecureVault::open(store, config.vault.clone())?
        }
        None => open_vault(cli, config).await?,
    };

    let coordinator = SigningCoordinator::new(vault.clone(), manager.clone());
    let signed = coordinator.sign_transaction(&fields).await;
    vault.lock();
    manager.disconnect().await?;
    println!("{}", serde_json::to_string_pretty(&signed?)?);
    Ok(())
}
