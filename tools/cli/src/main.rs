//! vaultdrive CLI - create vaults and serve them as drives.
//!
//! `unlock` mounts a vault and keeps it mounted until Ctrl-C, then locks
//! it again.

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use zeroize::Zeroizing;

use vaultdrive_agent::{AgentSettings, VaultManager, VaultStatus};
use vaultdrive_common::Error;
use vaultdrive_drive::DriveHost;

#[derive(Parser)]
#[command(name = "vaultdrive")]
#[command(about = "vaultdrive - Encrypted vaults as virtual drives")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file (defaults to $VAULTDRIVE_CONFIG, then the user config dir).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new vault.
    Create {
        /// Vault identifier.
        #[arg(short, long)]
        name: String,

        /// Directory holding the encrypted documents.
        #[arg(short, long)]
        path: PathBuf,

        /// Codec algorithm (default from settings).
        #[arg(short, long)]
        algorithm: Option<String>,
    },

    /// Register an existing vault.
    Open {
        /// Vault identifier.
        #[arg(short, long)]
        name: String,

        /// Vault directory.
        #[arg(short, long)]
        path: PathBuf,
    },

    /// Unlock and mount a vault until Ctrl-C.
    Unlock {
        /// Vault identifier.
        #[arg(short, long)]
        name: String,
    },

    /// Show the state of a vault.
    Status {
        /// Vault identifier.
        #[arg(short, long)]
        name: String,

        /// Print JSON.
        #[arg(long)]
        json: bool,
    },

    /// List known vaults.
    List {
        /// Print JSON.
        #[arg(long)]
        json: bool,
    },

    /// Encrypt plaintext files found in a locked vault.
    Migrate {
        /// Vault identifier.
        #[arg(short, long)]
        name: String,
    },

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let fallback = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .init();

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "vaultdrive", &mut io::stdout());
        return Ok(());
    }

    let settings_path = AgentSettings::resolve_path(cli.config.as_deref());
    let settings = AgentSettings::load(&settings_path)
        .await
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;

    let manager = VaultManager::new(settings, drive_host()).persist_to(&settings_path);
    manager.load_known().await;

    match cli.command {
        Commands::Create {
            name,
            path,
            algorithm,
        } => cmd_create(&manager, &name, path, algorithm.as_deref()).await,
        Commands::Open { name, path } => cmd_open(&manager, &name, path).await,
        Commands::Unlock { name } => cmd_unlock(&manager, &name).await,
        Commands::Status { name, json } => cmd_status(&manager, &name, json).await,
        Commands::List { json } => cmd_list(&manager, json).await,
        Commands::Migrate { name } => cmd_migrate(&manager, &name).await,
        Commands::Completions { .. } => Ok(()),
    }
}

#[cfg(feature = "fuse")]
fn drive_host() -> Box<dyn DriveHost> {
    use vaultdrive_drive::{FuseHost, FuseOptions};

    if !FuseHost::is_available() {
        warn!("FUSE does not appear to be installed; mounting will fail");
    }
    Box::new(FuseHost::new(FuseOptions::default()))
}

#[cfg(not(feature = "fuse"))]
fn drive_host() -> Box<dyn DriveHost> {
    Box::new(vaultdrive_drive::HeadlessHost)
}

/// Prompt for a passphrase securely.
fn prompt_passphrase(prompt: &str) -> Result<Zeroizing<Vec<u8>>> {
    let passphrase = rpassword::prompt_password(prompt).context("Failed to read passphrase")?;
    Ok(Zeroizing::new(passphrase.into_bytes()))
}

/// Prompt only if the vault's codec needs a key.
async fn passphrase_for(manager: &VaultManager, name: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
    let status = manager.status(name).await.context("Unknown vault")?;
    if manager.registry().requires_key(&status.algorithm)? {
        Ok(Some(prompt_passphrase("Enter passphrase: ")?))
    } else {
        Ok(None)
    }
}

fn print_status(status: &VaultStatus) {
    let state = match (status.locked, status.mounted) {
        (true, _) => "locked",
        (false, true) => "mounted",
        (false, false) => "unlocked (not mounted)",
    };
    println!("{}", status.id);
    println!("  Location:  {}", status.root.display());
    println!("  Algorithm: {}", status.algorithm);
    println!("  State:     {}", state);
    if let Some(mount_point) = &status.mount_point {
        println!("  Mounted:   {}", mount_point.display());
    }
    if !status.skipped.is_empty() {
        println!("  Skipped:   {}", status.skipped.join(", "));
    }
}

async fn cmd_create(
    manager: &VaultManager,
    name: &str,
    path: PathBuf,
    algorithm: Option<&str>,
) -> Result<()> {
    info!("Creating new vault: {}", name);

    let algorithm = algorithm.unwrap_or(&manager.settings().default_algorithm);
    let passphrase = if manager.registry().requires_key(algorithm)? {
        let passphrase = prompt_passphrase("Enter passphrase: ")?;
        let confirm = prompt_passphrase("Confirm passphrase: ")?;
        if passphrase != confirm {
            anyhow::bail!("Passphrases do not match");
        }
        if passphrase.is_empty() {
            anyhow::bail!("Passphrase cannot be empty");
        }
        Some(passphrase)
    } else {
        None
    };

    let status = manager
        .create(name, &path, Some(algorithm), passphrase.as_deref().map(Vec::as_slice))
        .await
        .context("Failed to create vault")?;

    println!("Vault created successfully!");
    print_status(&status);
    Ok(())
}

async fn cmd_open(manager: &VaultManager, name: &str, path: PathBuf) -> Result<()> {
    let status = manager
        .open(name, &path)
        .await
        .with_context(|| format!("Failed to open vault at {}", path.display()))?;

    println!("Vault registered.");
    print_status(&status);
    Ok(())
}

async fn cmd_unlock(manager: &VaultManager, name: &str) -> Result<()> {
    let passphrase = passphrase_for(manager, name).await?;
    let status = manager
        .unlock(name, passphrase.as_deref().map(Vec::as_slice))
        .await
        .context("Failed to unlock vault")?;
    drop(passphrase);

    print_status(&status);
    println!("\nPress Ctrl-C to lock.");

    loop {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        info!("Locking vault: {}", name);

        match manager.lock(name).await {
            Ok(_) => {
                println!("Vault locked.");
                return Ok(());
            }
            Err(Error::LockFailed { failures }) => {
                eprintln!("Some documents could not be saved; the vault stays unlocked:");
                for failure in &failures {
                    eprintln!("  {}", failure);
                }
                eprintln!("Press Ctrl-C to retry.");
            }
            Err(e) => return Err(e).context("Failed to lock vault"),
        }
    }
}

async fn cmd_status(manager: &VaultManager, name: &str, json: bool) -> Result<()> {
    let status = manager.status(name).await.context("Unknown vault")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status);
    }
    Ok(())
}

async fn cmd_list(manager: &VaultManager, json: bool) -> Result<()> {
    let statuses = manager.list().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    if statuses.is_empty() {
        println!("No vaults known.");
    }
    for status in &statuses {
        print_status(status);
    }
    Ok(())
}

async fn cmd_migrate(manager: &VaultManager, name: &str) -> Result<()> {
    let passphrase = passphrase_for(manager, name).await?;
    let report = manager
        .migrate(name, passphrase.as_deref().map(Vec::as_slice))
        .await
        .context("Failed to migrate vault")?;

    println!("Migrated {} file(s).", report.migrated.len());
    for path in &report.migrated {
        println!("  {}", path);
    }
    if !report.failed.is_empty() {
        warn!(failed = report.failed.len(), "Some files were not migrated");
        for failure in &report.failed {
            eprintln!("  not migrated: {}", failure);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_unlock() {
        let cli = Cli::try_parse_from(["vaultdrive", "-v", "unlock", "--name", "notes"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Unlock { ref name } if name == "notes"));
    }
}
