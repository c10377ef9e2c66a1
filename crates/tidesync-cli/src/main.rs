//! TideSync CLI
//!
//! Thin shell over the sync engine: configuration loading, lifecycle
//! commands, conflict and key management. The engine does the work.

mod config;
mod progress;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tidesync_core::{EncryptionContext, EngineConfig, SyncEngine};
use tidesync_crypto::keys::KeyStore;
use tidesync_store::{ConflictResolution, StateStore};
use tidesync_transport::{SyncClient, TransportConfig};
use tracing_subscriber::EnvFilter;

/// TideSync - multi-device file synchronization
#[derive(Parser)]
#[command(name = "tidesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output (implies --verbose)
    #[arg(short, long)]
    debug: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync engine until interrupted
    Run,

    /// Run a single sync pass and exit
    Sync,

    /// Show share status and recent activity
    Status,

    /// List or resolve conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },

    /// Manage the encryption keys
    Keys {
        #[command(subcommand)]
        command: KeyCommands,
    },
}

#[derive(Subcommand)]
enum ConflictCommands {
    /// List unresolved conflicts
    List {
        /// Share to inspect
        share_id: String,
    },
    /// Record a resolution for a conflict
    Resolve {
        /// Conflict id from `conflicts list`
        id: i64,
        /// keep_local, keep_remote, keep_both, or merge
        resolution: String,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Initialize the master key with a password
    Init,
    /// Change the master key password
    ChangePassword,
    /// Generate and display a recovery key
    ShowRecovery,
}

fn init_tracing(cli: &Cli) {
    let default = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tidesync={default}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let path = cli.config.clone().unwrap_or_else(config::default_config_path);
    config::load(&path)
}

fn build_engine(engine_config: EngineConfig) -> Result<Arc<SyncEngine>> {
    let store = Arc::new(StateStore::open(engine_config.store_path())?);

    let client = SyncClient::new(&TransportConfig {
        base_url: engine_config.server_url.clone(),
        device_id: engine_config.device_id.clone(),
        access_token: engine_config.access_token.clone(),
        refresh_token: engine_config.refresh_token.clone(),
        upload_limit: engine_config.upload_limit,
        download_limit: engine_config.download_limit,
        ..TransportConfig::default()
    })?;

    let crypto = if engine_config.encrypt_at_rest {
        let password = rpassword::prompt_password("Master key password: ")
            .context("reading password")?;
        Some(EncryptionContext::unlock(
            &engine_config.keys_dir(),
            password.as_bytes(),
        )?)
    } else {
        None
    };

    Ok(SyncEngine::new(engine_config, store, Arc::new(client), crypto))
}

async fn cmd_run(engine_config: EngineConfig) -> Result<()> {
    let engine = build_engine(engine_config)?;
    let _progress = progress::attach(&engine);

    engine.start().await?;
    println!("tidesync running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    engine.stop();
    Ok(())
}

async fn cmd_sync(engine_config: EngineConfig) -> Result<()> {
    let engine = build_engine(engine_config)?;
    let _progress = progress::attach(&engine);

    engine.start().await?;
    let summary = engine.run_pass().await?;
    engine.stop();
    println!(
        "sync complete: {} applied, {} failed, {} drained",
        summary.applied, summary.failed, summary.drained
    );
    Ok(())
}

fn cmd_status(engine_config: &EngineConfig) -> Result<()> {
    let store = StateStore::open(engine_config.store_path())?;

    let shares = store.list_shares()?;
    if shares.is_empty() {
        println!("no shares known yet; run `tidesync sync` first");
        return Ok(());
    }

    for share in shares {
        let stats = store.get_stats(&share.id)?;
        println!("{} ({})", share.name, share.id);
        println!(
            "  synced {}  pending up {}  pending down {}  conflicts {}  errors {}",
            stats.synced, stats.pending_upload, stats.pending_download, stats.conflict,
            stats.error
        );
        println!(
            "  {} bytes total, {} bytes pending",
            stats.total_bytes, stats.pending_bytes
        );
    }

    println!("\nrecent activity:");
    for entry in store.recent_activity(10)? {
        println!(
            "  {} {:<14} {:<8} {} ({} bytes)",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.action,
            entry.status,
            entry.path,
            entry.bytes
        );
    }
    Ok(())
}

fn cmd_conflicts(engine_config: &EngineConfig, command: &ConflictCommands) -> Result<()> {
    let store = StateStore::open(engine_config.store_path())?;
    match command {
        ConflictCommands::List { share_id } => {
            let conflicts = store.list_conflicts(share_id, true)?;
            if conflicts.is_empty() {
                println!("no unresolved conflicts");
            }
            for conflict in conflicts {
                println!(
                    "[{}] {} local {} @ {}  remote {} @ {}",
                    conflict.id,
                    conflict.path,
                    &conflict.local_hash[..conflict.local_hash.len().min(12)],
                    conflict.local_mod_time.format("%Y-%m-%d %H:%M:%S"),
                    &conflict.remote_hash[..conflict.remote_hash.len().min(12)],
                    conflict.remote_mod_time.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        ConflictCommands::Resolve { id, resolution } => {
            let resolution = match resolution.as_str() {
                "keep_local" => ConflictResolution::KeepLocal,
                "keep_remote" => ConflictResolution::KeepRemote,
                "keep_both" => ConflictResolution::KeepBoth,
                "merge" => ConflictResolution::Merge,
                other => bail!("unknown resolution {other}"),
            };
            store.resolve_conflict(*id, resolution)?;
            println!("conflict {id} resolved as {resolution:?}");
        }
    }
    Ok(())
}

fn cmd_keys(engine_config: &EngineConfig, command: &KeyCommands) -> Result<()> {
    let keystore = KeyStore::open(engine_config.keys_dir())?;
    match command {
        KeyCommands::Init => {
            if keystore.is_initialized() {
                bail!("master key already initialized");
            }
            let password = rpassword::prompt_password("New master password: ")?;
            let confirm = rpassword::prompt_password("Confirm master password: ")?;
            if password != confirm {
                bail!("passwords do not match");
            }
            keystore.init_master(password.as_bytes())?;
            println!("master key initialized");
        }
        KeyCommands::ChangePassword => {
            let old = rpassword::prompt_password("Current password: ")?;
            let new = rpassword::prompt_password("New password: ")?;
            let confirm = rpassword::prompt_password("Confirm new password: ")?;
            if new != confirm {
                bail!("passwords do not match");
            }
            keystore.change_password(old.as_bytes(), new.as_bytes())?;
            println!("password changed; share keys unchanged");
        }
        KeyCommands::ShowRecovery => {
            let password = rpassword::prompt_password("Master password: ")?;
            let master = keystore.unlock_master(password.as_bytes())?;
            let recovery = keystore.generate_recovery(&master)?;
            println!("Recovery key (write it down; it will not be shown again):");
            println!("  {recovery}");
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);
    let engine_config = load_config(&cli)?;

    match &cli.command {
        Commands::Status => return cmd_status(&engine_config),
        Commands::Conflicts { command } => return cmd_conflicts(&engine_config, command),
        Commands::Keys { command } => return cmd_keys(&engine_config, command),
        Commands::Run | Commands::Sync => {}
    }

    let runtime = tokio::runtime::Runtime::new().context("starting runtime")?;
    runtime.block_on(async {
        match cli.command {
            Commands::Run => cmd_run(engine_config).await,
            Commands::Sync => cmd_sync(engine_config).await,
            _ => Err(anyhow!("unreachable")),
        }
    })
}
