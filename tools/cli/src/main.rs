//! treesync CLI - Command line interface for persisted state trees.
//!
//! Each command restores a tree from its local snapshot, syncs it with the
//! configured remote, performs one operation and shuts the session down.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use treesync_common::StatePath;
use treesync_state::{MemoryState, Origin, StateStore};
use treesync_storage::{create_default_registry, MemoryStore};
use treesync_sync::{
    FlushOutcome, LocalConfig, ModifiedSpec, PersistConfig, PersistHandle, RemoteConfig,
    SyncEngine,
};

#[derive(Parser)]
#[command(name = "treesync")]
#[command(about = "treesync - Local-first sync for JSON state trees")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Path to the persistence configuration file.
    #[arg(short, long, global = true, default_value = "treesync.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration backed by local files.
    Init {
        /// Directory holding local snapshots.
        #[arg(long)]
        store_dir: PathBuf,

        /// JSON file holding the remote tree.
        #[arg(long)]
        remote_file: PathBuf,

        /// Remote root of the synced tree.
        #[arg(long, default_value = "/state")]
        sync_path: String,

        /// Snapshot key.
        #[arg(long, default_value = "treesync")]
        key: String,

        /// Tracked units as JSON (e.g. '{"todos": "*"}').
        #[arg(long)]
        modified: Option<String>,
    },

    /// Print the value at a path.
    Show {
        /// Path within the tree (default: root).
        #[arg(default_value = "/")]
        path: String,

        /// Only restore the local snapshot.
        #[arg(long)]
        offline: bool,
    },

    /// Set the value at a path and push it to the remote.
    Set {
        /// Path within the tree.
        path: String,

        /// JSON value; `null` deletes.
        value: String,
    },

    /// Print the remote writes a mutation would produce, without sending them.
    Batch {
        /// Path within the tree.
        path: String,

        /// JSON value; `null` deletes.
        value: String,
    },

    /// Push any changes left pending by earlier sessions.
    Push,

    /// Show session status.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init {
            store_dir,
            remote_file,
            sync_path,
            key,
            modified,
        } => {
            cmd_init(
                &cli.config,
                &store_dir,
                &remote_file,
                &sync_path,
                &key,
                modified.as_deref(),
            )
            .await
        }

        Commands::Show { path, offline } => cmd_show(&cli.config, &path, offline).await,

        Commands::Set { path, value } => cmd_set(&cli.config, &path, &value).await,

        Commands::Batch { path, value } => cmd_batch(&cli.config, &path, &value).await,

        Commands::Push => cmd_push(&cli.config).await,

        Commands::Status => cmd_status(&cli.config).await,
    }
}

/// A running session over an in-memory tree.
struct Session {
    state: Arc<MemoryState>,
    handle: PersistHandle,
    remote: bool,
}

impl Session {
    async fn open(config_path: &Path) -> Result<Self> {
        let config = PersistConfig::load(config_path)
            .await
            .with_context(|| format!("Failed to load config {}", config_path.display()))?;
        let remote = config.remote.is_some();

        let state = Arc::new(MemoryState::default());
        let registry = create_default_registry();
        let engine = SyncEngine::from_registry(state.clone(), config, &registry)
            .context("Failed to resolve persistence adapters")?;
        let handle = engine.start().await.context("Failed to start session")?;

        handle.loaded_local().wait().await?;
        Ok(Self {
            state,
            handle,
            remote,
        })
    }

    /// Wait for the first remote snapshot, if a remote is configured.
    async fn wait_remote(&self) -> Result<()> {
        if !self.remote {
            return Ok(());
        }
        tokio::time::timeout(Duration::from_secs(30), self.handle.loaded_remote().wait())
            .await
            .context("Timed out loading the remote tree")??;
        Ok(())
    }

    async fn close(self) -> Result<()> {
        self.handle.settle().await.context("Failed to save snapshot")?;
        self.handle.shutdown().await?;
        Ok(())
    }
}

fn parse_value(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("Invalid JSON value: {}", raw))
}

fn print_outcome(outcome: &FlushOutcome) {
    match outcome {
        FlushOutcome::Idle => println!("Nothing to push."),
        FlushOutcome::Acknowledged { writes, timestamp } => {
            let at = chrono::DateTime::from_timestamp_millis(*timestamp)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| timestamp.to_string());
            println!("Pushed {} write(s) at {}", writes, at);
        }
        FlushOutcome::Retained { reason } => {
            warn!("Remote write failed: {}", reason);
            println!("Changes kept locally: {}", reason);
        }
    }
}

/// Write a new configuration file.
async fn cmd_init(
    config_path: &Path,
    store_dir: &Path,
    remote_file: &Path,
    sync_path: &str,
    key: &str,
    modified: Option<&str>,
) -> Result<()> {
    if config_path.exists() {
        anyhow::bail!("Config {} already exists", config_path.display());
    }

    let spec = match modified {
        Some(raw) => ModifiedSpec::parse(&parse_value(raw)?).context("Invalid tracked units")?,
        None => ModifiedSpec::default(),
    };

    let config = PersistConfig::new()
        .with_local(LocalConfig {
            key: key.to_string(),
            store: "file".to_string(),
            store_config: serde_json::json!({ "root": store_dir.to_string_lossy() }),
        })
        .with_remote(
            RemoteConfig::new(sync_path)
                .with_backend(
                    "file",
                    serde_json::json!({ "path": remote_file.to_string_lossy() }),
                )
                .with_modified(spec),
        );

    tokio::fs::write(config_path, config.to_json()?)
        .await
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    println!("Config written to {}", config_path.display());
    println!("  Snapshots: {}", store_dir.display());
    println!("  Remote: {}", remote_file.display());
    Ok(())
}

/// Print the value at a path.
async fn cmd_show(config_path: &Path, path: &str, offline: bool) -> Result<()> {
    let path = StatePath::parse(path)?;
    let session = Session::open(config_path).await?;
    if !offline {
        session.wait_remote().await?;
    }

    let value = session.state.get(&path).unwrap_or(Value::Null);
    println!("{}", serde_json::to_string_pretty(&value)?);

    session.close().await
}

/// Set a value and push it.
async fn cmd_set(config_path: &Path, path: &str, value: &str) -> Result<()> {
    let path = StatePath::parse(path)?;
    let value = parse_value(value)?;
    let session = Session::open(config_path).await?;
    session.wait_remote().await?;

    info!("Setting {}", path);
    session.state.set(&path, value, Origin::Local);

    let outcome = session.handle.flush().await?;
    print_outcome(&outcome);

    session.close().await
}

/// Show the remote writes a mutation produces.
///
/// Runs against a scratch copy of the local snapshot with a debounce long
/// enough that nothing reaches the remote.
async fn cmd_batch(config_path: &Path, path: &str, value: &str) -> Result<()> {
    let path = StatePath::parse(path)?;
    let value = parse_value(value)?;

    let mut config = PersistConfig::load(config_path)
        .await
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    let registry = create_default_registry();

    let scratch = Arc::new(MemoryStore::new());
    if let Some(local) = &config.local {
        let store = registry.local(&local.store, &local.store_config)?;
        if let Some(bytes) = store.read(&local.key).await? {
            scratch.insert(local.key.clone(), bytes);
        }
    }
    let Some(remote) = config.remote.take() else {
        anyhow::bail!("No remote configured");
    };
    let backend = registry.remote(&remote.backend, &remote.backend_config)?;
    config.remote = Some(remote.with_save_timeout(Duration::from_secs(3600)));

    let state = Arc::new(MemoryState::default());
    let has_local = config.local.is_some();
    let mut engine = SyncEngine::new(state.clone(), config).with_remote(backend);
    if has_local {
        engine = engine.with_local(scratch);
    }
    let handle = engine.start().await.context("Failed to start session")?;
    let session = Session {
        state,
        handle,
        remote: true,
    };
    session.wait_remote().await?;

    session.state.set(&path, value, Origin::Local);
    let batch = session
        .handle
        .pending_batch()
        .await
        .context("Failed to build the pending batch")?;

    if batch.is_empty() {
        println!("No remote writes.");
    }
    for (remote_path, value) in &batch {
        println!("{} = {}", remote_path, value);
    }

    session.handle.shutdown().await?;
    Ok(())
}

/// Push pending changes restored from the local snapshot.
async fn cmd_push(config_path: &Path) -> Result<()> {
    let session = Session::open(config_path).await?;
    session.wait_remote().await?;

    let outcome = session.handle.flush().await?;
    print_outcome(&outcome);

    session.close().await
}

/// Show session status.
async fn cmd_status(config_path: &Path) -> Result<()> {
    let session = Session::open(config_path).await?;
    session.wait_remote().await?;

    let status = session.handle.status().await?;
    println!("Session Status:");
    println!("  Save state: {:?}", status.save_state);
    println!("  Local loaded: {}", status.loaded_local);
    println!("  Remote loaded: {}", status.loaded_remote);
    println!("  Pending entries: {}", status.pending_entries);
    println!("  Failures: {}", status.failure_count);
    if let Some(error) = &status.last_error {
        println!("  Last error: {}", error);
    }

    session.close().await
}
