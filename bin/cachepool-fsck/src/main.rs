//! cachepool fsck - Replica consistency checker
//!
//! Reconciles the replicas of one pool against its metadata and the
//! namespace, either all at once (as on pool startup) or by identifier.

use anyhow::{Context, Result};
use cachepool_client::HttpNamespaceClient;
use cachepool_common::{Config, FileId, ReplicaRecord};
use cachepool_repository::{
    ConsistencyReconciler, DirectoryFileStore, PoolAllocator, RedbReplicaStore, ReplicaScanner,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cachepool-fsck")]
#[command(about = "Check and repair cachepool replicas")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/cachepool/pool.toml")]
    config: String,

    /// Pool data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Pool name registered with the namespace
    #[arg(long)]
    pool_name: Option<String>,

    /// Namespace service URL
    #[arg(long, env = "CACHEPOOL_NAMESPACE_URL")]
    namespace_url: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile every replica in the pool
    Scan {
        /// Parallel reconciliations
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Reconcile the given replicas
    Check {
        #[arg(required = true)]
        ids: Vec<FileId>,
    },
    /// Delete the given replicas from the pool
    Remove {
        #[arg(required = true)]
        ids: Vec<FileId>,
    },
}

/// Load the config file if it exists, then apply CLI overrides
fn load_config(args: &Args) -> Result<Config> {
    let mut config: Config = if Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)?;
        toml::from_str(&config_str)
            .with_context(|| format!("failed to parse config file {}", args.config))?
    } else {
        Config::default()
    };

    // CLI takes precedence
    if let Some(data_dir) = &args.data_dir {
        config.pool.data_dir = data_dir.clone();
    }
    if let Some(name) = &args.pool_name {
        config.pool.name = name.clone();
    }
    if let Some(url) = &args.namespace_url {
        config.namespace.url = url.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Command::Scan {
        concurrency: Some(concurrency),
    } = args.command
    {
        config.pool.scan_concurrency = concurrency;
    }

    config.validate()?;
    Ok(config)
}

fn open_pool(config: &Config) -> Result<Arc<ConsistencyReconciler>> {
    let files = DirectoryFileStore::open(config.pool.replica_dir())?;
    let records = RedbReplicaStore::open(config.pool.metadata_path())?;
    let namespace = HttpNamespaceClient::from_config(&config.namespace)?;
    let allocator = PoolAllocator::new(config.pool.capacity);

    let reconciler = ConsistencyReconciler::new(
        config.pool.name.clone(),
        Arc::new(files),
        Arc::new(records),
        Arc::new(namespace),
        Arc::new(allocator),
    )
    .with_config(config.reconciler.clone());
    Ok(Arc::new(reconciler))
}

fn describe(record: &ReplicaRecord) -> String {
    let size = record
        .size()
        .map_or_else(|| "unknown size".to_string(), |s| format!("{} bytes", s));
    match &record.attributes.storage_class {
        Some(class) => format!("{} {} ({})", record.state, size, class),
        None => format!("{} {}", record.state, size),
    }
}

/// Run a command, returns whether every replica was handled
async fn execute(
    command: &Command,
    reconciler: Arc<ConsistencyReconciler>,
    concurrency: usize,
) -> Result<bool> {
    match command {
        Command::Scan { .. } => {
            let report = ReplicaScanner::new(reconciler, concurrency).scan().await?;
            println!("Checked:   {}", report.checked);
            println!("Kept:      {}", report.kept);
            println!("Broken:    {}", report.broken);
            println!("Discarded: {}", report.discarded);
            println!("Bytes:     {}", report.bytes);
            for (id, e) in &report.failed {
                println!("FAILED {}: {}", id, e);
            }
            Ok(report.is_clean())
        }
        Command::Check { ids } => {
            let mut clean = true;
            for id in ids {
                match reconciler.get(id).await {
                    Ok(Some(record)) => println!("{}: {}", id, describe(&record)),
                    Ok(None) => println!("{}: not present", id),
                    Err(e) => {
                        error!("Failed to check {}: {}", id, e);
                        println!("{}: FAILED ({})", id, e);
                        clean = false;
                    }
                }
            }
            Ok(clean)
        }
        Command::Remove { ids } => {
            let mut clean = true;
            for id in ids {
                if let Err(e) = reconciler.remove(id).await {
                    error!("Failed to remove {}: {}", id, e);
                    clean = false;
                }
            }
            Ok(clean)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Pool: {}", config.pool.name);
    info!("Data directory: {}", config.pool.data_dir.display());
    info!("Namespace: {}", config.namespace.url);

    let reconciler = open_pool(&config)?;
    let clean = execute(&args.command, reconciler, config.pool.scan_concurrency).await?;
    if !clean {
        std::process::exit(1);
    }
    Ok(())
}
