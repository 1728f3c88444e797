use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use stateflow::backup::{BackupIdentifier, BackupStore, FileSystemBackupStore, restore_partition};
use stateflow::partition::PartitionStatus;
use stateflow::{Engine, EngineConfig, ProcessingConfig, StorageConfig, StreamProcessor};
use std::io;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "stateflow-tool")]
#[command(about = "Developer tooling for stateflow partitions and backups")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print checkpoint, routing and job counts of a partition data directory.
    Inspect {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        partition: u32,
    },
    /// List the backups below a backup root.
    Backups {
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        partition: Option<u32>,
    },
    /// Materialize a completed backup as a partition data directory.
    Restore {
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        node: String,
        #[arg(long)]
        partition: u32,
        #[arg(long)]
        checkpoint: i64,
        #[arg(long)]
        target: PathBuf,
    },
    /// Run an engine from a JSON config until Ctrl-C.
    Run {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Inspect { dir, partition } => inspect(&dir, partition),
        Command::Backups { root, partition } => list_backups(&root, partition).await,
        Command::Restore {
            root,
            node,
            partition,
            checkpoint,
            target,
        } => restore(&root, BackupIdentifier::new(node, partition, checkpoint), &target).await,
        Command::Run { config } => run(&config).await,
    }
}

fn inspect(dir: &Path, partition: u32) -> Result<()> {
    if !dir.exists() {
        return Err(anyhow!("Partition directory '{}' does not exist", dir.display()));
    }
    let processor = StreamProcessor::open(partition, dir, &StorageConfig::default(), ProcessingConfig::default())
        .with_context(|| format!("Failed to open partition {} in '{}'", partition, dir.display()))?;
    let status = PartitionStatus::collect(&processor).context("Failed to read partition state")?;
    let rendered = serde_json::to_string_pretty(&status).context("Failed to render partition status")?;
    println!("{}", rendered);
    Ok(())
}

async fn list_backups(root: &Path, partition: Option<u32>) -> Result<()> {
    let store = FileSystemBackupStore::new(root);
    let statuses = store
        .list(partition)
        .await
        .with_context(|| format!("Failed to list backups below '{}'", root.display()))?;
    if statuses.is_empty() {
        println!("No backups found in '{}'", root.display());
        return Ok(());
    }
    for status in statuses {
        let position = status
            .descriptor
            .as_ref()
            .map(|descriptor| descriptor.checkpoint_position.to_string())
            .unwrap_or_else(|| "-".to_string());
        let modified = status
            .last_modified
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<40} {:<12} position={:<10} modified={}{}",
            status.id.to_string(),
            status.status.to_string(),
            position,
            modified,
            status
                .failure_reason
                .map(|reason| format!(" reason={}", reason))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn restore(root: &Path, id: BackupIdentifier, target: &Path) -> Result<()> {
    let store = FileSystemBackupStore::new(root);
    let restored = restore_partition(&store, &id, target, &StorageConfig::default())
        .await
        .with_context(|| format!("Failed to restore backup {} into '{}'", id, target.display()))?;
    println!(
        "Restored backup {} (checkpoint position {}, log position {}) into {}",
        id,
        restored.checkpoint_position,
        restored.log_position,
        target.display()
    );
    Ok(())
}

async fn run(config_path: &Path) -> Result<()> {
    let config = EngineConfig::load_from_file(config_path)
        .with_context(|| format!("Failed to load config '{}'", config_path.display()))?;
    let engine = Engine::start(config).await.context("Failed to start engine")?;
    println!(
        "Engine running with {} partitions, press Ctrl-C to stop",
        engine.partition_count()
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    engine.shutdown().await.context("Failed to stop engine")?;
    Ok(())
}
