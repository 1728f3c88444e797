// ============================================================================
// Engine Configuration
// ============================================================================
//
// Nested policy structs, each with serde defaults, so a JSON file only needs
// to name the values it changes.
//
// ============================================================================

use crate::core::{EngineError, MAX_PARTITION_ID, Result};
use crate::storage::DurabilityMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// State store durability and checking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub durability: DurabilityMode,
    /// Verify insert/update preconditions and foreign keys on every write.
    pub consistency_checks: bool,
    /// Rewrite the state snapshot and truncate the WAL after this many commits.
    pub snapshot_every_commits: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            durability: DurabilityMode::Async,
            consistency_checks: true,
            snapshot_every_commits: 1_000,
        }
    }
}

impl StorageConfig {
    pub fn in_memory() -> Self {
        Self {
            durability: DurabilityMode::None,
            ..Self::default()
        }
    }
}

/// Scheduled sweeps that inject commands into the processing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub job_timeout_check_interval_ms: u64,
    pub job_backoff_check_interval_ms: u64,
    pub message_ttl_check_interval_ms: u64,
    /// Upper bound of commands one sweep injects.
    pub sweep_batch_limit: usize,
    /// Maximum jobs a single JOB_BATCH:ACTIVATE may hand out.
    pub max_jobs_per_batch: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            job_timeout_check_interval_ms: 1_000,
            job_backoff_check_interval_ms: 1_000,
            message_ttl_check_interval_ms: 60_000,
            sweep_batch_limit: 1_000,
            max_jobs_per_batch: 1_000,
        }
    }
}

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 10,
            max_backoff_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let base = self.initial_backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor).min(max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ExporterConfig {
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BackupConfig {
    /// Root directory of the file system backup store. Backups are disabled when unset.
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub node_id: String,
    pub partition_count: u32,
    /// One sub-directory per partition is created below this path.
    pub data_dir: PathBuf,
    pub request_channel_capacity: usize,
    pub storage: StorageConfig,
    pub processing: ProcessingConfig,
    pub exporter: ExporterConfig,
    pub backup: BackupConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: "node-0".to_string(),
            partition_count: 1,
            data_dir: PathBuf::from("data"),
            request_channel_capacity: 1_024,
            storage: StorageConfig::default(),
            processing: ProcessingConfig::default(),
            exporter: ExporterConfig::default(),
            backup: BackupConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config: EngineConfig = serde_json::from_str(&raw).map_err(|e| {
            EngineError::Config(format!("Failed to parse config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.partition_count == 0 || self.partition_count > MAX_PARTITION_ID {
            return Err(EngineError::Config(format!(
                "partition_count must be between 1 and {}, got {}",
                MAX_PARTITION_ID, self.partition_count
            )));
        }
        if self.request_channel_capacity == 0 {
            return Err(EngineError::Config(
                "request_channel_capacity must be positive".to_string(),
            ));
        }
        if self.processing.sweep_batch_limit == 0 || self.processing.max_jobs_per_batch == 0 {
            return Err(EngineError::Config(
                "sweep_batch_limit and max_jobs_per_batch must be positive".to_string(),
            ));
        }
        if self.exporter.retry.max_attempts == 0 {
            return Err(EngineError::Config(
                "exporter.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn partition_dir(&self, partition_id: u32) -> PathBuf {
        self.data_dir.join(format!("partition-{}", partition_id))
    }
}
