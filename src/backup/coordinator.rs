// ============================================================================
// Backup Coordinator
// ============================================================================
//
// A backup is consistent when its state snapshot reflects exactly the log up
// to the checkpoint position. `take_snapshot` therefore runs on the partition
// actor right after the CHECKPOINT:CREATE command committed and before the
// next record is processed: it writes the state snapshot and the log copy
// into a staging directory. Uploading the staged files to the store happens
// afterwards and may take as long as it needs.
//
// ============================================================================

use super::status::{Backup, BackupDescriptor, BackupIdentifier, BackupStatus, BackupStatusCode, NamedFileSet};
use super::store::{BackupStore, completed_descriptor};
use crate::config::StorageConfig;
use crate::core::{EngineError, Position, Result};
use crate::log::{LOG_FILE_NAME, LogStream};
use crate::processing::{LOG_DIR, STATE_DIR, StreamProcessor};
use crate::storage::{DurabilityMode, StateDb};
use crate::state::CheckpointState;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

pub const STATE_SNAPSHOT_FILE: &str = "state.snapshot";
pub const LOG_SEGMENT_FILE: &str = "records.log";

/// Files staged for a backup that still has to reach the store.
pub struct PendingBackup {
    pub backup: Backup,
    staging: TempDir,
}

impl PendingBackup {
    pub fn staging_dir(&self) -> &Path {
        self.staging.path()
    }
}

pub struct BackupCoordinator {
    store: Arc<dyn BackupStore>,
    node_id: String,
    staging_root: PathBuf,
}

impl BackupCoordinator {
    pub fn new(store: Arc<dyn BackupStore>, node_id: impl Into<String>, staging_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            node_id: node_id.into(),
            staging_root: staging_root.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn BackupStore> {
        &self.store
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Stages the snapshot of `checkpoint_id`. Must run before the processor
    /// handles the next command.
    pub fn take_snapshot(
        &self,
        processor: &StreamProcessor,
        checkpoint_id: i64,
        partition_count: u32,
    ) -> Result<PendingBackup> {
        let checkpoint = processor.state().checkpoint.get_checkpoint(processor.db())?;
        if checkpoint.checkpoint_id != checkpoint_id {
            return Err(EngineError::Backup(format!(
                "Expected checkpoint {} on partition {}, but the state holds checkpoint {}",
                checkpoint_id,
                processor.partition_id(),
                checkpoint.checkpoint_id
            )));
        }

        std::fs::create_dir_all(&self.staging_root)
            .map_err(|e| EngineError::Backup(format!("Failed to create staging root: {}", e)))?;
        let staging = tempfile::Builder::new()
            .prefix(&format!("backup-{}-{}-", processor.partition_id(), checkpoint_id))
            .tempdir_in(&self.staging_root)
            .map_err(|e| EngineError::Backup(format!("Failed to create staging directory: {}", e)))?;

        let snapshot_path = staging.path().join(STATE_SNAPSHOT_FILE);
        processor.db().write_snapshot(&snapshot_path)?;
        let log_position = processor.log().last_position();
        let log_path = staging.path().join(LOG_SEGMENT_FILE);
        processor.log().write_segment(&log_path, log_position)?;

        let mut files = NamedFileSet::new();
        files.insert(STATE_SNAPSHOT_FILE, snapshot_path);
        files.insert(LOG_SEGMENT_FILE, log_path);

        tracing::info!(
            partition = processor.partition_id(),
            checkpoint_id,
            checkpoint_position = checkpoint.checkpoint_position,
            log_position,
            "backup snapshot staged"
        );

        Ok(PendingBackup {
            backup: Backup {
                id: BackupIdentifier::new(self.node_id.clone(), processor.partition_id(), checkpoint_id),
                descriptor: BackupDescriptor {
                    snapshot_id: Uuid::new_v4(),
                    checkpoint_position: checkpoint.checkpoint_position,
                    log_position,
                    partition_count,
                },
                files,
            },
            staging,
        })
    }

    /// Uploads a staged backup. A failed upload is recorded as FAILED.
    pub async fn complete(&self, pending: PendingBackup) -> Result<BackupStatus> {
        let id = pending.backup.id.clone();
        let existing = self.store.get_status(&id).await?;
        if matches!(existing.status, BackupStatusCode::InProgress | BackupStatusCode::Completed) {
            return Err(EngineError::Backup(format!(
                "Backup {} already exists with status {}",
                id, existing.status
            )));
        }
        match self.store.save(&pending.backup).await {
            Ok(status) => Ok(status),
            Err(err) => {
                tracing::error!(backup = %id, error = %err, "backup upload failed");
                self.store.mark_failed(&id, &err.to_string()).await?;
                Err(err)
            }
        }
    }
}

/// Where a restored partition resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoredPartition {
    pub checkpoint_id: i64,
    pub checkpoint_position: Position,
    pub log_position: Position,
}

/// Materializes a completed backup as the data directory of a partition.
/// Opening a `StreamProcessor` on `partition_dir` afterwards replays the log
/// suffix after the checkpoint position.
pub async fn restore_partition(
    store: &dyn BackupStore,
    id: &BackupIdentifier,
    partition_dir: &Path,
    storage: &StorageConfig,
) -> Result<RestoredPartition> {
    if storage.durability == DurabilityMode::None {
        return Err(EngineError::Config(
            "Restoring needs a durable storage configuration".to_string(),
        ));
    }
    if partition_dir.exists()
        && std::fs::read_dir(partition_dir)
            .map_err(|e| EngineError::Backup(format!("Failed to inspect target: {}", e)))?
            .next()
            .is_some()
    {
        return Err(EngineError::Backup(format!(
            "Restore target {} is not empty",
            partition_dir.display()
        )));
    }

    let descriptor = completed_descriptor(store, id).await?;
    let staging = partition_dir.join(".restore");
    let files = store.restore(id, &staging).await?;
    let snapshot = files
        .get(STATE_SNAPSHOT_FILE)
        .ok_or_else(|| EngineError::Backup(format!("Backup {} has no state snapshot", id)))?;
    let segment = files
        .get(LOG_SEGMENT_FILE)
        .ok_or_else(|| EngineError::Backup(format!("Backup {} has no log segment", id)))?;

    let mut db = StateDb::open(partition_dir.join(STATE_DIR), storage)?;
    db.restore_snapshot(snapshot)?;
    let checkpoint = CheckpointState.get_checkpoint(&db)?;
    if checkpoint.checkpoint_id != id.checkpoint_id {
        return Err(EngineError::Corruption(format!(
            "Backup {} holds state of checkpoint {}",
            id, checkpoint.checkpoint_id
        )));
    }
    drop(db);

    let log_dir = partition_dir.join(LOG_DIR);
    std::fs::create_dir_all(&log_dir)
        .map_err(|e| EngineError::Backup(format!("Failed to create log directory: {}", e)))?;
    std::fs::copy(segment, log_dir.join(LOG_FILE_NAME))
        .map_err(|e| EngineError::Backup(format!("Failed to restore log: {}", e)))?;
    // Reject a log copy that does not decode before anyone opens the partition.
    LogStream::open(&log_dir, id.partition_id, storage.durability)?;
    std::fs::remove_dir_all(&staging)
        .map_err(|e| EngineError::Backup(format!("Failed to remove restore staging: {}", e)))?;

    tracing::info!(
        backup = %id,
        checkpoint_position = checkpoint.checkpoint_position,
        "partition restored"
    );
    Ok(RestoredPartition {
        checkpoint_id: checkpoint.checkpoint_id,
        checkpoint_position: checkpoint.checkpoint_position,
        log_position: descriptor.log_position,
    })
}
