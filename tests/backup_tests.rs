//! Backup staging, upload and restore against the file system store

use stateflow::backup::{
    BackupCoordinator, BackupIdentifier, BackupStatusCode, BackupStore, FileSystemBackupStore, restore_partition,
};
use stateflow::config::{ProcessingConfig, StorageConfig};
use stateflow::processing::{PostCommitTask, StreamProcessor};
use stateflow::protocol::{CheckpointIntent, CheckpointRecord, CheckpointType, Intent, JobIntent, JobRecord, UnwrittenRecord};
use stateflow::storage::DurabilityMode;
use stateflow::Position;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn storage() -> StorageConfig {
    StorageConfig {
        durability: DurabilityMode::Sync,
        ..StorageConfig::default()
    }
}

fn open(dir: &Path) -> StreamProcessor {
    StreamProcessor::open(1, dir, &storage(), ProcessingConfig::default()).unwrap()
}

fn create_job(processor: &mut StreamProcessor, job_type: &str) {
    let command = UnwrittenRecord::new_command(Intent::Job(JobIntent::Create), JobRecord::new(job_type, 1));
    processor.process_command(command).unwrap();
}

/// Creates checkpoint `id` and returns its position.
fn checkpoint(processor: &mut StreamProcessor, id: i64) -> Position {
    let command = UnwrittenRecord::new_command(
        Intent::Checkpoint(CheckpointIntent::Create),
        CheckpointRecord::new(id, CheckpointType::ManualBackup),
    );
    let run = processor.process_command(command).unwrap();
    let processed = run
        .processed
        .iter()
        .find(|processed| processed.command.position == run.submitted)
        .unwrap();
    assert!(matches!(
        processed.tasks.as_slice(),
        [PostCommitTask::TakeBackup { checkpoint_id, .. }] if *checkpoint_id == id
    ));
    run.submitted
}

struct Fixture {
    _root: TempDir,
    store: Arc<FileSystemBackupStore>,
    coordinator: BackupCoordinator,
    partition_dir: std::path::PathBuf,
    restore_dir: std::path::PathBuf,
}

fn fixture() -> Fixture {
    let root = TempDir::new().unwrap();
    let store = Arc::new(FileSystemBackupStore::new(root.path().join("backups")));
    let coordinator = BackupCoordinator::new(store.clone(), "node-a", root.path().join("staging"));
    Fixture {
        partition_dir: root.path().join("partition-1"),
        restore_dir: root.path().join("restored"),
        store,
        coordinator,
        _root: root,
    }
}

#[tokio::test]
async fn test_backup_restores_state_at_the_checkpoint() {
    let fx = fixture();
    let mut processor = open(&fx.partition_dir);
    processor.initialize_routing(1).unwrap();
    create_job(&mut processor, "mail");
    create_job(&mut processor, "mail");
    let position = checkpoint(&mut processor, 5);
    let digest = processor.db().content_digest();

    let pending = fx.coordinator.take_snapshot(&processor, 5, 1).unwrap();
    // processing continues while the upload runs
    create_job(&mut processor, "mail");

    let status = fx.coordinator.complete(pending).await.unwrap();
    assert_eq!(status.status, BackupStatusCode::Completed);
    assert_eq!(status.descriptor.as_ref().unwrap().checkpoint_position, position);
    assert_eq!(status.descriptor.as_ref().unwrap().partition_count, 1);

    let listed = fx.store.list(Some(1)).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, BackupIdentifier::new("node-a", 1, 5));
    assert!(fx.store.list(Some(2)).await.unwrap().is_empty());

    let restored = restore_partition(fx.store.as_ref(), &listed[0].id, &fx.restore_dir, &storage())
        .await
        .unwrap();
    assert_eq!(restored.checkpoint_id, 5);
    assert_eq!(restored.checkpoint_position, position);

    let reopened = open(&fx.restore_dir);
    assert_eq!(reopened.db().content_digest(), digest);
    assert_eq!(reopened.last_processed_position(), position);
    let counts = reopened.state().jobs.job_type_counts(reopened.db()).unwrap();
    assert_eq!(counts["mail"].activatable, 2);
}

#[tokio::test]
async fn test_completed_backup_is_not_overwritten() {
    let fx = fixture();
    let mut processor = open(&fx.partition_dir);
    checkpoint(&mut processor, 1);

    let first = fx.coordinator.take_snapshot(&processor, 1, 1).unwrap();
    let second = fx.coordinator.take_snapshot(&processor, 1, 1).unwrap();
    fx.coordinator.complete(first).await.unwrap();
    assert!(fx.coordinator.complete(second).await.is_err());

    let status = fx.store.get_status(&BackupIdentifier::new("node-a", 1, 1)).await.unwrap();
    assert_eq!(status.status, BackupStatusCode::Completed);
}

#[tokio::test]
async fn test_snapshot_of_another_checkpoint_is_refused() {
    let fx = fixture();
    let mut processor = open(&fx.partition_dir);
    checkpoint(&mut processor, 3);

    assert!(fx.coordinator.take_snapshot(&processor, 2, 1).is_err());
}

#[tokio::test]
async fn test_failed_backup_cannot_be_restored() {
    let fx = fixture();
    let id = BackupIdentifier::new("node-a", 1, 9);

    assert_eq!(fx.store.get_status(&id).await.unwrap().status, BackupStatusCode::NotStarted);
    let status = fx.store.mark_failed(&id, "disk full").await.unwrap();
    assert_eq!(status.status, BackupStatusCode::Failed);
    assert_eq!(status.failure_reason.as_deref(), Some("disk full"));

    assert!(restore_partition(fx.store.as_ref(), &id, &fx.restore_dir, &storage()).await.is_err());
    assert!(!fx.restore_dir.exists());
}

#[tokio::test]
async fn test_restore_refuses_non_empty_target() {
    let fx = fixture();
    let mut processor = open(&fx.partition_dir);
    checkpoint(&mut processor, 1);
    let pending = fx.coordinator.take_snapshot(&processor, 1, 1).unwrap();
    fx.coordinator.complete(pending).await.unwrap();

    std::fs::create_dir_all(&fx.restore_dir).unwrap();
    std::fs::write(fx.restore_dir.join("leftover"), b"x").unwrap();
    let id = BackupIdentifier::new("node-a", 1, 1);
    assert!(restore_partition(fx.store.as_ref(), &id, &fx.restore_dir, &storage()).await.is_err());

    // an in-memory configuration cannot hold a restored partition
    let empty = fx.restore_dir.with_file_name("in-memory");
    assert!(restore_partition(fx.store.as_ref(), &id, &empty, &StorageConfig::in_memory()).await.is_err());
}

#[tokio::test]
async fn test_delete_removes_backup() {
    let fx = fixture();
    let mut processor = open(&fx.partition_dir);
    checkpoint(&mut processor, 4);
    let pending = fx.coordinator.take_snapshot(&processor, 4, 1).unwrap();
    let status = fx.coordinator.complete(pending).await.unwrap();

    fx.store.delete(&status.id).await.unwrap();
    assert_eq!(fx.store.get_status(&status.id).await.unwrap().status, BackupStatusCode::NotStarted);
    // deleting twice is fine
    fx.store.delete(&status.id).await.unwrap();
}
