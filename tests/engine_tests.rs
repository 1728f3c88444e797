//! End-to-end tests through the engine and its partition actors

use stateflow::backup::{BackupStatusCode, BackupStore, FileSystemBackupStore};
use stateflow::config::{BackupConfig, EngineConfig, ProcessingConfig, StorageConfig};
use stateflow::core::{PartitionId, decode_partition_id, encode_partition_id};
use stateflow::exporter::RecordingExporter;
use stateflow::partition::CommandResponse;
use stateflow::processing::ScheduledSweep;
use stateflow::protocol::{
    CheckpointIntent, CheckpointType, Intent, JobBatchRecord, JobIntent, JobRecord, MessageIntent, MessageRecord,
    RejectionType, UnwrittenRecord,
};
use stateflow::state::hash_mod_partition;
use stateflow::storage::DurabilityMode;
use stateflow::Engine;
use std::time::Duration;
use tempfile::TempDir;

const HOUR_MS: u64 = 3_600_000;

fn config(dir: &TempDir, partition_count: u32) -> EngineConfig {
    EngineConfig {
        node_id: "node-test".to_string(),
        partition_count,
        data_dir: dir.path().join("data"),
        storage: StorageConfig {
            durability: DurabilityMode::Sync,
            ..StorageConfig::default()
        },
        // sweeps only run when a test asks for them
        processing: ProcessingConfig {
            job_timeout_check_interval_ms: HOUR_MS,
            job_backoff_check_interval_ms: HOUR_MS,
            message_ttl_check_interval_ms: HOUR_MS,
            ..ProcessingConfig::default()
        },
        ..EngineConfig::default()
    }
}

fn correlation_key_for(partition_id: PartitionId, count: u32) -> String {
    (0..)
        .map(|i| format!("order-{}", i))
        .find(|key| hash_mod_partition(key.as_bytes(), count) == partition_id)
        .unwrap()
}

fn event_intent(response: &CommandResponse) -> Intent {
    response.event().map(|record| record.intent).unwrap()
}

#[tokio::test]
async fn test_job_round_trip_through_engine() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::start(config(&dir, 1)).await.unwrap();

    let created = engine.create_job(JobRecord::new("payment", 3)).await.unwrap();
    assert_eq!(event_intent(&created), Intent::Job(JobIntent::Created));
    let key = created.event().unwrap().key;
    assert_eq!(key, encode_partition_id(1, 1));

    let activated = engine
        .activate_jobs(1, JobBatchRecord::new("payment", "worker-1", 60_000, 10))
        .await
        .unwrap();
    let batch = activated.event().unwrap().as_job_batch().unwrap().clone();
    assert_eq!(batch.job_keys, vec![key]);

    let completed = engine
        .job_command(JobIntent::Complete, key, JobRecord::new("payment", 3))
        .await
        .unwrap();
    assert_eq!(event_intent(&completed), Intent::Job(JobIntent::Completed));

    let again = engine
        .job_command(JobIntent::Complete, key, JobRecord::new("payment", 3))
        .await
        .unwrap();
    let CommandResponse::Rejected { rejection_type, .. } = again else {
        panic!("Expected a rejection, got {:?}", again);
    };
    assert_eq!(rejection_type, RejectionType::NotFound);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_jobs_are_spread_over_partitions() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::start(config(&dir, 3)).await.unwrap();

    let mut partitions = Vec::new();
    for _ in 0..6 {
        let created = engine.create_job(JobRecord::new("mail", 1)).await.unwrap();
        partitions.push(decode_partition_id(created.event().unwrap().key));
    }
    partitions.sort();
    assert_eq!(partitions, vec![1, 1, 2, 2, 3, 3]);

    let statuses = engine.status().await.unwrap();
    assert!(statuses.iter().all(|status| status.activatable_jobs() == 2));
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_publish_lands_on_owning_partition() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::start(config(&dir, 2)).await.unwrap();
    let key = correlation_key_for(2, 2);

    let response = engine
        .publish_message(MessageRecord::new("paid", key.clone(), 60_000))
        .await
        .unwrap();
    assert_eq!(event_intent(&response), Intent::Message(MessageIntent::Published));
    assert_eq!(decode_partition_id(response.event().unwrap().key), 2);

    // a publish sent to the wrong partition is handed over
    let command = UnwrittenRecord::new_command(
        Intent::Message(MessageIntent::Publish),
        MessageRecord::new("paid", key, 60_000),
    );
    let response = engine.submit(1, command).await.unwrap();
    assert_eq!(response, CommandResponse::Forwarded { partition_id: 2 });

    let mut stored = 0;
    for _ in 0..100 {
        stored = engine.partition(2).unwrap().status().await.unwrap().message_count;
        if stored == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stored, 2);
    assert_eq!(engine.partition(1).unwrap().status().await.unwrap().message_count, 0);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_checkpoint_backs_up_every_partition() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, 2);
    config.backup = BackupConfig {
        root: Some(dir.path().join("backups")),
    };
    let engine = Engine::start(config).await.unwrap();
    engine.create_job(JobRecord::new("mail", 1)).await.unwrap();

    let responses = engine.checkpoint(7, CheckpointType::ManualBackup).await.unwrap();
    assert_eq!(responses.len(), 2);
    assert!(
        responses
            .values()
            .all(|response| event_intent(response) == Intent::Checkpoint(CheckpointIntent::Created))
    );

    let statuses = engine.wait_for_backups().await.unwrap();
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|status| status.status == BackupStatusCode::Completed));

    let store = FileSystemBackupStore::new(dir.path().join("backups"));
    let listed = store.list(None).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|status| status.id.node_id == "node-test" && status.id.checkpoint_id == 7));

    // an older id is ignored and takes no backup
    let responses = engine.checkpoint(6, CheckpointType::ManualBackup).await.unwrap();
    assert!(
        responses
            .values()
            .all(|response| event_intent(response) == Intent::Checkpoint(CheckpointIntent::Ignored))
    );
    assert!(engine.wait_for_backups().await.unwrap().is_empty());

    let status = engine.partition(1).unwrap().status().await.unwrap();
    assert_eq!(status.checkpoint.checkpoint_id, 7);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_finished_uploads_are_released_but_still_reported() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, 1);
    config.backup = BackupConfig {
        root: Some(dir.path().join("backups")),
    };
    let engine = Engine::start(config).await.unwrap();

    for checkpoint_id in 1..=5 {
        engine.create_job(JobRecord::new("mail", 1)).await.unwrap();
        engine.checkpoint(checkpoint_id, CheckpointType::ManualBackup).await.unwrap();
    }

    let mut in_flight = usize::MAX;
    for _ in 0..200 {
        in_flight = engine.partition(1).unwrap().status().await.unwrap().backups_in_flight;
        if in_flight == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(in_flight, 0);

    let statuses = engine.wait_for_backups().await.unwrap();
    let mut ids: Vec<i64> = statuses.iter().map(|status| status.id.checkpoint_id).collect();
    ids.sort();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert!(statuses.iter().all(|status| status.status == BackupStatusCode::Completed));
    assert!(engine.wait_for_backups().await.unwrap().is_empty());
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_scale_up_survives_restart() {
    let dir = TempDir::new().unwrap();
    let mut engine = Engine::start(config(&dir, 1)).await.unwrap();
    engine.scale_up(2).await.unwrap();
    assert_eq!(engine.partition_ids(), vec![1, 2]);
    assert_eq!(engine.partition_count(), 2);

    let status = engine.partition(1).unwrap().status().await.unwrap();
    assert_eq!(status.current_partitions, vec![1, 2]);
    assert_eq!(status.desired_partitions, Some(vec![1, 2]));

    let key = correlation_key_for(2, 2);
    let response = engine.publish_message(MessageRecord::new("paid", key, 60_000)).await.unwrap();
    assert_eq!(decode_partition_id(response.event().unwrap().key), 2);

    // retrying a finished scale-up is refused
    assert!(engine.scale_up(2).await.is_err());
    engine.shutdown().await.unwrap();

    // the config still says one partition, the routing state says two
    let engine = Engine::start(config(&dir, 1)).await.unwrap();
    assert_eq!(engine.partition_ids(), vec![1, 2]);
    assert_eq!(engine.partition_count(), 2);
    assert_eq!(engine.partition(2).unwrap().status().await.unwrap().message_count, 1);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_keeps_jobs_and_keys() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::start(config(&dir, 1)).await.unwrap();
    engine.create_job(JobRecord::new("mail", 1)).await.unwrap();
    engine.shutdown().await.unwrap();

    let engine = Engine::start(config(&dir, 1)).await.unwrap();
    let status = engine.partition(1).unwrap().status().await.unwrap();
    assert_eq!(status.job_counts["mail"].activatable, 1);

    let created = engine.create_job(JobRecord::new("mail", 1)).await.unwrap();
    assert_eq!(created.event().unwrap().key, encode_partition_id(1, 2));
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_exporter_sees_records_and_sweeps_run_on_request() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::start(config(&dir, 1)).await.unwrap();
    let exporter = RecordingExporter::new("recorder");
    engine.add_exporter(1, Box::new(exporter.clone())).await.unwrap();

    let publish = UnwrittenRecord::new_command(
        Intent::Message(MessageIntent::Publish),
        MessageRecord::new("paid", "order-1", 1_000),
    )
    .with_timestamp(100);
    engine.submit(1, publish).await.unwrap();

    assert_eq!(engine.run_sweep(ScheduledSweep::MessageTtl, 1_099).await.unwrap(), 0);
    assert_eq!(engine.run_sweep(ScheduledSweep::MessageTtl, 1_100).await.unwrap(), 1);

    let status = engine.partition(1).unwrap().status().await.unwrap();
    assert_eq!(status.message_count, 0);
    assert_eq!(status.exporter_positions["recorder"], status.log_position);

    let records = exporter.records().unwrap();
    let positions: Vec<i64> = records.iter().map(|record| record.position).collect();
    assert_eq!(positions, (1..=status.log_position).collect::<Vec<_>>());
    assert_eq!(records.last().unwrap().intent, Intent::Message(MessageIntent::Expired));
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_partition_is_unavailable() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::start(config(&dir, 1)).await.unwrap();
    let command = UnwrittenRecord::new_command(Intent::Job(JobIntent::Create), JobRecord::new("mail", 1));
    assert!(engine.submit(5, command).await.is_err());
    assert!(engine.backup_store().is_none());
    engine.shutdown().await.unwrap();
}
