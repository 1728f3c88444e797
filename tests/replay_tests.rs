//! Crash recovery: log replay, exactly-once application and determinism

use stateflow::config::{ProcessingConfig, StorageConfig};
use stateflow::core::encode_partition_id;
use stateflow::log::LOG_FILE_NAME;
use stateflow::processing::{LOG_DIR, StreamProcessor};
use stateflow::protocol::{
    CheckpointIntent, CheckpointRecord, CheckpointType, Intent, JobBatchIntent, JobBatchRecord, JobIntent, JobRecord,
    MessageIntent, MessageRecord, UnwrittenRecord,
};
use stateflow::state::{JobStatus, KeyGenerator, ImmutableKeyGenerator};
use stateflow::storage::DurabilityMode;
use std::fs;
use std::path::Path;
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

fn workload() -> Vec<UnwrittenRecord> {
    let mut commands = Vec::new();
    for i in 0..3 {
        commands.push(
            UnwrittenRecord::new_command(Intent::Job(JobIntent::Create), JobRecord::new("mail", 2)).with_timestamp(10 + i),
        );
    }
    commands.push(
        UnwrittenRecord::new_command(
            Intent::JobBatch(JobBatchIntent::Activate),
            JobBatchRecord::new("mail", "worker", 500, 2),
        )
        .with_timestamp(20),
    );
    commands.push(
        UnwrittenRecord::command(Intent::Job(JobIntent::Complete), encode_partition_id(1, 1), JobRecord::new("mail", 2))
            .with_timestamp(30),
    );
    // rejected: job 3 was never activated
    commands.push(
        UnwrittenRecord::command(Intent::Job(JobIntent::Complete), encode_partition_id(1, 3), JobRecord::new("mail", 2))
            .with_timestamp(40),
    );
    commands.push(
        UnwrittenRecord::new_command(Intent::Message(MessageIntent::Publish), MessageRecord::new("paid", "o-1", 0))
            .with_timestamp(50),
    );
    commands.push(
        UnwrittenRecord::new_command(
            Intent::Checkpoint(CheckpointIntent::Create),
            CheckpointRecord::new(1, CheckpointType::Marker),
        )
        .with_timestamp(60),
    );
    commands
}

fn run_workload(processor: &mut StreamProcessor) {
    processor.initialize_routing(1).unwrap();
    for command in workload() {
        processor.process_command(command).unwrap();
    }
}

#[test]
fn test_reopen_restores_state_without_reprocessing() {
    let dir = TempDir::new().unwrap();
    let digest = {
        let mut processor = open(dir.path());
        run_workload(&mut processor);
        processor.db().content_digest()
    };

    let mut reopened = open(dir.path());
    assert_eq!(reopened.db().content_digest(), digest);
    assert!(reopened.process_pending().unwrap().is_empty());
    assert_eq!(reopened.metrics().events_replayed, 0);
}

#[test]
fn test_lost_state_is_rebuilt_from_the_log() {
    let original = TempDir::new().unwrap();
    let (digest, last_processed, log_position) = {
        let mut processor = open(original.path());
        run_workload(&mut processor);
        (
            processor.db().content_digest(),
            processor.last_processed_position(),
            processor.log().last_position(),
        )
    };

    // Crash after the log append but before any state commit reached disk:
    // only the log survives.
    let crashed = TempDir::new().unwrap();
    fs::create_dir_all(crashed.path().join(LOG_DIR)).unwrap();
    fs::copy(
        original.path().join(LOG_DIR).join(LOG_FILE_NAME),
        crashed.path().join(LOG_DIR).join(LOG_FILE_NAME),
    )
    .unwrap();

    // Routing is initialized outside of the log, exactly as on first start.
    let mut recovered = {
        let mut processor = open(crashed.path());
        processor.initialize_routing(1).unwrap();
        processor
    };
    assert_eq!(recovered.db().content_digest(), digest);
    assert_eq!(recovered.last_processed_position(), last_processed);
    assert_eq!(recovered.log().last_position(), log_position);
    assert!(recovered.metrics().events_replayed > 0);

    // nothing is applied twice
    assert!(recovered.process_pending().unwrap().is_empty());
    let jobs = recovered.state().jobs;
    assert_eq!(jobs.get_state(recovered.db(), encode_partition_id(1, 1)).unwrap(), JobStatus::NotFound);
    assert_eq!(jobs.get_state(recovered.db(), encode_partition_id(1, 2)).unwrap(), JobStatus::Activated);
    assert_eq!(jobs.get_state(recovered.db(), encode_partition_id(1, 3)).unwrap(), JobStatus::Activatable);

    // the key generator continues after the replayed keys
    let generator = ImmutableKeyGenerator::new(recovered.db(), 1);
    let highest = recovered
        .log()
        .records_from(1)
        .filter(|record| record.key > 0)
        .map(|record| record.key)
        .max()
        .unwrap();
    assert_eq!(generator.current_key().unwrap(), highest);
}

#[test]
fn test_same_log_yields_identical_state() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    let mut a = open(first.path());
    let mut b = open(second.path());
    run_workload(&mut a);
    run_workload(&mut b);

    assert_eq!(a.db().export_entries(), b.db().export_entries());
    assert_eq!(a.db().content_digest(), b.db().content_digest());
}

#[test]
fn test_pending_command_is_processed_after_restart() {
    let dir = TempDir::new().unwrap();
    let position = {
        let mut processor = open(dir.path());
        let command = UnwrittenRecord::new_command(Intent::Job(JobIntent::Create), JobRecord::new("mail", 1))
            .with_timestamp(5);
        processor.append_command(command).unwrap().position
    };

    let mut processor = open(dir.path());
    assert_eq!(processor.last_processed_position(), -1);
    let processed = processor.process_pending().unwrap();
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].command.position, position);
    assert!(processed[0].outcome.is_applied());
    assert!(processor.process_pending().unwrap().is_empty());
}

#[test]
fn test_compaction_waits_for_checkpoint() {
    let dir = TempDir::new().unwrap();
    let mut processor = open(dir.path());
    processor.initialize_routing(1).unwrap();
    for i in 0..4 {
        let command = UnwrittenRecord::new_command(Intent::Job(JobIntent::Create), JobRecord::new("mail", 1))
            .with_timestamp(i);
        processor.process_command(command).unwrap();
    }
    assert_eq!(processor.compact_log().unwrap(), 0);

    let checkpoint = UnwrittenRecord::new_command(
        Intent::Checkpoint(CheckpointIntent::Create),
        CheckpointRecord::new(1, CheckpointType::Marker),
    );
    let run = processor.process_command(checkpoint).unwrap();
    let checkpoint_position = run.submitted;
    assert_eq!(processor.compaction_bound().unwrap(), checkpoint_position);

    let removed = processor.compact_log().unwrap();
    // everything up to and including the checkpoint command goes
    assert_eq!(removed as i64, checkpoint_position);
    assert_eq!(processor.log().first_position(), Some(checkpoint_position + 1));

    drop(processor);
    let reopened = open(dir.path());
    assert_eq!(reopened.log().first_position(), Some(checkpoint_position + 1));
    assert_eq!(reopened.metrics().events_replayed, 0);
    assert_eq!(reopened.state().jobs.job_type_counts(reopened.db()).unwrap()["mail"].activatable, 4);
}
