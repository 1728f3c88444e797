//! Job commands driven through the stream processor

use stateflow::config::ProcessingConfig;
use stateflow::core::{Key, encode_partition_id};
use stateflow::processing::{
    CommandError, CommandHandlers, CommandProcessor, ProcessedCommand, ProcessingContext, ProcessingOutcome,
    ScheduledSweep, StreamProcessor,
};
use stateflow::protocol::{
    Intent, JobBatchIntent, JobBatchRecord, JobIntent, JobRecord, Record, RecordType, RecordValue, RejectionType,
    UnwrittenRecord,
};
use stateflow::state::JobStatus;
use stateflow::EngineError;
use std::sync::Arc;

fn processor() -> StreamProcessor {
    StreamProcessor::in_memory(1, ProcessingConfig::default()).unwrap()
}

fn run(processor: &mut StreamProcessor, command: UnwrittenRecord) -> ProcessedCommand {
    let run = processor.process_command(command).unwrap();
    let submitted = run.submitted;
    run.processed
        .into_iter()
        .find(|processed| processed.command.position == submitted)
        .unwrap()
}

fn response(processed: &ProcessedCommand) -> &Record {
    match &processed.outcome {
        ProcessingOutcome::Applied(records) => records.first().unwrap(),
        other => panic!("Expected the command to be applied, got {:?}", other),
    }
}

fn create_job(processor: &mut StreamProcessor, job_type: &str, retries: i32, timestamp: i64) -> Key {
    let command = UnwrittenRecord::new_command(Intent::Job(JobIntent::Create), JobRecord::new(job_type, retries))
        .with_timestamp(timestamp);
    response(&run(processor, command)).key
}

fn activate(processor: &mut StreamProcessor, job_type: &str, max_jobs: i32, timeout: i64, timestamp: i64) -> JobBatchRecord {
    let command = UnwrittenRecord::new_command(
        Intent::JobBatch(JobBatchIntent::Activate),
        JobBatchRecord::new(job_type, "worker-1", timeout, max_jobs),
    )
    .with_timestamp(timestamp);
    let processed = run(processor, command);
    response(&processed).as_job_batch().unwrap().clone()
}

fn job_command(processor: &mut StreamProcessor, intent: JobIntent, key: Key, job: JobRecord, timestamp: i64) -> ProcessedCommand {
    run(
        processor,
        UnwrittenRecord::command(Intent::Job(intent), key, job).with_timestamp(timestamp),
    )
}

fn state_of(processor: &StreamProcessor, key: Key) -> JobStatus {
    processor.state().jobs.get_state(processor.db(), key).unwrap()
}

#[test]
fn test_create_assigns_partition_key_and_makes_job_activatable() {
    let mut processor = processor();
    let key = create_job(&mut processor, "payment", 3, 10);

    assert_eq!(key, encode_partition_id(1, 1));
    assert_eq!(state_of(&processor, key), JobStatus::Activatable);
    assert_eq!(processor.last_processed_position(), 1);
    // command at 1, CREATED at 2
    assert_eq!(processor.log().last_position(), 2);
    let created = processor.log().get(2).unwrap();
    assert_eq!(created.intent, Intent::Job(JobIntent::Created));
    assert_eq!(created.source_record_position, 1);
}

#[test]
fn test_fail_without_retries_then_update_retries_reactivates() {
    let mut processor = processor();
    let key = create_job(&mut processor, "payment", 1, 0);
    let batch = activate(&mut processor, "payment", 10, 1_000, 20);
    assert_eq!(batch.job_keys, vec![key]);
    assert_eq!(batch.jobs[0].deadline, Some(1_020));
    assert_eq!(state_of(&processor, key), JobStatus::Activated);

    let mut failed = JobRecord::new("payment", 0);
    failed.error_message = "card declined".to_string();
    let processed = job_command(&mut processor, JobIntent::Fail, key, failed, 30);
    assert_eq!(response(&processed).intent, Intent::Job(JobIntent::Failed));
    assert_eq!(state_of(&processor, key), JobStatus::Failed);

    // FAILED without retries is not handed out
    assert!(activate(&mut processor, "payment", 10, 1_000, 40).job_keys.is_empty());

    job_command(&mut processor, JobIntent::UpdateRetries, key, JobRecord::new("payment", 2), 50);
    assert_eq!(state_of(&processor, key), JobStatus::Activatable);
    let job = processor.state().jobs.get_job(processor.db(), key).unwrap().unwrap();
    assert_eq!(job.retries, 2);
    assert_eq!(job.error_message, "card declined");

    let batch = activate(&mut processor, "payment", 10, 1_000, 60);
    assert_eq!(batch.job_keys, vec![key]);
    job_command(&mut processor, JobIntent::Complete, key, JobRecord::new("payment", 2), 70);
    assert_eq!(state_of(&processor, key), JobStatus::NotFound);
}

#[test]
fn test_timeout_sweep_only_reclaims_expired_jobs() {
    let mut processor = processor();
    let first = create_job(&mut processor, "mail", 1, 0);
    let second = create_job(&mut processor, "mail", 1, 0);

    assert_eq!(activate(&mut processor, "mail", 1, 100, 0).job_keys, vec![first]);
    assert_eq!(activate(&mut processor, "mail", 1, 100, 156).job_keys, vec![second]);

    let processed = processor.run_sweep(ScheduledSweep::JobTimeouts, 150).unwrap();
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].command.key, first);
    assert_eq!(state_of(&processor, first), JobStatus::Activatable);
    assert_eq!(state_of(&processor, second), JobStatus::Activated);

    let reclaimed = processor.state().jobs.get_job(processor.db(), first).unwrap().unwrap();
    assert_eq!(reclaimed.deadline, None);
    assert!(reclaimed.worker.is_empty());
}

#[test]
fn test_time_out_before_deadline_is_rejected() {
    let mut processor = processor();
    let key = create_job(&mut processor, "mail", 1, 0);
    activate(&mut processor, "mail", 1, 100, 0);

    let processed = job_command(&mut processor, JobIntent::TimeOut, key, JobRecord::new("mail", 1), 50);
    assert_eq!(
        processed.outcome.rejection().map(|rejection| rejection.rejection_type),
        Some(RejectionType::InvalidState)
    );
    assert_eq!(state_of(&processor, key), JobStatus::Activated);
}

#[test]
fn test_fail_with_backoff_recurs_after_sweep() {
    let mut processor = processor();
    let key = create_job(&mut processor, "mail", 3, 0);
    activate(&mut processor, "mail", 1, 10_000, 0);

    let failed = JobRecord::new("mail", 2).with_retry_backoff(500);
    job_command(&mut processor, JobIntent::Fail, key, failed, 1_000);
    assert_eq!(state_of(&processor, key), JobStatus::Failed);

    assert!(processor.run_sweep(ScheduledSweep::JobBackoff, 1_499).unwrap().is_empty());
    let processed = processor.run_sweep(ScheduledSweep::JobBackoff, 1_500).unwrap();
    assert_eq!(processed.len(), 1);
    assert_eq!(
        response(&processed[0]).intent,
        Intent::Job(JobIntent::RecurredAfterBackoff)
    );
    assert_eq!(state_of(&processor, key), JobStatus::Activatable);
}

#[test]
fn test_update_timeout_moves_the_deadline() {
    let mut processor = processor();
    let key = create_job(&mut processor, "mail", 1, 0);
    activate(&mut processor, "mail", 1, 100, 0);

    let mut update = JobRecord::new("mail", 1);
    update.timeout = 1_000;
    job_command(&mut processor, JobIntent::UpdateTimeout, key, update, 50);

    assert!(processor.run_sweep(ScheduledSweep::JobTimeouts, 500).unwrap().is_empty());
    assert_eq!(processor.run_sweep(ScheduledSweep::JobTimeouts, 1_050).unwrap().len(), 1);
}

#[test]
fn test_throw_error_requires_error_code() {
    let mut processor = processor();
    let key = create_job(&mut processor, "mail", 1, 0);
    activate(&mut processor, "mail", 1, 100, 0);

    let processed = job_command(&mut processor, JobIntent::ThrowError, key, JobRecord::new("mail", 1), 10);
    assert_eq!(
        processed.outcome.rejection().map(|rejection| rejection.rejection_type),
        Some(RejectionType::InvalidArgument)
    );

    let mut thrown = JobRecord::new("mail", 1);
    thrown.error_code = "NO_ADDRESS".to_string();
    job_command(&mut processor, JobIntent::ThrowError, key, thrown, 20);
    assert_eq!(state_of(&processor, key), JobStatus::ErrorThrown);
}

#[test]
fn test_batch_activation_is_truncated_at_max_jobs() {
    let mut processor = processor();
    let keys: Vec<Key> = (0..3).map(|_| create_job(&mut processor, "mail", 1, 0)).collect();
    create_job(&mut processor, "other", 1, 0);

    let batch = activate(&mut processor, "mail", 2, 100, 0);
    assert_eq!(batch.job_keys, keys[..2].to_vec());
    assert!(batch.truncated);
    assert!(batch.jobs.iter().all(|job| job.worker == "worker-1"));

    let rest = activate(&mut processor, "mail", 2, 100, 0);
    assert_eq!(rest.job_keys, vec![keys[2]]);
    assert!(!rest.truncated);
}

#[test]
fn test_rejection_writes_only_the_rejection_record() {
    let mut processor = processor();
    let missing = encode_partition_id(1, 42);
    let entries_before = processor.db().len();

    let processed = job_command(&mut processor, JobIntent::Complete, missing, JobRecord::new("mail", 1), 10);
    let ProcessingOutcome::Rejected { rejection, record } = &processed.outcome else {
        panic!("Expected a rejection, got {:?}", processed.outcome);
    };
    assert_eq!(rejection.rejection_type, RejectionType::NotFound);
    assert_eq!(record.record_type, RecordType::CommandRejection);
    assert_eq!(record.key, missing);
    assert_eq!(record.source_record_position, processed.command.position);
    assert!(record.rejection_reason.contains("no such job"));

    // only the last processed position was added
    assert_eq!(processor.db().len(), entries_before + 1);
    assert_eq!(processor.metrics().commands_rejected, 1);
}

#[test]
fn test_unknown_intent_is_skipped_but_marked_processed() {
    let mut processor = processor();
    let command = UnwrittenRecord::new_command(
        Intent::Unknown { value_type: 99, code: 4 },
        RecordValue::Unknown(vec![1, 2, 3]),
    );
    let processed = run(&mut processor, command);

    assert!(matches!(processed.outcome, ProcessingOutcome::Skipped));
    assert_eq!(processor.last_processed_position(), processed.command.position);
    assert_eq!(processor.metrics().commands_skipped, 1);
    assert!(processor.process_pending().unwrap().is_empty());
}

struct KeyForgingProcessor;

impl CommandProcessor for KeyForgingProcessor {
    fn process(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<(), CommandError> {
        let job = command.as_job().cloned().unwrap_or_default();
        ctx.append_event(encode_partition_id(1, 99), Intent::Job(JobIntent::Created), job)?;
        Ok(())
    }
}

#[test]
fn test_event_key_above_generator_halts_partition() {
    let mut handlers = CommandHandlers::standard();
    handlers.register(Intent::Job(JobIntent::Create), Arc::new(KeyForgingProcessor));
    let mut processor = processor().with_handlers(handlers);

    let command = UnwrittenRecord::new_command(Intent::Job(JobIntent::Create), JobRecord::new("mail", 1));
    let processed = run(&mut processor, command);

    assert!(matches!(
        processed.outcome,
        ProcessingOutcome::Fatal(EngineError::Consistency(_))
    ));
    assert!(!processor.is_healthy());
    assert_eq!(state_of(&processor, encode_partition_id(1, 99)), JobStatus::NotFound);
    // the command stays unprocessed
    assert_eq!(processor.last_processed_position(), -1);

    let next = UnwrittenRecord::new_command(Intent::Job(JobIntent::Create), JobRecord::new("mail", 1));
    assert!(matches!(
        processor.process_command(next),
        Err(EngineError::PartitionUnavailable(1))
    ));
}

#[test]
fn test_durations_past_the_end_of_time_are_rejected() {
    let mut processor = processor();
    let key = create_job(&mut processor, "mail", 3, 0);

    let command = UnwrittenRecord::new_command(
        Intent::JobBatch(JobBatchIntent::Activate),
        JobBatchRecord::new("mail", "worker-1", i64::MAX, 1),
    )
    .with_timestamp(100);
    let processed = run(&mut processor, command);
    assert_eq!(
        processed.outcome.rejection().map(|rejection| rejection.rejection_type),
        Some(RejectionType::InvalidArgument)
    );
    assert_eq!(state_of(&processor, key), JobStatus::Activatable);

    activate(&mut processor, "mail", 1, 1_000, 100);
    let mut update = JobRecord::new("mail", 3);
    update.timeout = i64::MAX;
    let processed = job_command(&mut processor, JobIntent::UpdateTimeout, key, update, 200);
    assert_eq!(
        processed.outcome.rejection().map(|rejection| rejection.rejection_type),
        Some(RejectionType::InvalidArgument)
    );

    let failed = JobRecord::new("mail", 2).with_retry_backoff(i64::MAX);
    let processed = job_command(&mut processor, JobIntent::Fail, key, failed, 300);
    assert_eq!(
        processed.outcome.rejection().map(|rejection| rejection.rejection_type),
        Some(RejectionType::InvalidArgument)
    );

    // the job keeps its original deadline and times out as usual
    assert_eq!(state_of(&processor, key), JobStatus::Activated);
    assert_eq!(processor.run_sweep(ScheduledSweep::JobTimeouts, 1_100).unwrap().len(), 1);
    assert_eq!(state_of(&processor, key), JobStatus::Activatable);
}
