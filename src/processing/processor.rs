// ============================================================================
// Stream Processor
// ============================================================================
//
// Single-threaded owner of one partition's log and state store.
//
// Per command:
//   1. begin a state transaction
//   2. run the handler; appended events are applied immediately
//   3. validate event keys, store the command position as last processed
//   4. append all follow-ups to the log in one batch
//   5. commit the transaction
//
// A crash between 4 and 5 leaves follow-ups in the log whose effects are not
// in the store. Opening the processor replays exactly those events (source
// position newer than the stored last processed position), so every command
// is applied once and none is skipped.
//
// A rejected command rolls back the handler's writes and only writes the
// rejection. Any engine error halts the partition.
//
// ============================================================================

use super::appliers::EventAppliers;
use super::context::ProcessingContext;
use super::handlers::{CommandHandlers, CommandProcessor};
use super::metrics::ProcessingMetrics;
use super::outcome::{CommandError, PostCommitTask, ProcessedCommand, ProcessingOutcome, Rejection};
use super::scheduled::ScheduledSweep;
use crate::config::{ProcessingConfig, StorageConfig};
use crate::core::{EngineError, PartitionId, Position, Result};
use crate::log::LogStream;
use crate::protocol::{Record, RecordEnvelope, RecordType, UnwrittenRecord};
use crate::state::{DbKeyGenerator, ImmutableKeyGenerator, KeyGenerator, ProcessingState};
use crate::storage::{ReadOnlyState, StateDb};
use std::path::Path;
use tracing::{Level, event, info_span};

pub const STATE_DIR: &str = "state";
pub const LOG_DIR: &str = "log";

/// Commands processed by one `process_command` call, in log order.
#[derive(Debug)]
pub struct ProcessingRun {
    pub submitted: Position,
    pub processed: Vec<ProcessedCommand>,
}

impl ProcessingRun {
    /// Result of the command that started the run.
    pub fn submitted(&self) -> Option<&ProcessedCommand> {
        self.processed
            .iter()
            .find(|processed| processed.command.position == self.submitted)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &PostCommitTask> {
        self.processed.iter().flat_map(|processed| processed.tasks.iter())
    }
}

pub struct StreamProcessor {
    partition_id: PartitionId,
    db: StateDb,
    log: LogStream,
    handlers: CommandHandlers,
    appliers: EventAppliers,
    config: ProcessingConfig,
    state: ProcessingState,
    last_processed: Position,
    next_read: Position,
    metrics: ProcessingMetrics,
    failure: Option<String>,
}

impl StreamProcessor {
    /// Wraps an opened store and log and replays unapplied events.
    pub fn new(
        partition_id: PartitionId,
        db: StateDb,
        log: LogStream,
        config: ProcessingConfig,
    ) -> Result<Self> {
        let mut processor = Self {
            partition_id,
            db,
            log,
            handlers: CommandHandlers::standard(),
            appliers: EventAppliers::standard(),
            config,
            state: ProcessingState::default(),
            last_processed: -1,
            next_read: 1,
            metrics: ProcessingMetrics::default(),
            failure: None,
        };
        processor.replay()?;
        Ok(processor)
    }

    /// Opens the partition stored below `dir`.
    pub fn open(
        partition_id: PartitionId,
        dir: &Path,
        storage: &StorageConfig,
        config: ProcessingConfig,
    ) -> Result<Self> {
        let db = StateDb::open(dir.join(STATE_DIR), storage)?;
        let log = LogStream::open(dir.join(LOG_DIR), partition_id, storage.durability)?;
        Self::new(partition_id, db, log, config)
    }

    pub fn in_memory(partition_id: PartitionId, config: ProcessingConfig) -> Result<Self> {
        Self::new(
            partition_id,
            StateDb::in_memory(true),
            LogStream::in_memory(partition_id),
            config,
        )
    }

    pub fn with_handlers(mut self, handlers: CommandHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    // ------------------------------------------------------------------
    // Replay
    // ------------------------------------------------------------------

    fn replay(&mut self) -> Result<()> {
        let span = info_span!("stream.replay", partition = self.partition_id);
        let _enter = span.enter();

        let last_processed = self.state.last_processed.get(&self.db)?;
        let pending: Vec<Record> = self
            .log
            .records_from(last_processed.max(0) + 1)
            .filter(|record| !record.is_command() && record.source_record_position > last_processed)
            .cloned()
            .collect();

        let partition_id = self.partition_id;
        let appliers = &self.appliers;
        let last_processed_state = self.state.last_processed;
        let mut replayed = 0;
        for batch in pending.chunk_by(|a, b| a.source_record_position == b.source_record_position) {
            let source = batch[0].source_record_position;
            self.db.run_in_transaction(|db| {
                for record in batch.iter().filter(|record| record.is_event()) {
                    appliers.apply(db, record)?;
                    DbKeyGenerator::new(&mut *db, partition_id).set_key_if_higher(record.key)?;
                }
                last_processed_state.mark_as_processed(db, source)
            })?;
            replayed += batch.iter().filter(|record| record.is_event()).count();
        }

        self.last_processed = self.state.last_processed.get(&self.db)?;
        self.next_read = self.log.first_position().unwrap_or(1).max(self.last_processed + 1);
        self.metrics.record_replayed(replayed);
        event!(
            Level::INFO,
            replayed_events = replayed,
            last_processed = self.last_processed,
            "partition replay finished"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Processing
    // ------------------------------------------------------------------

    /// Bootstraps routing for `partition_count` partitions. No-op once set.
    pub fn initialize_routing(&mut self, partition_count: u32) -> Result<()> {
        self.ensure_healthy()?;
        let routing = self.state.routing;
        self.db
            .run_in_transaction(|db| routing.initialize_routing_info(db, partition_count))
    }

    /// Appends a command to the log without processing it.
    pub fn append_command(&mut self, mut command: UnwrittenRecord) -> Result<Record> {
        self.ensure_healthy()?;
        if command.record_type != RecordType::Command {
            return Err(EngineError::ExecutionError(format!(
                "Only commands can be submitted, got {:?}",
                command.record_type
            )));
        }
        if command.timestamp == 0 {
            command.timestamp = chrono::Utc::now().timestamp_millis();
        }
        command.source_record_position = -1;
        let mut written = self.log.append(vec![command])?;
        written
            .pop()
            .ok_or_else(|| EngineError::ExecutionError("Log append returned no record".into()))
    }

    /// Appends `command` and processes every pending command including it.
    pub fn process_command(&mut self, command: UnwrittenRecord) -> Result<ProcessingRun> {
        let submitted = self.append_command(command)?.position;
        let processed = self.process_pending()?;
        Ok(ProcessingRun {
            submitted,
            processed,
        })
    }

    /// Processes commands until the log has none left, the partition halts,
    /// or a command asks for a backup. In the last case the caller stages the
    /// backup before calling again, so the snapshot matches the checkpoint.
    pub fn process_pending(&mut self) -> Result<Vec<ProcessedCommand>> {
        let mut processed = Vec::new();
        while let Some(result) = self.process_next()? {
            let halted = matches!(result.outcome, ProcessingOutcome::Fatal(_));
            let paused = result
                .tasks
                .iter()
                .any(|task| matches!(task, PostCommitTask::TakeBackup { .. }));
            processed.push(result);
            if halted || paused {
                break;
            }
        }
        Ok(processed)
    }

    /// Processes the next unprocessed command of the log, if any.
    pub fn process_next(&mut self) -> Result<Option<ProcessedCommand>> {
        self.ensure_healthy()?;
        let last_processed = self.last_processed;
        let next = self
            .log
            .records_from(self.next_read)
            .find(|record| record.is_command() && record.position > last_processed)
            .cloned();
        let Some(command) = next else {
            self.next_read = self.log.next_position();
            return Ok(None);
        };
        self.next_read = command.position + 1;
        Ok(Some(self.process(command)))
    }

    /// Injects the commands a sweep finds due at `now` and processes them.
    pub fn run_sweep(&mut self, sweep: ScheduledSweep, now: i64) -> Result<Vec<ProcessedCommand>> {
        self.ensure_healthy()?;
        let commands = sweep.collect(&self.db, now, self.config.sweep_batch_limit)?;
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        event!(Level::DEBUG, sweep = %sweep, commands = commands.len(), "sweep found due entries");
        for command in commands {
            self.append_command(command)?;
        }
        self.process_pending()
    }

    fn process(&mut self, command: Record) -> ProcessedCommand {
        let span = info_span!(
            "stream.command",
            partition = self.partition_id,
            position = command.position,
            intent = %command.intent,
            key = command.key
        );
        let _enter = span.enter();

        let Some(handler) = self.handlers.get(&command.intent) else {
            event!(Level::DEBUG, "no handler registered, skipping command");
            self.metrics.record_skipped();
            let outcome = match self.mark_processed(command.position) {
                Ok(()) => ProcessingOutcome::Skipped,
                Err(err) => self.halt(err),
            };
            return ProcessedCommand {
                command,
                outcome,
                tasks: Vec::new(),
            };
        };

        let (outcome, tasks) = match self.apply_command(&command, handler.as_ref()) {
            Ok((written, tasks)) => {
                self.metrics.record_applied(written.len());
                event!(Level::DEBUG, follow_ups = written.len(), "command applied");
                (ProcessingOutcome::Applied(written), tasks)
            }
            Err(CommandError::Rejected(rejection)) => match self.write_rejection(&command, &rejection) {
                Ok(record) => {
                    self.metrics.record_rejected();
                    event!(Level::INFO, rejection = %rejection, "command rejected");
                    (ProcessingOutcome::Rejected { rejection, record }, Vec::new())
                }
                Err(err) => (self.halt(err), Vec::new()),
            },
            Err(CommandError::Fatal(err)) => (self.halt(err), Vec::new()),
        };
        ProcessedCommand {
            command,
            outcome,
            tasks,
        }
    }

    fn apply_command(
        &mut self,
        command: &Record,
        handler: &dyn CommandProcessor,
    ) -> std::result::Result<(Vec<Record>, Vec<PostCommitTask>), CommandError> {
        self.db.begin_transaction()?;
        let result = {
            let mut ctx = ProcessingContext::new(
                &mut self.db,
                &self.appliers,
                &self.config,
                self.partition_id,
                command,
            );
            handler.process(command, &mut ctx).map(|()| ctx.into_parts())
        };
        let (follow_ups, tasks) = match result {
            Ok(parts) => parts,
            Err(err) => {
                self.db.rollback()?;
                return Err(err);
            }
        };
        let written = self.write_follow_ups(command.position, follow_ups)?;
        Ok((written, tasks))
    }

    fn write_rejection(&mut self, command: &Record, rejection: &Rejection) -> Result<Record> {
        let record = UnwrittenRecord {
            key: command.key,
            source_record_position: command.position,
            timestamp: command.timestamp,
            partition_id: self.partition_id,
            record_type: RecordType::CommandRejection,
            intent: command.intent,
            rejection_type: rejection.rejection_type,
            rejection_reason: rejection.reason.clone(),
            request_id: command.request_id,
            request_stream_id: command.request_stream_id,
            value: command.value.clone(),
        };
        self.db.begin_transaction()?;
        let mut written = self.write_follow_ups(command.position, vec![record])?;
        written
            .pop()
            .ok_or_else(|| EngineError::ExecutionError("Log append returned no record".into()))
    }

    /// Runs inside the command's open transaction and ends it.
    fn write_follow_ups(&mut self, source: Position, follow_ups: Vec<UnwrittenRecord>) -> Result<Vec<Record>> {
        let result = self.persist_follow_ups(source, follow_ups);
        if result.is_err() && self.db.in_transaction() {
            self.db.rollback()?;
        }
        result
    }

    fn persist_follow_ups(&mut self, source: Position, follow_ups: Vec<UnwrittenRecord>) -> Result<Vec<Record>> {
        {
            let keys = ImmutableKeyGenerator::new(&self.db, self.partition_id);
            for record in follow_ups.iter().filter(|record| record.is_event()) {
                keys.validate_key(record.key)?;
            }
        }
        self.state.last_processed.mark_as_processed(&mut self.db, source)?;
        let written = self.log.append(follow_ups)?;
        self.db.commit()?;
        self.last_processed = source;
        Ok(written)
    }

    fn mark_processed(&mut self, position: Position) -> Result<()> {
        let last_processed = self.state.last_processed;
        self.db
            .run_in_transaction(|db| last_processed.mark_as_processed(db, position))?;
        self.last_processed = position;
        Ok(())
    }

    fn halt(&mut self, err: EngineError) -> ProcessingOutcome {
        event!(Level::ERROR, error = %err, partition = self.partition_id, "partition processing halted");
        self.failure = Some(err.to_string());
        ProcessingOutcome::Fatal(err)
    }

    fn ensure_healthy(&self) -> Result<()> {
        match self.failure {
            Some(_) => Err(EngineError::PartitionUnavailable(self.partition_id)),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Observers and maintenance
    // ------------------------------------------------------------------

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn db(&self) -> &StateDb {
        &self.db
    }

    pub fn read_only(&self) -> ReadOnlyState {
        self.db.read_only()
    }

    pub fn log(&self) -> &LogStream {
        &self.log
    }

    pub fn state(&self) -> &ProcessingState {
        &self.state
    }

    pub fn last_processed_position(&self) -> Position {
        self.last_processed
    }

    pub fn metrics(&self) -> ProcessingMetrics {
        self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut ProcessingMetrics {
        &mut self.metrics
    }

    pub fn is_healthy(&self) -> bool {
        self.failure.is_none()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn set_exporter_position(&mut self, exporter_id: &str, position: Position) -> Result<()> {
        let exporters = self.state.exporters;
        self.db
            .run_in_transaction(|db| exporters.set(db, exporter_id, position))
    }

    pub fn remove_exporter_position(&mut self, exporter_id: &str) -> Result<()> {
        let exporters = self.state.exporters;
        self.db
            .run_in_transaction(|db| exporters.remove(db, exporter_id))
    }

    /// Highest position the log may be compacted to: nothing newer than the
    /// last processed command, the slowest exporter or the last checkpoint.
    pub fn compaction_bound(&self) -> Result<Position> {
        let checkpoint = self.state.checkpoint.get_checkpoint_position(&self.db)?;
        let mut bound = self.last_processed.min(checkpoint);
        if let Some(exported) = self.state.exporters.lowest(&self.db)? {
            bound = bound.min(exported);
        }
        Ok(bound)
    }

    pub fn compact_log(&mut self) -> Result<usize> {
        let bound = self.compaction_bound()?;
        if bound <= 0 {
            return Ok(0);
        }
        let removed = self.log.compact_up_to(bound)?;
        if removed > 0 {
            event!(Level::INFO, bound, removed, "log compacted");
        }
        Ok(removed)
    }
}
