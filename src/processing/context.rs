// ============================================================================
// Processing Context
// ============================================================================
//
// Everything a command handler may touch while its transaction is open: the
// partition's store, the state views, the key generator and the follow-up
// buffer. Events go through the event appliers the moment they are appended,
// so later reads in the same handler observe them.
//
// ============================================================================

use super::appliers::EventAppliers;
use super::outcome::PostCommitTask;
use crate::config::ProcessingConfig;
use crate::core::{Key, PartitionId, Position, Result};
use crate::protocol::{Intent, Record, RecordType, RecordValue, RejectionType, UnwrittenRecord};
use crate::state::{DbKeyGenerator, KeyGenerator, ProcessingState};
use crate::storage::StateDb;

pub struct ProcessingContext<'a> {
    db: &'a mut StateDb,
    appliers: &'a EventAppliers,
    config: &'a ProcessingConfig,
    state: ProcessingState,
    partition_id: PartitionId,
    source_position: Position,
    timestamp: i64,
    request_stream_id: i32,
    request_id: i64,
    follow_ups: Vec<UnwrittenRecord>,
    tasks: Vec<PostCommitTask>,
}

impl<'a> ProcessingContext<'a> {
    pub fn new(
        db: &'a mut StateDb,
        appliers: &'a EventAppliers,
        config: &'a ProcessingConfig,
        partition_id: PartitionId,
        command: &Record,
    ) -> Self {
        Self {
            db,
            appliers,
            config,
            state: ProcessingState::default(),
            partition_id,
            source_position: command.position,
            timestamp: command.timestamp,
            request_stream_id: command.request_stream_id,
            request_id: command.request_id,
            follow_ups: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn db(&self) -> &StateDb {
        self.db
    }

    pub fn state(&self) -> &ProcessingState {
        &self.state
    }

    pub fn config(&self) -> &ProcessingConfig {
        self.config
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// Timestamp of the command; follow-ups carry the same one.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn next_key(&mut self) -> Result<Key> {
        DbKeyGenerator::new(&mut *self.db, self.partition_id).next_key()
    }

    /// Appends an event and applies it to the state.
    pub fn append_event(&mut self, key: Key, intent: Intent, value: impl Into<RecordValue>) -> Result<()> {
        let event = self.follow_up(RecordType::Event, key, intent, value.into());
        self.appliers.apply(&mut *self.db, &event)?;
        self.follow_ups.push(event);
        Ok(())
    }

    /// Like `append_event`, and the event answers the command's request.
    pub fn append_response(&mut self, key: Key, intent: Intent, value: impl Into<RecordValue>) -> Result<()> {
        let mut event = self.follow_up(RecordType::Event, key, intent, value.into());
        event.request_stream_id = self.request_stream_id;
        event.request_id = self.request_id;
        self.appliers.apply(&mut *self.db, &event)?;
        self.follow_ups.push(event);
        Ok(())
    }

    /// Appends a command that this partition processes after the current one.
    pub fn append_command(&mut self, key: Key, intent: Intent, value: impl Into<RecordValue>) {
        let command = self.follow_up(RecordType::Command, key, intent, value.into());
        self.follow_ups.push(command);
    }

    /// Hands `command` to another partition once this transaction committed.
    pub fn send_command(&mut self, partition_id: PartitionId, command: UnwrittenRecord) {
        self.tasks.push(PostCommitTask::SendCommand {
            partition_id,
            command,
        });
    }

    pub fn schedule(&mut self, task: PostCommitTask) {
        self.tasks.push(task);
    }

    pub fn follow_ups(&self) -> &[UnwrittenRecord] {
        &self.follow_ups
    }

    pub fn into_parts(self) -> (Vec<UnwrittenRecord>, Vec<PostCommitTask>) {
        (self.follow_ups, self.tasks)
    }

    fn follow_up(&self, record_type: RecordType, key: Key, intent: Intent, value: RecordValue) -> UnwrittenRecord {
        UnwrittenRecord {
            key,
            source_record_position: self.source_position,
            timestamp: self.timestamp,
            partition_id: self.partition_id,
            record_type,
            intent,
            rejection_type: RejectionType::NullVal,
            rejection_reason: String::new(),
            request_id: -1,
            request_stream_id: -1,
            value,
        }
    }
}
