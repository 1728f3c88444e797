use super::intent::{Intent, ValueType};
use super::value::{
    CheckpointRecord, JobBatchRecord, JobRecord, MessageRecord, RecordValue, ScaleRecord,
};
use crate::core::{Key, NO_KEY, NO_POSITION, PartitionId, Position};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    Command,
    Event,
    CommandRejection,
}

impl RecordType {
    pub fn code(&self) -> u8 {
        match self {
            RecordType::Command => 0,
            RecordType::Event => 1,
            RecordType::CommandRejection => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RecordType::Command),
            1 => Some(RecordType::Event),
            2 => Some(RecordType::CommandRejection),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RejectionType {
    #[default]
    NullVal,
    InvalidArgument,
    NotFound,
    AlreadyExists,
    InvalidState,
    ProcessingError,
}

impl RejectionType {
    pub fn code(&self) -> u8 {
        match self {
            RejectionType::NullVal => 0,
            RejectionType::InvalidArgument => 1,
            RejectionType::NotFound => 2,
            RejectionType::AlreadyExists => 3,
            RejectionType::InvalidState => 4,
            RejectionType::ProcessingError => 5,
        }
    }

    /// Rejection kinds added by newer versions degrade to `ProcessingError`.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => RejectionType::NullVal,
            1 => RejectionType::InvalidArgument,
            2 => RejectionType::NotFound,
            3 => RejectionType::AlreadyExists,
            4 => RejectionType::InvalidState,
            _ => RejectionType::ProcessingError,
        }
    }
}

impl fmt::Display for RejectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RejectionType::NullVal => "NULL_VAL",
            RejectionType::InvalidArgument => "INVALID_ARGUMENT",
            RejectionType::NotFound => "NOT_FOUND",
            RejectionType::AlreadyExists => "ALREADY_EXISTS",
            RejectionType::InvalidState => "INVALID_STATE",
            RejectionType::ProcessingError => "PROCESSING_ERROR",
        };
        f.write_str(name)
    }
}

/// Common envelope accessors shared by written and not-yet-written records.
pub trait RecordEnvelope {
    fn key(&self) -> Key;
    fn position(&self) -> Position;
    fn source_record_position(&self) -> Position;
    fn timestamp(&self) -> i64;
    fn partition_id(&self) -> PartitionId;
    fn record_type(&self) -> RecordType;
    fn intent(&self) -> Intent;
    fn rejection_type(&self) -> RejectionType;
    fn rejection_reason(&self) -> &str;
    fn value(&self) -> &RecordValue;

    fn value_type(&self) -> ValueType {
        self.intent().value_type()
    }

    fn is_command(&self) -> bool {
        self.record_type() == RecordType::Command
    }

    fn is_event(&self) -> bool {
        self.record_type() == RecordType::Event
    }

    fn is_rejection(&self) -> bool {
        self.record_type() == RecordType::CommandRejection
    }
}

/// One log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub position: Position,
    pub source_record_position: Position,
    pub key: Key,
    pub timestamp: i64,
    pub partition_id: PartitionId,
    pub record_type: RecordType,
    pub intent: Intent,
    pub rejection_type: RejectionType,
    pub rejection_reason: String,
    pub request_id: i64,
    pub request_stream_id: i32,
    /// Schema version of `value` as written.
    pub record_version: u16,
    pub value: RecordValue,
}

impl Record {
    pub fn as_job(&self) -> Option<&JobRecord> {
        match &self.value {
            RecordValue::Job(job) => Some(job),
            _ => None,
        }
    }

    pub fn as_job_batch(&self) -> Option<&JobBatchRecord> {
        match &self.value {
            RecordValue::JobBatch(batch) => Some(batch),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&MessageRecord> {
        match &self.value {
            RecordValue::Message(message) => Some(message),
            _ => None,
        }
    }

    pub fn as_checkpoint(&self) -> Option<&CheckpointRecord> {
        match &self.value {
            RecordValue::Checkpoint(checkpoint) => Some(checkpoint),
            _ => None,
        }
    }

    pub fn as_scale(&self) -> Option<&ScaleRecord> {
        match &self.value {
            RecordValue::Scale(scale) => Some(scale),
            _ => None,
        }
    }

    pub fn has_request(&self) -> bool {
        self.request_id >= 0
    }
}

impl RecordEnvelope for Record {
    fn key(&self) -> Key {
        self.key
    }

    fn position(&self) -> Position {
        self.position
    }

    fn source_record_position(&self) -> Position {
        self.source_record_position
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    fn record_type(&self) -> RecordType {
        self.record_type
    }

    fn intent(&self) -> Intent {
        self.intent
    }

    fn rejection_type(&self) -> RejectionType {
        self.rejection_type
    }

    fn rejection_reason(&self) -> &str {
        &self.rejection_reason
    }

    fn value(&self) -> &RecordValue {
        &self.value
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} key={} position={} source={}",
            self.record_type, self.intent, self.key, self.position, self.source_record_position
        )
    }
}

/// A record that has not been given a log position yet.
///
/// Commands submitted from outside and follow-ups produced by processing are
/// both built as `UnwrittenRecord`s; the log assigns positions on append.
#[derive(Debug, Clone, PartialEq)]
pub struct UnwrittenRecord {
    pub key: Key,
    pub source_record_position: Position,
    pub timestamp: i64,
    pub partition_id: PartitionId,
    pub record_type: RecordType,
    pub intent: Intent,
    pub rejection_type: RejectionType,
    pub rejection_reason: String,
    pub request_id: i64,
    pub request_stream_id: i32,
    pub value: RecordValue,
}

impl UnwrittenRecord {
    pub fn command(intent: Intent, key: Key, value: impl Into<RecordValue>) -> Self {
        Self {
            key,
            source_record_position: NO_POSITION,
            timestamp: 0,
            partition_id: 0,
            record_type: RecordType::Command,
            intent,
            rejection_type: RejectionType::NullVal,
            rejection_reason: String::new(),
            request_id: -1,
            request_stream_id: -1,
            value: value.into(),
        }
    }

    pub fn new_command(intent: Intent, value: impl Into<RecordValue>) -> Self {
        Self::command(intent, NO_KEY, value)
    }

    pub fn with_request(mut self, request_stream_id: i32, request_id: i64) -> Self {
        self.request_stream_id = request_stream_id;
        self.request_id = request_id;
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Materializes the record at `position`.
    pub fn into_record(self, position: Position, partition_id: PartitionId) -> Record {
        let record_version = self.value.schema_version();
        Record {
            position,
            source_record_position: self.source_record_position,
            key: self.key,
            timestamp: self.timestamp,
            partition_id,
            record_type: self.record_type,
            intent: self.intent,
            rejection_type: self.rejection_type,
            rejection_reason: self.rejection_reason,
            request_id: self.request_id,
            request_stream_id: self.request_stream_id,
            record_version,
            value: self.value,
        }
    }
}

impl RecordEnvelope for UnwrittenRecord {
    fn key(&self) -> Key {
        self.key
    }

    fn position(&self) -> Position {
        NO_POSITION
    }

    fn source_record_position(&self) -> Position {
        self.source_record_position
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    fn record_type(&self) -> RecordType {
        self.record_type
    }

    fn intent(&self) -> Intent {
        self.intent
    }

    fn rejection_type(&self) -> RejectionType {
        self.rejection_type
    }

    fn rejection_reason(&self) -> &str {
        &self.rejection_reason
    }

    fn value(&self) -> &RecordValue {
        &self.value
    }
}
