// ============================================================================
// Record Values
// ============================================================================
//
// One struct per value type, each carrying only its own fields. Every struct
// is `#[serde(default)]` so that omitted fields decode to their defaults and
// unknown fields written by newer versions are skipped.
//
// ============================================================================

use super::intent::ValueType;
use crate::core::{Key, PartitionId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Variable documents are ordered maps so that encoding is deterministic.
pub type Variables = BTreeMap<String, serde_json::Value>;

/// Schema metadata for a payload struct.
pub trait RecordValueSchema: Serialize + DeserializeOwned + Default + Clone {
    const VALUE_TYPE: ValueType;

    /// Bumped whenever fields are added. Decoders accept this version and older.
    const SCHEMA_VERSION: u16;

    fn into_value(self) -> RecordValue;

    /// Borrows the payload when `value` holds this schema.
    fn from_value(value: &RecordValue) -> Option<&Self>;
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRecord {
    pub job_type: String,
    pub worker: String,
    pub retries: i32,
    /// Delay in millis before a failed job with retries left becomes activatable again.
    pub retry_backoff: i64,
    /// Epoch millis at which a backed-off job recurs.
    pub recurring_time: Option<i64>,
    /// Epoch millis at which an activated job times out.
    pub deadline: Option<i64>,
    pub timeout: i64,
    pub variables: Variables,
    pub custom_headers: BTreeMap<String, String>,
    pub error_message: String,
    pub error_code: String,
    pub process_instance_key: Key,
    pub element_id: String,
    pub tenant_id: String,
}

impl JobRecord {
    pub fn new(job_type: impl Into<String>, retries: i32) -> Self {
        Self {
            job_type: job_type.into(),
            retries,
            process_instance_key: -1,
            ..Self::default()
        }
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_retry_backoff(mut self, retry_backoff: i64) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }
}

impl RecordValueSchema for JobRecord {
    const VALUE_TYPE: ValueType = ValueType::Job;
    const SCHEMA_VERSION: u16 = 2;

    fn into_value(self) -> RecordValue {
        RecordValue::Job(self)
    }

    fn from_value(value: &RecordValue) -> Option<&Self> {
        match value {
            RecordValue::Job(inner) => Some(inner),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobBatchRecord {
    pub job_type: String,
    pub worker: String,
    pub timeout: i64,
    pub max_jobs_to_activate: i32,
    pub job_keys: Vec<Key>,
    pub jobs: Vec<JobRecord>,
    pub truncated: bool,
}

impl JobBatchRecord {
    pub fn new(job_type: impl Into<String>, worker: impl Into<String>, timeout: i64, max_jobs: i32) -> Self {
        Self {
            job_type: job_type.into(),
            worker: worker.into(),
            timeout,
            max_jobs_to_activate: max_jobs,
            ..Self::default()
        }
    }
}

impl RecordValueSchema for JobBatchRecord {
    const VALUE_TYPE: ValueType = ValueType::JobBatch;
    const SCHEMA_VERSION: u16 = 1;

    fn into_value(self) -> RecordValue {
        RecordValue::JobBatch(self)
    }

    fn from_value(value: &RecordValue) -> Option<&Self> {
        match value {
            RecordValue::JobBatch(inner) => Some(inner),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageRecord {
    pub name: String,
    pub correlation_key: String,
    /// Millis the message stays buffered; zero expires it right after publishing.
    pub time_to_live: i64,
    pub message_id: String,
    pub variables: Variables,
    pub deadline: Option<i64>,
    pub tenant_id: String,
}

impl MessageRecord {
    pub fn new(name: impl Into<String>, correlation_key: impl Into<String>, time_to_live: i64) -> Self {
        Self {
            name: name.into(),
            correlation_key: correlation_key.into(),
            time_to_live,
            ..Self::default()
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }
}

impl RecordValueSchema for MessageRecord {
    const VALUE_TYPE: ValueType = ValueType::Message;
    const SCHEMA_VERSION: u16 = 1;

    fn into_value(self) -> RecordValue {
        RecordValue::Message(self)
    }

    fn from_value(value: &RecordValue) -> Option<&Self> {
        match value {
            RecordValue::Message(inner) => Some(inner),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CheckpointType {
    #[default]
    ManualBackup,
    ScheduledBackup,
    Marker,
}

impl CheckpointType {
    /// Markers fence the log without producing a backup.
    pub fn takes_backup(&self) -> bool {
        !matches!(self, CheckpointType::Marker)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointRecord {
    pub checkpoint_id: i64,
    pub checkpoint_position: i64,
    pub checkpoint_type: CheckpointType,
}

impl CheckpointRecord {
    pub fn new(checkpoint_id: i64, checkpoint_type: CheckpointType) -> Self {
        Self {
            checkpoint_id,
            checkpoint_position: -1,
            checkpoint_type,
        }
    }
}

impl RecordValueSchema for CheckpointRecord {
    const VALUE_TYPE: ValueType = ValueType::Checkpoint;
    const SCHEMA_VERSION: u16 = 1;

    fn into_value(self) -> RecordValue {
        RecordValue::Checkpoint(self)
    }

    fn from_value(value: &RecordValue) -> Option<&Self> {
        match value {
            RecordValue::Checkpoint(inner) => Some(inner),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleRecord {
    pub desired_partition_count: u32,
    pub current_partitions: Vec<PartitionId>,
    pub desired_partitions: Vec<PartitionId>,
}

impl ScaleRecord {
    pub fn scale_up(desired_partition_count: u32) -> Self {
        Self {
            desired_partition_count,
            ..Self::default()
        }
    }
}

impl RecordValueSchema for ScaleRecord {
    const VALUE_TYPE: ValueType = ValueType::Scale;
    const SCHEMA_VERSION: u16 = 1;

    fn into_value(self) -> RecordValue {
        RecordValue::Scale(self)
    }

    fn from_value(value: &RecordValue) -> Option<&Self> {
        match value {
            RecordValue::Scale(inner) => Some(inner),
            _ => None,
        }
    }
}

/// Payload of a record, tagged by value type.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordValue {
    Job(JobRecord),
    JobBatch(JobBatchRecord),
    Message(MessageRecord),
    Checkpoint(CheckpointRecord),
    Scale(ScaleRecord),
    /// Payload of a value type this build does not know; kept verbatim.
    Unknown(Vec<u8>),
}

impl RecordValue {
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            RecordValue::Job(_) => Some(ValueType::Job),
            RecordValue::JobBatch(_) => Some(ValueType::JobBatch),
            RecordValue::Message(_) => Some(ValueType::Message),
            RecordValue::Checkpoint(_) => Some(ValueType::Checkpoint),
            RecordValue::Scale(_) => Some(ValueType::Scale),
            RecordValue::Unknown(_) => None,
        }
    }

    pub fn schema_version(&self) -> u16 {
        match self {
            RecordValue::Job(_) => JobRecord::SCHEMA_VERSION,
            RecordValue::JobBatch(_) => JobBatchRecord::SCHEMA_VERSION,
            RecordValue::Message(_) => MessageRecord::SCHEMA_VERSION,
            RecordValue::Checkpoint(_) => CheckpointRecord::SCHEMA_VERSION,
            RecordValue::Scale(_) => ScaleRecord::SCHEMA_VERSION,
            RecordValue::Unknown(_) => 0,
        }
    }
}

impl From<JobRecord> for RecordValue {
    fn from(value: JobRecord) -> Self {
        value.into_value()
    }
}

impl From<JobBatchRecord> for RecordValue {
    fn from(value: JobBatchRecord) -> Self {
        value.into_value()
    }
}

impl From<MessageRecord> for RecordValue {
    fn from(value: MessageRecord) -> Self {
        value.into_value()
    }
}

impl From<CheckpointRecord> for RecordValue {
    fn from(value: CheckpointRecord) -> Self {
        value.into_value()
    }
}

impl From<ScaleRecord> for RecordValue {
    fn from(value: ScaleRecord) -> Self {
        value.into_value()
    }
}
