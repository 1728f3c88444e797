pub mod codec;
pub mod intent;
pub mod record;
pub mod value;

pub use codec::{decode_record, decode_state, decode_value, encode_record, encode_state, encode_value};
pub use intent::{
    CheckpointIntent, Intent, JobBatchIntent, JobIntent, MessageIntent, ScaleIntent, ValueType,
};
pub use record::{Record, RecordEnvelope, RecordType, RejectionType, UnwrittenRecord};
pub use value::{
    CheckpointRecord, CheckpointType, JobBatchRecord, JobRecord, MessageRecord, RecordValue,
    RecordValueSchema, ScaleRecord, Variables,
};
