// ============================================================================
// Binary Record Codec
// ============================================================================
//
// Payloads and state values are MessagePack maps keyed by field name, so a
// decoder skips fields it does not know and defaults fields that are absent.
// A log record is framed as:
//
//   [u32 LE header length][rmp header][rmp value bytes]
//
// The header carries the envelope plus the schema version of the value.
//
// ============================================================================

use super::intent::{Intent, ValueType};
use super::record::{Record, RecordType, RejectionType};
use super::value::{
    CheckpointRecord, JobBatchRecord, JobRecord, MessageRecord, RecordValue, RecordValueSchema,
    ScaleRecord,
};
use crate::core::{EngineError, Key, PartitionId, Position, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const HEADER_LEN_BYTES: usize = 4;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RecordHeader {
    position: Position,
    source_record_position: Position,
    key: Key,
    timestamp: i64,
    partition_id: PartitionId,
    record_type: u8,
    value_type: u16,
    intent: u8,
    rejection_type: u8,
    rejection_reason: String,
    request_id: i64,
    request_stream_id: i32,
    record_version: u16,
}

/// Encodes a state value or payload struct.
pub fn encode_state<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(value)
        .map_err(|e| EngineError::Serialization(format!("Failed to encode value: {}", e)))
}

/// Decodes a state value. Undecodable bytes are corruption.
pub fn decode_state<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes)
        .map_err(|e| EngineError::Corruption(format!("Failed to decode value: {}", e)))
}

fn decode_versioned<T: RecordValueSchema>(schema_version: u16, bytes: &[u8]) -> Result<RecordValue> {
    if schema_version > T::SCHEMA_VERSION {
        return Err(EngineError::Corruption(format!(
            "{} value has schema version {} but this build reads up to {}",
            T::VALUE_TYPE,
            schema_version,
            T::SCHEMA_VERSION
        )));
    }
    let value: T = decode_state(bytes)?;
    Ok(value.into_value())
}

pub fn encode_value(value: &RecordValue) -> Result<Vec<u8>> {
    match value {
        RecordValue::Job(job) => encode_state(job),
        RecordValue::JobBatch(batch) => encode_state(batch),
        RecordValue::Message(message) => encode_state(message),
        RecordValue::Checkpoint(checkpoint) => encode_state(checkpoint),
        RecordValue::Scale(scale) => encode_state(scale),
        RecordValue::Unknown(bytes) => Ok(bytes.clone()),
    }
}

/// Decodes a payload written with `schema_version`. Any version up to the
/// build's own is accepted; unknown value types are carried as raw bytes.
pub fn decode_value(value_type: ValueType, schema_version: u16, bytes: &[u8]) -> Result<RecordValue> {
    match value_type {
        ValueType::Job => decode_versioned::<JobRecord>(schema_version, bytes),
        ValueType::JobBatch => decode_versioned::<JobBatchRecord>(schema_version, bytes),
        ValueType::Message => decode_versioned::<MessageRecord>(schema_version, bytes),
        ValueType::Checkpoint => decode_versioned::<CheckpointRecord>(schema_version, bytes),
        ValueType::Scale => decode_versioned::<ScaleRecord>(schema_version, bytes),
        ValueType::Unknown(_) => Ok(RecordValue::Unknown(bytes.to_vec())),
    }
}

pub fn encode_record(record: &Record) -> Result<Vec<u8>> {
    let header = RecordHeader {
        position: record.position,
        source_record_position: record.source_record_position,
        key: record.key,
        timestamp: record.timestamp,
        partition_id: record.partition_id,
        record_type: record.record_type.code(),
        value_type: record.intent.value_type().code(),
        intent: record.intent.code(),
        rejection_type: record.rejection_type.code(),
        rejection_reason: record.rejection_reason.clone(),
        request_id: record.request_id,
        request_stream_id: record.request_stream_id,
        record_version: record.record_version,
    };
    let header_bytes = encode_state(&header)?;
    let value_bytes = encode_value(&record.value)?;

    let mut buf = Vec::with_capacity(HEADER_LEN_BYTES + header_bytes.len() + value_bytes.len());
    buf.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(&header_bytes);
    buf.extend_from_slice(&value_bytes);
    Ok(buf)
}

pub fn decode_record(bytes: &[u8]) -> Result<Record> {
    if bytes.len() < HEADER_LEN_BYTES {
        return Err(EngineError::Corruption(format!(
            "Record frame of {} bytes is shorter than its header length",
            bytes.len()
        )));
    }
    let mut len_bytes = [0u8; HEADER_LEN_BYTES];
    len_bytes.copy_from_slice(&bytes[..HEADER_LEN_BYTES]);
    let header_len = u32::from_le_bytes(len_bytes) as usize;
    let header_end = HEADER_LEN_BYTES
        .checked_add(header_len)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| {
            EngineError::Corruption(format!(
                "Record header length {} exceeds frame of {} bytes",
                header_len,
                bytes.len()
            ))
        })?;

    let header: RecordHeader = decode_state(&bytes[HEADER_LEN_BYTES..header_end])?;
    let record_type = RecordType::from_code(header.record_type).ok_or_else(|| {
        EngineError::Corruption(format!("Unknown record type code {}", header.record_type))
    })?;
    let value_type = ValueType::from_code(header.value_type);
    let value = decode_value(value_type, header.record_version, &bytes[header_end..])?;

    Ok(Record {
        position: header.position,
        source_record_position: header.source_record_position,
        key: header.key,
        timestamp: header.timestamp,
        partition_id: header.partition_id,
        record_type,
        intent: Intent::from_code(value_type, header.intent),
        rejection_type: RejectionType::from_code(header.rejection_type),
        rejection_reason: header.rejection_reason,
        request_id: header.request_id,
        request_stream_id: header.request_stream_id,
        record_version: header.record_version,
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::intent::JobIntent;
    use crate::protocol::record::UnwrittenRecord;

    fn job_command() -> Record {
        let mut variables = super::super::value::Variables::new();
        variables.insert("b".into(), serde_json::json!(2));
        variables.insert("a".into(), serde_json::json!({"nested": [1, 2, 3]}));
        UnwrittenRecord::new_command(
            Intent::Job(JobIntent::Create),
            JobRecord::new("payment", 3).with_variables(variables),
        )
        .with_timestamp(1_000)
        .into_record(7, 1)
    }

    #[test]
    fn test_record_frame_decodes_to_same_record() {
        let record = job_command();
        let bytes = encode_record(&record).unwrap();
        let decoded = decode_record(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let a = encode_record(&job_command()).unwrap();
        let b = encode_record(&job_command()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unknown_fields_are_ignored_and_missing_fields_default() {
        #[derive(Serialize)]
        struct FutureJob {
            job_type: String,
            retries: i32,
            priority: u8,
        }
        let bytes = encode_state(&FutureJob {
            job_type: "email".into(),
            retries: 5,
            priority: 9,
        })
        .unwrap();

        let value = decode_value(ValueType::Job, 1, &bytes).unwrap();
        let RecordValue::Job(job) = value else {
            panic!("expected a job value");
        };
        assert_eq!(job.job_type, "email");
        assert_eq!(job.retries, 5);
        assert_eq!(job.deadline, None);
        assert!(job.variables.is_empty());
    }

    #[test]
    fn test_newer_schema_version_is_corruption() {
        let bytes = encode_state(&JobRecord::new("email", 1)).unwrap();
        let err = decode_value(ValueType::Job, JobRecord::SCHEMA_VERSION + 1, &bytes).unwrap_err();
        assert!(matches!(err, EngineError::Corruption(_)));
    }

    #[test]
    fn test_structurally_invalid_buffers_are_corruption() {
        assert!(matches!(decode_record(&[1, 2]), Err(EngineError::Corruption(_))));
        assert!(matches!(
            decode_record(&[200, 0, 0, 0, 1, 2, 3]),
            Err(EngineError::Corruption(_))
        ));
        assert!(matches!(
            decode_state::<JobRecord>(&[0xc1, 0xff]),
            Err(EngineError::Corruption(_))
        ));
    }

    #[test]
    fn test_unknown_value_type_is_kept_verbatim() {
        let mut record = job_command();
        record.intent = Intent::from_code(ValueType::Unknown(99), 4);
        record.value = RecordValue::Unknown(vec![0x91, 0x01]);
        record.record_version = 0;

        let decoded = decode_record(&encode_record(&record).unwrap()).unwrap();
        assert_eq!(decoded.value, RecordValue::Unknown(vec![0x91, 0x01]));
        assert_eq!(decoded.intent.value_type(), ValueType::Unknown(99));
        assert!(!decoded.intent.is_known());
    }
}
