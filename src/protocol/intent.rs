// ============================================================================
// Value Types and Intents
// ============================================================================
//
// Every record names the payload schema it carries (value type) and the verb
// applied to it (intent). Both travel as small integer codes so that logs
// written by newer versions stay readable: unknown codes decode into the
// `Unknown` variants instead of failing.
//
// ============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValueType {
    Job,
    JobBatch,
    Message,
    Checkpoint,
    Scale,
    Unknown(u16),
}

impl ValueType {
    pub fn code(&self) -> u16 {
        match self {
            ValueType::Job => 0,
            ValueType::JobBatch => 1,
            ValueType::Message => 2,
            ValueType::Checkpoint => 3,
            ValueType::Scale => 4,
            ValueType::Unknown(code) => *code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            0 => ValueType::Job,
            1 => ValueType::JobBatch,
            2 => ValueType::Message,
            3 => ValueType::Checkpoint,
            4 => ValueType::Scale,
            other => ValueType::Unknown(other),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Job => write!(f, "JOB"),
            ValueType::JobBatch => write!(f, "JOB_BATCH"),
            ValueType::Message => write!(f, "MESSAGE"),
            ValueType::Checkpoint => write!(f, "CHECKPOINT"),
            ValueType::Scale => write!(f, "SCALE"),
            ValueType::Unknown(code) => write!(f, "UNKNOWN({})", code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum JobIntent {
    Create = 0,
    Created = 1,
    Complete = 2,
    Completed = 3,
    Fail = 4,
    Failed = 5,
    TimeOut = 6,
    TimedOut = 7,
    UpdateRetries = 8,
    RetriesUpdated = 9,
    Cancel = 10,
    Canceled = 11,
    ThrowError = 12,
    ErrorThrown = 13,
    RecurAfterBackoff = 14,
    RecurredAfterBackoff = 15,
    UpdateTimeout = 16,
    TimeoutUpdated = 17,
}

impl JobIntent {
    pub fn from_code(code: u8) -> Option<Self> {
        use JobIntent::*;
        let intent = match code {
            0 => Create,
            1 => Created,
            2 => Complete,
            3 => Completed,
            4 => Fail,
            5 => Failed,
            6 => TimeOut,
            7 => TimedOut,
            8 => UpdateRetries,
            9 => RetriesUpdated,
            10 => Cancel,
            11 => Canceled,
            12 => ThrowError,
            13 => ErrorThrown,
            14 => RecurAfterBackoff,
            15 => RecurredAfterBackoff,
            16 => UpdateTimeout,
            17 => TimeoutUpdated,
            _ => return None,
        };
        Some(intent)
    }

    /// Events carry odd codes, commands even ones.
    pub fn is_event(self) -> bool {
        (self as u8) % 2 == 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum JobBatchIntent {
    Activate = 0,
    Activated = 1,
}

impl JobBatchIntent {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(JobBatchIntent::Activate),
            1 => Some(JobBatchIntent::Activated),
            _ => None,
        }
    }

    pub fn is_event(self) -> bool {
        matches!(self, JobBatchIntent::Activated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageIntent {
    Publish = 0,
    Published = 1,
    Expire = 2,
    Expired = 3,
}

impl MessageIntent {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(MessageIntent::Publish),
            1 => Some(MessageIntent::Published),
            2 => Some(MessageIntent::Expire),
            3 => Some(MessageIntent::Expired),
            _ => None,
        }
    }

    pub fn is_event(self) -> bool {
        matches!(self, MessageIntent::Published | MessageIntent::Expired)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CheckpointIntent {
    Create = 0,
    Created = 1,
    Ignored = 2,
}

impl CheckpointIntent {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CheckpointIntent::Create),
            1 => Some(CheckpointIntent::Created),
            2 => Some(CheckpointIntent::Ignored),
            _ => None,
        }
    }

    pub fn is_event(self) -> bool {
        !matches!(self, CheckpointIntent::Create)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ScaleIntent {
    ScaleUp = 0,
    ScalingUp = 1,
    MarkScaledUp = 2,
    ScaledUp = 3,
}

impl ScaleIntent {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ScaleIntent::ScaleUp),
            1 => Some(ScaleIntent::ScalingUp),
            2 => Some(ScaleIntent::MarkScaledUp),
            3 => Some(ScaleIntent::ScaledUp),
            _ => None,
        }
    }

    pub fn is_event(self) -> bool {
        matches!(self, ScaleIntent::ScalingUp | ScaleIntent::ScaledUp)
    }
}

/// The verb of a record, scoped by its value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intent {
    Job(JobIntent),
    JobBatch(JobBatchIntent),
    Message(MessageIntent),
    Checkpoint(CheckpointIntent),
    Scale(ScaleIntent),
    Unknown { value_type: u16, code: u8 },
}

impl Intent {
    pub fn value_type(&self) -> ValueType {
        match self {
            Intent::Job(_) => ValueType::Job,
            Intent::JobBatch(_) => ValueType::JobBatch,
            Intent::Message(_) => ValueType::Message,
            Intent::Checkpoint(_) => ValueType::Checkpoint,
            Intent::Scale(_) => ValueType::Scale,
            Intent::Unknown { value_type, .. } => ValueType::from_code(*value_type),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Intent::Job(intent) => *intent as u8,
            Intent::JobBatch(intent) => *intent as u8,
            Intent::Message(intent) => *intent as u8,
            Intent::Checkpoint(intent) => *intent as u8,
            Intent::Scale(intent) => *intent as u8,
            Intent::Unknown { code, .. } => *code,
        }
    }

    /// Decodes an intent code. Codes this build does not know map to `Unknown`.
    pub fn from_code(value_type: ValueType, code: u8) -> Self {
        let known = match value_type {
            ValueType::Job => JobIntent::from_code(code).map(Intent::Job),
            ValueType::JobBatch => JobBatchIntent::from_code(code).map(Intent::JobBatch),
            ValueType::Message => MessageIntent::from_code(code).map(Intent::Message),
            ValueType::Checkpoint => CheckpointIntent::from_code(code).map(Intent::Checkpoint),
            ValueType::Scale => ScaleIntent::from_code(code).map(Intent::Scale),
            ValueType::Unknown(_) => None,
        };
        known.unwrap_or(Intent::Unknown {
            value_type: value_type.code(),
            code,
        })
    }

    pub fn is_event(&self) -> bool {
        match self {
            Intent::Job(intent) => intent.is_event(),
            Intent::JobBatch(intent) => intent.is_event(),
            Intent::Message(intent) => intent.is_event(),
            Intent::Checkpoint(intent) => intent.is_event(),
            Intent::Scale(intent) => intent.is_event(),
            Intent::Unknown { .. } => false,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Intent::Unknown { .. })
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intent::Job(intent) => write!(f, "JOB:{:?}", intent),
            Intent::JobBatch(intent) => write!(f, "JOB_BATCH:{:?}", intent),
            Intent::Message(intent) => write!(f, "MESSAGE:{:?}", intent),
            Intent::Checkpoint(intent) => write!(f, "CHECKPOINT:{:?}", intent),
            Intent::Scale(intent) => write!(f, "SCALE:{:?}", intent),
            Intent::Unknown { value_type, code } => write!(f, "UNKNOWN({}):{}", value_type, code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_codes_round_trip() {
        for code in 0..18u8 {
            let intent = Intent::from_code(ValueType::Job, code);
            assert!(intent.is_known());
            assert_eq!(intent.code(), code);
            assert_eq!(intent.value_type(), ValueType::Job);
        }
    }

    #[test]
    fn test_unknown_codes_are_preserved() {
        let intent = Intent::from_code(ValueType::Job, 200);
        assert_eq!(intent, Intent::Unknown { value_type: 0, code: 200 });
        assert_eq!(intent.value_type(), ValueType::Job);

        let future = Intent::from_code(ValueType::from_code(77), 1);
        assert_eq!(future.value_type(), ValueType::Unknown(77));
        assert!(!future.is_event());
    }

    #[test]
    fn test_event_classification() {
        assert!(!Intent::Job(JobIntent::Complete).is_event());
        assert!(Intent::Job(JobIntent::Completed).is_event());
        assert!(Intent::Checkpoint(CheckpointIntent::Ignored).is_event());
        assert!(!Intent::Scale(ScaleIntent::MarkScaledUp).is_event());
    }
}
