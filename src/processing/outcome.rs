use crate::core::{EngineError, PartitionId, Position};
use crate::protocol::{Record, RejectionType, UnwrittenRecord};
use std::fmt;

/// A business precondition the command did not meet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub rejection_type: RejectionType,
    pub reason: String,
}

impl Rejection {
    pub fn new(rejection_type: RejectionType, reason: impl Into<String>) -> Self {
        Self {
            rejection_type,
            reason: reason.into(),
        }
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::new(RejectionType::NotFound, reason)
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::new(RejectionType::InvalidState, reason)
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::new(RejectionType::InvalidArgument, reason)
    }

    pub fn already_exists(reason: impl Into<String>) -> Self {
        Self::new(RejectionType::AlreadyExists, reason)
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.rejection_type, self.reason)
    }
}

/// Why a command handler stopped.
#[derive(Debug)]
pub enum CommandError {
    Rejected(Rejection),
    Fatal(EngineError),
}

impl From<EngineError> for CommandError {
    fn from(err: EngineError) -> Self {
        CommandError::Fatal(err)
    }
}

impl From<Rejection> for CommandError {
    fn from(rejection: Rejection) -> Self {
        CommandError::Rejected(rejection)
    }
}

/// Work the partition performs once the command's transaction committed.
#[derive(Debug, Clone, PartialEq)]
pub enum PostCommitTask {
    /// Hand a command to another partition's log.
    SendCommand {
        partition_id: PartitionId,
        command: UnwrittenRecord,
    },
    /// Snapshot state and log for the checkpoint just created.
    TakeBackup {
        checkpoint_id: i64,
        checkpoint_position: Position,
    },
}

/// Result of processing one command.
#[derive(Debug)]
pub enum ProcessingOutcome {
    /// The command's events were applied and written.
    Applied(Vec<Record>),
    /// The command was rejected; only the rejection record was written.
    Rejected {
        rejection: Rejection,
        record: Record,
    },
    /// No handler knows the command.
    Skipped,
    /// Processing stopped the partition.
    Fatal(EngineError),
}

impl ProcessingOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ProcessingOutcome::Applied(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, ProcessingOutcome::Rejected { .. })
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            ProcessingOutcome::Rejected { rejection, .. } => Some(rejection),
            _ => None,
        }
    }

    /// Records written for the command, in log order.
    pub fn follow_ups(&self) -> &[Record] {
        match self {
            ProcessingOutcome::Applied(records) => records,
            ProcessingOutcome::Rejected { record, .. } => std::slice::from_ref(record),
            ProcessingOutcome::Skipped | ProcessingOutcome::Fatal(_) => &[],
        }
    }
}

/// A processed command together with what it caused.
#[derive(Debug)]
pub struct ProcessedCommand {
    pub command: Record,
    pub outcome: ProcessingOutcome,
    pub tasks: Vec<PostCommitTask>,
}
