// ============================================================================
// Engine State
// ============================================================================
//
// Typed views over the column families of one partition. The views hold no
// data; every call names the store it reads or writes, which lets the same
// code run against the live store inside the processor's transaction and
// against read-only snapshots handed to observers.
//
// ============================================================================

pub mod checkpoint;
pub mod job;
pub mod key_generator;
pub mod message;
pub mod position;
pub mod routing;

pub use checkpoint::{CheckpointInfo, CheckpointState};
pub use job::{JobState, JobStatus, JobTypeCounts};
pub use key_generator::{DbKeyGenerator, ImmutableKeyGenerator, KeyGenerator};
pub use message::MessageState;
pub use position::{ExporterPositionState, LastProcessedPositionState};
pub use routing::{MessageCorrelation, PartitionSet, RoutingState, correlation_hash, hash_mod_partition};

/// All state views of a partition.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessingState {
    pub jobs: JobState,
    pub messages: MessageState,
    pub routing: RoutingState,
    pub checkpoint: CheckpointState,
    pub last_processed: LastProcessedPositionState,
    pub exporters: ExporterPositionState,
}
