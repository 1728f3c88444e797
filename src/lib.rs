// ============================================================================
// Stateflow Library
// ============================================================================
//
// Partitioned, event-sourced stream processing. Each partition owns an
// append-only record log and a transactional keyed state store; a single
// processor per partition turns commands into events and applies them to
// the store exactly once, surviving crashes by replaying the log.
//
//   protocol    record envelope, values, intents, binary codec
//   storage     column-family key-value store with transactions and a WAL
//   state       typed views: jobs, messages, routing, checkpoints, positions
//   log         per-partition record log
//   processing  command handlers, event appliers, the stream processor
//   backup      checkpoint-aligned backups and restore
//   exporter    ordered export of committed records
//   partition   tokio actors per partition and the engine that routes to them
//
// ============================================================================

pub mod backup;
pub mod config;
pub mod core;
pub mod exporter;
pub mod log;
pub mod partition;
pub mod processing;
pub mod protocol;
pub mod state;
pub mod storage;
pub mod transaction;

pub use config::{
    BackupConfig, EngineConfig, ExporterConfig, ProcessingConfig, RetryPolicy, StorageConfig,
};
pub use core::{EngineError, Key, PartitionId, Position, Result};
pub use partition::{CommandResponse, Engine, PartitionStatus};
pub use processing::{ProcessingOutcome, StreamProcessor};
pub use protocol::{Intent, Record, RecordType, RecordValue, UnwrittenRecord};
pub use storage::{DurabilityMode, StateDb};
