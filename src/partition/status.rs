use crate::core::{PartitionId, Position, Result};
use crate::processing::{ProcessingMetrics, StreamProcessor};
use crate::state::{CheckpointInfo, JobTypeCounts};
use serde::Serialize;
use std::collections::BTreeMap;

/// Admin view of one partition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionStatus {
    pub partition_id: PartitionId,
    pub healthy: bool,
    pub failure: Option<String>,
    pub last_processed_position: Position,
    pub log_position: Position,
    pub checkpoint: CheckpointInfo,
    pub current_partitions: Vec<PartitionId>,
    pub desired_partitions: Option<Vec<PartitionId>>,
    pub job_counts: BTreeMap<String, JobTypeCounts>,
    pub message_count: usize,
    pub exporter_positions: BTreeMap<String, Position>,
    pub metrics: ProcessingMetrics,
    /// Backup uploads started but not yet finished.
    pub backups_in_flight: usize,
}

impl PartitionStatus {
    pub fn collect(processor: &StreamProcessor) -> Result<Self> {
        let db = processor.db();
        let state = processor.state();
        Ok(Self {
            partition_id: processor.partition_id(),
            healthy: processor.is_healthy(),
            failure: processor.failure().map(str::to_string),
            last_processed_position: processor.last_processed_position(),
            log_position: processor.log().last_position(),
            checkpoint: state.checkpoint.get_checkpoint(db)?,
            current_partitions: state.routing.current_partitions(db)?.into_iter().collect(),
            desired_partitions: state
                .routing
                .desired_partitions(db)?
                .map(|partitions| partitions.into_iter().collect()),
            job_counts: state.jobs.job_type_counts(db)?,
            message_count: state.messages.count(db)?,
            exporter_positions: state.exporters.all(db)?,
            metrics: processor.metrics(),
            backups_in_flight: 0,
        })
    }

    /// Jobs of every type waiting for a worker.
    pub fn activatable_jobs(&self) -> usize {
        self.job_counts.values().map(|counts| counts.activatable).sum()
    }
}
