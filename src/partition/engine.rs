// ============================================================================
// Engine
// ============================================================================
//
// Starts one partition actor per partition of the node, routes client
// commands to the partition owning them and fans admin requests out to every
// partition. Keyed commands go to the partition encoded in the key, message
// publishes to the partition their correlation key hashes to, job creation is
// spread round-robin.
//
// ============================================================================

use super::actor::{CommandResponse, PartitionActor, PartitionHandle};
use super::router::{CommandSender, PartitionRouter};
use super::status::PartitionStatus;
use crate::backup::{BackupCoordinator, BackupStatus, BackupStore, FileSystemBackupStore};
use crate::config::EngineConfig;
use crate::core::{EngineError, Key, PartitionId, Result, START_PARTITION_ID, decode_partition_id};
use crate::exporter::Exporter;
use crate::processing::{ScheduledSweep, StreamProcessor};
use crate::protocol::{
    CheckpointIntent, CheckpointRecord, CheckpointType, Intent, JobBatchIntent, JobBatchRecord, JobIntent,
    JobRecord, MessageIntent, MessageRecord, ScaleIntent, ScaleRecord, UnwrittenRecord,
};
use crate::state::hash_mod_partition;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Request stream id of commands submitted through the engine.
pub const CLIENT_REQUEST_STREAM: i32 = 0;

/// Directory below the data directory where backups are staged.
pub const BACKUP_STAGING_DIR: &str = ".backup-staging";

pub struct Engine {
    config: EngineConfig,
    router: Arc<PartitionRouter>,
    partitions: BTreeMap<PartitionId, PartitionHandle>,
    backups: Option<Arc<BackupCoordinator>>,
    partition_count: u32,
    next_request_id: AtomicI64,
}

impl Engine {
    /// Starts the engine with the file system backup store from the config,
    /// if one is configured.
    pub async fn start(config: EngineConfig) -> Result<Self> {
        let store = config
            .backup
            .root
            .clone()
            .map(|root| Arc::new(FileSystemBackupStore::new(root)) as Arc<dyn BackupStore>);
        Self::start_with_backup_store(config, store).await
    }

    pub async fn start_with_backup_store(config: EngineConfig, store: Option<Arc<dyn BackupStore>>) -> Result<Self> {
        config.validate()?;
        let backups = store.map(|store| {
            Arc::new(BackupCoordinator::new(
                store,
                config.node_id.clone(),
                config.data_dir.join(BACKUP_STAGING_DIR),
            ))
        });
        let initial_count = config.partition_count;
        let mut engine = Self {
            config,
            router: Arc::new(PartitionRouter::new()),
            partitions: BTreeMap::new(),
            backups,
            partition_count: initial_count,
            next_request_id: AtomicI64::new(1),
        };

        for partition_id in START_PARTITION_ID..START_PARTITION_ID + initial_count {
            engine.start_partition(partition_id, initial_count)?;
        }

        // Partitions added by a scale-up before the last restart.
        let routed = engine.partition(START_PARTITION_ID)?.status().await?.current_partitions;
        let routed_count = routed.len() as u32;
        for partition_id in routed {
            if !engine.partitions.contains_key(&partition_id) {
                engine.start_partition(partition_id, routed_count)?;
            }
        }
        engine.partition_count = engine.partition_count.max(routed_count);

        tracing::info!(
            node = %engine.config.node_id,
            partitions = engine.partition_count,
            "engine started"
        );
        Ok(engine)
    }

    fn start_partition(&mut self, partition_id: PartitionId, partition_count: u32) -> Result<()> {
        let mut processor = StreamProcessor::open(
            partition_id,
            &self.config.partition_dir(partition_id),
            &self.config.storage,
            self.config.processing.clone(),
        )?;
        processor.initialize_routing(partition_count)?;

        let actor = PartitionActor::new(
            processor,
            self.config.processing.clone(),
            self.config.exporter.retry.clone(),
            Arc::clone(&self.router) as Arc<dyn CommandSender>,
            self.backups.clone(),
        );
        let handle = actor.spawn(self.config.request_channel_capacity);
        self.router.register(partition_id, handle.requests())?;
        self.partitions.insert(partition_id, handle);
        tracing::debug!(partition = partition_id, "partition started");
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn partition_ids(&self) -> Vec<PartitionId> {
        self.partitions.keys().copied().collect()
    }

    pub fn partition(&self, partition_id: PartitionId) -> Result<&PartitionHandle> {
        self.partitions
            .get(&partition_id)
            .ok_or(EngineError::PartitionUnavailable(partition_id))
    }

    pub fn backup_store(&self) -> Option<&Arc<dyn BackupStore>> {
        self.backups.as_ref().map(|coordinator| coordinator.store())
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Submits `command` to `partition_id` with a fresh request id.
    pub async fn submit(&self, partition_id: PartitionId, command: UnwrittenRecord) -> Result<CommandResponse> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.partition(partition_id)?
            .submit(command.with_request(CLIENT_REQUEST_STREAM, request_id))
            .await
    }

    pub async fn create_job(&self, job: JobRecord) -> Result<CommandResponse> {
        let slot = self.next_request_id.load(Ordering::Relaxed).rem_euclid(self.partition_count as i64);
        let partition_id = START_PARTITION_ID + slot as u32;
        self.submit(partition_id, UnwrittenRecord::new_command(Intent::Job(JobIntent::Create), job))
            .await
    }

    /// Sends a job command to the partition that owns `key`.
    pub async fn job_command(&self, intent: JobIntent, key: Key, job: JobRecord) -> Result<CommandResponse> {
        self.submit(
            decode_partition_id(key),
            UnwrittenRecord::command(Intent::Job(intent), key, job),
        )
        .await
    }

    pub async fn activate_jobs(&self, partition_id: PartitionId, batch: JobBatchRecord) -> Result<CommandResponse> {
        self.submit(
            partition_id,
            UnwrittenRecord::new_command(Intent::JobBatch(JobBatchIntent::Activate), batch),
        )
        .await
    }

    pub async fn publish_message(&self, message: MessageRecord) -> Result<CommandResponse> {
        let partition_id = hash_mod_partition(message.correlation_key.as_bytes(), self.partition_count);
        self.submit(
            partition_id,
            UnwrittenRecord::new_command(Intent::Message(MessageIntent::Publish), message),
        )
        .await
    }

    // ------------------------------------------------------------------
    // Admin
    // ------------------------------------------------------------------

    /// Creates checkpoint `checkpoint_id` on every partition.
    pub async fn checkpoint(
        &self,
        checkpoint_id: i64,
        checkpoint_type: CheckpointType,
    ) -> Result<BTreeMap<PartitionId, CommandResponse>> {
        let requests = self.partitions.keys().map(|&partition_id| async move {
            let command = UnwrittenRecord::new_command(
                Intent::Checkpoint(CheckpointIntent::Create),
                CheckpointRecord::new(checkpoint_id, checkpoint_type),
            );
            (partition_id, self.submit(partition_id, command).await)
        });
        let mut responses = BTreeMap::new();
        for (partition_id, response) in join_all(requests).await {
            responses.insert(partition_id, response?);
        }
        tracing::info!(checkpoint_id, partitions = responses.len(), "checkpoint requested");
        Ok(responses)
    }

    /// Waits for every backup upload started so far.
    pub async fn wait_for_backups(&self) -> Result<Vec<BackupStatus>> {
        let results = join_all(self.partitions.values().map(|handle| handle.await_backups())).await;
        let mut statuses = Vec::new();
        for result in results {
            statuses.extend(result?);
        }
        Ok(statuses)
    }

    /// Grows the node to `desired_partition_count` partitions.
    ///
    /// Existing partitions record the target first, then the new partitions
    /// start, then the existing partitions switch their correlation over.
    /// A failed attempt can be repeated with the same target.
    pub async fn scale_up(&mut self, desired_partition_count: u32) -> Result<()> {
        let existing = self.partition_ids();
        for &partition_id in &existing {
            let command = UnwrittenRecord::new_command(
                Intent::Scale(ScaleIntent::ScaleUp),
                ScaleRecord::scale_up(desired_partition_count),
            );
            ensure_accepted(partition_id, self.submit(partition_id, command).await?)?;
        }

        for partition_id in START_PARTITION_ID..START_PARTITION_ID + desired_partition_count {
            if !self.partitions.contains_key(&partition_id) {
                self.start_partition(partition_id, desired_partition_count)?;
            }
        }

        for &partition_id in &existing {
            let command = UnwrittenRecord::new_command(
                Intent::Scale(ScaleIntent::MarkScaledUp),
                ScaleRecord::scale_up(desired_partition_count),
            );
            ensure_accepted(partition_id, self.submit(partition_id, command).await?)?;
        }

        self.partition_count = desired_partition_count;
        tracing::info!(partitions = desired_partition_count, "scaled up");
        Ok(())
    }

    pub async fn status(&self) -> Result<Vec<PartitionStatus>> {
        join_all(self.partitions.values().map(|handle| handle.status()))
            .await
            .into_iter()
            .collect()
    }

    pub async fn add_exporter(&self, partition_id: PartitionId, exporter: Box<dyn Exporter>) -> Result<()> {
        self.partition(partition_id)?.add_exporter(exporter).await
    }

    /// Runs `sweep` on every partition as of `now`. Returns the commands processed.
    pub async fn run_sweep(&self, sweep: ScheduledSweep, now: i64) -> Result<usize> {
        let results = join_all(self.partitions.values().map(|handle| handle.run_sweep(sweep, now))).await;
        results
            .into_iter()
            .try_fold(0usize, |total, result: Result<usize>| -> Result<usize> { Ok(total + result?) })
    }

    pub async fn compact(&self) -> Result<usize> {
        let results = join_all(self.partitions.values().map(|handle| handle.compact())).await;
        results
            .into_iter()
            .try_fold(0usize, |total, result: Result<usize>| -> Result<usize> { Ok(total + result?) })
    }

    /// Stops every partition. Pending backup uploads finish first.
    pub async fn shutdown(mut self) -> Result<()> {
        let partitions = std::mem::take(&mut self.partitions);
        for (partition_id, handle) in partitions {
            self.router.unregister(partition_id)?;
            handle.stop().await?;
        }
        tracing::info!(node = %self.config.node_id, "engine stopped");
        Ok(())
    }
}

fn ensure_accepted(partition_id: PartitionId, response: CommandResponse) -> Result<()> {
    match response {
        CommandResponse::Rejected {
            rejection_type, reason, ..
        } => Err(EngineError::ExecutionError(format!(
            "Partition {} rejected the command ({}): {}",
            partition_id, rejection_type, reason
        ))),
        _ => Ok(()),
    }
}
