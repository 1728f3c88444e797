// ============================================================================
// Partition Actor
// ============================================================================
//
// One tokio task per partition owns the partition's `StreamProcessor` and is
// the only code that touches it. Client commands, commands forwarded by other
// partitions and admin requests arrive over one mpsc channel and are handled
// one at a time. Interval ticks run the scheduled sweeps, which inject their
// commands into the same log and pipeline.
//
// After every processing run the actor executes the post-commit tasks:
// forwarded commands are handed to the sender seam on a separate task, and
// backups are staged before the next command is processed, then uploaded in
// the background.
//
// ============================================================================

use super::router::CommandSender;
use super::status::PartitionStatus;
use crate::backup::{BackupCoordinator, BackupIdentifier, BackupStatus};
use crate::config::{ProcessingConfig, RetryPolicy};
use crate::core::{EngineError, PartitionId, Result};
use crate::exporter::{Exporter, ExporterDirector};
use crate::processing::{PostCommitTask, ProcessedCommand, ProcessingOutcome, ScheduledSweep, StreamProcessor};
use crate::protocol::{Record, RecordEnvelope, RejectionType, UnwrittenRecord};
use futures::FutureExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tracing::{Instrument, info_span};

/// Outcomes of finished uploads kept for the next `AwaitBackups`.
const RETAINED_UPLOAD_RESULTS: usize = 64;

/// What a submitter learns about its command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResponse {
    /// The event answering the command.
    Event(Record),
    Rejected {
        rejection_type: RejectionType,
        reason: String,
        record: Record,
    },
    /// The command belongs to another partition and was handed over.
    Forwarded { partition_id: PartitionId },
    /// No handler is registered for the command.
    Skipped,
}

impl CommandResponse {
    fn from_processed(processed: ProcessedCommand) -> Result<Self> {
        let partition_id = processed.command.partition_id;
        let request_id = processed.command.request_id;
        match processed.outcome {
            ProcessingOutcome::Applied(records) => {
                let answer = records
                    .iter()
                    .position(|record| record.is_event() && record.has_request() && record.request_id == request_id)
                    .or_else(|| records.iter().position(|record| record.is_event()));
                if let Some(index) = answer {
                    return Ok(CommandResponse::Event(records[index].clone()));
                }
                let forwarded = processed.tasks.iter().find_map(|task| match task {
                    PostCommitTask::SendCommand { partition_id, .. } => Some(*partition_id),
                    PostCommitTask::TakeBackup { .. } => None,
                });
                Ok(match forwarded {
                    Some(partition_id) => CommandResponse::Forwarded { partition_id },
                    None => CommandResponse::Skipped,
                })
            }
            ProcessingOutcome::Rejected { rejection, record } => Ok(CommandResponse::Rejected {
                rejection_type: rejection.rejection_type,
                reason: rejection.reason,
                record,
            }),
            ProcessingOutcome::Skipped => Ok(CommandResponse::Skipped),
            ProcessingOutcome::Fatal(_) => Err(EngineError::PartitionUnavailable(partition_id)),
        }
    }

    pub fn event(&self) -> Option<&Record> {
        match self {
            CommandResponse::Event(record) => Some(record),
            _ => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, CommandResponse::Rejected { .. })
    }
}

type Reply<T> = oneshot::Sender<Result<T>>;

pub(crate) enum PartitionRequest {
    /// `reply` is absent for commands forwarded by other partitions.
    Command {
        command: UnwrittenRecord,
        reply: Option<Reply<CommandResponse>>,
    },
    Sweep {
        sweep: ScheduledSweep,
        now: i64,
        reply: Reply<usize>,
    },
    AddExporter {
        exporter: Box<dyn Exporter>,
        reply: Reply<()>,
    },
    RemoveExporter {
        exporter_id: String,
        reply: Reply<()>,
    },
    Export {
        reply: Reply<usize>,
    },
    Compact {
        reply: Reply<usize>,
    },
    AwaitBackups {
        reply: Reply<Vec<BackupStatus>>,
    },
    Status {
        reply: Reply<PartitionStatus>,
    },
}

pub struct PartitionActor {
    processor: StreamProcessor,
    exporters: ExporterDirector,
    backups: Option<Arc<BackupCoordinator>>,
    sender: Arc<dyn CommandSender>,
    uploads: Vec<JoinHandle<Result<BackupStatus>>>,
    finished_uploads: VecDeque<Result<BackupStatus>>,
    config: ProcessingConfig,
}

impl PartitionActor {
    pub fn new(
        processor: StreamProcessor,
        config: ProcessingConfig,
        exporter_retry: RetryPolicy,
        sender: Arc<dyn CommandSender>,
        backups: Option<Arc<BackupCoordinator>>,
    ) -> Self {
        let exporters = ExporterDirector::new(processor.partition_id(), exporter_retry);
        Self {
            processor,
            exporters,
            backups,
            sender,
            uploads: Vec::new(),
            finished_uploads: VecDeque::new(),
            config,
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.processor.partition_id()
    }

    /// Moves the actor onto its own task.
    pub fn spawn(self, capacity: usize) -> PartitionHandle {
        let partition_id = self.partition_id();
        let (requests_tx, requests_rx) = mpsc::channel(capacity.max(1));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let span = info_span!("partition", partition = partition_id);
        let join_handle = tokio::spawn(self.run(requests_rx, stop_rx).instrument(span));
        PartitionHandle {
            partition_id,
            requests: requests_tx,
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }

    async fn run(mut self, mut requests: mpsc::Receiver<PartitionRequest>, mut stop_rx: oneshot::Receiver<()>) {
        // Commands appended before a restart but never processed.
        if self.processor.is_healthy() {
            match self.processor.process_pending() {
                Ok(batch) => {
                    if let Err(err) = self.settle(batch).await {
                        tracing::error!(error = %err, "processing pending commands failed");
                    }
                }
                Err(err) => tracing::error!(error = %err, "processing pending commands failed"),
            }
        }

        let mut timeouts = sweep_interval(self.config.job_timeout_check_interval_ms);
        let mut backoffs = sweep_interval(self.config.job_backoff_check_interval_ms);
        let mut expirations = sweep_interval(self.config.message_ttl_check_interval_ms);

        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                request = requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
                _ = timeouts.tick() => self.tick(ScheduledSweep::JobTimeouts).await,
                _ = backoffs.tick() => self.tick(ScheduledSweep::JobBackoff).await,
                _ = expirations.tick() => self.tick(ScheduledSweep::MessageTtl).await,
            }
        }

        if let Err(err) = self.await_uploads().await {
            tracing::warn!(error = %err, "backup upload did not finish before shutdown");
        }
        self.exporters.close().await;
        tracing::info!(
            last_processed = self.processor.last_processed_position(),
            "partition stopped"
        );
    }

    async fn handle(&mut self, request: PartitionRequest) {
        match request {
            PartitionRequest::Command { command, reply } => {
                let result = self.submit(command).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                } else if let Err(err) = result {
                    tracing::warn!(error = %err, "forwarded command was not processed");
                }
            }
            PartitionRequest::Sweep { sweep, now, reply } => {
                let _ = reply.send(self.sweep(sweep, now).await);
            }
            PartitionRequest::AddExporter { exporter, reply } => {
                let result = self.exporters.add(exporter, &self.processor).await;
                let result = match result {
                    Ok(()) => self.export().await.map(|_| ()),
                    Err(err) => Err(err),
                };
                let _ = reply.send(result);
            }
            PartitionRequest::RemoveExporter { exporter_id, reply } => {
                let _ = reply.send(self.exporters.remove(&exporter_id, &mut self.processor).await);
            }
            PartitionRequest::Export { reply } => {
                let _ = reply.send(self.export().await);
            }
            PartitionRequest::Compact { reply } => {
                let _ = reply.send(self.processor.compact_log());
            }
            PartitionRequest::AwaitBackups { reply } => {
                let _ = reply.send(self.await_uploads().await);
            }
            PartitionRequest::Status { reply } => {
                self.reap_uploads();
                let status = PartitionStatus::collect(&self.processor).map(|mut status| {
                    status.backups_in_flight = self.uploads.len();
                    status
                });
                let _ = reply.send(status);
            }
        }
    }

    async fn submit(&mut self, command: UnwrittenRecord) -> Result<CommandResponse> {
        let run = self.processor.process_command(command)?;
        let submitted = run.submitted;
        let settled = self.settle(run.processed).await?;
        let processed = settled
            .into_iter()
            .find(|processed| processed.command.position == submitted)
            .ok_or(EngineError::PartitionUnavailable(self.partition_id()))?;
        CommandResponse::from_processed(processed)
    }

    async fn tick(&mut self, sweep: ScheduledSweep) {
        if !self.processor.is_healthy() {
            return;
        }
        let now = chrono::Utc::now().timestamp_millis();
        if let Err(err) = self.sweep(sweep, now).await {
            tracing::warn!(sweep = %sweep, error = %err, "scheduled sweep failed");
        }
    }

    async fn sweep(&mut self, sweep: ScheduledSweep, now: i64) -> Result<usize> {
        let processed = self.processor.run_sweep(sweep, now)?;
        Ok(self.settle(processed).await?.len())
    }

    /// Runs the tasks of `batch`. A batch that ended for a backup is
    /// continued once the backup is staged.
    async fn settle(&mut self, mut batch: Vec<ProcessedCommand>) -> Result<Vec<ProcessedCommand>> {
        let mut settled = Vec::new();
        loop {
            let paused = batch
                .last()
                .is_some_and(|processed| processed.tasks.iter().any(is_backup));
            for processed in &batch {
                self.run_tasks(processed);
            }
            settled.append(&mut batch);
            if !paused || !self.processor.is_healthy() {
                break;
            }
            batch = self.processor.process_pending()?;
            if batch.is_empty() {
                break;
            }
        }
        if let Err(err) = self.export().await {
            tracing::warn!(error = %err, "export failed, will retry on the next run");
        }
        Ok(settled)
    }

    fn run_tasks(&mut self, processed: &ProcessedCommand) {
        for task in &processed.tasks {
            match task {
                PostCommitTask::SendCommand { partition_id, command } => {
                    let sender = Arc::clone(&self.sender);
                    let target = *partition_id;
                    let command = command.clone();
                    tokio::spawn(async move {
                        if let Err(err) = sender.send_command(target, command).await {
                            tracing::warn!(target_partition = target, error = %err, "command forwarding failed");
                        }
                    });
                }
                PostCommitTask::TakeBackup { checkpoint_id, .. } => self.stage_backup(*checkpoint_id),
            }
        }
    }

    fn stage_backup(&mut self, checkpoint_id: i64) {
        let Some(coordinator) = self.backups.clone() else {
            tracing::debug!(checkpoint_id, "no backup store configured, skipping backup");
            return;
        };
        self.reap_uploads();
        let partition_count = self
            .processor
            .state()
            .routing
            .current_partitions(self.processor.db())
            .map(|partitions| partitions.len() as u32)
            .unwrap_or(0);
        let pending = match coordinator.take_snapshot(&self.processor, checkpoint_id, partition_count) {
            Ok(pending) => pending,
            Err(err) => {
                tracing::error!(checkpoint_id, error = %err, "backup snapshot failed");
                let id = BackupIdentifier::new(coordinator.node_id(), self.partition_id(), checkpoint_id);
                let reason = err.to_string();
                self.uploads.push(tokio::spawn(async move {
                    coordinator.store().mark_failed(&id, &reason).await?;
                    Err(err)
                }));
                return;
            }
        };
        self.uploads
            .push(tokio::spawn(async move { coordinator.complete(pending).await }));
    }

    async fn export(&mut self) -> Result<usize> {
        if self.exporters.is_empty() {
            return Ok(0);
        }
        let result = self.exporters.export_pending(&mut self.processor).await;
        let exported = match &result {
            Ok(exported) => *exported,
            Err(_) => 0,
        };
        self.processor.metrics_mut().record_exported(exported);
        result
    }

    /// Moves the outcome of finished uploads out of `uploads`.
    fn reap_uploads(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.uploads)
            .into_iter()
            .partition(|upload| upload.is_finished());
        self.uploads = running;
        for mut upload in finished {
            let Some(joined) = (&mut upload).now_or_never() else {
                self.uploads.push(upload);
                continue;
            };
            let result = upload_result(joined);
            match &result {
                Ok(status) => tracing::debug!(backup = %status.id, "backup upload finished"),
                Err(err) => tracing::warn!(error = %err, "backup upload failed"),
            }
            if self.finished_uploads.len() == RETAINED_UPLOAD_RESULTS {
                self.finished_uploads.pop_front();
            }
            self.finished_uploads.push_back(result);
        }
    }

    /// Waits for every upload started so far. Returns the first failure.
    async fn await_uploads(&mut self) -> Result<Vec<BackupStatus>> {
        let mut results: Vec<Result<BackupStatus>> = self.finished_uploads.drain(..).collect();
        for upload in self.uploads.drain(..) {
            results.push(upload_result(upload.await));
        }

        let mut statuses = Vec::new();
        let mut failure = None;
        for result in results {
            match result {
                Ok(status) => statuses.push(status),
                Err(err) if failure.is_none() => failure = Some(err),
                Err(err) => tracing::warn!(error = %err, "backup upload failed"),
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(statuses),
        }
    }
}

fn upload_result(joined: std::result::Result<Result<BackupStatus>, JoinError>) -> Result<BackupStatus> {
    joined
        .map_err(|err| EngineError::Backup(format!("backup upload task: {}", err)))
        .and_then(|result| result)
}

fn is_backup(task: &PostCommitTask) -> bool {
    matches!(task, PostCommitTask::TakeBackup { .. })
}

/// First tick one period after start.
fn sweep_interval(interval_ms: u64) -> Interval {
    let period = Duration::from_millis(interval_ms.max(1));
    let mut ticks = interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticks
}

/// Client side of a running partition actor.
pub struct PartitionHandle {
    partition_id: PartitionId,
    requests: mpsc::Sender<PartitionRequest>,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl PartitionHandle {
    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub(crate) fn requests(&self) -> mpsc::Sender<PartitionRequest> {
        self.requests.clone()
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> PartitionRequest) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(build(reply))
            .await
            .map_err(|_| EngineError::PartitionUnavailable(self.partition_id))?;
        response
            .await
            .map_err(|_| EngineError::PartitionUnavailable(self.partition_id))?
    }

    pub async fn submit(&self, command: UnwrittenRecord) -> Result<CommandResponse> {
        self.request(move |reply| PartitionRequest::Command {
            command,
            reply: Some(reply),
        })
        .await
    }

    /// Runs `sweep` as if the clock read `now`. Returns the commands processed.
    pub async fn run_sweep(&self, sweep: ScheduledSweep, now: i64) -> Result<usize> {
        self.request(move |reply| PartitionRequest::Sweep { sweep, now, reply })
            .await
    }

    pub async fn add_exporter(&self, exporter: Box<dyn Exporter>) -> Result<()> {
        self.request(move |reply| PartitionRequest::AddExporter { exporter, reply })
            .await
    }

    pub async fn remove_exporter(&self, exporter_id: impl Into<String>) -> Result<()> {
        let exporter_id = exporter_id.into();
        self.request(move |reply| PartitionRequest::RemoveExporter { exporter_id, reply })
            .await
    }

    pub async fn export(&self) -> Result<usize> {
        self.request(|reply| PartitionRequest::Export { reply }).await
    }

    pub async fn compact(&self) -> Result<usize> {
        self.request(|reply| PartitionRequest::Compact { reply }).await
    }

    pub async fn await_backups(&self) -> Result<Vec<BackupStatus>> {
        self.request(|reply| PartitionRequest::AwaitBackups { reply }).await
    }

    pub async fn status(&self) -> Result<PartitionStatus> {
        self.request(|reply| PartitionRequest::Status { reply }).await
    }

    /// Signals the actor to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| EngineError::ExecutionError(format!("partition actor join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for PartitionHandle {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}
