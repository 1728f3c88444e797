// ============================================================================
// Exporters
// ============================================================================
//
// Exporters see every record of the log exactly in log order. They get a
// read-only view of the state and their own last exported position, which
// the director persists in the EXPORTER column family after each run.
// Transient export failures are retried with bounded exponential backoff
// outside of any processing transaction.
//
// ============================================================================

use crate::config::RetryPolicy;
use crate::core::{EngineError, PartitionId, Position, Result};
use crate::processing::StreamProcessor;
use crate::protocol::Record;
use crate::storage::ReadOnlyState;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct ExporterContext {
    pub partition_id: PartitionId,
    pub last_exported_position: Position,
    pub state: ReadOnlyState,
}

#[async_trait]
pub trait Exporter: Send {
    fn id(&self) -> &str;

    async fn open(&mut self, _context: &ExporterContext) -> Result<()> {
        Ok(())
    }

    async fn export(&mut self, record: &Record) -> Result<()>;

    async fn close(&mut self) {}
}

struct ExporterSlot {
    exporter: Box<dyn Exporter>,
    position: Position,
}

pub struct ExporterDirector {
    partition_id: PartitionId,
    slots: Vec<ExporterSlot>,
    retry: RetryPolicy,
}

impl ExporterDirector {
    pub fn new(partition_id: PartitionId, retry: RetryPolicy) -> Self {
        Self {
            partition_id,
            slots: Vec::new(),
            retry,
        }
    }

    /// Opens `exporter` at its persisted position.
    pub async fn add(&mut self, mut exporter: Box<dyn Exporter>, processor: &StreamProcessor) -> Result<()> {
        if self.slots.iter().any(|slot| slot.exporter.id() == exporter.id()) {
            return Err(EngineError::Config(format!(
                "Exporter '{}' is already registered",
                exporter.id()
            )));
        }
        let position = processor.state().exporters.get(processor.db(), exporter.id())?;
        let context = ExporterContext {
            partition_id: self.partition_id,
            last_exported_position: position,
            state: processor.read_only(),
        };
        exporter.open(&context).await?;
        tracing::info!(
            exporter = exporter.id(),
            partition = self.partition_id,
            position,
            "exporter opened"
        );
        self.slots.push(ExporterSlot { exporter, position });
        Ok(())
    }

    /// Closes the exporter and forgets its position.
    pub async fn remove(&mut self, exporter_id: &str, processor: &mut StreamProcessor) -> Result<()> {
        let found = self.slots.iter().position(|slot| slot.exporter.id() == exporter_id);
        if let Some(index) = found {
            let mut slot = self.slots.remove(index);
            slot.exporter.close().await;
        }
        processor.remove_exporter_position(exporter_id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn positions(&self) -> Vec<(String, Position)> {
        self.slots
            .iter()
            .map(|slot| (slot.exporter.id().to_string(), slot.position))
            .collect()
    }

    /// Exports every record each exporter has not seen yet. Progress made
    /// before a failure is kept.
    pub async fn export_pending(&mut self, processor: &mut StreamProcessor) -> Result<usize> {
        let mut exported = 0;
        for slot in &mut self.slots {
            let records: Vec<Record> = processor
                .log()
                .records_from(slot.position + 1)
                .cloned()
                .collect();
            if records.is_empty() {
                continue;
            }

            let before = slot.position;
            let mut failure = None;
            for record in &records {
                if let Err(err) = export_with_retry(slot.exporter.as_mut(), record, &self.retry).await {
                    failure = Some(err);
                    break;
                }
                slot.position = record.position;
                exported += 1;
            }
            if slot.position != before {
                processor.set_exporter_position(slot.exporter.id(), slot.position)?;
            }
            if let Some(err) = failure {
                return Err(err);
            }
        }
        Ok(exported)
    }

    pub async fn close(&mut self) {
        for slot in &mut self.slots {
            slot.exporter.close().await;
        }
    }
}

async fn export_with_retry(exporter: &mut dyn Exporter, record: &Record, retry: &RetryPolicy) -> Result<()> {
    let mut attempt = 1;
    loop {
        match exporter.export(record).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < retry.max_attempts => {
                let delay = retry.backoff_ms(attempt);
                tracing::warn!(
                    exporter = exporter.id(),
                    position = record.position,
                    attempt,
                    delay_ms = delay,
                    error = %err,
                    "export failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(err) => {
                tracing::error!(
                    exporter = exporter.id(),
                    position = record.position,
                    error = %err,
                    "export failed, giving up until the next run"
                );
                return Err(err);
            }
        }
    }
}

/// Keeps exported records in memory. Can be told to fail a number of
/// export calls first.
#[derive(Clone)]
pub struct RecordingExporter {
    id: String,
    records: Arc<Mutex<Vec<Record>>>,
    failures_left: Arc<Mutex<usize>>,
}

impl RecordingExporter {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            records: Arc::new(Mutex::new(Vec::new())),
            failures_left: Arc::new(Mutex::new(0)),
        }
    }

    pub fn failing(self, failures: usize) -> Self {
        if let Ok(mut left) = self.failures_left.lock() {
            *left = failures;
        }
        self
    }

    pub fn records(&self) -> Result<Vec<Record>> {
        Ok(self.records.lock()?.clone())
    }
}

#[async_trait]
impl Exporter for RecordingExporter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn export(&mut self, record: &Record) -> Result<()> {
        {
            let mut left = self.failures_left.lock()?;
            if *left > 0 {
                *left -= 1;
                return Err(EngineError::IoError(format!(
                    "{} refused record {}",
                    self.id, record.position
                )));
            }
        }
        self.records.lock()?.push(record.clone());
        Ok(())
    }
}
