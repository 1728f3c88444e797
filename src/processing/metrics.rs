use serde::{Deserialize, Serialize};

/// Counters of one partition's pipeline since it was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingMetrics {
    pub commands_processed: u64,
    pub commands_rejected: u64,
    pub commands_skipped: u64,
    pub events_written: u64,
    pub events_replayed: u64,
    pub records_exported: u64,
}

impl ProcessingMetrics {
    pub fn record_applied(&mut self, events: usize) {
        self.commands_processed += 1;
        self.events_written += events as u64;
    }

    pub fn record_rejected(&mut self) {
        self.commands_processed += 1;
        self.commands_rejected += 1;
    }

    pub fn record_skipped(&mut self) {
        self.commands_skipped += 1;
    }

    pub fn record_replayed(&mut self, events: usize) {
        self.events_replayed += events as u64;
    }

    pub fn record_exported(&mut self, records: usize) {
        self.records_exported += records as u64;
    }
}
