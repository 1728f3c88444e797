//! Exporter director: ordering, retries and persisted positions

use stateflow::config::{ProcessingConfig, RetryPolicy, StorageConfig};
use stateflow::exporter::{ExporterDirector, RecordingExporter};
use stateflow::processing::StreamProcessor;
use stateflow::protocol::{Intent, JobIntent, JobRecord, RecordType, UnwrittenRecord};
use stateflow::storage::DurabilityMode;
use std::path::Path;
use tempfile::TempDir;

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
    }
}

fn open(dir: &Path) -> StreamProcessor {
    let storage = StorageConfig {
        durability: DurabilityMode::Sync,
        ..StorageConfig::default()
    };
    StreamProcessor::open(1, dir, &storage, ProcessingConfig::default()).unwrap()
}

fn create_jobs(processor: &mut StreamProcessor, count: usize) {
    for _ in 0..count {
        let command = UnwrittenRecord::new_command(Intent::Job(JobIntent::Create), JobRecord::new("mail", 1));
        processor.process_command(command).unwrap();
    }
}

#[tokio::test]
async fn test_records_are_exported_in_log_order_once() {
    let mut processor = StreamProcessor::in_memory(1, ProcessingConfig::default()).unwrap();
    let mut director = ExporterDirector::new(1, fast_retry(3));
    let exporter = RecordingExporter::new("audit");
    director.add(Box::new(exporter.clone()), &processor).await.unwrap();

    create_jobs(&mut processor, 2);
    assert_eq!(director.export_pending(&mut processor).await.unwrap(), 4);
    // nothing new, nothing exported
    assert_eq!(director.export_pending(&mut processor).await.unwrap(), 0);

    let records = exporter.records().unwrap();
    let positions: Vec<i64> = records.iter().map(|record| record.position).collect();
    assert_eq!(positions, vec![1, 2, 3, 4]);
    assert_eq!(records[0].record_type, RecordType::Command);
    assert_eq!(records[1].intent, Intent::Job(JobIntent::Created));
    assert_eq!(director.positions(), vec![("audit".to_string(), 4)]);
    assert_eq!(processor.state().exporters.get(processor.db(), "audit").unwrap(), 4);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let mut processor = StreamProcessor::in_memory(1, ProcessingConfig::default()).unwrap();
    let mut director = ExporterDirector::new(1, fast_retry(3));
    let exporter = RecordingExporter::new("flaky").failing(2);
    director.add(Box::new(exporter.clone()), &processor).await.unwrap();

    create_jobs(&mut processor, 1);
    assert_eq!(director.export_pending(&mut processor).await.unwrap(), 2);
    assert_eq!(exporter.records().unwrap().len(), 2);
}

#[tokio::test]
async fn test_exhausted_retries_keep_the_position() {
    let mut processor = StreamProcessor::in_memory(1, ProcessingConfig::default()).unwrap();
    let mut director = ExporterDirector::new(1, fast_retry(2));
    let exporter = RecordingExporter::new("broken").failing(2);
    director.add(Box::new(exporter.clone()), &processor).await.unwrap();

    create_jobs(&mut processor, 1);
    assert!(director.export_pending(&mut processor).await.is_err());
    assert!(exporter.records().unwrap().is_empty());
    assert_eq!(director.positions(), vec![("broken".to_string(), -1)]);

    // the next run starts over at the first record
    assert_eq!(director.export_pending(&mut processor).await.unwrap(), 2);
    assert_eq!(exporter.records().unwrap()[0].position, 1);
}

#[tokio::test]
async fn test_position_survives_restart_and_bounds_compaction() {
    let dir = TempDir::new().unwrap();
    {
        let mut processor = open(dir.path());
        let mut director = ExporterDirector::new(1, fast_retry(1));
        director
            .add(Box::new(RecordingExporter::new("audit")), &processor)
            .await
            .unwrap();
        create_jobs(&mut processor, 2);
        director.export_pending(&mut processor).await.unwrap();
        create_jobs(&mut processor, 1);
        director.close().await;
    }

    let mut processor = open(dir.path());
    assert_eq!(processor.state().exporters.get(processor.db(), "audit").unwrap(), 4);
    assert_eq!(processor.state().exporters.lowest(processor.db()).unwrap(), Some(4));

    let mut director = ExporterDirector::new(1, fast_retry(1));
    let exporter = RecordingExporter::new("audit");
    director.add(Box::new(exporter.clone()), &processor).await.unwrap();
    assert_eq!(director.export_pending(&mut processor).await.unwrap(), 2);
    assert_eq!(
        exporter.records().unwrap().iter().map(|record| record.position).collect::<Vec<_>>(),
        vec![5, 6]
    );

    director.remove("audit", &mut processor).await.unwrap();
    assert!(director.is_empty());
    assert_eq!(processor.state().exporters.lowest(processor.db()).unwrap(), None);
}

#[tokio::test]
async fn test_duplicate_exporter_id_is_refused() {
    let processor = StreamProcessor::in_memory(1, ProcessingConfig::default()).unwrap();
    let mut director = ExporterDirector::new(1, fast_retry(1));
    director
        .add(Box::new(RecordingExporter::new("audit")), &processor)
        .await
        .unwrap();
    assert!(director
        .add(Box::new(RecordingExporter::new("audit")), &processor)
        .await
        .is_err());
    assert_eq!(director.len(), 1);
}
