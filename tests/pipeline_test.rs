//! End-to-end runs of the archive pipeline against the in-memory ports.

use chrono::{TimeZone, Utc};
use std::path::Path;
use std::sync::Arc;

use pg_archiver::application::orchestrator::{Archiver, SKIP_ALREADY_ARCHIVED};
use pg_archiver::config::AppConfig;
use pg_archiver::domain::entities::{PartitionInfo, ProcessResult, RunSummary};
use pg_archiver::domain::errors::Stage;
use pg_archiver::ports::progress_port::ProgressObserver;
use pg_archiver::test_support::{
    partitioned_catalog, sample_rows, test_config, MemoryCatalog, MemoryObjectStore, ScriptedRowSource,
};

fn reference_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

struct Pipeline {
    dir: tempfile::TempDir,
    config: AppConfig,
    catalog: Arc<MemoryCatalog>,
    source: Arc<ScriptedRowSource>,
    store: Arc<MemoryObjectStore>,
    partitions: Vec<PartitionInfo>,
}

impl Pipeline {
    fn new(days: u32, rows_per_partition: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let (catalog, partitions) = partitioned_catalog("events", days);
        let source = Arc::new(ScriptedRowSource::new());
        for p in &partitions {
            source.set_rows(p, sample_rows(rows_per_partition));
        }
        Self {
            dir,
            config,
            catalog: Arc::new(catalog),
            source,
            store: Arc::new(MemoryObjectStore::new()),
            partitions,
        }
    }

    fn archiver(&self) -> Archiver {
        Archiver::new(
            self.catalog.clone(),
            self.source.clone(),
            self.store.clone(),
            self.config.clone(),
        )
        .unwrap()
    }

    fn run(&self) -> Vec<ProcessResult> {
        self.archiver().run_at(reference_time()).unwrap()
    }

    fn staged_files(&self) -> Vec<std::path::PathBuf> {
        list_files(&self.dir.path().join("tmp"))
    }
}

fn list_files(dir: &Path) -> Vec<std::path::PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(_) => vec![],
    }
}

#[test]
fn test_second_run_is_a_no_op() {
    let p = Pipeline::new(5, 30);
    let first = p.run();
    assert!(first.iter().all(|r| r.success && !r.skipped));
    let opens = p.source.opens();
    let puts = p.store.put_count();

    let second = p.run();
    assert_eq!(second.len(), 5);
    for r in &second {
        assert!(r.skipped, "{:?}", r);
        assert_eq!(r.skip_reason.as_deref(), Some(SKIP_ALREADY_ARCHIVED));
    }
    assert_eq!(p.source.opens(), opens);
    assert_eq!(p.store.put_count(), puts);
}

#[test]
fn test_mid_stream_transient_failure_is_retried_to_the_limit() {
    let mut p = Pipeline::new(1, 250);
    p.config.retry.max_attempts = 3;
    p.config.output.workers = 1;
    p.source.fail_next_opens(5, 1, true);

    let results = p.run();
    let r = &results[0];
    assert!(!r.success);
    assert_eq!(r.error_stage, Some(Stage::Extract));
    assert_eq!(p.source.opens_for(&p.partitions[0]), 3);
    assert_eq!(p.store.put_count(), 0);
}

#[test]
fn test_transient_failure_recovers_on_retry() {
    let mut p = Pipeline::new(1, 250);
    p.config.retry.max_attempts = 3;
    p.source.fail_next_opens(2, 1, true);

    let results = p.run();
    assert!(results[0].success, "{:?}", results[0]);
    assert_eq!(results[0].rows, 250);
    assert_eq!(p.source.opens_for(&p.partitions[0]), 3);
}

#[test]
fn test_permanent_failure_gets_one_attempt() {
    let mut p = Pipeline::new(1, 250);
    p.config.retry.max_attempts = 5;
    p.source.fail_next_opens(1, 1, false);

    let results = p.run();
    assert!(!results[0].success);
    assert_eq!(p.source.opens_for(&p.partitions[0]), 1);
}

#[test]
fn test_no_staged_files_after_failures() {
    let p = Pipeline::new(3, 250);
    p.source.fail_partition(&p.partitions[1], true);

    let results = p.run();
    let summary = RunSummary::from_results(&results);
    assert_eq!(summary.uploaded, 2);
    assert_eq!(summary.failed, 1);
    assert!(p.staged_files().is_empty(), "{:?}", p.staged_files());
}

/// Cancels the run as soon as the first chunk has been written.
struct CancelOnFirstChunk(pg_archiver::application::cancellation::CancellationSignal);

impl ProgressObserver for CancelOnFirstChunk {
    fn on_chunk(&self, _partition: &PartitionInfo, _rows_so_far: u64) {
        self.0.cancel();
    }
}

#[test]
fn test_no_staged_files_after_cancellation() {
    let mut p = Pipeline::new(2, 400);
    p.config.output.workers = 1;
    let archiver = p.archiver();
    let cancel = archiver.cancellation();
    let archiver = archiver.with_progress(Arc::new(CancelOnFirstChunk(cancel.clone())));

    let results = archiver.run_at(reference_time()).unwrap();
    assert!(cancel.is_cancelled());
    assert!(results.iter().all(|r| !r.success || r.skipped || r.cancelled));
    assert!(results.iter().any(|r| r.cancelled));
    assert_eq!(p.store.put_count(), 0);
    assert!(p.staged_files().is_empty());
}
