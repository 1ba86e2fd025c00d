// Copyright 2026 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Archiver
//!
//! The core application logic that drives one archive run.
//!
//! It discovers partitions and processes them in parallel on a bounded
//! worker pool. Each partition goes through the same state machine:
//!
//! ```text
//! skip check -> row count -> schema + extract (retried) -> compare remote -> upload + verify -> cache
//! ```
//!
//! A failing partition never stops the others. Its error is recorded in the
//! cache and returned in its `ProcessResult`.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use rayon::ThreadPool;
use std::sync::Arc;
use std::time::Instant;

use crate::application::cache::{CacheNamespace, CacheStore};
use crate::application::cancellation::CancellationSignal;
use crate::application::discovery::{DiscoveryRequest, PartitionDiscoverer};
use crate::application::extractor::{ChunkedExtractor, ExtractorOptions};
use crate::application::integrity::StagedArtifact;
use crate::application::retry::{retry_with_backoff, RetryPolicy};
use crate::application::uploader::Uploader;
use crate::compression::compressor_for;
use crate::config::AppConfig;
use crate::domain::entities::{PartitionInfo, ProcessResult, RunSummary};
use crate::domain::errors::{ArchiveError, Result, Stage};
use crate::domain::path_template::object_key;
use crate::format::format_for;
use crate::ports::catalog_port::CatalogPort;
use crate::ports::object_store_port::ObjectStorePort;
use crate::ports::progress_port::{NoopProgress, ProgressObserver};
use crate::ports::row_source_port::RowSource;

pub const SKIP_ALREADY_ARCHIVED: &str = "already archived";
pub const SKIP_DESTINATION_CURRENT: &str = "destination up to date";
pub const SKIP_EMPTY: &str = "empty partition";
pub const SKIP_DRY_RUN: &str = "dry run";

/// Builds a worker pool of the given size.
pub fn build_worker_pool(workers: usize) -> Result<ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("archive-worker-{}", i))
        .build()
        .map_err(|e| ArchiveError::ConfigError(format!("Cannot build worker pool: {}", e)))
}

/// Orchestrates the archive of one base table.
pub struct Archiver {
    catalog: Arc<dyn CatalogPort>,
    source: Arc<dyn RowSource>,
    extractor: ChunkedExtractor,
    uploader: Uploader,
    cache: CacheStore,
    retry: RetryPolicy,
    config: AppConfig,
    progress: Arc<dyn ProgressObserver>,
    cancel: CancellationSignal,
    pool: Option<Arc<ThreadPool>>,
}

impl Archiver {
    /// Wires the pipeline from a validated configuration.
    pub fn new(
        catalog: Arc<dyn CatalogPort>,
        source: Arc<dyn RowSource>,
        store: Arc<dyn ObjectStorePort>,
        config: AppConfig,
    ) -> Result<Self> {
        let output = &config.output;
        let format = format_for(&output.format, &output.format_options())?;
        let compressor = compressor_for(&output.compression, output.compression_workers)?;
        let extractor = ChunkedExtractor::new(
            Arc::clone(&source),
            Arc::from(format),
            Arc::from(compressor),
            ExtractorOptions {
                chunk_size: output.chunk_size,
                compression_level: output.resolved_compression_level(),
                temp_dir: output.temp_dir(),
                part_size: output.part_size(),
            },
        );
        let uploader = Uploader::new(store, output.max_reuploads);
        let cache = CacheStore::new(
            config.cache.dir.clone(),
            chrono::Duration::hours(config.cache.row_count_ttl_hours),
        );

        Ok(Self {
            catalog,
            source,
            extractor,
            uploader,
            cache,
            retry: config.retry.policy(),
            config,
            progress: Arc::new(NoopProgress),
            cancel: CancellationSignal::new(),
            pool: None,
        })
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressObserver>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs partitions on a shared pool. Without one, each run builds its
    /// own pool of `output.workers` threads.
    pub fn with_thread_pool(mut self, pool: Arc<ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    fn worker_pool(&self) -> Result<Arc<ThreadPool>> {
        match &self.pool {
            Some(pool) => Ok(Arc::clone(pool)),
            None => Ok(Arc::new(build_worker_pool(self.config.output.workers)?)),
        }
    }

    pub fn cancellation(&self) -> CancellationSignal {
        self.cancel.clone()
    }

    pub fn run(&self) -> Result<Vec<ProcessResult>> {
        self.run_at(Utc::now())
    }

    /// Runs with an explicit reference time for the open-partition rule.
    pub fn run_at(&self, now: DateTime<Utc>) -> Result<Vec<ProcessResult>> {
        let started = Instant::now();
        let table = &self.config.source.table;
        let pool = self.worker_pool()?;
        info!(
            "Archiving {} to {} ({} worker(s), reference time {})",
            table,
            self.config.destination.uri(),
            pool.current_num_threads(),
            now.to_rfc3339()
        );

        let request = DiscoveryRequest {
            table: table.clone(),
            date_column: self.config.source.date_column.clone(),
            start: self.config.source.start()?,
            end: self.config.source.end()?,
            duration: self.config.source.output_duration()?,
        };
        let partitions = PartitionDiscoverer::new(Arc::clone(&self.catalog))
            .discover(&request)
            .map_err(|e| e.in_partition(table, Stage::Discovery))?;
        if partitions.is_empty() {
            info!("No partitions found for {}", table);
            return Ok(vec![]);
        }

        let namespace = self.cache.namespace(table, &self.config.destination.uri())?;

        let results: Vec<ProcessResult> = pool.install(|| {
            partitions
                .par_iter()
                .map(|p| self.process_partition(p, &namespace, now))
                .collect()
        });

        let summary = RunSummary::from_results(&results);
        info!(
            "Run finished in {:.1}s: {} uploaded, {} skipped, {} failed, {} cancelled ({} rows, {} bytes)",
            started.elapsed().as_secs_f32(),
            summary.uploaded,
            summary.skipped,
            summary.failed,
            summary.cancelled,
            summary.total_rows,
            summary.total_bytes
        );
        Ok(results)
    }

    /// Processes one partition to a terminal outcome. Never fails the run.
    pub fn process_partition(
        &self,
        partition: &PartitionInfo,
        namespace: &CacheNamespace,
        now: DateTime<Utc>,
    ) -> ProcessResult {
        let started = Instant::now();
        let id = partition.id();

        let result = match self.try_process(partition, namespace, now, started) {
            Ok(result) => result,
            Err(e) => {
                if e.is_cancelled() {
                    warn!("{}: cancelled", id);
                } else {
                    error!("{}: {}", id, e);
                    let destination_unknown =
                        matches!(e.stage(), Some(Stage::Upload) | Some(Stage::Verify));
                    if let Err(cache_err) =
                        namespace.record_failure(&id, &e.to_string(), destination_unknown, Utc::now())
                    {
                        warn!("{}: cannot record failure in cache: {}", id, cache_err);
                    }
                }
                ProcessResult::failure(partition.clone(), &e, started.elapsed())
            }
        };

        self.progress.on_partition_done(&result);
        result
    }

    fn try_process(
        &self,
        partition: &PartitionInfo,
        namespace: &CacheNamespace,
        now: DateTime<Utc>,
        started: Instant,
    ) -> Result<ProcessResult> {
        let id = partition.id();
        self.cancel.check()?;

        let key = object_key(
            &self.config.destination.prefix,
            &self.config.output.path_template,
            partition,
            self.config.source.output_duration()?,
            &self.extractor.artifact_extension(),
        );
        let open = partition.is_open_at(now);

        if !open {
            if let Some(result) = self.already_archived(partition, &key, namespace, started)? {
                return Ok(result);
            }
        }

        let rows = match namespace.cached_row_count(partition, now)? {
            Some(rows) => {
                debug!("{}: {} rows (cached)", id, rows);
                rows
            }
            None => {
                let rows = retry_with_backoff(&self.retry, &self.cancel, &id, |_| {
                    self.source.count_rows(partition)
                })
                .map_err(|e| e.in_partition(&id, Stage::RowCount))?;
                namespace
                    .record_row_count(&id, rows, now)
                    .map_err(|e| e.in_partition(&id, Stage::Cache))?;
                rows
            }
        };
        self.progress.on_partition_start(partition, Some(rows));

        if rows == 0 {
            info!("{}: no rows, skipping", id);
            return Ok(ProcessResult::skipped(partition.clone(), SKIP_EMPTY, started.elapsed()));
        }
        if self.config.output.dry_run {
            info!("{}: {} rows would be archived to {}", id, rows, key);
            let mut result = ProcessResult::skipped(partition.clone(), SKIP_DRY_RUN, started.elapsed());
            result.rows = rows;
            result.object_key = Some(key);
            return Ok(result);
        }

        // The schema read is part of the attempt so catalog hiccups retry with it.
        let staged = retry_with_backoff(&self.retry, &self.cancel, &id, |attempt| {
            if attempt > 1 {
                info!("{}: extraction attempt {}", id, attempt);
            }
            let schema = self
                .catalog
                .column_schema(&partition.base_table)
                .map_err(|e| e.in_partition(&id, Stage::Schema))?;
            debug!("{}: {} column(s)", id, schema.columns.len());
            self.extractor
                .extract(partition, &schema, &self.cancel, self.progress.as_ref())
        })?;

        let remote = retry_with_backoff(&self.retry, &self.cancel, &id, |_| self.uploader.head(&key))
            .map_err(|e| e.in_partition(&id, Stage::Upload))?;
        if let Some(remote) = remote {
            if staged.matches_remote(remote.size, remote.etag.as_deref()) {
                info!("{}: {} already holds identical content", id, key);
                namespace
                    .record_upload(&id, &staged, &key, Utc::now())
                    .map_err(|e| e.in_partition(&id, Stage::Cache))?;
                return Ok(completed(
                    partition,
                    &staged,
                    &key,
                    Some(SKIP_DESTINATION_CURRENT),
                    started,
                ));
            }
            debug!(
                "{}: remote differs ({} bytes, etag {:?}), uploading",
                id, remote.size, remote.etag
            );
        }

        retry_with_backoff(&self.retry, &self.cancel, &id, |_| {
            self.uploader
                .upload_verified(&staged, &key, self.extractor.content_type(), &self.cancel)
        })
        .map_err(|e| {
            let stage = match e {
                ArchiveError::IntegrityError { .. } => Stage::Verify,
                _ => Stage::Upload,
            };
            e.in_partition(&id, stage)
        })?;

        namespace
            .record_upload(&id, &staged, &key, Utc::now())
            .map_err(|e| e.in_partition(&id, Stage::Cache))?;
        info!(
            "{}: archived {} rows to {} ({} bytes)",
            id, staged.row_count, key, staged.size
        );
        Ok(completed(partition, &staged, &key, None, started))
    }

    /// Level-one skip: cache says uploaded and the destination agrees.
    fn already_archived(
        &self,
        partition: &PartitionInfo,
        key: &str,
        namespace: &CacheNamespace,
        started: Instant,
    ) -> Result<Option<ProcessResult>> {
        let id = partition.id();
        let Some(entry) = namespace.get(&id)? else {
            return Ok(None);
        };
        if !entry.uploaded || entry.object_key.as_deref() != Some(key) {
            return Ok(None);
        }

        let remote = retry_with_backoff(&self.retry, &self.cancel, &id, |_| self.uploader.head(key))
            .map_err(|e| e.in_partition(&id, Stage::Upload))?;
        let Some(remote) = remote else {
            warn!("{}: cached as uploaded but {} is missing", id, key);
            return Ok(None);
        };
        if Some(remote.size) != entry.compressed_size || remote.etag != entry.etag {
            warn!("{}: destination no longer matches the cache, re-archiving", id);
            return Ok(None);
        }

        info!("{}: already archived at {}", id, key);
        let mut result = ProcessResult::skipped(partition.clone(), SKIP_ALREADY_ARCHIVED, started.elapsed());
        result.rows = entry.row_count.unwrap_or(0);
        result.bytes_written = remote.size;
        result.uncompressed_bytes = entry.uncompressed_size.unwrap_or(0);
        result.content_hash = entry.content_hash;
        result.object_key = Some(key.to_string());
        Ok(Some(result))
    }
}

fn completed(
    partition: &PartitionInfo,
    staged: &StagedArtifact,
    key: &str,
    skip_reason: Option<&str>,
    started: Instant,
) -> ProcessResult {
    ProcessResult {
        partition: partition.clone(),
        success: true,
        skipped: skip_reason.is_some(),
        skip_reason: skip_reason.map(str::to_string),
        rows: staged.row_count,
        bytes_written: staged.size,
        uncompressed_bytes: staged.uncompressed_size,
        content_hash: Some(staged.content_hash.clone()),
        object_key: Some(key.to_string()),
        duration: started.elapsed(),
        error: None,
        error_stage: None,
        cancelled: false,
    }
}

/// Reports progress through the `log` facade.
#[derive(Debug, Default)]
pub struct LogProgressObserver;

impl ProgressObserver for LogProgressObserver {
    fn on_partition_start(&self, partition: &PartitionInfo, expected_rows: Option<u64>) {
        match expected_rows {
            Some(rows) => info!("{}: starting ({} rows)", partition, rows),
            None => info!("{}: starting", partition),
        }
    }

    fn on_chunk(&self, partition: &PartitionInfo, rows_so_far: u64) {
        debug!("{}: {} rows written", partition.id(), rows_so_far);
    }

    fn on_partition_done(&self, result: &ProcessResult) {
        let id = result.partition.id();
        if result.cancelled {
            warn!("{}: cancelled", id);
        } else if !result.success {
            error!(
                "{}: failed at {:?}: {}",
                id,
                result.error_stage,
                result.error.as_deref().unwrap_or("unknown error")
            );
        } else if let Some(reason) = &result.skip_reason {
            info!("{}: skipped ({})", id, reason);
        } else {
            info!(
                "{}: done, {} rows, {} bytes in {:.1}s",
                id,
                result.rows,
                result.bytes_written,
                result.duration.as_secs_f32()
            );
        }
    }
}
