//! In-memory implementations of the ports, for unit and pipeline tests.
//!
//! None of these touch the network. The object store computes real MD5 and
//! multipart ETags so integrity checks behave as they do against S3.

use chrono::{DateTime, Duration, TimeZone, Utc};
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::application::integrity::multipart_etag;
use crate::config::AppConfig;
use crate::domain::chunk_buffer::ChunkBuffer;
use crate::domain::entities::{ColumnDef, ColumnSchema, PartitionInfo, Record, Value};
use crate::domain::errors::{ArchiveError, Result};
use crate::ports::catalog_port::{CatalogPort, ChildTable};
use crate::ports::object_store_port::{MultipartHandle, ObjectStorePort, PartReceipt, RemoteObject};
use crate::ports::row_source_port::{RowCursor, RowSource};

pub fn jan(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default() + Duration::days(day as i64 - 1)
}

pub fn sample_schema() -> ColumnSchema {
    ColumnSchema::new(vec![
        ColumnDef { name: "id".into(), declared_type: "bigint".into() },
        ColumnDef { name: "created_at".into(), declared_type: "timestamp with time zone".into() },
        ColumnDef { name: "note".into(), declared_type: "text".into() },
    ])
}

pub fn sample_rows(n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| {
            let mut r = Record::new();
            r.insert("id".into(), Value::Int(i as i64));
            r.insert("created_at".into(), Value::Timestamp(jan(1) + Duration::seconds(i as i64)));
            if i % 4 != 0 {
                r.insert("note".into(), Value::Text(format!("row {}", i)));
            }
            r
        })
        .collect()
}

/// Daily leaf partition `events_2024_01_DD`.
pub fn sample_partition(day: u32) -> PartitionInfo {
    PartitionInfo::physical(
        format!("events_2024_01_{:02}", day),
        "events",
        jan(day),
        jan(day + 1),
    )
}

/// `base -> base_2024 -> base_2024_01_01 .. base_2024_01_DD`, plus the partitions it yields.
pub fn partitioned_catalog(base: &str, days: u32) -> (MemoryCatalog, Vec<PartitionInfo>) {
    let catalog = MemoryCatalog::new();
    catalog.add_table(base, sample_schema());
    let year = format!("{}_2024", base);
    catalog.add_child(base, &year, true, None);
    let mut partitions = Vec::new();
    for day in 1..=days {
        let name = format!("{}_2024_01_{:02}", base, day);
        catalog.add_child(&year, &name, false, None);
        partitions.push(PartitionInfo::physical(name, base, jan(day), jan(day + 1)));
    }
    (catalog, partitions)
}

/// A configuration that keeps all scratch state under `dir` and retries fast.
pub fn test_config(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.source.table = "events".into();
    config.destination.bucket = "test-bucket".into();
    config.destination.prefix = "archive".into();
    config.output.chunk_size = 100;
    config.output.workers = 2;
    config.output.temp_dir = Some(dir.join("tmp"));
    config.cache.dir = dir.join("cache");
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config
}

#[derive(Default)]
struct TableDef {
    schema: ColumnSchema,
    children: Vec<ChildTable>,
}

/// Catalog backed by a map of table definitions.
#[derive(Default)]
pub struct MemoryCatalog {
    tables: Mutex<HashMap<String, TableDef>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&self, name: &str, schema: ColumnSchema) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.entry(name.to_string()).or_default().schema = schema;
        }
    }

    pub fn add_child(&self, parent: &str, name: &str, is_partitioned: bool, bound_expr: Option<&str>) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.entry(name.to_string()).or_default();
            tables.entry(parent.to_string()).or_default().children.push(ChildTable {
                name: name.to_string(),
                is_partitioned,
                bound_expr: bound_expr.map(str::to_string),
            });
        }
    }

    fn with_tables<T>(&self, f: impl FnOnce(&HashMap<String, TableDef>) -> T) -> Result<T> {
        let tables = self
            .tables
            .lock()
            .map_err(|_| ArchiveError::MetadataError("catalog lock poisoned".into()))?;
        Ok(f(&tables))
    }
}

impl CatalogPort for MemoryCatalog {
    fn table_exists(&self, table: &str) -> Result<bool> {
        self.with_tables(|t| t.contains_key(table))
    }

    fn child_tables(&self, table: &str) -> Result<Vec<ChildTable>> {
        self.with_tables(|t| t.get(table).map(|d| d.children.clone()).unwrap_or_default())
    }

    fn column_schema(&self, table: &str) -> Result<ColumnSchema> {
        self.with_tables(|t| t.get(table).map(|d| d.schema.clone()))?
            .ok_or_else(|| ArchiveError::MetadataError(format!("no such table {}", table)))
    }
}

#[derive(Debug, Clone, Copy)]
struct Failure {
    after_chunks: usize,
    retryable: bool,
}

impl Failure {
    fn error(&self) -> ArchiveError {
        if self.retryable {
            ArchiveError::transient_db("canceling statement due to statement timeout")
        } else {
            ArchiveError::permanent_db("permission denied for table")
        }
    }
}

/// Row source serving fixed rows per partition, with failure injection.
#[derive(Default)]
pub struct ScriptedRowSource {
    rows: Mutex<HashMap<String, Vec<Record>>>,
    next_open_failures: Mutex<VecDeque<Failure>>,
    partition_failures: Mutex<HashMap<String, Failure>>,
    opens_by_partition: Mutex<HashMap<String, usize>>,
    opens: AtomicUsize,
    counts: AtomicUsize,
}

impl ScriptedRowSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rows(&self, partition: &PartitionInfo, rows: Vec<Record>) {
        if let Ok(mut map) = self.rows.lock() {
            map.insert(partition.id(), rows);
        }
    }

    /// The next `opens` cursors fail after serving `after_chunks` chunks.
    pub fn fail_next_opens(&self, opens: usize, after_chunks: usize, retryable: bool) {
        if let Ok(mut q) = self.next_open_failures.lock() {
            for _ in 0..opens {
                q.push_back(Failure { after_chunks, retryable });
            }
        }
    }

    /// Every cursor for `partition` fails on its first fetch.
    pub fn fail_partition(&self, partition: &PartitionInfo, retryable: bool) {
        if let Ok(mut map) = self.partition_failures.lock() {
            map.insert(partition.id(), Failure { after_chunks: 0, retryable });
        }
    }

    /// Cursors opened so far.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn opens_for(&self, partition: &PartitionInfo) -> usize {
        self.opens_by_partition
            .lock()
            .map(|m| m.get(&partition.id()).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// `count_rows` calls so far.
    pub fn counts(&self) -> usize {
        self.counts.load(Ordering::SeqCst)
    }

    fn rows_for(&self, partition: &PartitionInfo) -> Vec<Record> {
        self.rows
            .lock()
            .map(|m| m.get(&partition.id()).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl RowSource for ScriptedRowSource {
    fn count_rows(&self, partition: &PartitionInfo) -> Result<u64> {
        self.counts.fetch_add(1, Ordering::SeqCst);
        Ok(self.rows_for(partition).len() as u64)
    }

    fn open_cursor(&self, partition: &PartitionInfo, _schema: &ColumnSchema) -> Result<Box<dyn RowCursor + '_>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut m) = self.opens_by_partition.lock() {
            *m.entry(partition.id()).or_default() += 1;
        }
        let failure = self
            .partition_failures
            .lock()
            .ok()
            .and_then(|m| m.get(&partition.id()).copied())
            .or_else(|| self.next_open_failures.lock().ok().and_then(|mut q| q.pop_front()));
        Ok(Box::new(ScriptedCursor {
            rows: self.rows_for(partition).into(),
            chunks_served: 0,
            failure,
        }))
    }
}

struct ScriptedCursor {
    rows: VecDeque<Record>,
    chunks_served: usize,
    failure: Option<Failure>,
}

impl RowCursor for ScriptedCursor {
    fn fetch_chunk(&mut self, buf: &mut ChunkBuffer) -> Result<usize> {
        if let Some(f) = self.failure {
            if self.chunks_served >= f.after_chunks {
                return Err(f.error());
            }
        }
        let mut n = 0;
        while buf.remaining() > 0 {
            let Some(row) = self.rows.pop_front() else {
                break;
            };
            buf.push(row);
            n += 1;
        }
        if n > 0 {
            self.chunks_served += 1;
        }
        Ok(n)
    }
}

struct StoredObject {
    data: Vec<u8>,
    etag: String,
}

struct PendingUpload {
    key: String,
    parts: BTreeMap<usize, Vec<u8>>,
}

/// Object store that keeps everything in memory and reports S3-style ETags.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    next_upload: AtomicUsize,
    puts: AtomicUsize,
    largest_put: AtomicUsize,
    largest_part: AtomicUsize,
    corrupt_remaining: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed uploads (single PUTs and completed multipart uploads).
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Largest body handed to `put_object`.
    pub fn largest_single_put(&self) -> usize {
        self.largest_put.load(Ordering::SeqCst)
    }

    /// Largest body handed to `put_part`.
    pub fn largest_part(&self) -> usize {
        self.largest_part.load(Ordering::SeqCst)
    }

    /// The next `n` uploads store a truncated body, as if bytes were lost in transit.
    pub fn corrupt_next_uploads(&self, n: usize) {
        self.corrupt_remaining.store(n, Ordering::SeqCst);
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().ok()?.get(key).map(|o| o.data.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Replaces an object behind the archiver's back.
    pub fn overwrite(&self, key: &str, data: Vec<u8>) {
        self.store(key, data, None);
    }

    fn take_corruption(&self) -> bool {
        self.corrupt_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn store(&self, key: &str, mut data: Vec<u8>, etag: Option<String>) {
        let etag = if self.take_corruption() {
            data.pop();
            hex::encode(Md5::digest(&data))
        } else {
            etag.unwrap_or_else(|| hex::encode(Md5::digest(&data)))
        };
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(key.to_string(), StoredObject { data, etag });
        }
    }

    fn lock_uploads(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, PendingUpload>>> {
        self.uploads
            .lock()
            .map_err(|_| ArchiveError::transient_storage("upload registry lock poisoned"))
    }
}

impl ObjectStorePort for MemoryObjectStore {
    fn head(&self, key: &str) -> Result<Option<RemoteObject>> {
        let objects = self
            .objects
            .lock()
            .map_err(|_| ArchiveError::transient_storage("object map lock poisoned"))?;
        Ok(objects.get(key).map(|o| RemoteObject {
            size: o.data.len() as u64,
            etag: Some(o.etag.clone()),
        }))
    }

    fn put_object(&self, key: &str, body: Vec<u8>, _content_type: &str) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.largest_put.fetch_max(body.len(), Ordering::SeqCst);
        self.store(key, body, None);
        Ok(())
    }

    fn create_multipart(&self, key: &str, _content_type: &str) -> Result<MultipartHandle> {
        let upload_id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::SeqCst));
        self.lock_uploads()?.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(MultipartHandle {
            key: key.to_string(),
            upload_id,
        })
    }

    fn put_part(&self, handle: &MultipartHandle, part_index: usize, body: Vec<u8>) -> Result<PartReceipt> {
        self.largest_part.fetch_max(body.len(), Ordering::SeqCst);
        let content_id = hex::encode(Md5::digest(&body));
        let mut uploads = self.lock_uploads()?;
        let upload = uploads
            .get_mut(&handle.upload_id)
            .ok_or_else(|| ArchiveError::permanent_storage("unknown upload id"))?;
        upload.parts.insert(part_index, body);
        Ok(PartReceipt {
            part_number: part_index + 1,
            content_id,
        })
    }

    fn complete_multipart(&self, handle: &MultipartHandle, _parts: Vec<PartReceipt>) -> Result<()> {
        let upload = self
            .lock_uploads()?
            .remove(&handle.upload_id)
            .ok_or_else(|| ArchiveError::permanent_storage("unknown upload id"))?;
        let digests: Vec<[u8; 16]> = upload.parts.values().map(|p| Md5::digest(p).into()).collect();
        let data: Vec<u8> = upload.parts.into_values().flatten().collect();
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.store(&upload.key, data, Some(multipart_etag(&digests)));
        Ok(())
    }

    fn abort_multipart(&self, handle: &MultipartHandle) -> Result<()> {
        self.lock_uploads()?.remove(&handle.upload_id);
        Ok(())
    }
}
