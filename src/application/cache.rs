//! # Cache / Skip-Decision Store
//!
//! One JSON document per (table, destination) pair, holding what earlier runs
//! learned about each partition. Two tiers live in every entry:
//!
//! * **Row counts** expire after a TTL and are never served for an open
//!   partition.
//! * **File metadata** (sizes, hashes, upload state) never expires, but it is
//!   only a hint: skipping an upload always re-checks the destination.
//!
//! Writes go to a temp file in the same directory, then rename over the
//! document, so a crash never leaves a half-written cache behind.

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::application::integrity::StagedArtifact;
use crate::domain::entities::PartitionInfo;
use crate::domain::errors::{ArchiveError, Result};

pub const DEFAULT_ROW_COUNT_TTL_HOURS: i64 = 24;
const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheEntry {
    pub row_count: Option<u64>,
    pub row_count_fetched_at: Option<DateTime<Utc>>,
    pub uncompressed_size: Option<u64>,
    pub compressed_size: Option<u64>,
    pub content_hash: Option<String>,
    pub etag: Option<String>,
    pub uploaded: bool,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub object_key: Option<String>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct CacheDocument {
    version: u32,
    table: String,
    destination: String,
    entries: BTreeMap<String, CacheEntry>,
}

/// Cache file name for a table and destination.
pub fn cache_file_name(table: &str, destination: &str) -> String {
    let digest = hex::encode(Sha256::digest(destination.as_bytes()));
    format!("archive_{}_{}_metadata.json", table, &digest[..16])
}

/// One cache document, guarded by its own lock.
pub struct CacheNamespace {
    path: PathBuf,
    row_count_ttl: Duration,
    doc: Mutex<CacheDocument>,
}

impl CacheNamespace {
    fn open(path: PathBuf, table: &str, destination: &str, row_count_ttl: Duration) -> Self {
        let doc = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<CacheDocument>(&bytes) {
                Ok(doc) => {
                    debug!("Loaded {} cache entries from {}", doc.entries.len(), path.display());
                    doc
                }
                Err(e) => {
                    warn!(
                        "Cache file {} is unreadable ({}); starting with an empty cache",
                        path.display(),
                        e
                    );
                    CacheDocument::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CacheDocument::default(),
            Err(e) => {
                warn!("Cannot read cache file {}: {}", path.display(), e);
                CacheDocument::default()
            }
        };
        let doc = CacheDocument {
            version: DOCUMENT_VERSION,
            table: table.to_string(),
            destination: destination.to_string(),
            entries: doc.entries,
        };
        Self {
            path,
            row_count_ttl,
            doc: Mutex::new(doc),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheDocument>> {
        self.doc
            .lock()
            .map_err(|_| ArchiveError::MetadataError("cache lock poisoned".to_string()))
    }

    pub fn get(&self, partition_id: &str) -> Result<Option<CacheEntry>> {
        Ok(self.lock()?.entries.get(partition_id).cloned())
    }

    /// A row count still inside its TTL. Open partitions always miss.
    pub fn cached_row_count(&self, partition: &PartitionInfo, now: DateTime<Utc>) -> Result<Option<u64>> {
        if partition.is_open_at(now) {
            return Ok(None);
        }
        let doc = self.lock()?;
        let Some(entry) = doc.entries.get(&partition.id()) else {
            return Ok(None);
        };
        Ok(match (entry.row_count, entry.row_count_fetched_at) {
            (Some(count), Some(at)) if now - at < self.row_count_ttl => Some(count),
            _ => None,
        })
    }

    pub fn record_row_count(&self, partition_id: &str, count: u64, now: DateTime<Utc>) -> Result<()> {
        self.update(partition_id, |e| {
            e.row_count = Some(count);
            e.row_count_fetched_at = Some(now);
        })
    }

    /// Records a verified upload (or a destination that already held the bytes).
    pub fn record_upload(
        &self,
        partition_id: &str,
        staged: &StagedArtifact,
        object_key: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.update(partition_id, |e| {
            e.uncompressed_size = Some(staged.uncompressed_size);
            e.compressed_size = Some(staged.size);
            e.content_hash = Some(staged.content_hash.clone());
            e.etag = Some(staged.expected_etag().to_string());
            e.uploaded = true;
            e.uploaded_at = Some(now);
            e.object_key = Some(object_key.to_string());
            e.last_error = None;
            e.last_error_at = None;
        })
    }

    /// Records a failure. `destination_unknown` clears `uploaded`, since the
    /// remote object may have been partially replaced.
    pub fn record_failure(
        &self,
        partition_id: &str,
        error: &str,
        destination_unknown: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.update(partition_id, |e| {
            e.last_error = Some(error.to_string());
            e.last_error_at = Some(now);
            if destination_unknown {
                e.uploaded = false;
            }
        })
    }

    pub fn invalidate(&self, partition_id: &str) -> Result<()> {
        let mut doc = self.lock()?;
        if doc.entries.remove(partition_id).is_some() {
            self.persist(&doc)?;
        }
        Ok(())
    }

    fn update(&self, partition_id: &str, f: impl FnOnce(&mut CacheEntry)) -> Result<()> {
        let mut doc = self.lock()?;
        f(doc.entries.entry(partition_id.to_string()).or_default());
        self.persist(&doc)
    }

    fn persist(&self, doc: &CacheDocument) -> Result<()> {
        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, doc)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))?;
        }
        tmp.persist(&self.path).map_err(|e| ArchiveError::IoError(e.error))?;
        Ok(())
    }
}

/// Hands out one `CacheNamespace` per document path.
pub struct CacheStore {
    root: PathBuf,
    row_count_ttl: Duration,
    namespaces: Mutex<HashMap<PathBuf, Arc<CacheNamespace>>>,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>, row_count_ttl: Duration) -> Self {
        Self {
            root: root.into(),
            row_count_ttl,
            namespaces: Mutex::new(HashMap::new()),
        }
    }

    pub fn namespace(&self, table: &str, destination: &str) -> Result<Arc<CacheNamespace>> {
        let path = self.root.join(cache_file_name(table, destination));
        let mut map = self
            .namespaces
            .lock()
            .map_err(|_| ArchiveError::MetadataError("cache registry lock poisoned".to_string()))?;
        let ns = map.entry(path.clone()).or_insert_with(|| {
            Arc::new(CacheNamespace::open(path, table, destination, self.row_count_ttl))
        });
        Ok(Arc::clone(ns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    fn closed_partition() -> PartitionInfo {
        PartitionInfo::physical("t_2024_01_01", "t", day(1), day(2))
    }

    fn store(dir: &Path) -> CacheStore {
        CacheStore::new(dir, Duration::hours(DEFAULT_ROW_COUNT_TTL_HOURS))
    }

    #[test]
    fn test_file_name_is_stable() {
        let a = cache_file_name("events", "s3://bucket/prefix");
        assert!(a.starts_with("archive_events_"));
        assert!(a.ends_with("_metadata.json"));
        assert_eq!(a.len(), "archive_events_".len() + 16 + "_metadata.json".len());
        assert_eq!(a, cache_file_name("events", "s3://bucket/prefix"));
        assert_ne!(a, cache_file_name("events", "s3://bucket/other"));
    }

    #[test]
    fn test_row_count_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let ns = store(dir.path()).namespace("t", "s3://b/p").unwrap();
        let p = closed_partition();

        ns.record_row_count(&p.id(), 42, day(10)).unwrap();
        assert_eq!(ns.cached_row_count(&p, day(10) + Duration::hours(23)).unwrap(), Some(42));
        assert_eq!(ns.cached_row_count(&p, day(11) + Duration::minutes(1)).unwrap(), None);
    }

    #[test]
    fn test_open_partition_never_uses_cached_count() {
        let dir = tempfile::tempdir().unwrap();
        let ns = store(dir.path()).namespace("t", "s3://b/p").unwrap();
        let p = PartitionInfo::physical("t_2024_01_10", "t", day(10), day(11));
        let now = day(10) + Duration::hours(3);

        ns.record_row_count(&p.id(), 5, now).unwrap();
        assert_eq!(ns.cached_row_count(&p, now).unwrap(), None);
    }

    #[test]
    fn test_persists_across_stores() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ns = store(dir.path()).namespace("t", "s3://b/p").unwrap();
            ns.record_failure("t_2024_01_01", "boom", true, day(3)).unwrap();
        }
        let ns = store(dir.path()).namespace("t", "s3://b/p").unwrap();
        let entry = ns.get("t_2024_01_01").unwrap().unwrap();
        assert_eq!(entry.last_error.as_deref(), Some("boom"));
        assert!(!entry.uploaded);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(ns.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(cache_file_name("t", "s3://b/p"));
        std::fs::write(&path, b"{ not json").unwrap();

        let ns = store(dir.path()).namespace("t", "s3://b/p").unwrap();
        assert_eq!(ns.get("anything").unwrap(), None);
        ns.record_row_count("x", 1, day(1)).unwrap();

        let reloaded: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(reloaded["entries"]["x"]["row_count"], 1);
    }

    #[test]
    fn test_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let ns = store(dir.path()).namespace("t", "s3://b/p").unwrap();
        ns.record_row_count("a", 1, day(1)).unwrap();
        ns.invalidate("a").unwrap();
        assert_eq!(ns.get("a").unwrap(), None);
    }

    #[test]
    fn test_namespace_is_shared() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let a = s.namespace("t", "s3://b/p").unwrap();
        let b = s.namespace("t", "s3://b/p").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
