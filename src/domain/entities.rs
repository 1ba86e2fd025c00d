//! # Domain Entities
//!
//! Entities are the "Nouns" of the archiver: partitions, columns, row values,
//! cache entries and per-partition results.
//!
//! We use the `serde` crate (Serialize/Deserialize) so results and cache
//! entries can be written as JSON without hand-written encoders.

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::domain::errors::Stage;

/// How a partition's rows are selected from the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionSource {
    /// A leaf partition table; every row in it belongs to the partition.
    Physical,
    /// A synthesized time range over a non-partitioned table.
    Window { date_column: String },
}

/// One unit of work: a physical partition or a synthesized time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    /// The table the rows are read from (the leaf table, or the base table for windows).
    pub table_name: String,
    /// The base table this partition belongs to; drives `{table}` in object keys.
    pub base_table: String,
    pub coverage_start: DateTime<Utc>,
    pub coverage_end: DateTime<Utc>,
    pub source: PartitionSource,
}

impl PartitionInfo {
    pub fn physical(
        table_name: impl Into<String>,
        base_table: impl Into<String>,
        coverage_start: DateTime<Utc>,
        coverage_end: DateTime<Utc>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            base_table: base_table.into(),
            coverage_start,
            coverage_end,
            source: PartitionSource::Physical,
        }
    }

    pub fn window(
        base_table: impl Into<String>,
        date_column: impl Into<String>,
        coverage_start: DateTime<Utc>,
        coverage_end: DateTime<Utc>,
    ) -> Self {
        let base_table = base_table.into();
        Self {
            table_name: base_table.clone(),
            base_table,
            coverage_start,
            coverage_end,
            source: PartitionSource::Window {
                date_column: date_column.into(),
            },
        }
    }

    /// Stable identifier used as the cache key.
    pub fn id(&self) -> String {
        match &self.source {
            PartitionSource::Physical => self.table_name.clone(),
            PartitionSource::Window { .. } => format!(
                "{}_{}",
                self.table_name,
                self.coverage_start.format("%Y%m%d%H")
            ),
        }
    }

    /// A partition is open while the reference instant falls inside its coverage.
    ///
    /// Open partitions still accumulate rows, so their row counts are never
    /// taken from cache and their uploads are never fast-path skipped.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.coverage_start <= now && now < self.coverage_end
    }

    /// True if the coverage intersects the half-open range `[start, end)`.
    pub fn overlaps(&self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> bool {
        let after_start = start.map_or(true, |s| self.coverage_end > s);
        let before_end = end.map_or(true, |e| self.coverage_start < e);
        after_start && before_end
    }
}

impl fmt::Display for PartitionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{} .. {})",
            self.id(),
            self.coverage_start.format("%Y-%m-%d %H:%M"),
            self.coverage_end.format("%Y-%m-%d %H:%M")
        )
    }
}

/// A single column as declared in the source catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// `information_schema.columns.data_type`, e.g. "timestamp with time zone".
    pub declared_type: String,
}

/// The column list of a base table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub columns: Vec<ColumnDef>,
}

impl ColumnSchema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self { columns }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// Column names in lexicographic order, the order every serializer emits.
    pub fn sorted_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.columns.iter().map(|c| c.name.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn declared_type(&self, name: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.declared_type.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// A single cell value read from the source.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Text rendering used by the CSV writer and for string-typed Parquet columns.
    ///
    /// `Null` renders as the empty string.
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::Micros, true),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Json(j) => j.to_string(),
            Value::Bytes(b) => general_purpose::STANDARD.encode(b),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Json(j) => j.serialize(serializer),
            Value::Text(_) | Value::Timestamp(_) | Value::Date(_) | Value::Bytes(_) => {
                serializer.serialize_str(&self.render())
            }
        }
    }
}

/// One row: column name to value. Keys iterate in lexicographic order.
pub type Record = BTreeMap<String, Value>;

/// Width of a synthesized window, and the granularity of output file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputDuration {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl OutputDuration {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hourly" | "hour" => Some(Self::Hourly),
            "daily" | "day" => Some(Self::Daily),
            "weekly" | "week" => Some(Self::Weekly),
            "monthly" | "month" => Some(Self::Monthly),
            "yearly" | "year" => Some(Self::Yearly),
            _ => None,
        }
    }
}

impl fmt::Display for OutputDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        };
        f.write_str(s)
    }
}

/// `ProcessResult` is the "Report Card" for one partition.
///
/// External progress and notification layers consume these directly.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessResult {
    pub partition: PartitionInfo,
    pub success: bool,
    pub skipped: bool,
    pub skip_reason: Option<String>,
    pub rows: u64,
    /// Compressed bytes staged (and uploaded, unless the upload was skipped).
    pub bytes_written: u64,
    /// 0 when the format compresses internally (Parquet).
    pub uncompressed_bytes: u64,
    pub content_hash: Option<String>,
    pub object_key: Option<String>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub error: Option<String>,
    pub error_stage: Option<Stage>,
    pub cancelled: bool,
}

impl ProcessResult {
    pub fn skipped(partition: PartitionInfo, reason: impl Into<String>, duration: Duration) -> Self {
        Self {
            partition,
            success: true,
            skipped: true,
            skip_reason: Some(reason.into()),
            rows: 0,
            bytes_written: 0,
            uncompressed_bytes: 0,
            content_hash: None,
            object_key: None,
            duration,
            error: None,
            error_stage: None,
            cancelled: false,
        }
    }

    pub fn failure(
        partition: PartitionInfo,
        error: &crate::domain::errors::ArchiveError,
        duration: Duration,
    ) -> Self {
        Self {
            partition,
            success: false,
            skipped: false,
            skip_reason: None,
            rows: 0,
            bytes_written: 0,
            uncompressed_bytes: 0,
            content_hash: None,
            object_key: None,
            duration,
            error: Some(error.to_string()),
            error_stage: error.stage(),
            cancelled: error.is_cancelled(),
        }
    }
}

/// Aggregate over all partitions of one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_rows: u64,
    pub total_bytes: u64,
}

impl RunSummary {
    pub fn from_results(results: &[ProcessResult]) -> Self {
        let mut summary = RunSummary {
            total: results.len(),
            ..Default::default()
        };
        for r in results {
            if r.cancelled {
                summary.cancelled += 1;
            } else if !r.success {
                summary.failed += 1;
            } else if r.skipped {
                summary.skipped += 1;
            } else {
                summary.uploaded += 1;
            }
            summary.total_rows += r.rows;
            summary.total_bytes += r.bytes_written;
        }
        summary
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_open_window_boundary() {
        let p = PartitionInfo::physical("t_2024_01_01", "t", day(1), day(2));
        assert!(p.is_open_at(day(1)));
        assert!(p.is_open_at(day(1) + chrono::Duration::hours(23)));
        // The end instant belongs to the next window.
        assert!(!p.is_open_at(day(2)));
        assert!(!p.is_open_at(day(1) - chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_partition_ids() {
        let p = PartitionInfo::physical("t_2024_01_01", "t", day(1), day(2));
        assert_eq!(p.id(), "t_2024_01_01");
        let w = PartitionInfo::window("events", "created_at", day(3), day(4));
        assert_eq!(w.id(), "events_2024010300");
        assert_eq!(w.table_name, "events");
    }

    #[test]
    fn test_overlaps() {
        let p = PartitionInfo::physical("t_2024_01_02", "t", day(2), day(3));
        assert!(p.overlaps(None, None));
        assert!(p.overlaps(Some(day(1)), Some(day(3))));
        assert!(!p.overlaps(Some(day(3)), None));
        assert!(!p.overlaps(None, Some(day(2))));
    }

    #[test]
    fn test_value_json_encoding() {
        let mut row = Record::new();
        row.insert("b".into(), Value::Null);
        row.insert("a".into(), Value::Int(7));
        row.insert("c".into(), Value::Timestamp(day(1)));
        row.insert("d".into(), Value::Bytes(vec![1, 2, 3]));
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(
            json,
            r#"{"a":7,"b":null,"c":"2024-01-01T00:00:00.000000Z","d":"AQID"}"#
        );
    }

    #[test]
    fn test_sorted_names() {
        let schema = ColumnSchema::new(vec![
            ColumnDef { name: "zeta".into(), declared_type: "text".into() },
            ColumnDef { name: "alpha".into(), declared_type: "integer".into() },
        ]);
        assert_eq!(schema.sorted_names(), vec!["alpha", "zeta"]);
        assert_eq!(schema.declared_type("alpha"), Some("integer"));
    }
}
