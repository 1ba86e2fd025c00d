//! # Streaming Serializers
//!
//! Every output format implements the same small capability set:
//! `OutputFormat` creates a `StreamWriter` over a byte sink, the extractor
//! feeds it one chunk at a time, and `close` writes whatever trailer the
//! format needs. Nothing here holds more than one chunk in memory.

mod csv_format;
mod jsonl_format;
mod parquet_format;

pub use csv_format::CsvFormat;
pub use jsonl_format::JsonLinesFormat;
pub use parquet_format::{map_parquet_compression, ParquetFormat};

use std::io::Write;

use crate::domain::entities::{ColumnSchema, Record};
use crate::domain::errors::{ArchiveError, Result};

/// A format writer bound to one artifact.
pub trait StreamWriter: Send {
    /// Serializes `rows` in order. Column alignment is stable across calls.
    fn write_chunk(&mut self, rows: &[Record]) -> Result<()>;

    /// Flushes and writes the format trailer, if any.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Capability set for an output format.
pub trait OutputFormat: Send + Sync {
    fn name(&self) -> &'static str;

    fn extension(&self) -> &'static str;

    fn mime_type(&self) -> &'static str;

    /// Formats that compress internally must not be wrapped in a `Compressor`.
    fn compresses_internally(&self) -> bool {
        false
    }

    fn new_writer<'a>(
        &self,
        sink: Box<dyn Write + Send + 'a>,
        schema: &ColumnSchema,
    ) -> Result<Box<dyn StreamWriter + 'a>>;
}

/// Settings only some formats care about.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// Compression name and level used inside columnar files.
    pub compression: String,
    pub compression_level: i32,
    /// Upper bound on rows buffered per Parquet row group.
    pub row_group_size: usize,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            compression: "zstd".to_string(),
            compression_level: 3,
            row_group_size: crate::domain::chunk_buffer::DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Factory keyed on the configuration string.
pub fn format_for(name: &str, options: &FormatOptions) -> Result<Box<dyn OutputFormat>> {
    match name.trim().to_lowercase().as_str() {
        "jsonl" | "ndjson" | "json" => Ok(Box::new(JsonLinesFormat)),
        "csv" => Ok(Box::new(CsvFormat)),
        "parquet" => Ok(Box::new(ParquetFormat::new(
            map_parquet_compression(&options.compression, options.compression_level)?,
            options.row_group_size,
        ))),
        other => Err(ArchiveError::ConfigError(format!(
            "Unknown output format '{}' (expected jsonl, csv or parquet)",
            other
        ))),
    }
}

/// Serializes all rows with the given chunk size into a byte vector.
#[cfg(test)]
pub(crate) fn serialize_in_chunks(
    format: &dyn OutputFormat,
    schema: &ColumnSchema,
    rows: &[Record],
    chunk_size: usize,
) -> Vec<u8> {
    let mut out = Vec::new();
    {
        let mut writer = format.new_writer(Box::new(&mut out), schema).unwrap();
        for chunk in rows.chunks(chunk_size.max(1)) {
            writer.write_chunk(chunk).unwrap();
        }
        writer.close().unwrap();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{ColumnDef, Value};
    use chrono::{TimeZone, Utc};

    fn schema() -> ColumnSchema {
        ColumnSchema::new(vec![
            ColumnDef { name: "id".into(), declared_type: "bigint".into() },
            ColumnDef { name: "created_at".into(), declared_type: "timestamp with time zone".into() },
            ColumnDef { name: "note".into(), declared_type: "text".into() },
        ])
    }

    fn rows(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| {
                let mut r = Record::new();
                r.insert("id".into(), Value::Int(i as i64));
                r.insert(
                    "created_at".into(),
                    Value::Timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 0, i as u32 % 60, 0).unwrap()),
                );
                if i % 3 != 0 {
                    r.insert("note".into(), Value::Text(format!("note, \"{}\"", i)));
                }
                r
            })
            .collect()
    }

    #[test]
    fn test_chunk_boundary_equivalence() {
        let n = 25;
        let data = rows(n);
        for name in ["jsonl", "csv", "parquet"] {
            let format = format_for(name, &FormatOptions::default()).unwrap();
            let whole = serialize_in_chunks(format.as_ref(), &schema(), &data, n);
            for chunk_size in [1, n / 2, n, n + 1] {
                let chunked = serialize_in_chunks(format.as_ref(), &schema(), &data, chunk_size);
                assert_eq!(chunked, whole, "{} with chunk size {}", name, chunk_size);
            }
        }
    }

    #[test]
    fn test_factory() {
        let opts = FormatOptions::default();
        assert_eq!(format_for("jsonl", &opts).unwrap().extension(), "jsonl");
        assert_eq!(format_for("CSV", &opts).unwrap().mime_type(), "text/csv");
        let parquet = format_for("parquet", &opts).unwrap();
        assert!(parquet.compresses_internally());
        assert!(matches!(format_for("avro", &opts), Err(ArchiveError::ConfigError(_))));
    }
}
