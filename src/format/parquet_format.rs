//! Columnar output via Arrow record batches and the Parquet `ArrowWriter`.
//!
//! The Arrow schema is fixed once per artifact. Declared column types map
//! directly; columns with an unknown declared type are inferred from the
//! first non-null value of the first chunk and default to UTF-8.

use arrow_array::builder::{
    BinaryBuilder, BooleanBuilder, Date32Builder, Float64Builder, Int64Builder, StringBuilder,
    TimestampMicrosecondBuilder,
};
use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::{DataType, Field, Schema, SchemaRef, TimeUnit};
use chrono::{DateTime, NaiveDate, Utc};
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression as ParquetCompression, GzipLevel, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::io::Write;
use std::sync::Arc;

use super::{OutputFormat, StreamWriter};
use crate::compression::compressor_for;
use crate::domain::entities::{ColumnSchema, Record, Value};
use crate::domain::errors::{ArchiveError, Result};
use crate::domain::mapping::{infer_arrow_from_value, map_declared_to_arrow};

/// Maps a compression name and level to the Parquet codec.
///
/// Levels are normalized with the same rules as the external compressors.
pub fn map_parquet_compression(name: &str, level: i32) -> Result<ParquetCompression> {
    let normalized = compressor_for(name, 0)?.normalize_level(level);
    let codec = match name.trim().to_lowercase().as_str() {
        "zstd" | "zst" => ParquetCompression::ZSTD(ZstdLevel::try_new(normalized).unwrap_or_default()),
        "gzip" | "gz" => {
            ParquetCompression::GZIP(GzipLevel::try_new(normalized as u32).unwrap_or_default())
        }
        "lz4" => ParquetCompression::LZ4_RAW,
        _ => ParquetCompression::UNCOMPRESSED,
    };
    Ok(codec)
}

/// Apache Parquet. Compression happens inside the file, per column chunk.
#[derive(Debug, Clone)]
pub struct ParquetFormat {
    compression: ParquetCompression,
    row_group_size: usize,
}

impl ParquetFormat {
    pub fn new(compression: ParquetCompression, row_group_size: usize) -> Self {
        Self {
            compression,
            row_group_size: row_group_size.max(1),
        }
    }
}

impl OutputFormat for ParquetFormat {
    fn name(&self) -> &'static str {
        "parquet"
    }

    fn extension(&self) -> &'static str {
        "parquet"
    }

    fn mime_type(&self) -> &'static str {
        "application/vnd.apache.parquet"
    }

    fn compresses_internally(&self) -> bool {
        true
    }

    fn new_writer<'a>(
        &self,
        sink: Box<dyn Write + Send + 'a>,
        schema: &ColumnSchema,
    ) -> Result<Box<dyn StreamWriter + 'a>> {
        let columns = schema.sorted_names();
        let declared = columns
            .iter()
            .map(|c| schema.declared_type(c).and_then(map_declared_to_arrow))
            .collect();
        let props = WriterProperties::builder()
            .set_compression(self.compression)
            .set_max_row_group_size(self.row_group_size)
            .build();
        Ok(Box::new(ParquetStreamWriter {
            state: WriterState::Pending(sink),
            columns,
            declared,
            props: Some(props),
        }))
    }
}

enum WriterState<'a> {
    /// Schema not fixed yet; holds the sink until the first chunk arrives.
    Pending(Box<dyn Write + Send + 'a>),
    Open {
        writer: ArrowWriter<Box<dyn Write + Send + 'a>>,
        schema: SchemaRef,
    },
    Closed,
}

struct ParquetStreamWriter<'a> {
    state: WriterState<'a>,
    columns: Vec<String>,
    declared: Vec<Option<DataType>>,
    props: Option<WriterProperties>,
}

impl ParquetStreamWriter<'_> {
    /// Resolves every column type and opens the Arrow writer.
    fn open(&mut self, sample: &[Record]) -> Result<()> {
        if self.columns.is_empty() {
            let mut names: Vec<String> = sample.iter().flat_map(|r| r.keys().cloned()).collect();
            names.sort();
            names.dedup();
            self.declared = vec![None; names.len()];
            self.columns = names;
        }

        let fields: Vec<Field> = self
            .columns
            .iter()
            .zip(&self.declared)
            .map(|(name, declared)| {
                let dt = declared.clone().unwrap_or_else(|| {
                    sample
                        .iter()
                        .filter_map(|r| r.get(name))
                        .find_map(infer_arrow_from_value)
                        .unwrap_or(DataType::Utf8)
                });
                Field::new(name, dt, true)
            })
            .collect();
        let schema: SchemaRef = Arc::new(Schema::new(fields));

        let sink = match std::mem::replace(&mut self.state, WriterState::Closed) {
            WriterState::Pending(sink) => sink,
            other => {
                self.state = other;
                return Ok(());
            }
        };
        let writer = ArrowWriter::try_new(sink, schema.clone(), self.props.take())?;
        self.state = WriterState::Open { writer, schema };
        Ok(())
    }
}

impl StreamWriter for ParquetStreamWriter<'_> {
    fn write_chunk(&mut self, rows: &[Record]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        if matches!(self.state, WriterState::Pending(_)) {
            self.open(rows)?;
        }
        let WriterState::Open { writer, schema } = &mut self.state else {
            return Err(ArchiveError::SerializationError(
                "Parquet writer already closed".to_string(),
            ));
        };

        let arrays = schema
            .fields()
            .iter()
            .map(|f| build_array(f.name(), f.data_type(), rows))
            .collect::<Result<Vec<ArrayRef>>>()?;
        let batch = RecordBatch::try_new(schema.clone(), arrays)?;
        writer.write(&batch)?;
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        if matches!(self.state, WriterState::Pending(_)) {
            // No rows at all: still emit a valid file carrying the schema.
            self.open(&[])?;
        }
        if let WriterState::Open { writer, .. } = std::mem::replace(&mut self.state, WriterState::Closed) {
            let mut sink = writer.into_inner()?;
            sink.flush()?;
        }
        Ok(())
    }
}

fn mismatch(column: &str, expected: &DataType, value: &Value) -> ArchiveError {
    ArchiveError::SerializationError(format!(
        "Column '{}' expects {} but got {:?}",
        column, expected, value
    ))
}

fn days_since_epoch(d: NaiveDate) -> i32 {
    (d - NaiveDate::default()).num_days() as i32
}

/// Builds one Arrow column for a chunk. Missing keys and `Null` become nulls.
fn build_array(column: &str, dt: &DataType, rows: &[Record]) -> Result<ArrayRef> {
    let values = rows.iter().map(|r| r.get(column).unwrap_or(&Value::Null));
    let array: ArrayRef = match dt {
        DataType::Boolean => {
            let mut b = BooleanBuilder::with_capacity(rows.len());
            for v in values {
                match v {
                    Value::Null => b.append_null(),
                    Value::Bool(x) => b.append_value(*x),
                    Value::Text(s) if s == "true" || s == "false" => b.append_value(s == "true"),
                    other => return Err(mismatch(column, dt, other)),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Int64 => {
            let mut b = Int64Builder::with_capacity(rows.len());
            for v in values {
                match v {
                    Value::Null => b.append_null(),
                    Value::Int(x) => b.append_value(*x),
                    Value::Bool(x) => b.append_value(i64::from(*x)),
                    Value::Text(s) => match s.parse::<i64>() {
                        Ok(x) => b.append_value(x),
                        Err(_) => return Err(mismatch(column, dt, v)),
                    },
                    other => return Err(mismatch(column, dt, other)),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Float64 => {
            let mut b = Float64Builder::with_capacity(rows.len());
            for v in values {
                match v {
                    Value::Null => b.append_null(),
                    Value::Float(x) => b.append_value(*x),
                    Value::Int(x) => b.append_value(*x as f64),
                    Value::Text(s) => match s.parse::<f64>() {
                        Ok(x) => b.append_value(x),
                        Err(_) => return Err(mismatch(column, dt, v)),
                    },
                    other => return Err(mismatch(column, dt, other)),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Timestamp(TimeUnit::Microsecond, tz) => {
            let mut b = TimestampMicrosecondBuilder::with_capacity(rows.len());
            for v in values {
                match v {
                    Value::Null => b.append_null(),
                    Value::Timestamp(ts) => b.append_value(ts.timestamp_micros()),
                    Value::Date(d) => b.append_value(d.and_time(Default::default()).and_utc().timestamp_micros()),
                    Value::Text(s) => match DateTime::parse_from_rfc3339(s) {
                        Ok(ts) => b.append_value(ts.with_timezone(&Utc).timestamp_micros()),
                        Err(_) => return Err(mismatch(column, dt, v)),
                    },
                    other => return Err(mismatch(column, dt, other)),
                }
            }
            let array = b.finish();
            match tz {
                Some(tz) => Arc::new(array.with_timezone(tz.clone())),
                None => Arc::new(array),
            }
        }
        DataType::Date32 => {
            let mut b = Date32Builder::with_capacity(rows.len());
            for v in values {
                match v {
                    Value::Null => b.append_null(),
                    Value::Date(d) => b.append_value(days_since_epoch(*d)),
                    Value::Timestamp(ts) => b.append_value(days_since_epoch(ts.date_naive())),
                    other => return Err(mismatch(column, dt, other)),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Binary => {
            let mut b = BinaryBuilder::with_capacity(rows.len(), rows.len() * 32);
            for v in values {
                match v {
                    Value::Null => b.append_null(),
                    Value::Bytes(x) => b.append_value(x),
                    Value::Text(s) => b.append_value(s.as_bytes()),
                    other => return Err(mismatch(column, dt, other)),
                }
            }
            Arc::new(b.finish())
        }
        _ => {
            let mut b = StringBuilder::with_capacity(rows.len(), rows.len() * 16);
            for v in values {
                match v {
                    Value::Null => b.append_null(),
                    other => b.append_value(other.render()),
                }
            }
            Arc::new(b.finish())
        }
    };
    Ok(array)
}
