//! Row source over server-side cursors.
//!
//! Each cursor lives in its own read-only transaction on a pooled
//! connection. Rows are pulled with `FETCH FORWARD n`, so client memory is
//! bounded by the chunk size regardless of partition size.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use log::{debug, warn};
use postgres::types::Type;
use postgres::Row;
use r2d2::{Pool, PooledConnection};
use std::sync::Arc;

use crate::domain::chunk_buffer::ChunkBuffer;
use crate::domain::entities::{ColumnSchema, PartitionInfo, Record, Value};
use crate::domain::errors::{ArchiveError, Result};
use crate::infrastructure::postgres::connection_manager::PostgresConnectionManager;
use crate::infrastructure::postgres::sql_utils;
use crate::ports::row_source_port::{RowCursor, RowSource};

pub struct PostgresRowSource {
    pool: Arc<Pool<PostgresConnectionManager>>,
    schema: String,
}

impl PostgresRowSource {
    pub fn new(pool: Arc<Pool<PostgresConnectionManager>>, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }
}

impl RowSource for PostgresRowSource {
    fn count_rows(&self, partition: &PartitionInfo) -> Result<u64> {
        let mut conn = self.pool.get()?;
        let sql = sql_utils::count_query(&self.schema, partition);
        let row = conn.query_one(sql.as_str(), &[])?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }

    fn open_cursor(
        &self,
        partition: &PartitionInfo,
        schema: &ColumnSchema,
    ) -> Result<Box<dyn RowCursor + '_>> {
        let mut conn = self.pool.get()?;
        let declare = sql_utils::declare_cursor(&self.schema, partition, schema);
        debug!("{}: {}", partition.id(), declare);

        conn.batch_execute("BEGIN TRANSACTION READ ONLY")?;
        if let Err(e) = conn.batch_execute(&declare) {
            let _ = conn.batch_execute("ROLLBACK");
            return Err(e.into());
        }
        Ok(Box::new(PostgresCursor {
            conn,
            partition_id: partition.id(),
            exhausted: false,
        }))
    }
}

/// A declared cursor inside an open transaction. Dropping it rolls back.
pub struct PostgresCursor {
    conn: PooledConnection<PostgresConnectionManager>,
    partition_id: String,
    exhausted: bool,
}

impl RowCursor for PostgresCursor {
    fn fetch_chunk(&mut self, buf: &mut ChunkBuffer) -> Result<usize> {
        let want = buf.remaining();
        if self.exhausted || want == 0 {
            return Ok(0);
        }
        let rows = self.conn.query(sql_utils::fetch_forward(want).as_str(), &[])?;
        if rows.len() < want {
            self.exhausted = true;
        }
        for row in &rows {
            buf.push(decode_row(row)?);
        }
        Ok(rows.len())
    }
}

impl Drop for PostgresCursor {
    fn drop(&mut self) {
        if self.conn.is_closed() {
            return;
        }
        if let Err(e) = self.conn.batch_execute("ROLLBACK") {
            warn!("{}: failed to close cursor transaction: {}", self.partition_id, e);
        }
    }
}

/// Converts a driver row into a `Record`, keyed by column name.
fn decode_row(row: &Row) -> Result<Record> {
    let mut record = Record::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = decode_value(row, idx, column.type_())?;
        record.insert(column.name().to_string(), value);
    }
    Ok(record)
}

fn decode_value(row: &Row, idx: usize, ty: &Type) -> Result<Value> {
    let value = match ty.name() {
        "bool" => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
        "int2" => row.try_get::<_, Option<i16>>(idx)?.map(|v| Value::Int(v.into())),
        "int4" => row.try_get::<_, Option<i32>>(idx)?.map(|v| Value::Int(v.into())),
        "int8" => row.try_get::<_, Option<i64>>(idx)?.map(Value::Int),
        "float4" => row.try_get::<_, Option<f32>>(idx)?.map(|v| Value::Float(v.into())),
        "float8" => row.try_get::<_, Option<f64>>(idx)?.map(Value::Float),
        "timestamp" => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|v| Value::Timestamp(v.and_utc())),
        "timestamptz" => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(Value::Timestamp),
        "date" => row.try_get::<_, Option<NaiveDate>>(idx)?.map(Value::Date),
        "json" | "jsonb" => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(Value::Json),
        "bytea" => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(Value::Bytes),
        "text" | "varchar" | "bpchar" | "name" | "unknown" => {
            row.try_get::<_, Option<String>>(idx)?.map(Value::Text)
        }
        other => {
            return Err(ArchiveError::SerializationError(format!(
                "column {} has type {} with no decoder; select it as text",
                row.columns()[idx].name(),
                other
            )))
        }
    };
    Ok(value.unwrap_or(Value::Null))
}
