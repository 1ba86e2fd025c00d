//! Helpers for building PostgreSQL statements.
//!
//! Cursor statements (`DECLARE`) cannot take bind parameters through the
//! simple protocol, so identifiers are quoted and timestamps are inlined as
//! literals built only from formatted `DateTime` values.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::domain::entities::{ColumnSchema, PartitionInfo, PartitionSource};
use crate::domain::mapping::{value_kind, ValueKind};

pub const CURSOR_NAME: &str = "archive_cursor";

/// Double-quotes an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `"schema"."table"`.
pub fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// A `timestamptz` literal. The input is a typed value, never user text.
pub fn timestamp_literal(ts: DateTime<Utc>) -> String {
    format!(
        "'{}'::timestamptz",
        ts.to_rfc3339_opts(SecondsFormat::Micros, true)
    )
}

/// Projection for the extraction query.
///
/// Columns without a native decoder are selected as text so every row can
/// be read without per-type driver support.
pub fn select_list(schema: &ColumnSchema) -> String {
    if schema.is_empty() {
        return "*".to_string();
    }
    schema
        .columns
        .iter()
        .map(|c| {
            let ident = quote_ident(&c.name);
            match value_kind(&c.declared_type) {
                ValueKind::CastToText => format!("{}::text AS {}", ident, ident),
                _ => ident,
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// `FROM ... [WHERE ...]` selecting exactly the partition's rows.
pub fn from_clause(db_schema: &str, partition: &PartitionInfo) -> String {
    let table = qualified(db_schema, &partition.table_name);
    match &partition.source {
        PartitionSource::Physical => format!("FROM ONLY {}", table),
        PartitionSource::Window { date_column } => format!(
            "FROM {} WHERE {} >= {} AND {} < {}",
            table,
            quote_ident(date_column),
            timestamp_literal(partition.coverage_start),
            quote_ident(date_column),
            timestamp_literal(partition.coverage_end)
        ),
    }
}

pub fn count_query(db_schema: &str, partition: &PartitionInfo) -> String {
    format!("SELECT COUNT(*) {}", from_clause(db_schema, partition))
}

/// Ordered by the date column for windows so files are stable across runs.
pub fn declare_cursor(db_schema: &str, partition: &PartitionInfo, schema: &ColumnSchema) -> String {
    let order = match &partition.source {
        PartitionSource::Window { date_column } => format!(" ORDER BY {}", quote_ident(date_column)),
        PartitionSource::Physical => String::new(),
    };
    format!(
        "DECLARE {} NO SCROLL CURSOR FOR SELECT {} {}{}",
        CURSOR_NAME,
        select_list(schema),
        from_clause(db_schema, partition),
        order
    )
}

/// Statements run on every new connection.
///
/// Window bounds are UTC literals and naive timestamps are decoded as UTC, so
/// the session time zone must be UTC for both to agree.
pub fn session_setup(statement_timeout_secs: u64) -> String {
    let mut sql = String::from("SET TIME ZONE 'UTC';");
    if statement_timeout_secs > 0 {
        sql.push_str(&format!(
            " SET statement_timeout = {};",
            statement_timeout_secs.saturating_mul(1000)
        ));
    }
    sql
}

pub fn fetch_forward(rows: usize) -> String {
    format!("FETCH FORWARD {} FROM {}", rows, CURSOR_NAME)
}
