//! Infrastructure adapter for reading the PostgreSQL catalog.

use log::debug;
use r2d2::Pool;
use std::sync::Arc;

use crate::domain::entities::{ColumnDef, ColumnSchema};
use crate::domain::errors::Result;
use crate::infrastructure::postgres::connection_manager::PostgresConnectionManager;
use crate::ports::catalog_port::{CatalogPort, ChildTable};

const SQL_TABLE_EXISTS: &str = "
    SELECT EXISTS (
        SELECT 1
        FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = $1
          AND c.relname = $2
          AND c.relkind IN ('r', 'p')
    )
";
const SQL_CHILD_TABLES: &str = "
    SELECT c.relname::text,
           c.relkind = 'p',
           pg_get_expr(c.relpartbound, c.oid)
    FROM pg_inherits i
    JOIN pg_class c ON c.oid = i.inhrelid
    JOIN pg_class p ON p.oid = i.inhparent
    JOIN pg_namespace n ON n.oid = p.relnamespace
    WHERE n.nspname = $1
      AND p.relname = $2
    ORDER BY c.relname
";
const SQL_COLUMNS: &str = "
    SELECT column_name::text, data_type::text
    FROM information_schema.columns
    WHERE table_schema = $1
      AND table_name = $2
    ORDER BY ordinal_position
";

/// `CatalogPort` backed by `pg_catalog` and `information_schema`.
pub struct PostgresCatalogAdapter {
    pool: Arc<Pool<PostgresConnectionManager>>,
    schema: String,
}

impl PostgresCatalogAdapter {
    pub fn new(pool: Arc<Pool<PostgresConnectionManager>>, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }
}

impl CatalogPort for PostgresCatalogAdapter {
    fn table_exists(&self, table: &str) -> Result<bool> {
        let mut conn = self.pool.get()?;
        let row = conn.query_one(SQL_TABLE_EXISTS, &[&self.schema, &table])?;
        Ok(row.try_get(0)?)
    }

    fn child_tables(&self, table: &str) -> Result<Vec<ChildTable>> {
        let mut conn = self.pool.get()?;
        let rows = conn.query(SQL_CHILD_TABLES, &[&self.schema, &table])?;
        let mut children = Vec::with_capacity(rows.len());
        for row in rows {
            children.push(ChildTable {
                name: row.try_get(0)?,
                is_partitioned: row.try_get(1)?,
                bound_expr: row.try_get(2)?,
            });
        }
        debug!("{}.{}: {} child table(s)", self.schema, table, children.len());
        Ok(children)
    }

    fn column_schema(&self, table: &str) -> Result<ColumnSchema> {
        let mut conn = self.pool.get()?;
        let rows = conn.query(SQL_COLUMNS, &[&self.schema, &table])?;
        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            columns.push(ColumnDef {
                name: row.try_get(0)?,
                declared_type: row.try_get(1)?,
            });
        }
        Ok(ColumnSchema::new(columns))
    }
}
