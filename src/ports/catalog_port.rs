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

//! # Catalog Port
//!
//! This Port defines what it means to "read the catalog" of the source
//! database. The Partition Discoverer and the Schema Inspector only talk to
//! this trait, so they can be exercised against an in-memory catalog.

use crate::domain::entities::ColumnSchema;
use crate::domain::errors::Result;

/// A direct child of a table in the inheritance hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildTable {
    pub name: String,
    /// Declared as a partitioned table itself (it can never hold rows).
    pub is_partitioned: bool,
    /// Declarative partition bound, e.g. `FOR VALUES FROM ('2024-01-01') TO ('2024-01-02')`.
    pub bound_expr: Option<String>,
}

/// `CatalogPort` answers read-only questions about tables.
///
/// `Send + Sync` because discovery may run while workers hold a handle.
pub trait CatalogPort: Send + Sync {
    /// Whether the table exists in the configured schema.
    fn table_exists(&self, table: &str) -> Result<bool>;

    /// Direct children of `table` (one level of `pg_inherits`).
    fn child_tables(&self, table: &str) -> Result<Vec<ChildTable>>;

    /// Column names and declared types, in ordinal order.
    fn column_schema(&self, table: &str) -> Result<ColumnSchema>;
}
