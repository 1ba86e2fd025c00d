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

//! # Row Source Port
//!
//! The "Data Mover" contract. Anything implementing `RowSource` can count the
//! rows of a partition and open a forward-only cursor over them. The
//! extractor pulls chunks from the cursor; it never sees SQL.

use crate::domain::chunk_buffer::ChunkBuffer;
use crate::domain::entities::{ColumnSchema, PartitionInfo};
use crate::domain::errors::Result;

/// A server-side cursor positioned inside one partition.
pub trait RowCursor: Send {
    /// Fills `buf` with up to `buf.remaining()` rows.
    ///
    /// Returns the number of rows appended; `0` means the cursor is exhausted.
    /// Errors may surface here long after the cursor was opened (statement
    /// timeouts, dropped connections).
    fn fetch_chunk(&mut self, buf: &mut ChunkBuffer) -> Result<usize>;
}

pub trait RowSource: Send + Sync {
    /// `SELECT COUNT(*)` over the partition.
    fn count_rows(&self, partition: &PartitionInfo) -> Result<u64>;

    /// Opens a cursor over the partition's rows, in extraction order.
    fn open_cursor(
        &self,
        partition: &PartitionInfo,
        schema: &ColumnSchema,
    ) -> Result<Box<dyn RowCursor + '_>>;
}
