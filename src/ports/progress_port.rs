//! Progress callbacks consumed by whatever renders progress.
//!
//! The core never assumes a renderer exists; `NoopProgress` is the default.

use crate::domain::entities::{PartitionInfo, ProcessResult};

pub trait ProgressObserver: Send + Sync {
    fn on_partition_start(&self, _partition: &PartitionInfo, _expected_rows: Option<u64>) {}

    /// Called after each chunk with the cumulative row count for this attempt.
    fn on_chunk(&self, _partition: &PartitionInfo, _rows_so_far: u64) {}

    fn on_partition_done(&self, _result: &ProcessResult) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressObserver for NoopProgress {}
