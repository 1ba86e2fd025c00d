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

//! Core error definitions for the archiver.
//!
//! This module provides a centralized `ArchiveError` enum and a `Result` type
//! used throughout the application. Every error knows whether it is worth
//! retrying: the Retry Orchestrator only consults `is_retryable()`.

use std::fmt;
use thiserror::Error;

/// The pipeline stage an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovery,
    Schema,
    RowCount,
    Extract,
    Serialize,
    Compress,
    Upload,
    Verify,
    Cache,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Discovery => "discovery",
            Stage::Schema => "schema",
            Stage::RowCount => "row_count",
            Stage::Extract => "extract",
            Stage::Serialize => "serialize",
            Stage::Compress => "compress",
            Stage::Upload => "upload",
            Stage::Verify => "verify",
            Stage::Cache => "cache",
        };
        f.write_str(s)
    }
}

/// Error types encountered during an archive run.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Metadata discovery failed: {0}")]
    MetadataError(String),

    #[error("Database error: {message}")]
    DatabaseError { message: String, retryable: bool },

    #[error("Object storage error: {message}")]
    StorageError { message: String, retryable: bool },

    #[error("Serialization failed: {0}")]
    SerializationError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Integrity check failed for {key}: expected {expected}, destination reports {actual}")]
    IntegrityError {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Partition {partition} failed during {stage}: {source}")]
    PartitionError {
        partition: String,
        stage: Stage,
        #[source]
        source: Box<ArchiveError>,
    },
}

impl ArchiveError {
    /// Whether another attempt has a reasonable chance of succeeding.
    ///
    /// Configuration, metadata, serialization and integrity errors are
    /// permanent. Cancellation is never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ArchiveError::DatabaseError { retryable, .. }
            | ArchiveError::StorageError { retryable, .. } => *retryable,
            ArchiveError::IoError(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::InvalidInput
                    | std::io::ErrorKind::Unsupported
            ),
            ArchiveError::PartitionError { source, .. } => source.is_retryable(),
            ArchiveError::ConfigError(_)
            | ArchiveError::MetadataError(_)
            | ArchiveError::SerializationError(_)
            | ArchiveError::IntegrityError { .. }
            | ArchiveError::Cancelled => false,
        }
    }

    /// True if this error, or the error it wraps, is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            ArchiveError::Cancelled => true,
            ArchiveError::PartitionError { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Wraps the error with the partition and stage it came from.
    ///
    /// Already-wrapped errors keep their original context.
    pub fn in_partition(self, partition: &str, stage: Stage) -> Self {
        match self {
            ArchiveError::PartitionError { .. } => self,
            other => ArchiveError::PartitionError {
                partition: partition.to_string(),
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage recorded by `in_partition`, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            ArchiveError::PartitionError { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub fn transient_db(message: impl Into<String>) -> Self {
        ArchiveError::DatabaseError {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent_db(message: impl Into<String>) -> Self {
        ArchiveError::DatabaseError {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn transient_storage(message: impl Into<String>) -> Self {
        ArchiveError::StorageError {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent_storage(message: impl Into<String>) -> Self {
        ArchiveError::StorageError {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<csv::Error> for ArchiveError {
    fn from(e: csv::Error) -> Self {
        if e.is_io_error() {
            match e.into_kind() {
                csv::ErrorKind::Io(io) => ArchiveError::IoError(io),
                other => ArchiveError::SerializationError(format!("{:?}", other)),
            }
        } else {
            ArchiveError::SerializationError(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ArchiveError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            ArchiveError::IoError(std::io::Error::other(e))
        } else {
            ArchiveError::SerializationError(e.to_string())
        }
    }
}

impl From<parquet::errors::ParquetError> for ArchiveError {
    fn from(e: parquet::errors::ParquetError) -> Self {
        ArchiveError::SerializationError(format!("Parquet: {}", e))
    }
}

impl From<arrow_schema::ArrowError> for ArchiveError {
    fn from(e: arrow_schema::ArrowError) -> Self {
        ArchiveError::SerializationError(format!("Arrow: {}", e))
    }
}

/// A specialized Result type for the archiver.
pub type Result<T> = std::result::Result<T, ArchiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ArchiveError::transient_db("connection reset").is_retryable());
        assert!(!ArchiveError::permanent_db("password authentication failed").is_retryable());
        assert!(ArchiveError::transient_storage("503 SlowDown").is_retryable());
        assert!(!ArchiveError::ConfigError("bad chunk size".into()).is_retryable());
        assert!(!ArchiveError::Cancelled.is_retryable());
        assert!(!ArchiveError::IntegrityError {
            key: "k".into(),
            expected: "a".into(),
            actual: "b".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_partition_context_preserves_classification() {
        let err = ArchiveError::transient_db("timeout").in_partition("events_2024_01_01", Stage::Extract);
        assert!(err.is_retryable());
        assert_eq!(err.stage(), Some(Stage::Extract));
        assert!(err.to_string().contains("events_2024_01_01"));

        // Re-wrapping keeps the innermost context.
        let rewrapped = err.in_partition("other", Stage::Upload);
        assert_eq!(rewrapped.stage(), Some(Stage::Extract));

        let cancelled = ArchiveError::Cancelled.in_partition("p", Stage::Extract);
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_retryable());
    }

    #[test]
    fn test_io_error_kinds() {
        let reset = ArchiveError::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(reset.is_retryable());
        let denied = ArchiveError::from(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!denied.is_retryable());
    }
}
