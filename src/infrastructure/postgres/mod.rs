//! PostgreSQL adapters: connection pooling, catalog reads and cursors.

pub mod catalog_adapter;
pub mod connection_manager;
pub mod row_source_adapter;
pub mod sql_utils;

use std::error::Error as _;

use crate::domain::errors::ArchiveError;

/// SQLSTATE classes that will fail the same way on every attempt:
/// authorization (28), syntax/access rule (42), catalog (3D) and schema (3F).
const PERMANENT_CLASSES: &[&str] = &["28", "42", "3D", "3F"];

/// Whether a SQLSTATE is worth retrying.
///
/// Query cancellation and statement timeouts (57014), serialization failures
/// (40001), deadlocks (40P01), resource exhaustion (53) and connection
/// exceptions (08) are transient. Unknown states are treated as transient so
/// a flaky server does not fail a partition outright.
pub fn sqlstate_is_retryable(code: &str) -> bool {
    if PERMANENT_CLASSES.iter().any(|class| code.starts_with(class)) {
        return false;
    }
    if matches!(code, "57014" | "40001" | "40P01") {
        return true;
    }
    if code.starts_with("53") || code.starts_with("08") || code.starts_with("57") {
        return true;
    }
    // Data exceptions (22) and integrity violations (23) are bound to the rows.
    !(code.starts_with("22") || code.starts_with("23"))
}

impl From<postgres::Error> for ArchiveError {
    fn from(e: postgres::Error) -> Self {
        if let Some(state) = e.code() {
            let code = state.code();
            let message = match e.as_db_error() {
                Some(db) => format!("{} (SQLSTATE {})", db.message(), code),
                None => format!("{} (SQLSTATE {})", e, code),
            };
            return ArchiveError::DatabaseError {
                message,
                retryable: sqlstate_is_retryable(code),
            };
        }
        if e.is_closed() {
            return ArchiveError::transient_db(format!("connection closed: {}", e));
        }
        // Socket-level failures surface as an io::Error source.
        let is_io = e
            .source()
            .is_some_and(|s| s.downcast_ref::<std::io::Error>().is_some());
        if is_io {
            ArchiveError::transient_db(e.to_string())
        } else {
            ArchiveError::permanent_db(e.to_string())
        }
    }
}

impl From<r2d2::Error> for ArchiveError {
    fn from(e: r2d2::Error) -> Self {
        ArchiveError::transient_db(format!("connection pool: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_classification() {
        assert!(sqlstate_is_retryable("57014"));
        assert!(sqlstate_is_retryable("40001"));
        assert!(sqlstate_is_retryable("40P01"));
        assert!(sqlstate_is_retryable("53300"));
        assert!(sqlstate_is_retryable("08006"));

        assert!(!sqlstate_is_retryable("28P01"));
        assert!(!sqlstate_is_retryable("42P01"));
        assert!(!sqlstate_is_retryable("42501"));
        assert!(!sqlstate_is_retryable("3D000"));
        assert!(!sqlstate_is_retryable("3F000"));
        assert!(!sqlstate_is_retryable("22P02"));
    }
}
