//! # pg-archiver
//!
//! Archives time-partitioned PostgreSQL tables to S3-compatible object
//! storage, one compressed file per partition, in constant memory.
//!
//! The crate follows a Ports and Adapters layout: `application` holds the
//! pipeline and talks to the database and the destination only through the
//! traits in `ports`; `infrastructure` implements those traits.

pub mod application;
pub mod compression;
pub mod config;
pub mod domain;
pub mod format;
pub mod infrastructure;
pub mod ports;

/// In-memory fakes of the ports, shared by unit and integration tests.
#[doc(hidden)]
pub mod test_support;
