//! Ports: the traits the application layer depends on.

pub mod catalog_port;
pub mod object_store_port;
pub mod progress_port;
pub mod row_source_port;
