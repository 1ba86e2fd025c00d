//! Adapters that connect the ports to PostgreSQL and object storage.

pub mod postgres;
pub mod storage;
