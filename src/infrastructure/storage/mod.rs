//! Archive destinations.

pub mod s3_adapter;
