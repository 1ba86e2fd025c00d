//! Application layer: discovery, extraction, upload and the orchestration
//! that ties them together. Depends only on ports, never on adapters.

pub mod cache;
pub mod cancellation;
pub mod discovery;
pub mod extractor;
pub mod integrity;
pub mod orchestrator;
pub mod retry;
pub mod runtime;
pub mod uploader;
