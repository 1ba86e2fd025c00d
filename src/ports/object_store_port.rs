//! Port for the archive destination.
//!
//! The uploader drives single-part and multipart uploads through this trait
//! and reads back the destination's size/ETag to verify them.

use crate::domain::errors::Result;

/// What the destination reports about an existing object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub size: u64,
    /// ETag with surrounding quotes removed.
    pub etag: Option<String>,
}

/// Handle for an in-progress multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartHandle {
    pub key: String,
    pub upload_id: String,
}

/// Opaque per-part receipt returned by the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartReceipt {
    pub part_number: usize,
    pub content_id: String,
}

pub trait ObjectStorePort: Send + Sync {
    /// `None` if the object does not exist.
    fn head(&self, key: &str) -> Result<Option<RemoteObject>>;

    fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()>;

    fn create_multipart(&self, key: &str, content_type: &str) -> Result<MultipartHandle>;

    /// `part_index` is zero-based. Parts are sent one at a time in ascending
    /// index order.
    fn put_part(&self, handle: &MultipartHandle, part_index: usize, body: Vec<u8>) -> Result<PartReceipt>;

    fn complete_multipart(&self, handle: &MultipartHandle, parts: Vec<PartReceipt>) -> Result<()>;

    fn abort_multipart(&self, handle: &MultipartHandle) -> Result<()>;
}
