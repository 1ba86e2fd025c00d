//! Object storage uploader.
//!
//! Small artifacts go up in one PUT; artifacts at or above the multipart
//! threshold are split at the same part size the integrity sink hashed with,
//! so the ETag the destination reports is predictable. Every upload is
//! followed by a HEAD and compared against the staged size and ETag.

use log::{debug, info, warn};
use std::fs::File;
use std::io::Read;
use std::sync::Arc;

use crate::application::cancellation::CancellationSignal;
use crate::application::integrity::StagedArtifact;
use crate::domain::errors::{ArchiveError, Result};
use crate::ports::object_store_port::{MultipartHandle, ObjectStorePort, RemoteObject};

pub const DEFAULT_MAX_REUPLOADS: u32 = 2;

pub struct Uploader {
    store: Arc<dyn ObjectStorePort>,
    max_reuploads: u32,
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStorePort>, max_reuploads: u32) -> Self {
        Self {
            store,
            max_reuploads,
        }
    }

    pub fn head(&self, key: &str) -> Result<Option<RemoteObject>> {
        self.store.head(key)
    }

    /// Uploads `staged` to `key` and verifies what the destination reports.
    ///
    /// A mismatch triggers a fresh upload from the staged file, at most
    /// `max_reuploads` times, before failing with an integrity error.
    pub fn upload_verified(
        &self,
        staged: &StagedArtifact,
        key: &str,
        content_type: &str,
        cancel: &CancellationSignal,
    ) -> Result<RemoteObject> {
        let mut last_seen: Option<RemoteObject> = None;
        for attempt in 0..=self.max_reuploads {
            cancel.check()?;
            if attempt > 0 {
                warn!(
                    "{}: re-uploading after checksum mismatch ({}/{})",
                    key, attempt, self.max_reuploads
                );
            }
            self.upload_once(staged, key, content_type, cancel)?;

            match self.store.head(key)? {
                Some(remote) if staged.matches_remote(remote.size, remote.etag.as_deref()) => {
                    info!("{}: verified {} bytes, etag {}", key, remote.size, staged.expected_etag());
                    return Ok(remote);
                }
                other => last_seen = other,
            }
        }

        let actual = match last_seen {
            Some(r) => format!("{} bytes, etag {}", r.size, r.etag.as_deref().unwrap_or("<none>")),
            None => "missing object".to_string(),
        };
        Err(ArchiveError::IntegrityError {
            key: key.to_string(),
            expected: format!("{} bytes, etag {}", staged.size, staged.expected_etag()),
            actual,
        })
    }

    fn upload_once(
        &self,
        staged: &StagedArtifact,
        key: &str,
        content_type: &str,
        cancel: &CancellationSignal,
    ) -> Result<()> {
        // Below MULTIPART_THRESHOLD; larger artifacts stream one part at a time.
        if !staged.is_multipart() {
            let body = std::fs::read(staged.path())?;
            debug!("{}: single PUT of {} bytes", key, body.len());
            return self.store.put_object(key, body, content_type);
        }

        let handle = self.store.create_multipart(key, content_type)?;
        match self.put_parts(staged, &handle, cancel) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(abort_err) = self.store.abort_multipart(&handle) {
                    warn!("{}: failed to abort multipart upload: {}", key, abort_err);
                }
                Err(e)
            }
        }
    }

    fn put_parts(
        &self,
        staged: &StagedArtifact,
        handle: &MultipartHandle,
        cancel: &CancellationSignal,
    ) -> Result<()> {
        let mut file = File::open(staged.path())?;
        let part_size = staged.part_size as usize;
        let mut receipts = Vec::new();
        let mut index = 0usize;
        loop {
            cancel.check()?;
            let mut body = Vec::with_capacity(part_size);
            (&mut file).take(part_size as u64).read_to_end(&mut body)?;
            if body.is_empty() {
                break;
            }
            debug!("{}: part {} ({} bytes)", handle.key, index + 1, body.len());
            receipts.push(self.store.put_part(handle, index, body)?);
            index += 1;
        }
        self.store.complete_multipart(handle, receipts)
    }
}
