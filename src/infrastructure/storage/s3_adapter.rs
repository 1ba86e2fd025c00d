//! S3-compatible destination built on `object_store`.
//!
//! The pipeline is synchronous; calls are driven to completion on a tokio
//! runtime handle owned by the binary.
//!
//! Multipart uploads go through `put_multipart_opts` so the content type is
//! set on both upload paths. The in-flight upload objects are kept here,
//! keyed by the id handed out in `MultipartHandle`.

use bytes::Bytes;
use log::{debug, info};
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path;
use object_store::{
    Attribute, AttributeValue, Attributes, MultipartUpload, ObjectStore, PutMultipartOpts, PutOptions,
    PutPayload,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::runtime::Handle;

use crate::config::DestinationConfig;
use crate::domain::errors::{ArchiveError, Result};
use crate::ports::object_store_port::{MultipartHandle, ObjectStorePort, PartReceipt, RemoteObject};

pub struct S3ObjectStore {
    store: AmazonS3,
    handle: Handle,
    uploads: Mutex<HashMap<String, Box<dyn MultipartUpload>>>,
    next_upload: AtomicU64,
}

impl S3ObjectStore {
    /// Builds the client from the destination settings, with the usual AWS
    /// environment variables filling anything left unset.
    pub fn new(config: &DestinationConfig, handle: Handle) -> Result<Self> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&config.bucket);

        if let Some(region) = &config.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false);
        }
        if config.allow_http {
            builder = builder.with_allow_http(true);
        }
        if let (Some(key), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            builder = builder
                .with_access_key_id(key)
                .with_secret_access_key(secret);
        }

        let store = builder
            .build()
            .map_err(|e| ArchiveError::ConfigError(format!("Invalid S3 destination: {}", e)))?;
        info!("Object storage destination: {}", config.uri());
        Ok(Self {
            store,
            handle,
            uploads: Mutex::new(HashMap::new()),
            next_upload: AtomicU64::new(1),
        })
    }

    fn uploads(&self) -> Result<MutexGuard<'_, HashMap<String, Box<dyn MultipartUpload>>>> {
        self.uploads
            .lock()
            .map_err(|_| ArchiveError::permanent_storage("multipart registry lock poisoned"))
    }

    fn take_upload(&self, handle: &MultipartHandle) -> Result<Option<Box<dyn MultipartUpload>>> {
        Ok(self.uploads()?.remove(&handle.upload_id))
    }
}

/// 401/403 and a missing bucket will not fix themselves; everything else
/// (throttling, 5xx, timeouts, resets) is worth another attempt.
pub fn classify_store_error(e: object_store::Error) -> ArchiveError {
    let message = e.to_string();
    match e {
        object_store::Error::PermissionDenied { .. }
        | object_store::Error::Unauthenticated { .. }
        | object_store::Error::NotImplemented
        | object_store::Error::UnknownConfigurationKey { .. } => {
            ArchiveError::permanent_storage(message)
        }
        _ if message.contains("NoSuchBucket") => ArchiveError::permanent_storage(message),
        _ => ArchiveError::transient_storage(message),
    }
}

fn content_type_attributes(content_type: &str) -> Attributes {
    Attributes::from_iter([(
        Attribute::ContentType,
        AttributeValue::from(content_type.to_string()),
    )])
}

fn content_type_opts(content_type: &str) -> PutOptions {
    PutOptions {
        attributes: content_type_attributes(content_type),
        ..Default::default()
    }
}

fn multipart_opts(content_type: &str) -> PutMultipartOpts {
    PutMultipartOpts {
        attributes: content_type_attributes(content_type),
        ..Default::default()
    }
}

impl ObjectStorePort for S3ObjectStore {
    fn head(&self, key: &str) -> Result<Option<RemoteObject>> {
        let path = Path::from(key);
        match self.handle.block_on(self.store.head(&path)) {
            Ok(meta) => Ok(Some(RemoteObject {
                size: meta.size,
                etag: meta.e_tag.map(|t| t.trim_matches('"').to_string()),
            })),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(classify_store_error(e)),
        }
    }

    fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        let path = Path::from(key);
        let payload = PutPayload::from(Bytes::from(body));
        self.handle
            .block_on(self.store.put_opts(&path, payload, content_type_opts(content_type)))
            .map_err(classify_store_error)?;
        Ok(())
    }

    fn create_multipart(&self, key: &str, content_type: &str) -> Result<MultipartHandle> {
        let path = Path::from(key);
        let upload = self
            .handle
            .block_on(self.store.put_multipart_opts(&path, multipart_opts(content_type)))
            .map_err(classify_store_error)?;
        let upload_id = format!("{}#{}", key, self.next_upload.fetch_add(1, Ordering::Relaxed));
        self.uploads()?.insert(upload_id.clone(), upload);
        debug!("{}: multipart upload {} ({})", key, upload_id, content_type);
        Ok(MultipartHandle {
            key: key.to_string(),
            upload_id,
        })
    }

    fn put_part(&self, handle: &MultipartHandle, part_index: usize, body: Vec<u8>) -> Result<PartReceipt> {
        let part = {
            let mut uploads = self.uploads()?;
            let upload = uploads.get_mut(&handle.upload_id).ok_or_else(|| {
                ArchiveError::permanent_storage(format!("unknown multipart upload {}", handle.upload_id))
            })?;
            upload.put_part(PutPayload::from(Bytes::from(body)))
        };
        self.handle.block_on(part).map_err(classify_store_error)?;
        Ok(PartReceipt {
            part_number: part_index,
            content_id: part_index.to_string(),
        })
    }

    fn complete_multipart(&self, handle: &MultipartHandle, parts: Vec<PartReceipt>) -> Result<()> {
        let mut upload = self.take_upload(handle)?.ok_or_else(|| {
            ArchiveError::permanent_storage(format!("unknown multipart upload {}", handle.upload_id))
        })?;
        debug!("{}: completing {} part(s)", handle.key, parts.len());
        let completed = self.handle.block_on(upload.complete());
        match completed {
            Ok(_) => Ok(()),
            Err(e) => {
                // Keep it registered so the caller can still abort.
                self.uploads()?.insert(handle.upload_id.clone(), upload);
                Err(classify_store_error(e))
            }
        }
    }

    fn abort_multipart(&self, handle: &MultipartHandle) -> Result<()> {
        match self.take_upload(handle)? {
            Some(mut upload) => self
                .handle
                .block_on(upload.abort())
                .map_err(classify_store_error),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let denied = object_store::Error::PermissionDenied {
            path: "k".into(),
            source: "403 Forbidden".into(),
        };
        assert!(!classify_store_error(denied).is_retryable());

        let generic = object_store::Error::Generic {
            store: "S3",
            source: "503 SlowDown".into(),
        };
        assert!(classify_store_error(generic).is_retryable());

        let bucket = object_store::Error::Generic {
            store: "S3",
            source: "NoSuchBucket: the specified bucket does not exist".into(),
        };
        assert!(!classify_store_error(bucket).is_retryable());
    }

    #[test]
    fn test_builds_for_custom_endpoint() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let config = DestinationConfig {
            bucket: "archive".into(),
            prefix: "pg".into(),
            region: Some("us-east-1".into()),
            endpoint: Some("http://localhost:9000".into()),
            access_key_id: Some("minio".into()),
            secret_access_key: Some("minio123".into()),
            allow_http: true,
        };
        assert!(S3ObjectStore::new(&config, rt.handle().clone()).is_ok());
    }

    #[test]
    fn test_content_type_on_both_upload_paths() {
        let expected = AttributeValue::from("application/vnd.apache.parquet");
        let single = content_type_opts("application/vnd.apache.parquet");
        assert_eq!(single.attributes.get(&Attribute::ContentType), Some(&expected));
        let multipart = multipart_opts("application/vnd.apache.parquet");
        assert_eq!(multipart.attributes.get(&Attribute::ContentType), Some(&expected));
    }

    #[test]
    fn test_unknown_multipart_handle() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let config = DestinationConfig {
            bucket: "archive".into(),
            endpoint: Some("http://localhost:9000".into()),
            region: Some("us-east-1".into()),
            access_key_id: Some("minio".into()),
            secret_access_key: Some("minio123".into()),
            allow_http: true,
            ..Default::default()
        };
        let store = S3ObjectStore::new(&config, rt.handle().clone()).unwrap();
        let handle = MultipartHandle {
            key: "a/b.parquet".into(),
            upload_id: "a/b.parquet#99".into(),
        };
        let err = store.put_part(&handle, 0, b"x".to_vec()).unwrap_err();
        assert!(!err.is_retryable());
        assert!(store.complete_multipart(&handle, vec![]).is_err());
        store.abort_multipart(&handle).unwrap();
    }
}
