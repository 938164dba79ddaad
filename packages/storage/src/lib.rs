#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Object-storage backend capability.
//!
//! Every storage provider the migration engine can read from or write to
//! implements [`StorageBackend`]. The engine never talks to an SDK
//! directly: listing, metadata lookups, whole-object and ranged
//! downloads, and the chunked (multipart) upload protocol all go through
//! this trait, so one transfer algorithm serves every pairing of source
//! and destination.
//!
//! Implementations:
//!
//! * [`object_store::ObjectStoreBackend`]: `aws-sdk-s3` client used for
//!   both S3-compatible and OSS-compatible endpoints.
//! * [`memory::MemoryBackend`]: in-process buckets with fault injection.

pub mod memory;
pub mod metadata;
pub mod object_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use bucket_mover_storage_models::{
    BackendKind, ByteRange, ConnectionConfig, ListPage, ObjectMetadata, PartAck,
};

pub use bucket_mover_storage_models as models;

/// Boxed error used as the `source` of wrapped SDK failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Number of keys requested per listing page.
pub const DEFAULT_PAGE_SIZE: i32 = 1000;

/// Delay before re-listing a page whose listing failed.
pub const LISTING_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Delimiter used for directory-style listings.
pub const DIRECTORY_DELIMITER: &str = "/";

/// Errors that can occur during backend operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested backend kind is not an object store.
    #[error("Unsupported backend kind: {kind}")]
    UnsupportedKind {
        /// The rejected kind.
        kind: BackendKind,
    },

    /// Listing a page of objects failed.
    #[error("Failed to list {bucket}/{prefix}: {source}")]
    List {
        /// Bucket name.
        bucket: String,
        /// Key prefix.
        prefix: String,
        /// Underlying SDK error.
        source: BoxError,
    },

    /// Fetching object metadata failed.
    #[error("Failed to head {bucket}/{key}: {source}")]
    Head {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Underlying SDK error.
        source: BoxError,
    },

    /// The object does not exist.
    #[error("NoSuchKey: {bucket}/{key} not found")]
    NotFound {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
    },

    /// Downloading an object (or a range of one) failed.
    #[error("Failed to download {bucket}/{key}: {source}")]
    Download {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Underlying SDK error.
        source: BoxError,
    },

    /// Uploading a whole object failed.
    #[error("Failed to upload {bucket}/{key}: {source}")]
    Upload {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Underlying SDK error.
        source: BoxError,
    },

    /// Starting a chunked upload failed.
    #[error("Failed to initiate chunked upload of {bucket}/{key}: {source}")]
    Initiate {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Underlying SDK error.
        source: BoxError,
    },

    /// The destination accepted the initiate call but returned no upload id.
    #[error("No upload id returned for {bucket}/{key}")]
    MissingUploadId {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
    },

    /// Uploading one part failed.
    #[error("Failed to upload part {part_number} of {bucket}/{key}: {source}")]
    UploadPart {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// 1-based part number.
        part_number: i32,
        /// Underlying SDK error.
        source: BoxError,
    },

    /// The destination accepted a part but returned no part identifier.
    #[error("No part identifier returned for part {part_number} of {bucket}/{key}")]
    MissingPartId {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// 1-based part number.
        part_number: i32,
    },

    /// Completing a chunked upload failed.
    #[error("Failed to complete chunked upload {upload_id} of {bucket}/{key}: {source}")]
    Complete {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Upload id of the session.
        upload_id: String,
        /// Underlying SDK error.
        source: BoxError,
    },

    /// Aborting a chunked upload failed.
    #[error("Failed to abort chunked upload {upload_id} of {bucket}/{key}: {source}")]
    Abort {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Upload id of the session.
        upload_id: String,
        /// Underlying SDK error.
        source: BoxError,
    },

    /// Reading a response body failed.
    #[error("Failed to read object body: {0}")]
    Body(BoxError),

    /// The client was shut down.
    #[error("Backend client is closed")]
    Closed,
}

/// A byte stream plus its exact length.
///
/// The length travels with the stream because chunked and whole-object
/// uploads must declare it up front.
#[derive(Debug)]
pub struct ObjectBody {
    /// The bytes.
    pub stream: ByteStream,
    /// Exact number of bytes `stream` yields.
    pub content_length: u64,
}

impl ObjectBody {
    /// Wraps an in-memory buffer.
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        let content_length = data.len() as u64;
        Self {
            stream: ByteStream::from(data),
            content_length,
        }
    }

    /// Reads the whole stream into memory.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Body`] if the stream fails mid-read.
    pub async fn into_vec(self) -> Result<Vec<u8>, StorageError> {
        let bytes = self
            .stream
            .collect()
            .await
            .map_err(|e| StorageError::Body(Box::new(e)))?;
        Ok(bytes.into_bytes().to_vec())
    }
}

/// A downloaded object: its body and the metadata to carry across.
#[derive(Debug)]
pub struct DownloadedObject {
    /// Object bytes.
    pub body: ObjectBody,
    /// Object metadata.
    pub metadata: ObjectMetadata,
}

/// Capability every storage provider implements.
///
/// Part numbers are 1-based. Byte ranges are inclusive on both ends.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// The kind of backend this is.
    fn kind(&self) -> BackendKind;

    /// Delay used between retries of a failed listing page while counting.
    fn listing_retry_delay(&self) -> Duration {
        LISTING_RETRY_DELAY
    }

    /// Lists one page of objects under `prefix`, starting after `marker`.
    ///
    /// With a `delimiter`, keys sharing a directory-like prefix below
    /// `prefix` are grouped into [`ListPage::common_prefixes`].
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] on backend failures.
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        marker: Option<&str>,
        delimiter: Option<&str>,
        max_keys: i32,
    ) -> Result<ListPage, StorageError>;

    /// Counts every object under `prefix`, excluding a key equal to the
    /// prefix itself.
    ///
    /// Listing failures are logged and the same page is retried after
    /// [`Self::listing_retry_delay`] for as long as it takes. Hierarchical
    /// backends are walked one directory level at a time.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Closed`] if the client is shut down while
    /// counting; every other failure is retried.
    async fn count(&self, bucket: &str, prefix: &str) -> Result<u64, StorageError> {
        count_by_listing(self, bucket, prefix).await
    }

    /// Whether `bucket` exists and is reachable with these credentials.
    async fn bucket_exists(&self, bucket: &str) -> bool;

    /// Size of an object in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] or [`StorageError::Head`] when
    /// metadata cannot be retrieved.
    async fn content_length(&self, bucket: &str, key: &str) -> Result<u64, StorageError>;

    /// Downloads a whole object together with its metadata.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Download`] on backend failures.
    async fn get(&self, bucket: &str, key: &str) -> Result<DownloadedObject, StorageError>;

    /// Downloads an inclusive byte range of an object.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Download`] on backend failures.
    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        range: ByteRange,
    ) -> Result<ObjectBody, StorageError>;

    /// Uploads a whole object in one call.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Upload`] on backend failures.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: ObjectBody,
        metadata: &ObjectMetadata,
    ) -> Result<(), StorageError>;

    /// Opens a chunked upload session and returns its upload id.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Initiate`] or
    /// [`StorageError::MissingUploadId`].
    async fn initiate_chunked_upload(&self, bucket: &str, key: &str)
    -> Result<String, StorageError>;

    /// Uploads one part of a chunked upload session. The part size is the
    /// body's content length.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UploadPart`] or
    /// [`StorageError::MissingPartId`].
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: ObjectBody,
    ) -> Result<PartAck, StorageError>;

    /// Assembles the uploaded parts into the final object.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Complete`] on backend failures.
    async fn complete_chunked_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[PartAck],
    ) -> Result<(), StorageError>;

    /// Discards a chunked upload session and any parts uploaded to it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Abort`] on backend failures.
    async fn abort_chunked_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError>;

    /// Closes the client. Every later call fails with
    /// [`StorageError::Closed`].
    async fn shutdown(&self);
}

/// Counts every object under `prefix` by walking `backend`'s listings.
///
/// This is the body of [`StorageBackend::count`], callable from
/// implementations that wrap it.
///
/// # Errors
///
/// Returns [`StorageError::Closed`] if the client is shut down while
/// counting.
pub async fn count_by_listing<B: StorageBackend + ?Sized>(
    backend: &B,
    bucket: &str,
    prefix: &str,
) -> Result<u64, StorageError> {
    let delimiter = backend.kind().is_hierarchical().then_some(DIRECTORY_DELIMITER);
    let mut pending = vec![prefix.to_string()];
    let mut total = 0u64;

    while let Some(dir) = pending.pop() {
        let mut marker: Option<String> = None;
        loop {
            let page = match backend
                .list_page(bucket, &dir, marker.as_deref(), delimiter, DEFAULT_PAGE_SIZE)
                .await
            {
                Ok(page) => page,
                Err(StorageError::Closed) => return Err(StorageError::Closed),
                Err(e) => {
                    log::warn!("count {bucket}/{dir}: listing failed, retrying: {e}");
                    tokio::time::sleep(backend.listing_retry_delay()).await;
                    continue;
                }
            };

            total += page.objects.iter().filter(|o| o.key != prefix).count() as u64;
            pending.extend(page.common_prefixes);

            if !page.is_truncated {
                break;
            }
            let Some(next) = page.next_marker else {
                log::warn!("count {bucket}/{dir}: truncated listing returned no marker");
                break;
            };
            marker = Some(next);
        }
    }

    Ok(total)
}

/// Builds live backend clients from connection parameters.
pub trait BackendConnector: Send + Sync {
    /// Creates a client for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnsupportedKind`] if `config.kind` is not an
    /// object store.
    fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn StorageBackend>, StorageError>;
}

/// Connector that builds `aws-sdk-s3` clients for S3-compatible and
/// OSS-compatible endpoints.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnector;

impl BackendConnector for DefaultConnector {
    fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn StorageBackend>, StorageError> {
        Ok(Arc::new(object_store::ObjectStoreBackend::connect(config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    #[tokio::test]
    async fn count_skips_the_prefix_placeholder() {
        let backend = MemoryBackend::new(BackendKind::S3);
        backend.create_bucket("b1");
        backend.insert_object("b1", "in/", Vec::new());
        backend.insert_object("b1", "in/a", vec![1; 4]);
        backend.insert_object("b1", "in/b", vec![2; 4]);
        backend.insert_object("b1", "other/c", vec![3; 4]);

        assert_eq!(backend.count("b1", "in/").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn count_walks_every_page() {
        let backend = MemoryBackend::new(BackendKind::S3);
        backend.create_bucket("b1");
        for i in 0..2_500 {
            backend.insert_object("b1", &format!("data/{i:05}"), Vec::new());
        }

        assert_eq!(backend.count("b1", "data/").await.unwrap(), 2_500);
    }

    #[tokio::test]
    async fn count_recurses_into_directories_for_hierarchical_backends() {
        let backend = MemoryBackend::new(BackendKind::Oss);
        backend.create_bucket("b1");
        backend.insert_object("b1", "in/a", vec![1]);
        backend.insert_object("b1", "in/sub/b", vec![2]);
        backend.insert_object("b1", "in/sub/deeper/c", vec![3]);

        assert_eq!(backend.count("b1", "in/").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn count_retries_failed_listings() {
        let backend = MemoryBackend::new(BackendKind::S3).with_retry_delay(Duration::from_millis(1));
        backend.create_bucket("b1");
        backend.insert_object("b1", "in/a", vec![1]);
        backend.fail_next_listings(3);

        assert_eq!(backend.count("b1", "in/").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn count_gives_up_on_a_closed_client() {
        let backend = MemoryBackend::new(BackendKind::S3);
        backend.create_bucket("b1");
        backend.shutdown().await;

        assert!(matches!(
            backend.count("b1", "").await,
            Err(StorageError::Closed)
        ));
    }

    #[tokio::test]
    async fn object_body_round_trips_bytes() {
        let body = ObjectBody::from_vec(b"hello".to_vec());
        assert_eq!(body.content_length, 5);
        assert_eq!(body.into_vec().await.unwrap(), b"hello");
    }
}
