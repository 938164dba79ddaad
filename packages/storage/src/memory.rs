//! In-process [`StorageBackend`] with fault injection.
//!
//! Buckets live in ordered maps so listings come back in key order with
//! the same marker and delimiter semantics as an object store. Every
//! chunked-upload call and ranged read is recorded, and individual
//! operations can be made to fail, which is what the engine tests use to
//! exercise retry, abort, and drain paths.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bucket_mover_storage_models::{
    BackendKind, ByteRange, ListPage, ObjectMetadata, ObjectSummary, PartAck,
};
use tokio::sync::watch;

use crate::{DownloadedObject, ObjectBody, StorageBackend, StorageError, count_by_listing};

/// A chunked-upload call observed by a [`MemoryBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultipartCall {
    /// A session was opened.
    Initiate {
        /// Object key.
        key: String,
    },
    /// A part upload was attempted (successful or not).
    UploadPart {
        /// Object key.
        key: String,
        /// 1-based part number.
        part_number: i32,
    },
    /// A completion was attempted with these part numbers, in order.
    Complete {
        /// Object key.
        key: String,
        /// Part numbers in the order they were submitted.
        part_numbers: Vec<i32>,
    },
    /// A session was aborted.
    Abort {
        /// Object key.
        key: String,
    },
}

/// A listing request observed by a [`MemoryBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListCall {
    /// Prefix listed.
    pub prefix: String,
    /// Marker passed, if any.
    pub marker: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    metadata: ObjectMetadata,
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<i32, Vec<u8>>,
}

#[derive(Debug, Default)]
struct State {
    buckets: BTreeMap<String, BTreeMap<String, StoredObject>>,
    uploads: BTreeMap<String, PendingUpload>,
    next_upload_id: u64,

    failing_listings: u32,
    failing_heads: BTreeSet<String>,
    failing_gets: BTreeSet<String>,
    failing_puts: BTreeSet<String>,
    failing_initiates: BTreeSet<String>,
    failing_completes: BTreeSet<String>,
    failing_aborts: BTreeSet<String>,
    failing_parts: BTreeMap<(String, i32), u32>,

    list_calls: Vec<ListCall>,
    multipart_calls: Vec<MultipartCall>,
    ranged_reads: Vec<(String, ByteRange)>,
}

/// In-memory object store.
#[derive(Debug)]
pub struct MemoryBackend {
    kind: BackendKind,
    retry_delay: Duration,
    transfer_delay: Duration,
    state: Mutex<State>,
    closed: AtomicBool,
    /// `false` while counts are held.
    count_gate: watch::Sender<bool>,
}

impl MemoryBackend {
    /// Creates an empty store that lists like `kind`.
    #[must_use]
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            retry_delay: Duration::from_millis(10),
            transfer_delay: Duration::ZERO,
            state: Mutex::new(State::default()),
            closed: AtomicBool::new(false),
            count_gate: watch::Sender::new(true),
        }
    }

    /// Sets the delay between retries of failed listing pages.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Makes every `put` and `upload_part` call take at least `delay`.
    #[must_use]
    pub const fn with_transfer_delay(mut self, delay: Duration) -> Self {
        self.transfer_delay = delay;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    /// Creates `bucket` if it does not exist.
    pub fn create_bucket(&self, bucket: &str) {
        self.state().buckets.entry(bucket.to_string()).or_default();
    }

    /// Stores an object with empty metadata, creating the bucket if needed.
    pub fn insert_object(&self, bucket: &str, key: &str, data: Vec<u8>) {
        self.insert_object_with_metadata(bucket, key, data, ObjectMetadata::default());
    }

    /// Stores an object with `metadata`, creating the bucket if needed.
    pub fn insert_object_with_metadata(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        metadata: ObjectMetadata,
    ) {
        self.state()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), StoredObject { data, metadata });
    }

    /// Returns the bytes of `bucket`/`key`, if present.
    #[must_use]
    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.state()
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|o| o.data.clone())
    }

    /// Returns the metadata of `bucket`/`key`, if present.
    #[must_use]
    pub fn metadata(&self, bucket: &str, key: &str) -> Option<ObjectMetadata> {
        self.state()
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|o| o.metadata.clone())
    }

    /// Every key in `bucket`, in order.
    #[must_use]
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.state()
            .buckets
            .get(bucket)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether [`StorageBackend::shutdown`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of chunked-upload sessions opened and not yet completed or
    /// aborted.
    #[must_use]
    pub fn open_uploads(&self) -> usize {
        self.state().uploads.len()
    }

    /// Fails the next `count` listing calls.
    pub fn fail_next_listings(&self, count: u32) {
        self.state().failing_listings = count;
    }

    /// Makes [`StorageBackend::count`] wait until [`Self::release_counts`]
    /// or [`StorageBackend::shutdown`] is called.
    pub fn hold_counts(&self) {
        self.count_gate.send_replace(false);
    }

    /// Lets held and future counts run.
    pub fn release_counts(&self) {
        self.count_gate.send_replace(true);
    }

    /// Fails every metadata lookup of `key`.
    pub fn fail_head(&self, key: &str) {
        self.state().failing_heads.insert(key.to_string());
    }

    /// Fails every whole or ranged download of `key`.
    pub fn fail_get(&self, key: &str) {
        self.state().failing_gets.insert(key.to_string());
    }

    /// Fails every whole-object upload of `key`.
    pub fn fail_put(&self, key: &str) {
        self.state().failing_puts.insert(key.to_string());
    }

    /// Fails every attempt to open a chunked upload of `key`.
    pub fn fail_initiate(&self, key: &str) {
        self.state().failing_initiates.insert(key.to_string());
    }

    /// Fails the first `attempts` uploads of part `part_number` of `key`.
    pub fn fail_part(&self, key: &str, part_number: i32, attempts: u32) {
        self.state()
            .failing_parts
            .insert((key.to_string(), part_number), attempts);
    }

    /// Fails every completion of a chunked upload of `key`.
    pub fn fail_complete(&self, key: &str) {
        self.state().failing_completes.insert(key.to_string());
    }

    /// Fails every abort of a chunked upload of `key`.
    pub fn fail_abort(&self, key: &str) {
        self.state().failing_aborts.insert(key.to_string());
    }

    /// Listing calls observed so far.
    #[must_use]
    pub fn list_calls(&self) -> Vec<ListCall> {
        self.state().list_calls.clone()
    }

    /// Chunked-upload calls observed so far.
    #[must_use]
    pub fn multipart_calls(&self) -> Vec<MultipartCall> {
        self.state().multipart_calls.clone()
    }

    /// Ranged reads observed so far, as `(key, range)`.
    #[must_use]
    pub fn ranged_reads(&self) -> Vec<(String, ByteRange)> {
        self.state().ranged_reads.clone()
    }

    fn injected(key: &str, operation: &str) -> Box<dyn std::error::Error + Send + Sync> {
        format!("injected {operation} failure for {key}").into()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn listing_retry_delay(&self) -> Duration {
        self.retry_delay
    }

    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        marker: Option<&str>,
        delimiter: Option<&str>,
        max_keys: i32,
    ) -> Result<ListPage, StorageError> {
        self.ensure_open()?;
        let mut state = self.state();

        state.list_calls.push(ListCall {
            prefix: prefix.to_string(),
            marker: marker.map(String::from),
        });

        if state.failing_listings > 0 {
            state.failing_listings -= 1;
            return Err(StorageError::List {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
                source: Self::injected(prefix, "listing"),
            });
        }

        let Some(objects) = state.buckets.get(bucket) else {
            return Err(StorageError::List {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
                source: "NoSuchBucket: bucket does not exist".into(),
            });
        };

        let max_keys = usize::try_from(max_keys.max(1)).unwrap_or(1);
        let lower = marker.map_or(Bound::Unbounded, |m| Bound::Excluded(m.to_string()));
        let skip_rolled_up = marker.filter(|m| delimiter.is_some_and(|d| m.ends_with(d)));

        let mut page = ListPage::default();
        let mut entries = 0usize;
        let mut last_entry: Option<String> = None;

        for (key, object) in objects.range::<String, _>((lower, Bound::Unbounded)) {
            if !key.starts_with(prefix) {
                if key.as_str() > prefix {
                    break;
                }
                continue;
            }
            if skip_rolled_up.is_some_and(|m| key.starts_with(m)) {
                continue;
            }

            let rolled_up = delimiter.and_then(|d| {
                key[prefix.len()..]
                    .find(d)
                    .map(|idx| key[..prefix.len() + idx + d.len()].to_string())
            });

            if let Some(common) = &rolled_up
                && page.common_prefixes.last() == Some(common)
            {
                continue;
            }

            if entries == max_keys {
                page.is_truncated = true;
                page.next_marker.clone_from(&last_entry);
                break;
            }
            entries += 1;

            if let Some(common) = rolled_up {
                last_entry = Some(common.clone());
                page.common_prefixes.push(common);
            } else {
                last_entry = Some(key.clone());
                page.objects.push(ObjectSummary {
                    key: key.clone(),
                    size: object.data.len() as u64,
                });
            }
        }

        drop(state);
        Ok(page)
    }

    async fn count(&self, bucket: &str, prefix: &str) -> Result<u64, StorageError> {
        self.count_gate
            .subscribe()
            .wait_for(|open| *open)
            .await
            .map_err(|_| StorageError::Closed)?;
        count_by_listing(self, bucket, prefix).await
    }

    async fn bucket_exists(&self, bucket: &str) -> bool {
        self.ensure_open().is_ok() && self.state().buckets.contains_key(bucket)
    }

    async fn content_length(&self, bucket: &str, key: &str) -> Result<u64, StorageError> {
        self.ensure_open()?;
        let state = self.state();

        if state.failing_heads.contains(key) {
            return Err(StorageError::Head {
                bucket: bucket.to_string(),
                key: key.to_string(),
                source: Self::injected(key, "head"),
            });
        }

        state
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|o| o.data.len() as u64)
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<DownloadedObject, StorageError> {
        self.ensure_open()?;
        let state = self.state();

        if state.failing_gets.contains(key) {
            return Err(StorageError::Download {
                bucket: bucket.to_string(),
                key: key.to_string(),
                source: Self::injected(key, "download"),
            });
        }

        let object = state
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;
        drop(state);

        Ok(DownloadedObject {
            body: ObjectBody::from_vec(object.data),
            metadata: object.metadata,
        })
    }

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        range: ByteRange,
    ) -> Result<ObjectBody, StorageError> {
        self.ensure_open()?;
        let mut state = self.state();
        state.ranged_reads.push((key.to_string(), range));

        if state.failing_gets.contains(key) {
            return Err(StorageError::Download {
                bucket: bucket.to_string(),
                key: key.to_string(),
                source: Self::injected(key, "ranged download"),
            });
        }

        let data = state
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|o| &o.data)
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        let len = data.len() as u64;
        if range.start >= len {
            return Err(StorageError::Download {
                bucket: bucket.to_string(),
                key: key.to_string(),
                source: format!("InvalidRange: {} beyond length {len}", range.header_value())
                    .into(),
            });
        }

        let start = usize::try_from(range.start).unwrap_or(usize::MAX);
        let end = usize::try_from(range.end.min(len - 1)).unwrap_or(usize::MAX);
        let slice = data[start..=end].to_vec();
        drop(state);

        Ok(ObjectBody::from_vec(slice))
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: ObjectBody,
        metadata: &ObjectMetadata,
    ) -> Result<(), StorageError> {
        if !self.transfer_delay.is_zero() {
            tokio::time::sleep(self.transfer_delay).await;
        }
        self.ensure_open()?;

        let data = body.into_vec().await?;
        let mut state = self.state();

        if state.failing_puts.contains(key) {
            return Err(StorageError::Upload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                source: Self::injected(key, "upload"),
            });
        }

        let Some(objects) = state.buckets.get_mut(bucket) else {
            return Err(StorageError::Upload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                source: "NoSuchBucket: bucket does not exist".into(),
            });
        };

        objects.insert(
            key.to_string(),
            StoredObject {
                data,
                metadata: metadata.clone(),
            },
        );
        drop(state);
        Ok(())
    }

    async fn initiate_chunked_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<String, StorageError> {
        self.ensure_open()?;
        let mut state = self.state();
        state.multipart_calls.push(MultipartCall::Initiate {
            key: key.to_string(),
        });

        if state.failing_initiates.contains(key) {
            return Err(StorageError::Initiate {
                bucket: bucket.to_string(),
                key: key.to_string(),
                source: Self::injected(key, "initiate"),
            });
        }

        state.next_upload_id += 1;
        let upload_id = format!("upload-{}", state.next_upload_id);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        drop(state);
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: ObjectBody,
    ) -> Result<PartAck, StorageError> {
        if !self.transfer_delay.is_zero() {
            tokio::time::sleep(self.transfer_delay).await;
        }
        self.ensure_open()?;

        let data = body.into_vec().await?;
        let mut state = self.state();
        state.multipart_calls.push(MultipartCall::UploadPart {
            key: key.to_string(),
            part_number,
        });

        if let Some(remaining) = state
            .failing_parts
            .get_mut(&(key.to_string(), part_number))
            .filter(|r| **r > 0)
        {
            *remaining -= 1;
            return Err(StorageError::UploadPart {
                bucket: bucket.to_string(),
                key: key.to_string(),
                part_number,
                source: Self::injected(key, "part upload"),
            });
        }

        let Some(upload) = state.uploads.get_mut(upload_id) else {
            return Err(StorageError::UploadPart {
                bucket: bucket.to_string(),
                key: key.to_string(),
                part_number,
                source: format!("NoSuchUpload: {upload_id}").into(),
            });
        };
        upload.parts.insert(part_number, data);
        drop(state);

        Ok(PartAck {
            part_number,
            etag: format!("\"{upload_id}-{part_number}\""),
        })
    }

    async fn complete_chunked_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[PartAck],
    ) -> Result<(), StorageError> {
        self.ensure_open()?;
        let mut state = self.state();
        state.multipart_calls.push(MultipartCall::Complete {
            key: key.to_string(),
            part_numbers: parts.iter().map(|p| p.part_number).collect(),
        });

        let failure = |source: Box<dyn std::error::Error + Send + Sync>| StorageError::Complete {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id: upload_id.to_string(),
            source,
        };

        if state.failing_completes.contains(key) {
            return Err(failure(Self::injected(key, "complete")));
        }

        let Some(upload) = state.uploads.get(upload_id) else {
            return Err(failure(format!("NoSuchUpload: {upload_id}").into()));
        };

        let mut data = Vec::new();
        let mut previous = 0;
        for part in parts {
            if part.part_number <= previous {
                return Err(failure("InvalidPartOrder: parts must ascend".into()));
            }
            previous = part.part_number;
            let Some(bytes) = upload.parts.get(&part.part_number) else {
                return Err(failure(format!("InvalidPart: {} missing", part.part_number).into()));
            };
            data.extend_from_slice(bytes);
        }

        let target_bucket = upload.bucket.clone();
        let target_key = upload.key.clone();
        state.uploads.remove(upload_id);
        state.buckets.entry(target_bucket).or_default().insert(
            target_key,
            StoredObject {
                data,
                metadata: ObjectMetadata::default(),
            },
        );
        drop(state);
        Ok(())
    }

    async fn abort_chunked_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        self.ensure_open()?;
        let mut state = self.state();
        state.multipart_calls.push(MultipartCall::Abort {
            key: key.to_string(),
        });

        if state.failing_aborts.contains(key) {
            return Err(StorageError::Abort {
                bucket: bucket.to_string(),
                key: key.to_string(),
                upload_id: upload_id.to_string(),
                source: Self::injected(key, "abort"),
            });
        }

        state.uploads.remove(upload_id);
        drop(state);
        Ok(())
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.count_gate.send_replace(true);
    }
}
