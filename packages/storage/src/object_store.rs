//! `aws-sdk-s3` backed [`StorageBackend`] for S3-compatible and
//! OSS-compatible endpoints.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{Credentials, StalledStreamProtectionConfig};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bucket_mover_storage_models::{
    BackendKind, ByteRange, ConnectionConfig, ListPage, ObjectMetadata, ObjectSummary, PartAck,
};

use crate::{BoxError, DownloadedObject, ObjectBody, StorageBackend, StorageError};

/// Client for one S3-compatible or OSS-compatible endpoint.
pub struct ObjectStoreBackend {
    client: aws_sdk_s3::Client,
    kind: BackendKind,
    closed: AtomicBool,
}

impl std::fmt::Debug for ObjectStoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreBackend")
            .field("kind", &self.kind)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ObjectStoreBackend {
    /// Builds a client from connection parameters.
    ///
    /// S3 endpoints use path-style addressing; OSS endpoints use
    /// virtual-hosted addressing.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnsupportedKind`] if `config.kind` is not an
    /// object store.
    pub fn connect(config: &ConnectionConfig) -> Result<Self, StorageError> {
        if !config.kind.is_object_store() {
            return Err(StorageError::UnsupportedKind { kind: config.kind });
        }

        let creds = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "bucket-mover",
        );

        let timeouts = TimeoutConfig::builder()
            .read_timeout(config.socket_timeout)
            .build();

        let sdk_config = aws_sdk_s3::Config::builder()
            .endpoint_url(config.endpoint_url())
            .region(Region::new(config.region.clone()))
            .credentials_provider(creds)
            .force_path_style(config.kind == BackendKind::S3)
            .timeout_config(timeouts)
            .stalled_stream_protection(StalledStreamProtectionConfig::disabled())
            .build();

        log::debug!(
            "Connected {} backend at {}",
            config.kind,
            config.endpoint_url()
        );

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(sdk_config),
            kind: config.kind,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

/// Wraps an SDK error so its message carries the service error code and
/// message instead of a bare "service error".
fn sdk_error<E>(err: E) -> BoxError
where
    E: std::error::Error + Send + Sync + 'static,
{
    DisplayErrorContext(err).to_string().into()
}

fn content_length_i64(len: u64) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}

#[allow(clippy::cast_sign_loss)] // S3 sizes are non-negative
fn size_u64(size: Option<i64>) -> u64 {
    size.unwrap_or(0).max(0) as u64
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn kind(&self) -> BackendKind {
        self.kind
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

        let output = self
            .client
            .list_objects()
            .bucket(bucket)
            .prefix(prefix)
            .set_marker(marker.map(String::from))
            .set_delimiter(delimiter.map(String::from))
            .max_keys(max_keys)
            .send()
            .await
            .map_err(|e| StorageError::List {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
                source: sdk_error(e),
            })?;

        let objects: Vec<ObjectSummary> = output
            .contents()
            .iter()
            .filter_map(|obj| {
                obj.key().map(|key| ObjectSummary {
                    key: key.to_string(),
                    size: size_u64(obj.size()),
                })
            })
            .collect();

        let common_prefixes = output
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix().map(String::from))
            .collect();

        let is_truncated = output.is_truncated() == Some(true);

        // Without a delimiter most providers omit NextMarker; the last key
        // on the page is the marker in that case.
        let next_marker = output.next_marker().map(String::from).or_else(|| {
            if is_truncated {
                objects.last().map(|o| o.key.clone())
            } else {
                None
            }
        });

        Ok(ListPage {
            objects,
            common_prefixes,
            next_marker,
            is_truncated,
        })
    }

    async fn bucket_exists(&self, bucket: &str) -> bool {
        if self.ensure_open().is_err() {
            return false;
        }

        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => true,
            Err(e) => {
                log::warn!("Bucket {bucket} is not reachable: {}", DisplayErrorContext(e));
                false
            }
        }
    }

    async fn content_length(&self, bucket: &str, key: &str) -> Result<u64, StorageError> {
        self.ensure_open()?;

        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(output) => Ok(size_u64(output.content_length())),
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(HeadObjectError::is_not_found)
                {
                    return Err(StorageError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    });
                }
                Err(StorageError::Head {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    source: sdk_error(err),
                })
            }
        }
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<DownloadedObject, StorageError> {
        self.ensure_open()?;

        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::Download {
                bucket: bucket.to_string(),
                key: key.to_string(),
                source: sdk_error(e),
            })?;

        let metadata = ObjectMetadata {
            content_type: output.content_type().map(String::from),
            content_encoding: output.content_encoding().map(String::from),
            cache_control: output.cache_control().map(String::from),
            content_disposition: output.content_disposition().map(String::from),
            content_language: output.content_language().map(String::from),
            user: output
                .metadata()
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
        };
        let content_length = size_u64(output.content_length());

        Ok(DownloadedObject {
            body: ObjectBody {
                stream: output.body,
                content_length,
            },
            metadata,
        })
    }

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        range: ByteRange,
    ) -> Result<ObjectBody, StorageError> {
        self.ensure_open()?;

        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(range.header_value())
            .send()
            .await
            .map_err(|e| StorageError::Download {
                bucket: bucket.to_string(),
                key: key.to_string(),
                source: sdk_error(e),
            })?;

        Ok(ObjectBody {
            stream: output.body,
            content_length: range.len(),
        })
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: ObjectBody,
        metadata: &ObjectMetadata,
    ) -> Result<(), StorageError> {
        self.ensure_open()?;

        let user: Option<HashMap<String, String>> = if metadata.user.is_empty() {
            None
        } else {
            Some(
                metadata
                    .user
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            )
        };

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_length(content_length_i64(body.content_length))
            .body(body.stream)
            .set_content_type(metadata.content_type.clone())
            .set_content_encoding(metadata.content_encoding.clone())
            .set_cache_control(metadata.cache_control.clone())
            .set_content_disposition(metadata.content_disposition.clone())
            .set_content_language(metadata.content_language.clone())
            .set_metadata(user)
            .send()
            .await
            .map_err(|e| StorageError::Upload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                source: sdk_error(e),
            })?;

        Ok(())
    }

    async fn initiate_chunked_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<String, StorageError> {
        self.ensure_open()?;

        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::Initiate {
                bucket: bucket.to_string(),
                key: key.to_string(),
                source: sdk_error(e),
            })?;

        output
            .upload_id()
            .map(String::from)
            .ok_or_else(|| StorageError::MissingUploadId {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: ObjectBody,
    ) -> Result<PartAck, StorageError> {
        self.ensure_open()?;

        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .content_length(content_length_i64(body.content_length))
            .body(body.stream)
            .send()
            .await
            .map_err(|e| StorageError::UploadPart {
                bucket: bucket.to_string(),
                key: key.to_string(),
                part_number,
                source: sdk_error(e),
            })?;

        let etag = output.e_tag().ok_or_else(|| StorageError::MissingPartId {
            bucket: bucket.to_string(),
            key: key.to_string(),
            part_number,
        })?;

        Ok(PartAck {
            part_number,
            etag: etag.to_string(),
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

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|part| {
                        CompletedPart::builder()
                            .e_tag(&part.etag)
                            .part_number(part.part_number)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| StorageError::Complete {
                bucket: bucket.to_string(),
                key: key.to_string(),
                upload_id: upload_id.to_string(),
                source: sdk_error(e),
            })?;

        Ok(())
    }

    async fn abort_chunked_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        self.ensure_open()?;

        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| StorageError::Abort {
                bucket: bucket.to_string(),
                key: key.to_string(),
                upload_id: upload_id.to_string(),
                source: sdk_error(e),
            })?;

        Ok(())
    }

    async fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            log::debug!("{} backend client closed", self.kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use bucket_mover_storage_models::{DEFAULT_REGION, DEFAULT_SOCKET_TIMEOUT, Protocol};

    use super::*;

    fn config(kind: BackendKind) -> ConnectionConfig {
        ConnectionConfig {
            kind,
            address: "127.0.0.1:9000".to_string(),
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
            protocol: Protocol::Http,
            region: DEFAULT_REGION.to_string(),
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
        }
    }

    #[test]
    fn refuses_local_kind() {
        assert!(matches!(
            ObjectStoreBackend::connect(&config(BackendKind::Local)),
            Err(StorageError::UnsupportedKind {
                kind: BackendKind::Local
            })
        ));
    }

    #[tokio::test]
    async fn closed_client_rejects_calls_without_network() {
        let backend = ObjectStoreBackend::connect(&config(BackendKind::S3)).unwrap();
        assert_eq!(backend.kind(), BackendKind::S3);

        backend.shutdown().await;

        assert!(matches!(
            backend.content_length("b1", "k").await,
            Err(StorageError::Closed)
        ));
        assert!(matches!(
            backend.list_page("b1", "", None, None, 10).await,
            Err(StorageError::Closed)
        ));
        assert!(!backend.bucket_exists("b1").await);
    }
}
