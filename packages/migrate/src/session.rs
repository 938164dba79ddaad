//! An in-flight chunked upload.

use bucket_mover_storage::{StorageBackend, StorageError};
use bucket_mover_storage_models::PartAck;

/// Upload id plus the part acknowledgements collected so far, in part
/// order.
///
/// A session ends either with [`Self::complete`] or [`Self::abort`];
/// `abort` consumes the session so it cannot be issued twice.
#[derive(Debug)]
pub struct UploadSession {
    upload_id: String,
    acks: Vec<PartAck>,
}

impl UploadSession {
    /// Opens a session on `destination`.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if the session cannot be initiated.
    pub async fn initiate<D: StorageBackend + ?Sized>(
        destination: &D,
        bucket: &str,
        key: &str,
    ) -> Result<Self, StorageError> {
        let upload_id = destination.initiate_chunked_upload(bucket, key).await?;
        log::debug!("Initiated chunked upload {upload_id} for {bucket}/{key}");
        Ok(Self {
            upload_id,
            acks: Vec::new(),
        })
    }

    /// The destination-issued upload id.
    #[must_use]
    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    /// Acknowledgements collected so far.
    #[must_use]
    pub fn acks(&self) -> &[PartAck] {
        &self.acks
    }

    /// Records an uploaded part.
    pub fn push(&mut self, ack: PartAck) {
        debug_assert!(
            self.acks
                .last()
                .is_none_or(|last| last.part_number < ack.part_number),
            "parts must be acknowledged in ascending order"
        );
        self.acks.push(ack);
    }

    /// Assembles the acknowledged parts into the final object.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if completion fails. The session is
    /// still open and must then be aborted.
    pub async fn complete<D: StorageBackend + ?Sized>(
        &self,
        destination: &D,
        bucket: &str,
        key: &str,
    ) -> Result<(), StorageError> {
        destination
            .complete_chunked_upload(bucket, key, &self.upload_id, &self.acks)
            .await
    }

    /// Discards the session. An abort failure is logged, never returned.
    pub async fn abort<D: StorageBackend + ?Sized>(self, destination: &D, bucket: &str, key: &str) {
        match destination
            .abort_chunked_upload(bucket, key, &self.upload_id)
            .await
        {
            Ok(()) => log::info!("Aborted chunked upload {} for {bucket}/{key}", self.upload_id),
            Err(e) => log::error!(
                "Failed to abort chunked upload {} for {bucket}/{key}: {e}",
                self.upload_id
            ),
        }
    }
}
