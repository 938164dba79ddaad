//! Listing loop and per-object transfer for one source/destination pair.
//!
//! [`TransferStrategy`] is generic over both backends, so the same code
//! serves every pairing of backend kinds.
//!
//! # Paging
//!
//! For each page the strategy:
//!
//! 1. persists the marker the page is listed from,
//! 2. lists the page (retrying the same page on failure),
//! 3. dispatches every object to the job's [`WorkerPool`],
//! 4. waits for all of them to report back before listing the next page.
//!
//! Hierarchical sources are walked one directory at a time: after a
//! page's objects finish, each common prefix on that page is walked in
//! full before the next page is listed. Only root-level pages persist a
//! marker.
//!
//! # Per-object transfer
//!
//! Objects smaller than the chunk threshold are downloaded and uploaded in
//! one call each. Larger ones are copied as a chunked upload, one ranged
//! read and one part upload per part, each part retried up to the
//! configured number of attempts. A session that cannot be completed is
//! always aborted.

use std::fmt;
use std::sync::Arc;

use bucket_mover_ledger::{FailedObjectSink, FailureRecord, ProgressLedger};
use bucket_mover_migrate_models::{ErrorCode, JobConfig, JobId};
use bucket_mover_storage::metadata::translate_metadata;
use bucket_mover_storage::{DIRECTORY_DELIMITER, StorageBackend, StorageError};
use bucket_mover_storage_models::PartAck;
use futures::FutureExt as _;
use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::chunk::{ChunkPart, ChunkPlan};
use crate::classify::classify;
use crate::pool::WorkerPool;
use crate::recent::RecentFailures;
use crate::session::UploadSession;
use crate::{MigrateError, TransferError, off_runtime};

/// Buckets and prefixes of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchTarget {
    /// Bucket to read from.
    pub source_bucket: String,
    /// Bucket to write to.
    pub destination_bucket: String,
    /// Source key prefix.
    pub source_prefix: String,
    /// Destination key prefix.
    pub destination_prefix: String,
}

impl BatchTarget {
    /// Takes the buckets and prefixes from `config`.
    #[must_use]
    pub fn from_config(config: &JobConfig) -> Self {
        Self {
            source_bucket: config.source_bucket.clone(),
            destination_bucket: config.destination_bucket.clone(),
            source_prefix: config.source_prefix.clone(),
            destination_prefix: config.destination_prefix.clone(),
        }
    }

    /// Destination key for `source_key`: the source prefix is replaced by
    /// the destination prefix, keeping the relative path.
    #[must_use]
    pub fn destination_key(&self, source_key: &str) -> String {
        let relative = source_key
            .strip_prefix(&self.source_prefix)
            .unwrap_or(source_key);
        format!("{}{relative}", self.destination_prefix)
    }
}

/// How an object was copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPath {
    /// One download and one upload.
    Whole,
    /// A chunked upload with this many parts.
    Chunked {
        /// Parts uploaded.
        parts: u64,
    },
}

impl fmt::Display for TransferPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Whole => f.write_str("whole object"),
            Self::Chunked { parts } => write!(f, "{parts} parts"),
        }
    }
}

/// Result of migrating one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The object now exists at the destination.
    Migrated(TransferPath),
    /// The object failed and was recorded.
    Failed(ErrorCode),
}

/// Transfer tuning for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    /// Objects of at least this many bytes use chunked transfer.
    pub chunk_threshold: u64,
    /// Bytes per part.
    pub chunk_size: u64,
    /// Attempts per part.
    pub part_attempts: u32,
    /// Keys per listing page.
    pub page_size: i32,
}

impl TransferSettings {
    /// Takes the tuning from `config`.
    #[must_use]
    pub const fn from_config(config: &JobConfig) -> Self {
        Self {
            chunk_threshold: config.chunk_threshold,
            chunk_size: config.chunk_size,
            part_attempts: config.part_attempts,
            page_size: config.page_size,
        }
    }
}

/// Counts finished objects of one page. Dropping a slot marks its object
/// finished, so a panicking task still releases the page.
struct PageSlot(Arc<watch::Sender<usize>>);

impl Drop for PageSlot {
    fn drop(&mut self) {
        self.0.send_modify(|done| *done += 1);
    }
}

/// Migrates objects from `S` to `D` for one job.
pub struct TransferStrategy<S: StorageBackend + ?Sized, D: StorageBackend + ?Sized> {
    job_id: JobId,
    source: Arc<S>,
    destination: Arc<D>,
    settings: TransferSettings,
    ledger: Arc<dyn ProgressLedger>,
    sink: Arc<dyn FailedObjectSink>,
    recent: Arc<RecentFailures>,
}

impl<S, D> TransferStrategy<S, D>
where
    S: StorageBackend + ?Sized + 'static,
    D: StorageBackend + ?Sized + 'static,
{
    /// Creates a strategy reporting to `ledger`, `sink` and `recent`.
    #[must_use]
    pub fn new(
        job_id: JobId,
        source: Arc<S>,
        destination: Arc<D>,
        settings: TransferSettings,
        ledger: Arc<dyn ProgressLedger>,
        sink: Arc<dyn FailedObjectSink>,
        recent: Arc<RecentFailures>,
    ) -> Self {
        Self {
            job_id,
            source,
            destination,
            settings,
            ledger,
            sink,
            recent,
        }
    }

    /// The job this strategy works for.
    #[must_use]
    pub const fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Lists `target.source_prefix` from `resume_marker` and dispatches
    /// every object to `pool`, one page at a time.
    ///
    /// Listing failures are retried indefinitely.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::SourceClosed`] if the source client is shut
    /// down, or [`MigrateError::PoolClosed`] if the pool is.
    pub async fn migrate_batch(
        self: &Arc<Self>,
        pool: &WorkerPool,
        target: &BatchTarget,
        resume_marker: Option<String>,
    ) -> Result<(), MigrateError> {
        log::info!(
            "{}: migrating {}/{} -> {}/{} from marker {:?}",
            self.job_id,
            target.source_bucket,
            target.source_prefix,
            target.destination_bucket,
            target.destination_prefix,
            resume_marker
        );
        self.walk(pool, target, target.source_prefix.clone(), resume_marker, true)
            .await?;
        log::info!("{}: listing exhausted", self.job_id);
        Ok(())
    }

    fn walk<'a>(
        self: &'a Arc<Self>,
        pool: &'a WorkerPool,
        target: &'a BatchTarget,
        dir: String,
        mut marker: Option<String>,
        root: bool,
    ) -> BoxFuture<'a, Result<(), MigrateError>> {
        async move {
            let delimiter = self
                .source
                .kind()
                .is_hierarchical()
                .then_some(DIRECTORY_DELIMITER);

            loop {
                if root {
                    let ledger = Arc::clone(&self.ledger);
                    let job_id = self.job_id.clone();
                    let at = marker.clone();
                    let persisted =
                        off_runtime(move || ledger.set_marker(&job_id, at.as_deref())).await;
                    if let Err(e) = persisted {
                        log::error!("{}: failed to persist marker {marker:?}: {e}", self.job_id);
                    }
                }

                let page = match self
                    .source
                    .list_page(
                        &target.source_bucket,
                        &dir,
                        marker.as_deref(),
                        delimiter,
                        self.settings.page_size,
                    )
                    .await
                {
                    Ok(page) => page,
                    Err(StorageError::Closed) => {
                        return Err(MigrateError::SourceClosed {
                            job_id: self.job_id.clone(),
                        });
                    }
                    Err(e) => {
                        log::warn!(
                            "{}: listing {dir} from {marker:?} failed, retrying: {e}",
                            self.job_id
                        );
                        tokio::time::sleep(self.source.listing_retry_delay()).await;
                        continue;
                    }
                };

                let keys: Vec<String> = page
                    .objects
                    .into_iter()
                    .map(|o| o.key)
                    .filter(|key| *key != target.source_prefix)
                    .collect();
                log::debug!(
                    "{}: page of {} objects under {dir}",
                    self.job_id,
                    keys.len()
                );
                self.dispatch_page(pool, target, keys).await?;

                for sub in page.common_prefixes {
                    self.walk(pool, target, sub, None, false).await?;
                }

                if !page.is_truncated {
                    return Ok(());
                }
                let Some(next) = page.next_marker else {
                    log::warn!(
                        "{}: truncated listing of {dir} returned no marker, stopping",
                        self.job_id
                    );
                    return Ok(());
                };
                marker = Some(next);
            }
        }
        .boxed()
    }

    /// Dispatches `keys` to `pool` and waits until every one has finished.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::PoolClosed`] if the pool is shut down.
    pub async fn dispatch_page(
        self: &Arc<Self>,
        pool: &WorkerPool,
        target: &BatchTarget,
        keys: Vec<String>,
    ) -> Result<(), MigrateError> {
        let expected = keys.len();
        let done = Arc::new(watch::Sender::new(0usize));
        let mut finished = done.subscribe();

        let mut handed_out = 0;
        let mut refused = None;
        for key in keys {
            let strategy = Arc::clone(self);
            let slot = PageSlot(Arc::clone(&done));
            let target = target.clone();
            handed_out += 1;
            // A refused task is dropped with its slot, which still counts.
            if let Err(e) = pool
                .submit(async move {
                    let _slot = slot;
                    let destination_key = target.destination_key(&key);
                    strategy
                        .migrate(
                            &target.source_bucket,
                            &key,
                            &target.destination_bucket,
                            &destination_key,
                        )
                        .await;
                })
                .await
            {
                refused = Some(e);
                break;
            }
        }

        if finished.wait_for(|n| *n >= handed_out).await.is_err() {
            log::warn!("{}: page tracker closed early", self.job_id);
        }

        if let Some(e) = refused {
            log::error!(
                "{}: page dispatch stopped after {handed_out} of {expected} objects",
                self.job_id
            );
            return Err(e);
        }
        Ok(())
    }

    /// Dispatches an explicit key list without listing. Does not wait for
    /// the objects to finish.
    ///
    /// Earlier failure records of each key are dropped once that key has
    /// been attempted again; a key that fails again is recorded afresh.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::PoolClosed`] if the pool is shut down.
    pub async fn dispatch_keys(
        self: &Arc<Self>,
        pool: &WorkerPool,
        target: &BatchTarget,
        keys: Vec<String>,
    ) -> Result<(), MigrateError> {
        log::info!("{}: retrying {} keys", self.job_id, keys.len());
        for key in keys {
            let strategy = Arc::clone(self);
            let target = target.clone();
            pool.submit(async move {
                let destination_key = target.destination_key(&key);
                strategy
                    .migrate_and_record(
                        &target.source_bucket,
                        &key,
                        &target.destination_bucket,
                        &destination_key,
                        true,
                    )
                    .await;
            })
            .await?;
        }
        Ok(())
    }

    /// Migrates one object and records the outcome.
    ///
    /// Failures are counted, classified, and recorded; they are never
    /// retried here.
    pub async fn migrate(
        &self,
        source_bucket: &str,
        source_key: &str,
        destination_bucket: &str,
        destination_key: &str,
    ) -> Outcome {
        self.migrate_and_record(
            source_bucket,
            source_key,
            destination_bucket,
            destination_key,
            false,
        )
        .await
    }

    async fn migrate_and_record(
        &self,
        source_bucket: &str,
        source_key: &str,
        destination_bucket: &str,
        destination_key: &str,
        replace_recorded: bool,
    ) -> Outcome {
        match self
            .transfer(source_bucket, source_key, destination_bucket, destination_key)
            .await
        {
            Ok(path) => {
                log::debug!(
                    "{}: {source_key} -> {destination_bucket}/{destination_key} ({path})",
                    self.job_id
                );
                if let Err(e) = self.ledger.increment_success(&self.job_id) {
                    log::error!("{}: failed to count success: {e}", self.job_id);
                }
                if replace_recorded {
                    self.forget_recorded(source_key).await;
                }
                Outcome::Migrated(path)
            }
            Err(e) => {
                let code = classify(&e);
                log::error!("{}: failed to migrate {source_key} ({code}): {e}", self.job_id);
                if let Err(e) = self.ledger.increment_failure(&self.job_id) {
                    log::error!("{}: failed to count failure: {e}", self.job_id);
                }
                if replace_recorded {
                    self.forget_recorded(source_key).await;
                }
                let sink = Arc::clone(&self.sink);
                let job_id = self.job_id.clone();
                let key = source_key.to_string();
                if let Err(e) = off_runtime(move || sink.record(&job_id, &key, code)).await {
                    log::error!("{}: failed to record failure of {source_key}: {e}", self.job_id);
                }
                self.recent
                    .push(FailureRecord::now(&self.job_id, source_key, code));
                Outcome::Failed(code)
            }
        }
    }

    /// Drops the failure records an earlier run left for `source_key`.
    async fn forget_recorded(&self, source_key: &str) {
        let sink = Arc::clone(&self.sink);
        let job_id = self.job_id.clone();
        let key = source_key.to_string();
        if let Err(e) = off_runtime(move || sink.remove(&job_id, &key)).await {
            log::error!(
                "{}: failed to drop earlier records of {source_key}: {e}",
                self.job_id
            );
        }
    }

    async fn transfer(
        &self,
        source_bucket: &str,
        source_key: &str,
        destination_bucket: &str,
        destination_key: &str,
    ) -> Result<TransferPath, TransferError> {
        let length = self.source.content_length(source_bucket, source_key).await?;

        if length >= self.settings.chunk_threshold {
            let parts = self
                .transfer_chunked(
                    source_bucket,
                    source_key,
                    destination_bucket,
                    destination_key,
                    length,
                )
                .await?;
            Ok(TransferPath::Chunked { parts })
        } else {
            self.transfer_whole(source_bucket, source_key, destination_bucket, destination_key)
                .await?;
            Ok(TransferPath::Whole)
        }
    }

    async fn transfer_whole(
        &self,
        source_bucket: &str,
        source_key: &str,
        destination_bucket: &str,
        destination_key: &str,
    ) -> Result<(), StorageError> {
        let object = self.source.get(source_bucket, source_key).await?;
        let metadata = translate_metadata(&object.metadata, self.destination.kind());
        self.destination
            .put(destination_bucket, destination_key, object.body, &metadata)
            .await
    }

    async fn transfer_chunked(
        &self,
        source_bucket: &str,
        source_key: &str,
        destination_bucket: &str,
        destination_key: &str,
        total: u64,
    ) -> Result<u64, TransferError> {
        let plan = ChunkPlan::new(total, self.settings.chunk_size).ok_or_else(|| {
            TransferError::TooManyParts {
                key: source_key.to_string(),
                total,
                chunk_size: self.settings.chunk_size,
            }
        })?;

        log::info!(
            "{}: chunked transfer of {source_key} ({total} bytes, {} parts)",
            self.job_id,
            plan.part_count()
        );

        let mut session =
            UploadSession::initiate(&*self.destination, destination_bucket, destination_key)
                .await?;

        for part in plan.parts() {
            let uploaded = self
                .transfer_part(
                    source_bucket,
                    source_key,
                    destination_bucket,
                    destination_key,
                    session.upload_id(),
                    part,
                )
                .await;
            match uploaded {
                Ok(ack) => session.push(ack),
                Err(source) => {
                    session
                        .abort(&*self.destination, destination_bucket, destination_key)
                        .await;
                    return Err(TransferError::PartExhausted {
                        key: source_key.to_string(),
                        part_number: part.part_number,
                        attempts: self.settings.part_attempts,
                        source,
                    });
                }
            }
        }

        if let Err(source) = session
            .complete(&*self.destination, destination_bucket, destination_key)
            .await
        {
            session
                .abort(&*self.destination, destination_bucket, destination_key)
                .await;
            return Err(TransferError::Complete {
                key: source_key.to_string(),
                source,
            });
        }

        Ok(plan.part_count())
    }

    async fn transfer_part(
        &self,
        source_bucket: &str,
        source_key: &str,
        destination_bucket: &str,
        destination_key: &str,
        upload_id: &str,
        part: ChunkPart,
    ) -> Result<PartAck, StorageError> {
        let max_attempts = self.settings.part_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = async {
                let body = self
                    .source
                    .get_range(source_bucket, source_key, part.range)
                    .await?;
                self.destination
                    .upload_part(
                        destination_bucket,
                        destination_key,
                        upload_id,
                        part.part_number,
                        body,
                    )
                    .await
            }
            .await;

            match result {
                Ok(ack) => {
                    log::debug!(
                        "{}: {source_key} part {} uploaded ({})",
                        self.job_id,
                        part.part_number,
                        part.range.header_value()
                    );
                    return Ok(ack);
                }
                Err(e @ StorageError::Closed) => return Err(e),
                Err(e) if attempt < max_attempts => {
                    log::warn!(
                        "{}: {source_key} part {} attempt {attempt}/{max_attempts} failed, retrying: {e}",
                        self.job_id,
                        part.part_number
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
