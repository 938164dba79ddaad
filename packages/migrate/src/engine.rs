//! Job lifecycle.
//!
//! A fresh job runs two activities side by side: a counting task that
//! writes the total object count once, and the listing loop that feeds the
//! job's worker pool. A retry job skips both and dispatches an explicit key
//! list. Either way the job then drains:
//!
//! 1. wait for the pool to go idle,
//! 2. shut the pool down and wait for its workers to exit,
//! 3. wait for the counting task to write its total (fresh jobs only),
//! 4. shut down both backend clients and purge the job's registry entries.
//!
//! Only then does the job report [`JobState::Closed`].

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bucket_mover_ledger::{FailedObjectSink, FailureRecord, ProgressLedger, ProgressSnapshot};
use bucket_mover_migrate_models::{
    BucketCheck, COUNT_RETRY_DELAY, JobConfig, JobId, JobMode, JobRequest, JobState,
    RECENT_FAILURE_CAP,
};
use bucket_mover_storage::{BackendConnector, StorageBackend, StorageError};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::pool::{PoolStats, WorkerPool};
use crate::{MigrateError, off_runtime};
use crate::recent::RecentFailures;
use crate::strategy::{BatchTarget, TransferSettings, TransferStrategy};

type DynStrategy = TransferStrategy<dyn StorageBackend, dyn StorageBackend>;

/// Final counters of a drained job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    /// Job id.
    pub job_id: JobId,
    /// Counters after the drain.
    pub progress: ProgressSnapshot,
    /// Time from start to close.
    pub elapsed: Duration,
}

impl fmt::Display for JobReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} migrated, {} failed",
            self.job_id, self.progress.success, self.progress.failure
        )?;
        if let Some(total) = self.progress.total {
            write!(f, " of {total}")?;
        }
        write!(f, " in {:.1?}", self.elapsed)
    }
}

/// Handle to a running job.
#[derive(Debug)]
pub struct JobHandle {
    job_id: JobId,
    state: watch::Receiver<JobState>,
    driver: JoinHandle<Result<JobReport, MigrateError>>,
}

impl JobHandle {
    /// The job's id.
    #[must_use]
    pub const fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state.clone()
    }

    /// Waits for the job to drain and close.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::Join`] if the job's task panicked, or
    /// [`MigrateError::Ledger`] if the final counters cannot be read.
    pub async fn finished(self) -> Result<JobReport, MigrateError> {
        self.driver.await?
    }
}

/// Per-job registry entry.
struct ActiveJob {
    pool: Arc<WorkerPool>,
    recent: Arc<RecentFailures>,
    state: Arc<watch::Sender<JobState>>,
}

/// Everything a driver task needs to drain a job.
struct Drain {
    job_id: JobId,
    pool: Arc<WorkerPool>,
    source: Arc<dyn StorageBackend>,
    destination: Arc<dyn StorageBackend>,
    total: Option<watch::Receiver<Option<u64>>>,
    state: Arc<watch::Sender<JobState>>,
    started: Instant,
}

/// Runs migration jobs.
///
/// Cloning is cheap; clones share the job and client registries.
#[derive(Clone)]
pub struct JobEngine {
    ledger: Arc<dyn ProgressLedger>,
    sink: Arc<dyn FailedObjectSink>,
    jobs: Arc<DashMap<JobId, ActiveJob>>,
    clients: Arc<DashMap<JobId, Arc<dyn StorageBackend>>>,
}

impl fmt::Debug for JobEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobEngine")
            .field("active_jobs", &self.jobs.len())
            .finish_non_exhaustive()
    }
}

impl JobEngine {
    /// Creates an engine reporting to `ledger` and `sink`.
    #[must_use]
    pub fn new(ledger: Arc<dyn ProgressLedger>, sink: Arc<dyn FailedObjectSink>) -> Self {
        Self {
            ledger,
            sink,
            jobs: Arc::new(DashMap::new()),
            clients: Arc::new(DashMap::new()),
        }
    }

    /// The progress ledger jobs report to.
    #[must_use]
    pub fn ledger(&self) -> &Arc<dyn ProgressLedger> {
        &self.ledger
    }

    /// The failure sink jobs report to.
    #[must_use]
    pub fn sink(&self) -> &Arc<dyn FailedObjectSink> {
        &self.sink
    }

    /// Validates `request`, connects both backends, checks that both
    /// buckets exist, and starts the job.
    ///
    /// Nothing is connected if the parameters are malformed or the backend
    /// pair is unsupported. Both clients are shut down again if the job
    /// cannot start.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::InvalidParams`],
    /// [`MigrateError::UnsupportedPair`], [`MigrateError::JobAlreadyActive`],
    /// [`MigrateError::Storage`] if a client cannot be built, or
    /// [`MigrateError::BucketCheck`] if a bucket is missing.
    pub async fn submit(
        &self,
        request: &JobRequest,
        connector: &dyn BackendConnector,
    ) -> Result<JobHandle, MigrateError> {
        let config = validate(request)?;
        let (source, destination) = self.connect_checked(&config, connector).await?;
        let started = self
            .start(config, Arc::clone(&source), Arc::clone(&destination))
            .await;
        close_on_error(started, &source, &destination).await
    }

    /// Like [`Self::submit`], but re-migrates the keys recorded as failed
    /// for the request's job instead of listing the source.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Self::submit`], or [`MigrateError::Ledger`]
    /// if the recorded failures cannot be read.
    pub async fn submit_failure_retry(
        &self,
        request: &JobRequest,
        connector: &dyn BackendConnector,
    ) -> Result<JobHandle, MigrateError> {
        let config = validate(request)?;
        let (source, destination) = self.connect_checked(&config, connector).await?;
        let started = self
            .retry_recorded_failures(config, Arc::clone(&source), Arc::clone(&destination))
            .await;
        close_on_error(started, &source, &destination).await
    }

    /// Connects both sides of `config` and checks that both buckets exist.
    async fn connect_checked(
        &self,
        config: &JobConfig,
        connector: &dyn BackendConnector,
    ) -> Result<(Arc<dyn StorageBackend>, Arc<dyn StorageBackend>), MigrateError> {
        check_pair(config)?;
        self.ensure_inactive(&config.job_id)?;

        let source = connector.connect(&config.source)?;
        let destination = match connector.connect(&config.destination) {
            Ok(destination) => destination,
            Err(e) => {
                source.shutdown().await;
                return Err(e.into());
            }
        };

        let (source_exists, destination_exists) = tokio::join!(
            source.bucket_exists(&config.source_bucket),
            destination.bucket_exists(&config.destination_bucket),
        );
        if let Some(check) = BucketCheck::from_presence(source_exists, destination_exists) {
            log::error!("{}: {check} ({})", config.job_id, check.code());
            source.shutdown().await;
            destination.shutdown().await;
            return Err(MigrateError::BucketCheck {
                check,
                code: check.code(),
            });
        }

        Ok((source, destination))
    }

    /// Starts a job on already-connected backends.
    ///
    /// A fresh job returns once the object count has been written (or the
    /// source has been closed); the transfer keeps running in the
    /// background. A retry job returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::UnsupportedPair`] or
    /// [`MigrateError::JobAlreadyActive`].
    pub async fn start(
        &self,
        config: JobConfig,
        source: Arc<dyn StorageBackend>,
        destination: Arc<dyn StorageBackend>,
    ) -> Result<JobHandle, MigrateError> {
        check_pair(&config)?;

        let job_id = config.job_id.clone();
        let pool = Arc::new(WorkerPool::new(
            job_id.to_string(),
            config.workers,
            config.queue_capacity,
        ));
        let recent = Arc::new(RecentFailures::new(RECENT_FAILURE_CAP));
        let state = Arc::new(watch::Sender::new(JobState::Idle));
        let state_rx = state.subscribe();

        let registered = match self.jobs.entry(job_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(ActiveJob {
                    pool: Arc::clone(&pool),
                    recent: Arc::clone(&recent),
                    state: Arc::clone(&state),
                });
                true
            }
        };
        if !registered {
            pool.shutdown().await;
            return Err(MigrateError::JobAlreadyActive { job_id });
        }
        self.clients.insert(job_id.clone(), Arc::clone(&destination));

        let strategy: Arc<DynStrategy> = Arc::new(TransferStrategy::new(
            job_id.clone(),
            Arc::clone(&source),
            Arc::clone(&destination),
            TransferSettings::from_config(&config),
            Arc::clone(&self.ledger),
            Arc::clone(&self.sink),
            recent,
        ));
        let target = BatchTarget::from_config(&config);
        let started = Instant::now();

        let driver = match config.mode {
            JobMode::Fresh { resume_marker } => {
                state.send_replace(JobState::CountingAndTransferring);
                log::info!("{job_id}: started (counting and transferring)");

                let (total_tx, mut total_rx) = watch::channel(None);
                tokio::spawn(count_objects(
                    job_id.clone(),
                    Arc::clone(&source),
                    target.clone(),
                    Arc::clone(&self.ledger),
                    total_tx,
                ));

                let drain = Drain {
                    job_id: job_id.clone(),
                    pool,
                    source,
                    destination,
                    total: Some(total_rx.clone()),
                    state,
                    started,
                };
                let engine = self.clone();
                let driver = tokio::spawn(async move {
                    if let Err(e) = strategy
                        .migrate_batch(&drain.pool, &target, resume_marker)
                        .await
                    {
                        log::error!("{}: listing stopped: {e}", drain.job_id);
                    }
                    engine.drain(drain).await
                });

                match total_rx.wait_for(Option::is_some).await {
                    Ok(total) => log::info!("{job_id}: {} objects to migrate", total.unwrap_or(0)),
                    Err(_) => log::warn!("{job_id}: counting ended without a total"),
                }
                driver
            }
            JobMode::Retry { keys } => {
                state.send_replace(JobState::RetryingSelectedKeys);
                log::info!("{job_id}: started (retrying {} keys)", keys.len());

                let drain = Drain {
                    job_id: job_id.clone(),
                    pool,
                    source,
                    destination,
                    total: None,
                    state,
                    started,
                };
                let engine = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = strategy.dispatch_keys(&drain.pool, &target, keys).await {
                        log::error!("{}: retry dispatch stopped: {e}", drain.job_id);
                    }
                    engine.drain(drain).await
                })
            }
        };

        Ok(JobHandle {
            job_id,
            state: state_rx,
            driver,
        })
    }

    /// Re-migrates every key recorded as failed for `config.job_id`.
    ///
    /// Records are left in place until their key has been attempted again,
    /// so a refused or interrupted retry loses none of them. Keys that fail
    /// again are recorded again.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::UnsupportedPair`],
    /// [`MigrateError::JobAlreadyActive`], [`MigrateError::Ledger`] if the
    /// failure sink cannot be read, or any error from [`Self::start`].
    pub async fn retry_recorded_failures(
        &self,
        mut config: JobConfig,
        source: Arc<dyn StorageBackend>,
        destination: Arc<dyn StorageBackend>,
    ) -> Result<JobHandle, MigrateError> {
        check_pair(&config)?;
        self.ensure_inactive(&config.job_id)?;

        let sink = Arc::clone(&self.sink);
        let job_id = config.job_id.clone();
        let records = off_runtime(move || sink.list(&job_id)).await?;

        let mut seen = BTreeSet::new();
        let keys: Vec<String> = records
            .into_iter()
            .map(|record| record.key)
            .filter(|key| seen.insert(key.clone()))
            .collect();

        config.mode = JobMode::Retry { keys };
        self.start(config, source, destination).await
    }

    /// Shuts down the destination client of a running job. Transfers that
    /// reach it afterwards fail as `CLIENT_CLOSED`.
    ///
    /// Returns `false` if no such job is running.
    pub async fn close_destination(&self, job_id: &JobId) -> bool {
        let Some(client) = self.clients.get(job_id).map(|c| Arc::clone(c.value())) else {
            return false;
        };
        log::warn!("{job_id}: destination client closed by operator");
        client.shutdown().await;
        true
    }

    /// State of a running job, or `None` once it has closed.
    #[must_use]
    pub fn state(&self, job_id: &JobId) -> Option<JobState> {
        self.jobs.get(job_id).map(|job| *job.state.borrow())
    }

    /// Most recent failures of a running job, oldest first.
    #[must_use]
    pub fn recent_failures(&self, job_id: &JobId) -> Vec<FailureRecord> {
        self.jobs
            .get(job_id)
            .map(|job| job.recent.snapshot())
            .unwrap_or_default()
    }

    /// Worker pool counters of a running job.
    #[must_use]
    pub fn pool_stats(&self, job_id: &JobId) -> Option<PoolStats> {
        self.jobs.get(job_id).map(|job| job.pool.stats())
    }

    /// Ids of running jobs.
    #[must_use]
    pub fn active_jobs(&self) -> Vec<JobId> {
        self.jobs.iter().map(|job| job.key().clone()).collect()
    }

    fn ensure_inactive(&self, job_id: &JobId) -> Result<(), MigrateError> {
        if self.jobs.contains_key(job_id) {
            return Err(MigrateError::JobAlreadyActive {
                job_id: job_id.clone(),
            });
        }
        Ok(())
    }

    async fn drain(self, drain: Drain) -> Result<JobReport, MigrateError> {
        let Drain {
            job_id,
            pool,
            source,
            destination,
            total,
            state,
            started,
        } = drain;

        state.send_replace(JobState::Draining);
        log::info!("{job_id}: draining");

        pool.drain().await;
        log::info!("{job_id}: pool idle after {} tasks", pool.completed());
        pool.shutdown().await;

        if let Some(mut total) = total
            && total.wait_for(Option::is_some).await.is_err()
        {
            log::warn!("{job_id}: closing without a total count");
        }

        source.shutdown().await;
        destination.shutdown().await;

        let ledger = Arc::clone(&self.ledger);
        if let Err(e) = off_runtime(move || ledger.flush()).await {
            log::error!("{job_id}: failed to flush progress: {e}");
        }

        self.clients.remove(&job_id);
        self.jobs.remove(&job_id);
        state.send_replace(JobState::Closed);

        let report = JobReport {
            progress: self.ledger.get(&job_id)?,
            job_id,
            elapsed: started.elapsed(),
        };
        log::info!("{report}");
        Ok(report)
    }
}

fn validate(request: &JobRequest) -> Result<JobConfig, MigrateError> {
    request.validate().map_err(|e| {
        log::error!("{}: rejected job: {e}", request.job_id);
        MigrateError::InvalidParams(e)
    })
}

/// Shuts both clients down if the job did not start.
async fn close_on_error(
    started: Result<JobHandle, MigrateError>,
    source: &Arc<dyn StorageBackend>,
    destination: &Arc<dyn StorageBackend>,
) -> Result<JobHandle, MigrateError> {
    if started.is_err() {
        source.shutdown().await;
        destination.shutdown().await;
    }
    started
}

fn check_pair(config: &JobConfig) -> Result<(), MigrateError> {
    if config.source.kind.is_object_store() && config.destination.kind.is_object_store() {
        return Ok(());
    }
    log::error!(
        "{}: unsupported backend pair {} -> {}",
        config.job_id,
        config.source.kind,
        config.destination.kind
    );
    Err(MigrateError::UnsupportedPair {
        source_kind: config.source.kind,
        destination_kind: config.destination.kind,
    })
}

/// Counts the source objects and writes the total once. Gives up only
/// when the source client is closed.
async fn count_objects(
    job_id: JobId,
    source: Arc<dyn StorageBackend>,
    target: BatchTarget,
    ledger: Arc<dyn ProgressLedger>,
    total: watch::Sender<Option<u64>>,
) {
    loop {
        match source
            .count(&target.source_bucket, &target.source_prefix)
            .await
        {
            Ok(count) => {
                let ledger = Arc::clone(&ledger);
                let id = job_id.clone();
                if let Err(e) = off_runtime(move || ledger.set_total(&id, count)).await {
                    log::error!("{job_id}: failed to record total {count}: {e}");
                }
                total.send_replace(Some(count));
                return;
            }
            Err(StorageError::Closed) => {
                log::warn!("{job_id}: source closed before counting finished");
                return;
            }
            Err(e) => {
                log::warn!("{job_id}: counting failed, retrying: {e}");
                tokio::time::sleep(COUNT_RETRY_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bucket_mover_ledger::LedgerError;
    use bucket_mover_ledger::memory::{MemoryFailureSink, MemoryLedger};
    use bucket_mover_migrate_models::{EndpointRequest, ErrorCode};
    use bucket_mover_storage::memory::MemoryBackend;
    use bucket_mover_storage::{DownloadedObject, ObjectBody};
    use bucket_mover_storage_models::{
        BackendKind, ByteRange, ConnectionConfig, DEFAULT_REGION, DEFAULT_SOCKET_TIMEOUT,
        ListPage, ObjectMetadata, PartAck, Protocol,
    };

    use super::*;

    const KIB: u64 = 1024;

    fn job() -> JobId {
        JobId::from("job")
    }

    fn endpoint(kind: BackendKind, address: &str) -> ConnectionConfig {
        ConnectionConfig {
            kind,
            address: address.to_string(),
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
            protocol: Protocol::default(),
            region: DEFAULT_REGION.to_string(),
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
        }
    }

    fn config(mode: JobMode) -> JobConfig {
        JobConfig {
            job_id: job(),
            source: endpoint(BackendKind::S3, "src"),
            destination: endpoint(BackendKind::Oss, "dst"),
            source_bucket: "b1".to_string(),
            destination_bucket: "b2".to_string(),
            source_prefix: "in/".to_string(),
            destination_prefix: "out/".to_string(),
            workers: 4,
            chunk_threshold: 64 * KIB,
            chunk_size: 16 * KIB,
            part_attempts: 5,
            page_size: 1000,
            queue_capacity: 16,
            mode,
        }
    }

    fn fresh() -> JobConfig {
        config(JobMode::Fresh {
            resume_marker: None,
        })
    }

    fn request() -> JobRequest {
        let side = |kind: &str, address: &str| EndpointRequest {
            kind: kind.to_string(),
            address: address.to_string(),
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
            ..EndpointRequest::default()
        };
        JobRequest {
            job_id: "job".to_string(),
            source: side("s3", "src"),
            destination: side("oss", "dst"),
            source_bucket: "b1".to_string(),
            destination_bucket: "b2".to_string(),
            source_prefix: "in/".to_string(),
            destination_prefix: "out/".to_string(),
            workers: Some("2".to_string()),
            ..JobRequest::default()
        }
    }

    fn source() -> Arc<MemoryBackend> {
        let backend = MemoryBackend::new(BackendKind::S3);
        backend.create_bucket("b1");
        backend.insert_object("b1", "in/", Vec::new());
        backend.insert_object("b1", "in/a", b"alpha".to_vec());
        backend.insert_object("b1", "in/b", b"bravo".to_vec());
        backend.insert_object("b1", "other/x", b"x".to_vec());
        Arc::new(backend)
    }

    fn destination() -> Arc<MemoryBackend> {
        let backend = MemoryBackend::new(BackendKind::Oss);
        backend.create_bucket("b2");
        Arc::new(backend)
    }

    struct Fixture {
        engine: JobEngine,
        ledger: Arc<MemoryLedger>,
        sink: Arc<MemoryFailureSink>,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(MemoryLedger::new());
        let sink = Arc::new(MemoryFailureSink::new());
        Fixture {
            engine: JobEngine::new(ledger.clone(), sink.clone()),
            ledger,
            sink,
        }
    }

    struct TestConnector {
        backends: BTreeMap<String, Arc<MemoryBackend>>,
        connects: AtomicUsize,
    }

    impl TestConnector {
        fn new(source: &Arc<MemoryBackend>, destination: &Arc<MemoryBackend>) -> Self {
            let mut backends = BTreeMap::new();
            backends.insert("src".to_string(), Arc::clone(source));
            backends.insert("dst".to_string(), Arc::clone(destination));
            Self {
                backends,
                connects: AtomicUsize::new(0),
            }
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    impl BackendConnector for TestConnector {
        fn connect(
            &self,
            config: &ConnectionConfig,
        ) -> Result<Arc<dyn StorageBackend>, StorageError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.backends
                .get(&config.address)
                .map(|b| Arc::clone(b) as Arc<dyn StorageBackend>)
                .ok_or(StorageError::UnsupportedKind { kind: config.kind })
        }
    }

    /// Connector that lets a second job claim the id while the destination
    /// is being connected.
    struct RivalConnector {
        inner: TestConnector,
        engine: JobEngine,
    }

    impl BackendConnector for RivalConnector {
        fn connect(
            &self,
            config: &ConnectionConfig,
        ) -> Result<Arc<dyn StorageBackend>, StorageError> {
            if config.address == "dst" {
                self.engine.jobs.insert(
                    job(),
                    ActiveJob {
                        pool: Arc::new(WorkerPool::new("rival", 1, 1)),
                        recent: Arc::new(RecentFailures::new(1)),
                        state: Arc::new(watch::Sender::new(JobState::CountingAndTransferring)),
                    },
                );
            }
            self.inner.connect(config)
        }
    }

    /// Destination that notes the job's pool counters when it is shut
    /// down.
    struct ShutdownWitness {
        inner: Arc<MemoryBackend>,
        engine: JobEngine,
        seen: Mutex<Vec<Option<PoolStats>>>,
    }

    impl ShutdownWitness {
        fn new(inner: Arc<MemoryBackend>, engine: JobEngine) -> Self {
            Self {
                inner,
                engine,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn seen(&self) -> Vec<Option<PoolStats>> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StorageBackend for ShutdownWitness {
        fn kind(&self) -> BackendKind {
            self.inner.kind()
        }

        async fn list_page(
            &self,
            bucket: &str,
            prefix: &str,
            marker: Option<&str>,
            delimiter: Option<&str>,
            max_keys: i32,
        ) -> Result<ListPage, StorageError> {
            self.inner
                .list_page(bucket, prefix, marker, delimiter, max_keys)
                .await
        }

        async fn bucket_exists(&self, bucket: &str) -> bool {
            self.inner.bucket_exists(bucket).await
        }

        async fn content_length(&self, bucket: &str, key: &str) -> Result<u64, StorageError> {
            self.inner.content_length(bucket, key).await
        }

        async fn get(&self, bucket: &str, key: &str) -> Result<DownloadedObject, StorageError> {
            self.inner.get(bucket, key).await
        }

        async fn get_range(
            &self,
            bucket: &str,
            key: &str,
            range: ByteRange,
        ) -> Result<ObjectBody, StorageError> {
            self.inner.get_range(bucket, key, range).await
        }

        async fn put(
            &self,
            bucket: &str,
            key: &str,
            body: ObjectBody,
            metadata: &ObjectMetadata,
        ) -> Result<(), StorageError> {
            self.inner.put(bucket, key, body, metadata).await
        }

        async fn initiate_chunked_upload(
            &self,
            bucket: &str,
            key: &str,
        ) -> Result<String, StorageError> {
            self.inner.initiate_chunked_upload(bucket, key).await
        }

        async fn upload_part(
            &self,
            bucket: &str,
            key: &str,
            upload_id: &str,
            part_number: i32,
            body: ObjectBody,
        ) -> Result<PartAck, StorageError> {
            self.inner
                .upload_part(bucket, key, upload_id, part_number, body)
                .await
        }

        async fn complete_chunked_upload(
            &self,
            bucket: &str,
            key: &str,
            upload_id: &str,
            parts: &[PartAck],
        ) -> Result<(), StorageError> {
            self.inner
                .complete_chunked_upload(bucket, key, upload_id, parts)
                .await
        }

        async fn abort_chunked_upload(
            &self,
            bucket: &str,
            key: &str,
            upload_id: &str,
        ) -> Result<(), StorageError> {
            self.inner.abort_chunked_upload(bucket, key, upload_id).await
        }

        async fn shutdown(&self) {
            let stats = self.engine.pool_stats(&job());
            self.seen.lock().unwrap().push(stats);
            self.inner.shutdown().await;
        }
    }

    async fn wait_for_state(engine: &JobEngine, state: JobState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.state(&job()) != Some(state) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    /// Ledger that remembers when the total was written and when it was
    /// flushed.
    #[derive(Default)]
    struct RecordingLedger {
        inner: MemoryLedger,
        events: Mutex<Vec<&'static str>>,
    }

    impl RecordingLedger {
        fn events(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ProgressLedger for RecordingLedger {
        fn increment_success(&self, job: &JobId) -> Result<(), LedgerError> {
            self.inner.increment_success(job)
        }

        fn increment_failure(&self, job: &JobId) -> Result<(), LedgerError> {
            self.inner.increment_failure(job)
        }

        fn set_total(&self, job: &JobId, total: u64) -> Result<(), LedgerError> {
            self.events.lock().unwrap().push("total");
            self.inner.set_total(job, total)
        }

        fn set_marker(&self, job: &JobId, marker: Option<&str>) -> Result<(), LedgerError> {
            self.inner.set_marker(job, marker)
        }

        fn get(&self, job: &JobId) -> Result<ProgressSnapshot, LedgerError> {
            self.inner.get(job)
        }

        fn flush(&self) -> Result<(), LedgerError> {
            self.events.lock().unwrap().push("flush");
            Ok(())
        }
    }

    #[tokio::test]
    async fn fresh_job_migrates_drains_and_closes() {
        let fx = fixture();
        let (src, dst) = (source(), destination());

        let handle = fx
            .engine
            .start(fresh(), src.clone(), dst.clone())
            .await
            .unwrap();
        assert_eq!(fx.ledger.get(&job()).unwrap().total, Some(2));
        let state = handle.subscribe();

        let report = handle.finished().await.unwrap();
        assert_eq!(report.progress.success, 2);
        assert_eq!(report.progress.failure, 0);
        assert_eq!(report.progress.total, Some(2));

        assert_eq!(dst.keys("b2"), ["out/a", "out/b"]);
        assert_eq!(dst.object("b2", "out/b").unwrap(), b"bravo");
        assert!(src.is_closed());
        assert!(dst.is_closed());
        assert_eq!(*state.borrow(), JobState::Closed);
        assert_eq!(fx.engine.state(&job()), None);
        assert!(fx.engine.active_jobs().is_empty());
        assert!(fx.sink.list(&job()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn total_is_written_before_the_ledger_is_flushed() {
        let ledger = Arc::new(RecordingLedger::default());
        let engine = JobEngine::new(ledger.clone(), Arc::new(MemoryFailureSink::new()));

        let handle = engine.start(fresh(), source(), destination()).await.unwrap();
        handle.finished().await.unwrap();

        assert_eq!(ledger.events(), ["total", "flush"]);
    }

    #[tokio::test]
    async fn duplicate_job_id_is_refused_while_running() {
        let fx = fixture();
        let dst = Arc::new(
            MemoryBackend::new(BackendKind::Oss).with_transfer_delay(Duration::from_millis(200)),
        );
        dst.create_bucket("b2");

        let handle = fx.engine.start(fresh(), source(), dst).await.unwrap();
        assert_eq!(
            fx.engine.state(&job()),
            Some(JobState::CountingAndTransferring)
        );
        assert_eq!(fx.engine.active_jobs(), [job()]);
        assert_eq!(
            fx.engine.pool_stats(&job()).map(|stats| stats.terminated),
            Some(false)
        );

        let err = fx
            .engine
            .start(fresh(), source(), destination())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::JobAlreadyActive { .. }));

        let report = handle.finished().await.unwrap();
        assert_eq!(report.progress.success, 2);
        assert_eq!(fx.engine.pool_stats(&job()), None);
    }

    #[tokio::test]
    async fn drain_waits_for_a_slow_count_before_closing_clients() {
        let fx = fixture();
        let (src, dst) = (source(), destination());
        src.hold_counts();

        let starting = tokio::spawn({
            let engine = fx.engine.clone();
            let (src, dst) = (Arc::clone(&src), Arc::clone(&dst));
            async move { engine.start(fresh(), src, dst).await }
        });

        wait_for_state(&fx.engine, JobState::Draining).await;
        assert_eq!(dst.keys("b2"), ["out/a", "out/b"]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(fx.engine.state(&job()), Some(JobState::Draining));
        assert_eq!(
            fx.engine.pool_stats(&job()).map(|stats| stats.terminated),
            Some(true)
        );
        assert!(!src.is_closed());
        assert!(!dst.is_closed());
        assert_eq!(fx.ledger.get(&job()).unwrap().total, None);

        src.release_counts();
        let handle = starting.await.unwrap().unwrap();
        let report = handle.finished().await.unwrap();

        assert_eq!(report.progress.total, Some(2));
        assert!(src.is_closed());
        assert!(dst.is_closed());
        assert_eq!(fx.engine.state(&job()), None);
    }

    #[tokio::test]
    async fn pool_terminates_before_clients_shut_down() {
        let fx = fixture();
        let dst = Arc::new(ShutdownWitness::new(destination(), fx.engine.clone()));

        let handle = fx
            .engine
            .start(fresh(), source(), dst.clone())
            .await
            .unwrap();
        handle.finished().await.unwrap();

        assert_eq!(
            dst.seen(),
            [Some(PoolStats {
                submitted: 2,
                completed: 2,
                active: 0,
                terminated: true,
            })]
        );
        assert!(dst.inner.is_closed());
    }

    #[tokio::test]
    async fn rerunning_a_key_list_overwrites_and_counts_again() {
        let ledger = Arc::new(MemoryLedger::with_snapshot(
            &job(),
            ProgressSnapshot {
                success: 2,
                failure: 0,
                total: Some(2),
                marker: None,
            },
        ));
        let engine = JobEngine::new(ledger, Arc::new(MemoryFailureSink::new()));
        let keys = vec!["in/a".to_string(), "in/b".to_string()];
        let mut existing = vec![
            ("out/a", b"stale".to_vec()),
            ("out/b", b"stale".to_vec()),
        ];

        for run in 1..=2u64 {
            let dst = destination();
            for (key, data) in &existing {
                dst.insert_object("b2", key, data.clone());
            }

            let handle = engine
                .start(
                    config(JobMode::Retry { keys: keys.clone() }),
                    source(),
                    dst.clone(),
                )
                .await
                .unwrap();
            let report = handle.finished().await.unwrap();

            assert_eq!(report.progress.success, 2 + 2 * run);
            assert_eq!(report.progress.failure, 0);
            assert_eq!(report.progress.total, Some(2));
            assert_eq!(dst.keys("b2"), ["out/a", "out/b"]);
            assert_eq!(dst.object("b2", "out/a").unwrap(), b"alpha");
            assert_eq!(dst.object("b2", "out/b").unwrap(), b"bravo");

            existing = vec![
                ("out/a", dst.object("b2", "out/a").unwrap()),
                ("out/b", dst.object("b2", "out/b").unwrap()),
            ];
        }
    }

    #[tokio::test]
    async fn retry_mode_migrates_only_the_listed_keys() {
        let fx = fixture();
        let dst = destination();

        let handle = fx
            .engine
            .start(
                config(JobMode::Retry {
                    keys: vec!["in/b".to_string()],
                }),
                source(),
                dst.clone(),
            )
            .await
            .unwrap();
        assert_eq!(handle.state(), JobState::RetryingSelectedKeys);

        let report = handle.finished().await.unwrap();
        assert_eq!(report.progress.success, 1);
        assert_eq!(report.progress.total, None);
        assert_eq!(dst.keys("b2"), ["out/b"]);
    }

    #[tokio::test]
    async fn recorded_failures_are_retried_and_cleared() {
        let fx = fixture();
        for key in ["in/a", "in/a", "in/b"] {
            fx.sink.record(&job(), key, ErrorCode::Network).unwrap();
        }
        let dst = destination();

        let handle = fx
            .engine
            .retry_recorded_failures(fresh(), source(), dst.clone())
            .await
            .unwrap();
        let report = handle.finished().await.unwrap();

        assert_eq!(report.progress.success, 2);
        assert_eq!(dst.keys("b2"), ["out/a", "out/b"]);
        assert!(fx.sink.list(&job()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn keys_that_fail_again_replace_their_records() {
        let fx = fixture();
        for key in ["in/a", "in/b", "in/b"] {
            fx.sink.record(&job(), key, ErrorCode::Network).unwrap();
        }
        let src = source();
        src.fail_get("in/b");

        let handle = fx
            .engine
            .retry_recorded_failures(fresh(), src, destination())
            .await
            .unwrap();
        let report = handle.finished().await.unwrap();

        assert_eq!(report.progress.success, 1);
        assert_eq!(report.progress.failure, 1);
        let records = fx.sink.list(&job()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "in/b");
    }

    #[tokio::test]
    async fn refused_retry_keeps_recorded_failures() {
        let fx = fixture();
        fx.sink.record(&job(), "in/a", ErrorCode::Network).unwrap();
        let recorded_keys = |sink: &MemoryFailureSink| -> Vec<String> {
            sink.list(&job())
                .unwrap()
                .into_iter()
                .map(|r| r.key)
                .collect()
        };

        let mut local = fresh();
        local.source.kind = BackendKind::Local;
        let err = fx
            .engine
            .retry_recorded_failures(local, source(), destination())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::UnsupportedPair { .. }));
        assert_eq!(recorded_keys(&fx.sink), ["in/a"]);

        let dst = Arc::new(
            MemoryBackend::new(BackendKind::Oss).with_transfer_delay(Duration::from_millis(100)),
        );
        dst.create_bucket("b2");
        let running = fx.engine.start(fresh(), source(), dst).await.unwrap();
        let err = fx
            .engine
            .retry_recorded_failures(fresh(), source(), destination())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::JobAlreadyActive { .. }));
        assert_eq!(recorded_keys(&fx.sink), ["in/a"]);

        running.finished().await.unwrap();
    }

    #[tokio::test]
    async fn closing_the_destination_fails_remaining_objects_as_client_closed() {
        let fx = fixture();
        let dst = Arc::new(
            MemoryBackend::new(BackendKind::Oss).with_transfer_delay(Duration::from_millis(100)),
        );
        dst.create_bucket("b2");
        let mut cfg = fresh();
        cfg.workers = 1;

        let handle = fx.engine.start(cfg, source(), dst).await.unwrap();
        assert!(fx.engine.close_destination(&job()).await);

        let report = handle.finished().await.unwrap();
        assert_eq!(report.progress.success, 0);
        assert_eq!(report.progress.failure, 2);
        let codes: Vec<_> = fx
            .sink
            .list(&job())
            .unwrap()
            .into_iter()
            .map(|r| r.error_code)
            .collect();
        assert_eq!(codes, [ErrorCode::ClientClosed, ErrorCode::ClientClosed]);
        assert!(!fx.engine.close_destination(&job()).await);
    }

    #[tokio::test]
    async fn submit_runs_a_validated_request() {
        let fx = fixture();
        let (src, dst) = (source(), destination());
        let connector = TestConnector::new(&src, &dst);

        let handle = fx.engine.submit(&request(), &connector).await.unwrap();
        let report = handle.finished().await.unwrap();

        assert_eq!(connector.connects(), 2);
        assert_eq!(report.progress.success, 2);
        assert_eq!(dst.keys("b2"), ["out/a", "out/b"]);
    }

    #[tokio::test]
    async fn refused_start_after_connecting_shuts_both_clients_down() {
        let fx = fixture();
        let (src, dst) = (source(), destination());
        let connector = RivalConnector {
            inner: TestConnector::new(&src, &dst),
            engine: fx.engine.clone(),
        };

        let err = fx.engine.submit(&request(), &connector).await.unwrap_err();
        assert!(matches!(err, MigrateError::JobAlreadyActive { .. }));
        assert!(src.is_closed());
        assert!(dst.is_closed());

        let (_, rival) = fx.engine.jobs.remove(&job()).unwrap();
        rival.pool.shutdown().await;
    }

    #[tokio::test]
    async fn failure_retry_requests_check_buckets_and_keep_records() {
        let fx = fixture();
        fx.sink.record(&job(), "in/a", ErrorCode::Network).unwrap();

        let src = source();
        let dst = Arc::new(MemoryBackend::new(BackendKind::Oss));
        let connector = TestConnector::new(&src, &dst);
        let err = fx
            .engine
            .submit_failure_retry(&request(), &connector)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::BucketCheck { code: 1402, .. }));
        assert!(src.is_closed());
        assert!(dst.is_closed());
        assert_eq!(fx.sink.list(&job()).unwrap().len(), 1);

        let (src, dst) = (source(), destination());
        let connector = TestConnector::new(&src, &dst);
        let handle = fx
            .engine
            .submit_failure_retry(&request(), &connector)
            .await
            .unwrap();
        let report = handle.finished().await.unwrap();

        assert_eq!(report.progress.success, 1);
        assert_eq!(dst.keys("b2"), ["out/a"]);
        assert!(fx.sink.list(&job()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_requests_are_rejected_before_connecting() {
        let fx = fixture();
        let (src, dst) = (source(), destination());
        let connector = TestConnector::new(&src, &dst);

        let mut bad = request();
        bad.chunk_size_mb = Some("-5".to_string());
        let err = fx.engine.submit(&bad, &connector).await.unwrap_err();
        assert!(matches!(err, MigrateError::InvalidParams(_)));

        let mut local = request();
        local.source.kind = "local".to_string();
        let err = fx.engine.submit(&local, &connector).await.unwrap_err();
        assert!(matches!(
            err,
            MigrateError::UnsupportedPair {
                source_kind: BackendKind::Local,
                ..
            }
        ));

        assert_eq!(connector.connects(), 0);
        assert!(fx.engine.active_jobs().is_empty());
    }

    #[tokio::test]
    async fn missing_buckets_map_to_check_codes() {
        let cases = [
            (false, true, 1401),
            (true, false, 1402),
            (false, false, 1403),
        ];
        for (source_exists, destination_exists, expected) in cases {
            let fx = fixture();
            let src = Arc::new(MemoryBackend::new(BackendKind::S3));
            if source_exists {
                src.create_bucket("b1");
            }
            let dst = Arc::new(MemoryBackend::new(BackendKind::Oss));
            if destination_exists {
                dst.create_bucket("b2");
            }
            let connector = TestConnector::new(&src, &dst);

            let err = fx.engine.submit(&request(), &connector).await.unwrap_err();
            match err {
                MigrateError::BucketCheck { code, .. } => assert_eq!(code, expected),
                other => panic!("unexpected error: {other}"),
            }
            assert!(src.is_closed());
            assert!(dst.is_closed());
            assert!(fx.engine.active_jobs().is_empty());
        }
    }
}
