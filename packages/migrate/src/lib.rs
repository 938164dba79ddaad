#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Bulk bucket-to-bucket migration engine.
//!
//! A job copies every object under a source prefix into a destination
//! bucket, possibly across different backend kinds. The moving parts:
//!
//! * [`engine::JobEngine`] owns job lifecycle. It starts the counting
//!   task and the listing loop, keeps one [`pool::WorkerPool`] per job,
//!   and drains and closes a job once everything has finished.
//! * [`strategy::TransferStrategy`] lists pages, dispatches them to the
//!   pool, and migrates single objects either in one call or as a chunked
//!   upload with per-part retry.
//! * Outcomes go to the injected [`bucket_mover_ledger::ProgressLedger`]
//!   and [`bucket_mover_ledger::FailedObjectSink`].
//!
//! Delivery is at least once: the listing marker is persisted before a
//! page is dispatched, so a restarted job repeats at most one page.

pub mod chunk;
pub mod classify;
pub mod engine;
pub mod pool;
pub mod recent;
pub mod session;
pub mod strategy;

use bucket_mover_ledger::LedgerError;
use bucket_mover_migrate_models::{BucketCheck, JobId, ParamsError};
use bucket_mover_storage::StorageError;
use bucket_mover_storage_models::BackendKind;

pub use engine::{JobEngine, JobHandle, JobReport};
pub use pool::PoolStats;

/// Job-level errors. Any of these refuses or ends a whole job.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// The submitted parameters are malformed.
    #[error("Invalid job parameters: {0}")]
    InvalidParams(#[from] ParamsError),

    /// One side of the job is not an object store.
    #[error("Unsupported backend pair: {source_kind} -> {destination_kind}")]
    UnsupportedPair {
        /// Source backend kind.
        source_kind: BackendKind,
        /// Destination backend kind.
        destination_kind: BackendKind,
    },

    /// A bucket named by the job does not exist.
    #[error("Bucket check failed ({code}): {check}")]
    BucketCheck {
        /// Which buckets are missing.
        check: BucketCheck,
        /// Numeric code reported to submitters.
        code: u16,
    },

    /// A job with this id is already running.
    #[error("Job {job_id} is already active")]
    JobAlreadyActive {
        /// The duplicate id.
        job_id: JobId,
    },

    /// A backend client could not be created.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The ledger or failure sink failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// A task was submitted to a pool that has shut down.
    #[error("Worker pool {pool} is closed")]
    PoolClosed {
        /// Pool name (the job id).
        pool: String,
    },

    /// The source client was closed while listing.
    #[error("Source client for job {job_id} was closed while listing")]
    SourceClosed {
        /// Job id.
        job_id: JobId,
    },

    /// The job's driver task failed.
    #[error("Job task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Per-object transfer errors. These fail one object, never the job.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// A backend call failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A part kept failing until its attempts ran out.
    #[error("Part {part_number} of {key} failed after {attempts} attempts: {source}")]
    PartExhausted {
        /// Source key.
        key: String,
        /// 1-based part number.
        part_number: i32,
        /// Attempts made.
        attempts: u32,
        /// Last error.
        source: StorageError,
    },

    /// All parts uploaded but the destination refused to assemble them.
    #[error("Chunked upload of {key} could not be completed: {source}")]
    Complete {
        /// Source key.
        key: String,
        /// Completion error.
        source: StorageError,
    },

    /// The object needs more parts than a chunked upload can carry.
    #[error("{key} ({total} bytes) cannot be split into {chunk_size}-byte parts")]
    TooManyParts {
        /// Source key.
        key: String,
        /// Object size.
        total: u64,
        /// Configured part size.
        chunk_size: u64,
    },
}

/// Runs a ledger or failure-sink call on tokio's blocking pool. The
/// file-backed implementations write to disk synchronously.
pub(crate) async fn off_runtime<T, F>(call: F) -> Result<T, MigrateError>
where
    F: FnOnce() -> Result<T, LedgerError> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(call).await??)
}
