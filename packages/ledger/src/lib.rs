#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Progress and failure bookkeeping for migration jobs.
//!
//! The engine reports every outcome through two contracts:
//!
//! * [`ProgressLedger`] holds per-job success/failure/total counters and
//!   the last listing marker. It is the authoritative record a restarted
//!   job resumes from.
//! * [`FailedObjectSink`] records which keys failed and why, for a later
//!   targeted retry.
//!
//! Both come in an in-memory flavour ([`memory`]) and a file-backed one
//! ([`file`]) that survives process restarts.

pub mod file;
pub mod memory;

use std::path::PathBuf;

use bucket_mover_migrate_models::{ErrorCode, JobId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Errors raised by ledger and sink implementations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Reading or writing the backing file failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The backing file holds malformed JSON.
    #[error("Malformed ledger data in {}: {source}", path.display())]
    Json {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
}

/// Counters for one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Objects migrated successfully.
    pub success: u64,
    /// Objects that failed.
    pub failure: u64,
    /// Objects under the source prefix, once the count has finished.
    pub total: Option<u64>,
    /// Marker of the listing page most recently started.
    pub marker: Option<String>,
}

impl ProgressSnapshot {
    /// Objects with an outcome so far.
    #[must_use]
    pub const fn processed(&self) -> u64 {
        self.success + self.failure
    }
}

/// Per-job progress counters.
///
/// Counters are independent increments; a reader may see `success +
/// failure` briefly out of step with `total`.
pub trait ProgressLedger: Send + Sync {
    /// Adds one to the success counter.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the change cannot be recorded.
    fn increment_success(&self, job: &JobId) -> Result<(), LedgerError>;

    /// Adds one to the failure counter.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the change cannot be recorded.
    fn increment_failure(&self, job: &JobId) -> Result<(), LedgerError>;

    /// Records the total object count.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the change cannot be recorded.
    fn set_total(&self, job: &JobId, total: u64) -> Result<(), LedgerError>;

    /// Records the marker of the page about to be dispatched. `None` means
    /// the first page.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the change cannot be recorded.
    fn set_marker(&self, job: &JobId, marker: Option<&str>) -> Result<(), LedgerError>;

    /// Current counters for `job` (all zero for an unknown job).
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the counters cannot be read.
    fn get(&self, job: &JobId) -> Result<ProgressSnapshot, LedgerError>;

    /// Persists anything buffered.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if persisting fails.
    fn flush(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}

/// One failed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Job the object belongs to.
    pub job_id: JobId,
    /// Source key.
    pub key: String,
    /// Classification of the failure.
    pub error_code: ErrorCode,
    /// When the failure was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl FailureRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn now(job_id: &JobId, key: &str, error_code: ErrorCode) -> Self {
        Self {
            job_id: job_id.clone(),
            key: key.to_string(),
            error_code,
            recorded_at: Utc::now(),
        }
    }
}

/// Append-only record of failed objects, read back by the retry path.
pub trait FailedObjectSink: Send + Sync {
    /// Appends a failure.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the record cannot be stored.
    fn record(&self, job: &JobId, key: &str, error_code: ErrorCode) -> Result<(), LedgerError>;

    /// Every failure recorded for `job`, in the order recorded.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the records cannot be read.
    fn list(&self, job: &JobId) -> Result<Vec<FailureRecord>, LedgerError>;

    /// Removes every failure recorded for `key` of `job`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the records cannot be removed.
    fn remove(&self, job: &JobId, key: &str) -> Result<(), LedgerError>;

    /// Removes every failure recorded for `job`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the records cannot be removed.
    fn clear(&self, job: &JobId) -> Result<(), LedgerError>;
}
