#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Job request, configuration, and state types for bucket migrations.
//!
//! A submitter hands the engine a [`JobRequest`] whose tuning values are
//! raw strings (they usually come straight from a form, an RPC payload or
//! a TOML file). [`JobRequest::validate`] turns it into a typed
//! [`JobConfig`] or rejects it before any backend is contacted.

pub mod request;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

pub use request::{EndpointRequest, JobRequest};

use bucket_mover_storage_models::ConnectionConfig;

/// Bytes in one megabyte as submitters express sizes.
pub const BYTES_PER_MB: u64 = 1024 * 1024;

/// Worker count used when a submitter leaves it blank.
pub const DEFAULT_WORKERS: usize = 10;

/// Objects at or above this size use chunked transfer (1 GiB).
pub const DEFAULT_CHUNK_THRESHOLD_MB: u64 = 1024;

/// Part size for chunked transfers (200 MiB).
pub const DEFAULT_CHUNK_SIZE_MB: u64 = 200;

/// Attempts per part before a chunked transfer is abandoned.
pub const MAX_PART_ATTEMPTS: u32 = 5;

/// Keys requested per listing page.
pub const DEFAULT_PAGE_SIZE: i32 = 1000;

/// Tasks that may wait in a job's pool queue before submission blocks.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Delay before retrying a failed object count.
pub const COUNT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Most recent failures kept in memory per running job.
pub const RECENT_FAILURE_CAP: usize = 1000;

/// Caller-supplied job identifier. Unique among running jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Wraps `id`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// How a job selects the objects it migrates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum JobMode {
    /// List the source prefix, optionally resuming after a marker.
    Fresh {
        /// Listing marker to resume from.
        resume_marker: Option<String>,
    },
    /// Migrate exactly these source keys; no listing, no counting.
    Retry {
        /// Source keys to migrate.
        keys: Vec<String>,
    },
}

/// A validated job, with sizes in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    /// Job identifier.
    pub job_id: JobId,
    /// Source connection.
    pub source: ConnectionConfig,
    /// Destination connection.
    pub destination: ConnectionConfig,
    /// Bucket to read from.
    pub source_bucket: String,
    /// Bucket to write to.
    pub destination_bucket: String,
    /// Only keys under this prefix are migrated. Empty means the whole
    /// bucket.
    pub source_prefix: String,
    /// Prefix that replaces `source_prefix` on destination keys.
    pub destination_prefix: String,
    /// Worker pool size.
    pub workers: usize,
    /// Objects of at least this many bytes use chunked transfer.
    pub chunk_threshold: u64,
    /// Bytes per part of a chunked transfer.
    pub chunk_size: u64,
    /// Attempts per part before a chunked transfer is abandoned.
    pub part_attempts: u32,
    /// Keys requested per listing page.
    pub page_size: i32,
    /// Pool queue capacity.
    pub queue_capacity: usize,
    /// Fresh listing or explicit retry list.
    pub mode: JobMode,
}

/// Lifecycle state of a job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    /// Registered, nothing running yet.
    Idle,
    /// The counting task and the listing loop are running.
    CountingAndTransferring,
    /// Dispatching an explicit key list.
    RetryingSelectedKeys,
    /// Waiting for workers and the count to finish.
    Draining,
    /// Clients are shut down and per-job state is purged.
    Closed,
}

impl JobState {
    /// Whether the job has finished.
    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Stable classification stored with every failed object.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The source object vanished between listing and transfer.
    SourceNotFound,
    /// A bucket does not exist.
    BucketNotFound,
    /// Credentials were rejected.
    AccessDenied,
    /// A call exceeded the client's socket timeout.
    Timeout,
    /// Connection-level failure.
    Network,
    /// A chunked transfer could not be completed.
    ChunkedTransfer,
    /// The backend client was shut down mid-transfer.
    ClientClosed,
    /// Anything else.
    Unknown,
}

/// Fatal submission error codes for missing buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum BucketCheck {
    /// The source bucket does not exist.
    #[strum(to_string = "source bucket does not exist")]
    SourceMissing,
    /// The destination bucket does not exist.
    #[strum(to_string = "destination bucket does not exist")]
    DestinationMissing,
    /// Neither bucket exists.
    #[strum(to_string = "source and destination buckets do not exist")]
    BothMissing,
}

impl BucketCheck {
    /// Maps bucket existence to a failure, or `None` when both exist.
    #[must_use]
    pub const fn from_presence(source_exists: bool, destination_exists: bool) -> Option<Self> {
        match (source_exists, destination_exists) {
            (true, true) => None,
            (false, true) => Some(Self::SourceMissing),
            (true, false) => Some(Self::DestinationMissing),
            (false, false) => Some(Self::BothMissing),
        }
    }

    /// Numeric code reported to submitters.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::SourceMissing => 1401,
            Self::DestinationMissing => 1402,
            Self::BothMissing => 1403,
        }
    }
}

/// Errors raised while validating a [`JobRequest`].
#[derive(Debug, thiserror::Error)]
pub enum ParamsError {
    /// A required field is empty.
    #[error("Missing required field: {field}")]
    MissingField {
        /// Field name.
        field: &'static str,
    },

    /// A numeric field is not an integer (or overflows).
    #[error("Field {field} is not a valid integer: {value:?}")]
    InvalidNumber {
        /// Field name.
        field: &'static str,
        /// Submitted value.
        value: String,
    },

    /// A numeric field is zero or negative.
    #[error("Field {field} must be positive, got {value}")]
    NotPositive {
        /// Field name.
        field: &'static str,
        /// Parsed value.
        value: i64,
    },

    /// An endpoint names an unknown backend kind.
    #[error("Unknown {side} backend kind: {value:?}")]
    InvalidKind {
        /// `source` or `destination`.
        side: &'static str,
        /// Submitted value.
        value: String,
    },

    /// An endpoint names an unknown protocol.
    #[error("Unknown {side} protocol: {value:?}")]
    InvalidProtocol {
        /// `source` or `destination`.
        side: &'static str,
        /// Submitted value.
        value: String,
    },
}
