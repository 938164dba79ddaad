#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shared types for talking to object-storage backends.
//!
//! Everything here is backend-agnostic: the same [`ListPage`],
//! [`ObjectMetadata`] and [`PartAck`] shapes are produced by the
//! S3-compatible backend, the OSS-compatible backend, and the in-memory
//! backend used in tests.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Default socket timeout for backend clients (two hours).
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Default signing region for S3-compatible endpoints that ignore regions.
pub const DEFAULT_REGION: &str = "us-east-1";

/// The kind of storage a job endpoint points at.
///
/// Parses from either the human-readable name or the numeric code used by
/// job submitters (`"0"`, `"1"`, `"2"`).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum BackendKind {
    /// Local filesystem. Recognised so that submissions naming it can be
    /// refused with a clear error; it is not an object store.
    #[strum(to_string = "local", serialize = "0")]
    Local,
    /// S3-compatible object storage (flat listing, path-style addressing).
    #[strum(to_string = "s3", serialize = "moss", serialize = "1")]
    S3,
    /// OSS-compatible object storage (directory-style listing with a `/`
    /// delimiter, virtual-hosted addressing).
    #[strum(to_string = "oss", serialize = "2")]
    Oss,
}

impl BackendKind {
    /// Whether this kind is an object store the migration engine can read
    /// from or write to.
    #[must_use]
    pub const fn is_object_store(self) -> bool {
        matches!(self, Self::S3 | Self::Oss)
    }

    /// Whether listings should be walked one directory level at a time
    /// using common-prefix grouping.
    #[must_use]
    pub const fn is_hierarchical(self) -> bool {
        matches!(self, Self::Oss)
    }
}

/// Transport protocol for a backend endpoint.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Protocol {
    /// Plain HTTP.
    Http,
    /// HTTP over TLS.
    #[default]
    Https,
}

/// Everything needed to build a client for one side of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Which backend implementation to use.
    pub kind: BackendKind,
    /// Host (optionally with port) or full URL of the endpoint.
    pub address: String,
    /// Access key id.
    pub access_key: String,
    /// Secret access key.
    pub secret_key: String,
    /// Protocol used when `address` carries no scheme.
    pub protocol: Protocol,
    /// Signing region.
    pub region: String,
    /// Per-call socket timeout.
    pub socket_timeout: Duration,
}

impl ConnectionConfig {
    /// Returns the endpoint URL, adding the configured scheme when the
    /// address is a bare host.
    #[must_use]
    pub fn endpoint_url(&self) -> String {
        if self.address.contains("://") {
            self.address.clone()
        } else {
            format!("{}://{}", self.protocol, self.address)
        }
    }
}

/// Names one object to migrate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    /// Bucket holding the object.
    pub bucket: String,
    /// Object key.
    pub key: String,
}

impl ObjectDescriptor {
    /// Creates a descriptor for `bucket`/`key`.
    #[must_use]
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

/// One entry of a listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    /// Object key.
    pub key: String,
    /// Size in bytes as reported by the listing.
    pub size: u64,
}

/// One page of a bucket listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Objects on this page, in listing order.
    pub objects: Vec<ObjectSummary>,
    /// Directory-like prefixes grouped by the delimiter (empty when the
    /// listing was flat).
    pub common_prefixes: Vec<String>,
    /// Marker to pass for the next page.
    pub next_marker: Option<String>,
    /// Whether more pages follow.
    pub is_truncated: bool,
}

/// Object metadata carried across a whole-object transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// `Content-Type`.
    pub content_type: Option<String>,
    /// `Content-Encoding`.
    pub content_encoding: Option<String>,
    /// `Cache-Control`.
    pub cache_control: Option<String>,
    /// `Content-Disposition`.
    pub content_disposition: Option<String>,
    /// `Content-Language`.
    pub content_language: Option<String>,
    /// User-defined metadata (without the backend-specific header prefix).
    pub user: BTreeMap<String, String>,
}

/// Acknowledgement for one uploaded part of a chunked upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartAck {
    /// 1-based part number.
    pub part_number: i32,
    /// Part identifier returned by the destination (usually an `ETag`).
    pub etag: String,
}

/// An inclusive byte range within an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte, inclusive.
    pub start: u64,
    /// Last byte, inclusive.
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered by the range.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always `false`: an inclusive range covers at least one byte.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Formats the range as an HTTP `Range` header value.
    #[must_use]
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}
