//! Raw job submissions and their validation.

use std::time::Duration;

use bucket_mover_storage_models::{
    BackendKind, ConnectionConfig, DEFAULT_REGION, DEFAULT_SOCKET_TIMEOUT, Protocol,
};
use serde::{Deserialize, Serialize};

use crate::{
    BYTES_PER_MB, DEFAULT_CHUNK_SIZE_MB, DEFAULT_CHUNK_THRESHOLD_MB, DEFAULT_PAGE_SIZE,
    DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS, JobConfig, JobId, JobMode, MAX_PART_ATTEMPTS,
    ParamsError,
};

/// Connection parameters for one side of a job, as submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointRequest {
    /// Backend kind name (`s3`, `moss`, `oss`, `local`) or code (`1`, `2`,
    /// `0`).
    pub kind: String,
    /// Host, host:port, or URL.
    pub address: String,
    /// Access key id.
    pub access_key: String,
    /// Secret access key.
    pub secret_key: String,
    /// `http` or `https`; defaults to `https`.
    pub protocol: Option<String>,
    /// Signing region; defaults to [`DEFAULT_REGION`].
    pub region: Option<String>,
    /// Socket timeout in seconds; defaults to two hours.
    pub socket_timeout_secs: Option<u64>,
}

impl EndpointRequest {
    fn validate(&self, side: &'static str) -> Result<ConnectionConfig, ParamsError> {
        let kind = self
            .kind
            .trim()
            .parse::<BackendKind>()
            .map_err(|_| ParamsError::InvalidKind {
                side,
                value: self.kind.clone(),
            })?;

        if self.address.trim().is_empty() {
            return Err(ParamsError::MissingField {
                field: if side == "source" {
                    "source.address"
                } else {
                    "destination.address"
                },
            });
        }

        let protocol = match self.protocol.as_deref().map(str::trim) {
            None | Some("") => Protocol::default(),
            Some(value) => value
                .parse::<Protocol>()
                .map_err(|_| ParamsError::InvalidProtocol {
                    side,
                    value: value.to_string(),
                })?,
        };

        Ok(ConnectionConfig {
            kind,
            address: self.address.trim().to_string(),
            access_key: self.access_key.clone(),
            secret_key: self.secret_key.clone(),
            protocol,
            region: self
                .region
                .clone()
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_REGION.to_string()),
            socket_timeout: self
                .socket_timeout_secs
                .map_or(DEFAULT_SOCKET_TIMEOUT, Duration::from_secs),
        })
    }
}

/// A job as submitted. Numeric fields are raw strings and sizes are in
/// megabytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRequest {
    /// Job identifier.
    pub job_id: String,
    /// Source connection.
    pub source: EndpointRequest,
    /// Destination connection.
    pub destination: EndpointRequest,
    /// Bucket to read from.
    pub source_bucket: String,
    /// Bucket to write to.
    pub destination_bucket: String,
    /// Source key prefix.
    pub source_prefix: String,
    /// Destination key prefix.
    pub destination_prefix: String,
    /// Worker count.
    pub workers: Option<String>,
    /// Chunked-transfer threshold in megabytes.
    pub chunk_threshold_mb: Option<String>,
    /// Part size in megabytes.
    pub chunk_size_mb: Option<String>,
    /// Listing marker to resume after.
    pub resume_marker: Option<String>,
    /// Explicit source keys to migrate instead of listing.
    pub retry_keys: Option<Vec<String>>,
}

fn parse_positive(field: &'static str, value: Option<&str>, default: u64) -> Result<u64, ParamsError> {
    let Some(raw) = value else {
        return Ok(default);
    };

    let parsed = raw
        .trim()
        .parse::<i64>()
        .map_err(|_| ParamsError::InvalidNumber {
            field,
            value: raw.to_string(),
        })?;

    u64::try_from(parsed)
        .ok()
        .filter(|v| *v > 0)
        .ok_or(ParamsError::NotPositive {
            field,
            value: parsed,
        })
}

fn megabytes(field: &'static str, value: Option<&str>, default: u64) -> Result<u64, ParamsError> {
    let mb = parse_positive(field, value, default)?;
    mb.checked_mul(BYTES_PER_MB)
        .ok_or_else(|| ParamsError::InvalidNumber {
            field,
            value: mb.to_string(),
        })
}

fn required(field: &'static str, value: &str) -> Result<(), ParamsError> {
    if value.trim().is_empty() {
        return Err(ParamsError::MissingField { field });
    }
    Ok(())
}

impl JobRequest {
    /// Parses and checks every field.
    ///
    /// # Errors
    ///
    /// Returns [`ParamsError`] if a required field is empty, a numeric
    /// field is not a positive integer, or an endpoint names an unknown
    /// backend kind or protocol.
    pub fn validate(&self) -> Result<JobConfig, ParamsError> {
        required("job_id", &self.job_id)?;
        required("source_bucket", &self.source_bucket)?;
        required("destination_bucket", &self.destination_bucket)?;

        let workers = parse_positive("workers", self.workers.as_deref(), DEFAULT_WORKERS as u64)?;
        let workers = usize::try_from(workers).map_err(|_| ParamsError::InvalidNumber {
            field: "workers",
            value: workers.to_string(),
        })?;
        let chunk_threshold = megabytes(
            "chunk_threshold_mb",
            self.chunk_threshold_mb.as_deref(),
            DEFAULT_CHUNK_THRESHOLD_MB,
        )?;
        let chunk_size = megabytes(
            "chunk_size_mb",
            self.chunk_size_mb.as_deref(),
            DEFAULT_CHUNK_SIZE_MB,
        )?;

        let source = self.source.validate("source")?;
        let destination = self.destination.validate("destination")?;

        let mode = self.retry_keys.as_ref().map_or_else(
            || JobMode::Fresh {
                resume_marker: self.resume_marker.clone().filter(|m| !m.is_empty()),
            },
            |keys| JobMode::Retry { keys: keys.clone() },
        );

        Ok(JobConfig {
            job_id: JobId::new(self.job_id.trim()),
            source,
            destination,
            source_bucket: self.source_bucket.trim().to_string(),
            destination_bucket: self.destination_bucket.trim().to_string(),
            source_prefix: self.source_prefix.clone(),
            destination_prefix: self.destination_prefix.clone(),
            workers,
            chunk_threshold,
            chunk_size,
            part_attempts: MAX_PART_ATTEMPTS,
            page_size: DEFAULT_PAGE_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> JobRequest {
        JobRequest {
            job_id: "job-1".to_string(),
            source: EndpointRequest {
                kind: "1".to_string(),
                address: "10.0.0.1:9000".to_string(),
                access_key: "ak".to_string(),
                secret_key: "sk".to_string(),
                protocol: Some("http".to_string()),
                ..EndpointRequest::default()
            },
            destination: EndpointRequest {
                kind: "oss".to_string(),
                address: "oss.example.com".to_string(),
                ..EndpointRequest::default()
            },
            source_bucket: "b1".to_string(),
            destination_bucket: "b2".to_string(),
            source_prefix: "in/".to_string(),
            destination_prefix: "out/".to_string(),
            workers: Some("4".to_string()),
            chunk_threshold_mb: Some("1024".to_string()),
            chunk_size_mb: Some("200".to_string()),
            ..JobRequest::default()
        }
    }

    #[test]
    fn converts_megabytes_to_bytes() {
        let config = request().validate().unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.chunk_threshold, 1024 * 1024 * 1024);
        assert_eq!(config.chunk_size, 200 * 1024 * 1024);
        assert_eq!(config.source.kind, BackendKind::S3);
        assert_eq!(config.destination.kind, BackendKind::Oss);
        assert_eq!(config.destination.protocol, Protocol::Https);
        assert_eq!(config.destination.region, DEFAULT_REGION);
        assert_eq!(config.mode, JobMode::Fresh { resume_marker: None });
    }

    #[test]
    fn applies_defaults_for_missing_tuning() {
        let mut req = request();
        req.workers = None;
        req.chunk_threshold_mb = None;
        req.chunk_size_mb = None;

        let config = req.validate().unwrap();
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.chunk_threshold, DEFAULT_CHUNK_THRESHOLD_MB * BYTES_PER_MB);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE_MB * BYTES_PER_MB);
    }

    #[test]
    fn rejects_non_integer_workers() {
        let mut req = request();
        req.workers = Some("ten".to_string());
        assert!(matches!(
            req.validate(),
            Err(ParamsError::InvalidNumber { field: "workers", .. })
        ));
    }

    #[test]
    fn rejects_zero_and_negative_sizes() {
        let mut req = request();
        req.chunk_size_mb = Some("0".to_string());
        assert!(matches!(
            req.validate(),
            Err(ParamsError::NotPositive { field: "chunk_size_mb", value: 0 })
        ));

        let mut req = request();
        req.chunk_threshold_mb = Some("-5".to_string());
        assert!(matches!(
            req.validate(),
            Err(ParamsError::NotPositive { field: "chunk_threshold_mb", value: -5 })
        ));
    }

    #[test]
    fn rejects_unknown_kind_and_protocol() {
        let mut req = request();
        req.source.kind = "ftp".to_string();
        assert!(matches!(
            req.validate(),
            Err(ParamsError::InvalidKind { side: "source", .. })
        ));

        let mut req = request();
        req.destination.protocol = Some("gopher".to_string());
        assert!(matches!(
            req.validate(),
            Err(ParamsError::InvalidProtocol { side: "destination", .. })
        ));
    }

    #[test]
    fn rejects_missing_buckets() {
        let mut req = request();
        req.destination_bucket = "  ".to_string();
        assert!(matches!(
            req.validate(),
            Err(ParamsError::MissingField { field: "destination_bucket" })
        ));
    }

    #[test]
    fn retry_keys_select_retry_mode() {
        let mut req = request();
        req.resume_marker = Some("in/m".to_string());
        req.retry_keys = Some(vec!["in/a".to_string()]);
        assert_eq!(
            req.validate().unwrap().mode,
            JobMode::Retry {
                keys: vec!["in/a".to_string()]
            }
        );
    }
}
