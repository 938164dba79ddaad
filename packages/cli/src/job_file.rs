//! TOML job files.
//!
//! ```toml
//! job_id = "photos-2024"
//! source_bucket = "photos"
//! destination_bucket = "photos-archive"
//! source_prefix = "2024/"
//! destination_prefix = "archive/2024/"
//! workers = 16
//! chunk_size_mb = "256"
//!
//! [source]
//! kind = "s3"
//! address = "s3.internal:9000"
//! protocol = "http"
//!
//! [destination]
//! kind = 2
//! address = "oss-cn-hangzhou.aliyuncs.com"
//! ```
//!
//! Numbers may be written as integers or strings; either way they reach
//! [`JobRequest::validate`] as raw text. Credentials left out of the file
//! are read from `BUCKET_MOVER_{SOURCE,DEST}_{ACCESS,SECRET}_KEY`.

use std::path::{Path, PathBuf};

use bucket_mover_migrate_models::{EndpointRequest, JobRequest};
use serde::Deserialize;

/// Errors raised while loading a job file.
#[derive(Debug, thiserror::Error)]
pub enum JobFileError {
    /// The file could not be read.
    #[error("Failed to read job file {}: {source}", path.display())]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The file is not a valid job description.
    #[error("Failed to parse job file {}: {source}", path.display())]
    Parse {
        /// File path.
        path: PathBuf,
        /// TOML error.
        source: toml::de::Error,
    },
}

/// An integer or a string, kept as text.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Raw {
    Int(i64),
    Text(String),
}

impl Raw {
    fn into_string(self) -> String {
        match self {
            Self::Int(value) => value.to_string(),
            Self::Text(value) => value,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EndpointFile {
    kind: Raw,
    address: String,
    access_key: Option<String>,
    secret_key: Option<String>,
    protocol: Option<String>,
    region: Option<String>,
    socket_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JobFile {
    job_id: String,
    source: EndpointFile,
    destination: EndpointFile,
    source_bucket: String,
    destination_bucket: String,
    #[serde(default)]
    source_prefix: String,
    #[serde(default)]
    destination_prefix: String,
    workers: Option<Raw>,
    chunk_threshold_mb: Option<Raw>,
    chunk_size_mb: Option<Raw>,
    resume_marker: Option<String>,
}

impl EndpointFile {
    fn into_request(
        self,
        env_prefix: &str,
        env: &impl Fn(&str) -> Option<String>,
    ) -> EndpointRequest {
        let credential = |from_file: Option<String>, name: &str| {
            env(&format!("{env_prefix}_{name}"))
                .or(from_file)
                .unwrap_or_default()
        };

        EndpointRequest {
            kind: self.kind.into_string(),
            address: self.address,
            access_key: credential(self.access_key, "ACCESS_KEY"),
            secret_key: credential(self.secret_key, "SECRET_KEY"),
            protocol: self.protocol,
            region: self.region,
            socket_timeout_secs: self.socket_timeout_secs,
        }
    }
}

impl JobFile {
    fn into_request(self, env: &impl Fn(&str) -> Option<String>) -> JobRequest {
        JobRequest {
            job_id: self.job_id,
            source: self.source.into_request("BUCKET_MOVER_SOURCE", env),
            destination: self.destination.into_request("BUCKET_MOVER_DEST", env),
            source_bucket: self.source_bucket,
            destination_bucket: self.destination_bucket,
            source_prefix: self.source_prefix,
            destination_prefix: self.destination_prefix,
            workers: self.workers.map(Raw::into_string),
            chunk_threshold_mb: self.chunk_threshold_mb.map(Raw::into_string),
            chunk_size_mb: self.chunk_size_mb.map(Raw::into_string),
            resume_marker: self.resume_marker,
            retry_keys: None,
        }
    }
}

/// Parses a job file's contents, resolving credentials through `env`.
///
/// # Errors
///
/// Returns [`JobFileError::Parse`] if `contents` is not a valid job file.
pub fn parse(
    path: &Path,
    contents: &str,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<JobRequest, JobFileError> {
    let file: JobFile = toml::from_str(contents).map_err(|source| JobFileError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(file.into_request(env))
}

/// Reads and parses the job file at `path`, taking credentials from the
/// process environment.
///
/// # Errors
///
/// Returns [`JobFileError`] if the file cannot be read or parsed.
pub fn load(path: &Path) -> Result<JobRequest, JobFileError> {
    let contents = std::fs::read_to_string(path).map_err(|source| JobFileError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(path, &contents, &|name| std::env::var(name).ok())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use bucket_mover_migrate_models::{BYTES_PER_MB, JobMode};
    use bucket_mover_storage::models::{BackendKind, Protocol};

    use super::*;

    const JOB: &str = r#"
job_id = "photos"
source_bucket = "b1"
destination_bucket = "b2"
source_prefix = "in/"
destination_prefix = "out/"
workers = 16
chunk_size_mb = "256"

[source]
kind = "s3"
address = "s3.internal:9000"
protocol = "http"
access_key = "file-ak"
secret_key = "file-sk"

[destination]
kind = 2
address = "oss.example.com"
"#;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn parses_integers_and_strings_alike() {
        let request = parse(Path::new("job.toml"), JOB, &no_env).unwrap();
        assert_eq!(request.workers.as_deref(), Some("16"));
        assert_eq!(request.chunk_size_mb.as_deref(), Some("256"));
        assert_eq!(request.destination.kind, "2");

        let config = request.validate().unwrap();
        assert_eq!(config.workers, 16);
        assert_eq!(config.chunk_size, 256 * BYTES_PER_MB);
        assert_eq!(config.source.kind, BackendKind::S3);
        assert_eq!(config.source.protocol, Protocol::Http);
        assert_eq!(config.destination.kind, BackendKind::Oss);
        assert_eq!(
            config.mode,
            JobMode::Fresh {
                resume_marker: None
            }
        );
    }

    #[test]
    fn environment_credentials_win_over_the_file() {
        let env: BTreeMap<&str, &str> = [
            ("BUCKET_MOVER_SOURCE_ACCESS_KEY", "env-ak"),
            ("BUCKET_MOVER_DEST_SECRET_KEY", "env-sk"),
        ]
        .into_iter()
        .collect();
        let lookup = |name: &str| env.get(name).map(ToString::to_string);

        let request = parse(Path::new("job.toml"), JOB, &lookup).unwrap();
        assert_eq!(request.source.access_key, "env-ak");
        assert_eq!(request.source.secret_key, "file-sk");
        assert_eq!(request.destination.access_key, "");
        assert_eq!(request.destination.secret_key, "env-sk");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let contents = format!("{JOB}\nworkerz = 3\n");
        let err = parse(Path::new("job.toml"), &contents, &no_env).unwrap_err();
        assert!(matches!(err, JobFileError::Parse { .. }));
    }

    #[test]
    fn missing_file_reports_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("absent.toml"));
    }
}
