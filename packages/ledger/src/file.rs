//! File-backed ledger and failure sink.
//!
//! [`FileLedger`] keeps every job's counters in memory and rewrites a JSON
//! snapshot (`{ "<job id>": { success, failure, total, marker } }`) when a
//! marker or total changes and on [`ProgressLedger::flush`]. Counter
//! increments alone are not written, so the persisted counts are the ones
//! that were current when the last page began. The snapshot is taken
//! under the counter lock but written outside it, so increments never wait
//! on the disk.
//!
//! Both types do blocking file I/O; async callers run them on a blocking
//! thread.
//!
//! [`FileFailureSink`] appends one JSON object per line.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bucket_mover_migrate_models::{ErrorCode, JobId};

use crate::{FailedObjectSink, FailureRecord, LedgerError, ProgressLedger, ProgressSnapshot};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> LedgerError + '_ {
    move |source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes `contents` next to `path` and renames it into place.
fn replace_file(path: &Path, contents: &[u8]) -> Result<(), LedgerError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents).map_err(io_error(&tmp))?;
    std::fs::rename(&tmp, path).map_err(io_error(path))
}

/// Reads `path`, treating a missing file as empty.
fn read_optional(path: &Path) -> Result<Option<String>, LedgerError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(path)(e)),
    }
}

/// Counters persisted as a JSON snapshot.
#[derive(Debug)]
pub struct FileLedger {
    path: PathBuf,
    jobs: Mutex<BTreeMap<JobId, ProgressSnapshot>>,
    /// Bumped for every snapshot taken, under the `jobs` lock.
    generation: AtomicU64,
    /// Generation of the snapshot on disk.
    written: Mutex<u64>,
}

impl FileLedger {
    /// Opens the ledger at `path`, loading any existing snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the file exists but cannot be read or
    /// parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let jobs = match read_optional(&path)? {
            Some(contents) if !contents.trim().is_empty() => serde_json::from_str(&contents)
                .map_err(|source| LedgerError::Json {
                    path: path.clone(),
                    source,
                })?,
            _ => BTreeMap::new(),
        };

        log::debug!("Opened progress ledger at {}", path.display());
        Ok(Self {
            path,
            jobs: Mutex::new(jobs),
            generation: AtomicU64::new(0),
            written: Mutex::new(0),
        })
    }

    /// Path of the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies `change` and writes the resulting snapshot.
    fn persist(
        &self,
        change: impl FnOnce(&mut BTreeMap<JobId, ProgressSnapshot>),
    ) -> Result<(), LedgerError> {
        let (json, generation) = {
            let mut jobs = lock(&self.jobs);
            change(&mut jobs);
            let json = serde_json::to_vec_pretty(&*jobs).map_err(|source| LedgerError::Json {
                path: self.path.clone(),
                source,
            })?;
            (json, self.generation.fetch_add(1, Ordering::SeqCst) + 1)
        };

        let mut written = lock(&self.written);
        if *written > generation {
            return Ok(());
        }
        replace_file(&self.path, &json)?;
        *written = generation;
        Ok(())
    }
}

impl ProgressLedger for FileLedger {
    fn increment_success(&self, job: &JobId) -> Result<(), LedgerError> {
        lock(&self.jobs).entry(job.clone()).or_default().success += 1;
        Ok(())
    }

    fn increment_failure(&self, job: &JobId) -> Result<(), LedgerError> {
        lock(&self.jobs).entry(job.clone()).or_default().failure += 1;
        Ok(())
    }

    fn set_total(&self, job: &JobId, total: u64) -> Result<(), LedgerError> {
        self.persist(|jobs| jobs.entry(job.clone()).or_default().total = Some(total))
    }

    fn set_marker(&self, job: &JobId, marker: Option<&str>) -> Result<(), LedgerError> {
        self.persist(|jobs| {
            jobs.entry(job.clone()).or_default().marker = marker.map(String::from);
        })
    }

    fn get(&self, job: &JobId) -> Result<ProgressSnapshot, LedgerError> {
        Ok(lock(&self.jobs).get(job).cloned().unwrap_or_default())
    }

    fn flush(&self) -> Result<(), LedgerError> {
        self.persist(|_| {})
    }
}

/// Failure records appended to a JSON-lines file.
#[derive(Debug)]
pub struct FileFailureSink {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileFailureSink {
    /// Uses the file at `path`, creating it on first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    /// Path of the records file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Vec<FailureRecord>, LedgerError> {
        let Some(contents) = read_optional(&self.path)? else {
            return Ok(Vec::new());
        };

        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|source| LedgerError::Json {
                    path: self.path.clone(),
                    source,
                })
            })
            .collect()
    }

    /// Rewrites the file with only the records `keep` accepts. The caller
    /// holds the guard.
    fn rewrite(&self, keep: impl Fn(&FailureRecord) -> bool) -> Result<(), LedgerError> {
        let records = self.read_all()?;
        if records.is_empty() {
            return Ok(());
        }

        let mut contents = Vec::new();
        for record in records.iter().filter(|r| keep(r)) {
            serde_json::to_writer(&mut contents, record).map_err(|source| LedgerError::Json {
                path: self.path.clone(),
                source,
            })?;
            contents.push(b'\n');
        }
        replace_file(&self.path, &contents)
    }
}

impl FailedObjectSink for FileFailureSink {
    fn record(&self, job: &JobId, key: &str, error_code: ErrorCode) -> Result<(), LedgerError> {
        let mut line = serde_json::to_vec(&FailureRecord::now(job, key, error_code)).map_err(
            |source| LedgerError::Json {
                path: self.path.clone(),
                source,
            },
        )?;
        line.push(b'\n');

        let _guard = lock(&self.guard);
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(&line))
            .map_err(io_error(&self.path))
    }

    fn list(&self, job: &JobId) -> Result<Vec<FailureRecord>, LedgerError> {
        let _guard = lock(&self.guard);
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| &r.job_id == job)
            .collect())
    }

    fn remove(&self, job: &JobId, key: &str) -> Result<(), LedgerError> {
        let _guard = lock(&self.guard);
        self.rewrite(|r| &r.job_id != job || r.key != key)
    }

    fn clear(&self, job: &JobId) -> Result<(), LedgerError> {
        let _guard = lock(&self.guard);
        self.rewrite(|r| &r.job_id != job)
    }
}
