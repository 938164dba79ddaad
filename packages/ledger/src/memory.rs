//! In-memory ledger and failure sink.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bucket_mover_migrate_models::{ErrorCode, JobId};

use crate::{FailedObjectSink, FailureRecord, LedgerError, ProgressLedger, ProgressSnapshot};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counters held in process memory.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    jobs: Mutex<BTreeMap<JobId, ProgressSnapshot>>,
}

impl MemoryLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a ledger pre-seeded with `snapshot` for `job`.
    #[must_use]
    pub fn with_snapshot(job: &JobId, snapshot: ProgressSnapshot) -> Self {
        let ledger = Self::new();
        lock(&ledger.jobs).insert(job.clone(), snapshot);
        ledger
    }

    fn update(&self, job: &JobId, f: impl FnOnce(&mut ProgressSnapshot)) {
        f(lock(&self.jobs).entry(job.clone()).or_default());
    }
}

impl ProgressLedger for MemoryLedger {
    fn increment_success(&self, job: &JobId) -> Result<(), LedgerError> {
        self.update(job, |s| s.success += 1);
        Ok(())
    }

    fn increment_failure(&self, job: &JobId) -> Result<(), LedgerError> {
        self.update(job, |s| s.failure += 1);
        Ok(())
    }

    fn set_total(&self, job: &JobId, total: u64) -> Result<(), LedgerError> {
        self.update(job, |s| s.total = Some(total));
        Ok(())
    }

    fn set_marker(&self, job: &JobId, marker: Option<&str>) -> Result<(), LedgerError> {
        self.update(job, |s| s.marker = marker.map(String::from));
        Ok(())
    }

    fn get(&self, job: &JobId) -> Result<ProgressSnapshot, LedgerError> {
        Ok(lock(&self.jobs).get(job).cloned().unwrap_or_default())
    }
}

/// Failure records held in process memory.
#[derive(Debug, Default)]
pub struct MemoryFailureSink {
    records: Mutex<Vec<FailureRecord>>,
}

impl MemoryFailureSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl FailedObjectSink for MemoryFailureSink {
    fn record(&self, job: &JobId, key: &str, error_code: ErrorCode) -> Result<(), LedgerError> {
        lock(&self.records).push(FailureRecord::now(job, key, error_code));
        Ok(())
    }

    fn list(&self, job: &JobId) -> Result<Vec<FailureRecord>, LedgerError> {
        Ok(lock(&self.records)
            .iter()
            .filter(|r| &r.job_id == job)
            .cloned()
            .collect())
    }

    fn remove(&self, job: &JobId, key: &str) -> Result<(), LedgerError> {
        lock(&self.records).retain(|r| &r.job_id != job || r.key != key);
        Ok(())
    }

    fn clear(&self, job: &JobId) -> Result<(), LedgerError> {
        lock(&self.records).retain(|r| &r.job_id != job);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_per_job() {
        let ledger = MemoryLedger::new();
        let a = JobId::from("a");
        let b = JobId::from("b");

        ledger.increment_success(&a).unwrap();
        ledger.increment_success(&a).unwrap();
        ledger.increment_failure(&b).unwrap();
        ledger.set_total(&a, 7).unwrap();
        ledger.set_marker(&a, Some("in/x")).unwrap();

        let snap = ledger.get(&a).unwrap();
        assert_eq!(snap.success, 2);
        assert_eq!(snap.failure, 0);
        assert_eq!(snap.total, Some(7));
        assert_eq!(snap.marker.as_deref(), Some("in/x"));
        assert_eq!(ledger.get(&b).unwrap().failure, 1);
        assert_eq!(ledger.get(&JobId::from("c")).unwrap(), ProgressSnapshot::default());
    }

    #[test]
    fn sink_lists_in_order_and_clears_one_job() {
        let sink = MemoryFailureSink::new();
        let a = JobId::from("a");
        let b = JobId::from("b");

        sink.record(&a, "k2", ErrorCode::Timeout).unwrap();
        sink.record(&b, "k9", ErrorCode::Unknown).unwrap();
        sink.record(&a, "k1", ErrorCode::Network).unwrap();

        let keys: Vec<_> = sink.list(&a).unwrap().into_iter().map(|r| r.key).collect();
        assert_eq!(keys, ["k2", "k1"]);

        sink.clear(&a).unwrap();
        assert!(sink.list(&a).unwrap().is_empty());
        assert_eq!(sink.list(&b).unwrap().len(), 1);
    }

    #[test]
    fn remove_drops_one_key_of_one_job() {
        let sink = MemoryFailureSink::new();
        let a = JobId::from("a");
        let b = JobId::from("b");

        sink.record(&a, "k1", ErrorCode::Timeout).unwrap();
        sink.record(&a, "k2", ErrorCode::Network).unwrap();
        sink.record(&a, "k1", ErrorCode::Network).unwrap();
        sink.record(&b, "k1", ErrorCode::Unknown).unwrap();

        sink.remove(&a, "k1").unwrap();

        let keys: Vec<_> = sink.list(&a).unwrap().into_iter().map(|r| r.key).collect();
        assert_eq!(keys, ["k2"]);
        assert_eq!(sink.list(&b).unwrap()[0].key, "k1");
    }
}
