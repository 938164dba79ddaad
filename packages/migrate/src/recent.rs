//! Bounded in-memory list of a running job's latest failures.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use bucket_mover_ledger::FailureRecord;

/// Keeps the newest `cap` failure records, dropping the oldest.
#[derive(Debug)]
pub struct RecentFailures {
    cap: usize,
    records: Mutex<VecDeque<FailureRecord>>,
}

impl RecentFailures {
    /// Creates an empty cache holding at most `cap` records.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            records: Mutex::new(VecDeque::with_capacity(cap.min(64))),
        }
    }

    /// Adds `record`, evicting the oldest when full.
    pub fn push(&self, record: FailureRecord) {
        if self.cap == 0 {
            return;
        }
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.len() == self.cap {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Records oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<FailureRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use bucket_mover_migrate_models::{ErrorCode, JobId};

    use super::*;

    #[test]
    fn evicts_oldest_past_cap() {
        let job = JobId::from("j");
        let cache = RecentFailures::new(2);
        for key in ["a", "b", "c"] {
            cache.push(FailureRecord::now(&job, key, ErrorCode::Unknown));
        }

        let keys: Vec<_> = cache.snapshot().into_iter().map(|r| r.key).collect();
        assert_eq!(keys, ["b", "c"]);
    }
}
