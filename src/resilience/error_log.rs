//! Bounded history of [`ErrorRecord`]s for the run report.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::ErrorRecord;
use crate::utils::unix_now;

use super::classify::Classification;

pub struct ErrorLog {
    capacity: usize,
    next_id: AtomicU64,
    records: Mutex<VecDeque<ErrorRecord>>,
}

impl ErrorLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<ErrorRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a failed attempt of the logical operation `context`. Repeated failures of the
    /// same unresolved operation only bump `retry_count` on the first record; its kind,
    /// message and timestamp stay as first seen. Returns the record id.
    pub fn record(&self, context: &str, cls: &Classification, message: String) -> u64 {
        let mut records = self.lock();
        if let Some(rec) = records
            .iter_mut()
            .rev()
            .find(|r| r.context == context && !r.resolved)
        {
            rec.retry_count = rec.retry_count.saturating_add(1);
            return rec.id;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        records.push_back(ErrorRecord {
            id,
            kind: cls.kind,
            severity: cls.severity,
            message,
            context: context.to_string(),
            timestamp: unix_now(),
            retry_count: 0,
            resolved: false,
        });
        while records.len() > self.capacity {
            records.pop_front();
        }
        id
    }

    /// Mark every open record for `context` resolved (a later retry succeeded).
    pub fn resolve(&self, context: &str) -> usize {
        let mut records = self.lock();
        let mut n = 0;
        for rec in records
            .iter_mut()
            .filter(|r| r.context == context && !r.resolved)
        {
            rec.resolved = true;
            n += 1;
        }
        n
    }

    /// Most recent records, oldest first.
    pub fn recent(&self) -> Vec<ErrorRecord> {
        self.lock().iter().cloned().collect()
    }

    pub fn unresolved_count(&self) -> usize {
        self.lock().iter().filter(|r| !r.resolved).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::ErrorKind;

    #[test]
    fn retries_fold_into_one_record_and_resolve() {
        let log = ErrorLog::new(8);
        let cls = ErrorKind::Transient.classification();
        let a = log.record("process:a", &cls, "timeout".into());
        let first = log.recent()[0].clone();
        let b = log.record(
            "process:a",
            &ErrorKind::DataValidation.classification(),
            "bad header".into(),
        );
        assert_eq!(a, b);
        let rec = &log.recent()[0];
        assert_eq!(rec.retry_count, 1);
        assert_eq!(rec.kind, ErrorKind::Transient);
        assert_eq!(rec.message, "timeout");
        assert_eq!(rec.timestamp, first.timestamp);
        assert_eq!(log.resolve("process:a"), 1);
        assert!(log.recent()[0].resolved);
        assert_eq!(log.unresolved_count(), 0);
    }

    #[test]
    fn history_is_bounded() {
        let log = ErrorLog::new(2);
        let cls = ErrorKind::Unknown.classification();
        for i in 0..5 {
            log.record(&format!("process:{i}"), &cls, "boom".into());
        }
        let recent = log.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].context, "process:4");
    }
}
