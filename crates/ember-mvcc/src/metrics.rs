//! Engine-wide counters.
//!
//! Lock-free `AtomicU64` counters with `Relaxed` ordering; observers may see
//! stale values but never torn ones.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Global engine metrics singleton.
pub static GLOBAL_ENGINE_METRICS: EngineMetrics = EngineMetrics::new();

/// Counters for transaction lifecycle outcomes and conflict activity.
pub struct EngineMetrics {
    /// Transactions begun.
    pub begins_total: AtomicU64,
    /// Transactions committed.
    pub commits_total: AtomicU64,
    /// Transactions aborted (all reasons).
    pub aborts_total: AtomicU64,
    /// Aborts whose reason was SSN exclusion failure.
    pub ssn_exclusion_aborts_total: AtomicU64,
    /// Aborts whose reason was a write-write conflict.
    pub write_conflict_aborts_total: AtomicU64,
    /// Tuple reads that passed visibility.
    pub tuple_reads_total: AtomicU64,
    /// Reads that took the old-version fast path (no stamping).
    pub old_version_reads_total: AtomicU64,
    /// Tuples marked pessimistic because the reader bitmap was full.
    pub pessimistic_marks_total: AtomicU64,
}

impl EngineMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            begins_total: AtomicU64::new(0),
            commits_total: AtomicU64::new(0),
            aborts_total: AtomicU64::new(0),
            ssn_exclusion_aborts_total: AtomicU64::new(0),
            write_conflict_aborts_total: AtomicU64::new(0),
            tuple_reads_total: AtomicU64::new(0),
            old_version_reads_total: AtomicU64::new(0),
            pessimistic_marks_total: AtomicU64::new(0),
        }
    }

    pub fn record_begin(&self) {
        self.begins_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.commits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abort(&self, reason: ember_types::AbortReason) {
        self.aborts_total.fetch_add(1, Ordering::Relaxed);
        match reason {
            ember_types::AbortReason::SsnExclusionFailure => {
                self.ssn_exclusion_aborts_total
                    .fetch_add(1, Ordering::Relaxed);
            }
            ember_types::AbortReason::WriteWriteConflict => {
                self.write_conflict_aborts_total
                    .fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn record_tuple_read(&self) {
        self.tuple_reads_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_old_version_read(&self) {
        self.old_version_reads_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pessimistic_mark(&self) {
        self.pessimistic_marks_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            begins_total: self.begins_total.load(Ordering::Relaxed),
            commits_total: self.commits_total.load(Ordering::Relaxed),
            aborts_total: self.aborts_total.load(Ordering::Relaxed),
            ssn_exclusion_aborts_total: self.ssn_exclusion_aborts_total.load(Ordering::Relaxed),
            write_conflict_aborts_total: self.write_conflict_aborts_total.load(Ordering::Relaxed),
            tuple_reads_total: self.tuple_reads_total.load(Ordering::Relaxed),
            old_version_reads_total: self.old_version_reads_total.load(Ordering::Relaxed),
            pessimistic_marks_total: self.pessimistic_marks_total.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters (tests/diagnostics).
    pub fn reset(&self) {
        self.begins_total.store(0, Ordering::Relaxed);
        self.commits_total.store(0, Ordering::Relaxed);
        self.aborts_total.store(0, Ordering::Relaxed);
        self.ssn_exclusion_aborts_total.store(0, Ordering::Relaxed);
        self.write_conflict_aborts_total.store(0, Ordering::Relaxed);
        self.tuple_reads_total.store(0, Ordering::Relaxed);
        self.old_version_reads_total.store(0, Ordering::Relaxed);
        self.pessimistic_marks_total.store(0, Ordering::Relaxed);
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable snapshot of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineMetricsSnapshot {
    pub begins_total: u64,
    pub commits_total: u64,
    pub aborts_total: u64,
    pub ssn_exclusion_aborts_total: u64,
    pub write_conflict_aborts_total: u64,
    pub tuple_reads_total: u64,
    pub old_version_reads_total: u64,
    pub pessimistic_marks_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_types::AbortReason;

    #[test]
    fn abort_reasons_are_bucketed() {
        let m = EngineMetrics::new();
        m.record_abort(AbortReason::SsnExclusionFailure);
        m.record_abort(AbortReason::WriteWriteConflict);
        m.record_abort(AbortReason::User);

        let snap = m.snapshot();
        assert_eq!(snap.aborts_total, 3);
        assert_eq!(snap.ssn_exclusion_aborts_total, 1);
        assert_eq!(snap.write_conflict_aborts_total, 1);
    }

    #[test]
    fn snapshot_serializes() {
        let m = EngineMetrics::new();
        m.record_begin();
        m.record_commit();
        let json = serde_json::to_string(&m.snapshot()).unwrap();
        assert!(json.contains("\"begins_total\":1"));
        assert!(json.contains("\"commits_total\":1"));
    }
}
