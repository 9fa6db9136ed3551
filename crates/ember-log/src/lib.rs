//! The append-only, LSN-issuing log service consumed by the MVCC core.
//!
//! The engine treats the log as an external collaborator with a narrow
//! contract: hand out a monotonic current LSN for begin stamps, issue one
//! end LSN per committing transaction at pre-commit (this is the commit
//! order and the serial order of the whole system), and accept or discard
//! per-transaction intents. Durability, flushing and shipping live behind
//! this interface and are out of scope here; this implementation keeps the
//! sequencing contract in memory.
//!
//! LSNs are byte offsets: pre-commit reserves the intent's encoded size, so
//! two transactions never share an end LSN.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ember_error::{EmberError, Result};
use ember_types::{Lsn, Oid};
use tracing::{debug, trace};

/// Fixed per-record header charge when sizing an intent.
const RECORD_HEADER_BYTES: usize = 16;

// ---------------------------------------------------------------------------
// Log records / TxLog
// ---------------------------------------------------------------------------

/// What a log record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRecordKind {
    Insert,
    Update,
    Delete,
}

/// One logical operation in a transaction's intent.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub kind: LogRecordKind,
    /// Table (file) identifier.
    pub fid: u32,
    pub oid: Oid,
    pub payload: Vec<u8>,
}

impl LogRecord {
    fn encoded_len(&self) -> usize {
        RECORD_HEADER_BYTES + self.payload.len()
    }
}

/// A per-transaction log intent.
///
/// Accumulates records during execution; `pre_commit` stamps it with the
/// end LSN, after which it is either committed or discarded. Dropping an
/// unstamped intent is equivalent to discarding it.
#[derive(Debug, Default)]
pub struct TxLog {
    records: Vec<LogRecord>,
    end: Option<Lsn>,
}

impl TxLog {
    /// Append an insert record.
    pub fn log_insert(&mut self, fid: u32, oid: Oid, payload: &[u8]) {
        self.push(LogRecordKind::Insert, fid, oid, payload.to_vec());
    }

    /// Append an update record.
    pub fn log_update(&mut self, fid: u32, oid: Oid, payload: &[u8]) {
        self.push(LogRecordKind::Update, fid, oid, payload.to_vec());
    }

    /// Append a delete (tombstone) record.
    pub fn log_delete(&mut self, fid: u32, oid: Oid) {
        self.push(LogRecordKind::Delete, fid, oid, Vec::new());
    }

    fn push(&mut self, kind: LogRecordKind, fid: u32, oid: Oid, payload: Vec<u8>) {
        debug_assert!(self.end.is_none(), "intent already stamped");
        self.records.push(LogRecord {
            kind,
            fid,
            oid,
            payload,
        });
    }

    /// Number of records in the intent.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Encoded size of the intent in log bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.records.iter().map(LogRecord::encoded_len).sum()
    }

    /// The end LSN stamped at pre-commit, if any.
    #[must_use]
    pub const fn end(&self) -> Option<Lsn> {
        self.end
    }
}

// ---------------------------------------------------------------------------
// LogManager
// ---------------------------------------------------------------------------

/// Global log sequencer.
///
/// `cur_lsn` is the begin-stamp source; `pre_commit` is the commit
/// sequencer. Both are single atomic operations; the total order of end
/// LSNs is the commit order of the engine.
#[derive(Debug)]
pub struct LogManager {
    /// Next unissued byte offset. Starts past [`Lsn::INVALID`].
    next_lsn: AtomicU64,
    /// Set once the log stops accepting commits (shutdown).
    sealed: AtomicBool,
    commits: AtomicU64,
    discards: AtomicU64,
    committed_bytes: AtomicU64,
}

impl LogManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_lsn: AtomicU64::new(1),
            sealed: AtomicBool::new(false),
            commits: AtomicU64::new(0),
            discards: AtomicU64::new(0),
            committed_bytes: AtomicU64::new(0),
        }
    }

    /// A fresh, empty per-transaction intent.
    #[must_use]
    pub fn new_tx_log(&self) -> TxLog {
        TxLog::default()
    }

    /// The current log tail. Used as the begin stamp of new transactions.
    #[must_use]
    pub fn cur_lsn(&self) -> Lsn {
        Lsn::new(self.next_lsn.load(Ordering::Acquire))
    }

    /// Claim the end LSN for `intent`, entering it into the commit order.
    ///
    /// # Errors
    ///
    /// [`EmberError::LogPreCommitFailed`] once the log has been sealed by
    /// [`LogManager::seal`]; callers abort with reason `Internal`.
    pub fn pre_commit(&self, intent: &mut TxLog) -> Result<Lsn> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(EmberError::LogPreCommitFailed);
        }
        debug_assert!(intent.end.is_none(), "intent stamped twice");
        // Reserve at least one byte so every committer gets a distinct
        // offset, read-only transactions included.
        let len = intent.encoded_len().max(1) as u64;
        let start = self.next_lsn.fetch_add(len, Ordering::AcqRel);
        let end = Lsn::new(start + len);
        intent.end = Some(end);
        trace!(target: "ember_log", end = end.offset(), bytes = len, "pre-commit stamped");
        Ok(end)
    }

    /// Commit a stamped intent.
    pub fn commit(&self, intent: TxLog) {
        debug_assert!(intent.end.is_some(), "committing an unstamped intent");
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.committed_bytes
            .fetch_add(intent.encoded_len() as u64, Ordering::Relaxed);
        trace!(
            target: "ember_log",
            records = intent.record_count(),
            end = intent.end.map_or(0, Lsn::offset),
            "intent committed"
        );
    }

    /// Discard an intent (abort path). Valid for stamped and unstamped
    /// intents alike.
    pub fn discard(&self, intent: TxLog) {
        self.discards.fetch_add(1, Ordering::Relaxed);
        trace!(
            target: "ember_log",
            records = intent.record_count(),
            "intent discarded"
        );
    }

    /// Stop issuing commit LSNs. In-flight `pre_commit` calls that already
    /// reserved an offset are unaffected.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
        debug!(
            target: "ember_log",
            commits = self.commits.load(Ordering::Relaxed),
            discards = self.discards.load(Ordering::Relaxed),
            "log sealed"
        );
    }

    /// Committed-transaction count (diagnostics).
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }
}

impl Default for LogManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_lsns_are_distinct_and_increasing() {
        let log = LogManager::new();
        let begin = log.cur_lsn();

        let mut a = log.new_tx_log();
        a.log_insert(1, Oid::new(1), b"hello");
        let end_a = log.pre_commit(&mut a).unwrap();

        let mut b = log.new_tx_log();
        let end_b = log.pre_commit(&mut b).unwrap();

        assert!(end_a > begin);
        assert!(end_b > end_a);
        log.commit(a);
        log.commit(b);
        assert_eq!(log.commit_count(), 2);
    }

    #[test]
    fn begin_stamp_reflects_prior_commits() {
        let log = LogManager::new();
        let mut a = log.new_tx_log();
        a.log_update(1, Oid::new(9), b"payload");
        let end = log.pre_commit(&mut a).unwrap();
        log.commit(a);
        assert!(log.cur_lsn() >= end);
    }

    #[test]
    fn sealed_log_refuses_pre_commit() {
        let log = LogManager::new();
        log.seal();
        let mut intent = log.new_tx_log();
        assert_eq!(
            log.pre_commit(&mut intent),
            Err(EmberError::LogPreCommitFailed)
        );
    }

    #[test]
    fn empty_intent_still_gets_an_lsn() {
        let log = LogManager::new();
        let mut intent = log.new_tx_log();
        let end = log.pre_commit(&mut intent).unwrap();
        assert!(end.is_valid());
        log.discard(intent);
    }
}
