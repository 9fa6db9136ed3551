//! The per-transaction execution state.
//!
//! A [`Transaction`] is the handle application code threads through the
//! engine: it records the read set (in execution order; duplicates allowed,
//! the deepest read wins for stamp purposes) and the write set (keyed by
//! the overwritten version, inserts keyed by their own new version), and it
//! pins an epoch read-side region for its whole lifetime.
//!
//! All published state — begin/end stamps, SSN stamps, the state machine —
//! lives in the transaction's context-table slot so remote transactions can
//! inspect it; this struct only holds what is private to the owner.

use std::collections::HashMap;
use std::sync::Arc;

use ember_log::TxLog;
use ember_types::{Lsn, Oid, TxnFlags, VersionIdx, Xid};
use smallvec::SmallVec;

use crate::engine::Table;
use crate::epoch::EpochGuard;

/// One tracked read: the committed version observed, its OID and table.
#[derive(Debug, Clone)]
pub(crate) struct ReadEntry {
    pub tuple: VersionIdx,
    pub oid: Oid,
    pub table: Arc<Table>,
}

/// One installed write. `is_insert` means the entry is keyed by its own
/// `new` version (there is no overwritten predecessor).
#[derive(Debug, Clone)]
pub(crate) struct WriteEntry {
    pub new: VersionIdx,
    pub oid: Oid,
    pub table: Arc<Table>,
    pub is_insert: bool,
}

/// A live transaction handle.
///
/// Obtained from `Engine::begin`; resolved by `Engine::commit` or
/// `Engine::abort`. Dropping an unresolved transaction is a programming
/// error (it would leak its context slot) and is reported loudly.
#[derive(Debug)]
pub struct Transaction {
    pub(crate) xid: Xid,
    pub(crate) flags: TxnFlags,
    pub(crate) begin: Lsn,
    pub(crate) log: Option<TxLog>,
    pub(crate) read_set: SmallVec<[ReadEntry; 8]>,
    pub(crate) write_set: HashMap<VersionIdx, WriteEntry>,
    /// Reader-list slot, claimed lazily at the first tracked read.
    pub(crate) reader_slot: Option<u32>,
    /// Epoch pin held for the transaction's lifetime.
    pub(crate) guard: Option<EpochGuard>,
    pub(crate) resolved: bool,
    /// Terminal state once resolved.
    pub(crate) outcome: Option<ember_types::TxnState>,
}

impl Transaction {
    pub(crate) fn new(xid: Xid, flags: TxnFlags, begin: Lsn, log: TxLog, guard: EpochGuard) -> Self {
        Self {
            xid,
            flags,
            begin,
            log: Some(log),
            read_set: SmallVec::new(),
            write_set: HashMap::new(),
            reader_slot: None,
            guard: Some(guard),
            resolved: false,
            outcome: None,
        }
    }

    /// This transaction's identifier.
    #[must_use]
    pub const fn xid(&self) -> Xid {
        self.xid
    }

    /// Begin stamp.
    #[must_use]
    pub const fn begin(&self) -> Lsn {
        self.begin
    }

    /// Behavior flags.
    #[must_use]
    pub const fn flags(&self) -> TxnFlags {
        self.flags
    }

    /// Whether the transaction has been committed or aborted.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.resolved
    }

    #[must_use]
    pub fn read_set_len(&self) -> usize {
        self.read_set.len()
    }

    #[must_use]
    pub fn write_set_len(&self) -> usize {
        self.write_set.len()
    }

    /// Find the write-set key whose entry installed `new` (used by the
    /// self-overwrite collapse to re-point the surviving entry).
    pub(crate) fn write_key_of_new(&self, new: VersionIdx) -> Option<VersionIdx> {
        self.write_set
            .iter()
            .find(|(_, entry)| entry.new == new)
            .map(|(&key, _)| key)
    }

    /// Whether `tuple` is shadowed by one of this transaction's writes.
    pub(crate) fn is_shadowed(&self, tuple: VersionIdx) -> bool {
        self.write_set.contains_key(&tuple)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.resolved {
            tracing::error!(
                target: "ember_mvcc::txn",
                xid = %self.xid,
                "transaction dropped without commit or abort; context slot leaked"
            );
            debug_assert!(self.resolved, "transaction dropped unresolved");
        }
    }
}
