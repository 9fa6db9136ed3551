//! The version record: one committed or in-flight tuple version.
//!
//! A version's identity on a chain is its arena index; the record itself
//! carries the three SSN stamps, the reader bitmap word, the `next` link,
//! and the payload. Field discipline:
//!
//! - `clsn` is `Xid`-tagged while in flight and retagged to `Log` by the
//!   creator's post-commit with a single release store. A successor cannot
//!   observe the retag before the creator reached `Committing`.
//! - `sstamp` is written exactly once, by the successor's post-commit.
//! - `xstamp` only moves up, through a CAS-max.
//! - `next` is written by the owning transaction before the version is
//!   published and afterwards only truncated by GC pruning.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use ember_types::{AtomicFatPtr, FatPtr, Lsn, Xid};

/// One version on a chain. `data == None` is a tombstone: visible to
/// traversal, reported as not-found by reads.
#[derive(Debug)]
pub struct Version {
    /// Creator stamp: `Xid` while in flight, `Log(commit LSN)` after
    /// post-commit.
    clsn: AtomicFatPtr,
    /// Commit LSN of the overwriter; 0 while no overwriter has committed.
    sstamp: AtomicU64,
    /// Largest commit LSN of any reader of this version.
    xstamp: AtomicU64,
    /// Reader bitmap word; bit 31 is the pessimistic flag.
    readers: AtomicU32,
    /// Next-older version on the chain (`Addr`) or `Null`.
    next: AtomicFatPtr,
    data: Option<Box<[u8]>>,
}

impl Version {
    /// A fresh in-flight version owned by `creator`.
    #[must_use]
    pub fn in_flight(creator: Xid, data: Option<Box<[u8]>>) -> Self {
        Self {
            clsn: AtomicFatPtr::new(FatPtr::from_xid(creator)),
            sstamp: AtomicU64::new(0),
            xstamp: AtomicU64::new(0),
            readers: AtomicU32::new(0),
            next: AtomicFatPtr::null(),
            data,
        }
    }

    /// Creator stamp word.
    #[inline]
    pub fn clsn(&self) -> FatPtr {
        self.clsn.load(Ordering::Acquire)
    }

    /// Retag the creator stamp to the committed LSN. Called once, by the
    /// creator's post-commit, after its state reached `Committed`.
    pub fn set_clsn_committed(&self, commit: Lsn) {
        self.clsn.store(FatPtr::from_lsn(commit), Ordering::Release);
    }

    /// Successor stamp; 0 means no overwriter has committed yet.
    #[inline]
    pub fn sstamp(&self) -> u64 {
        self.sstamp.load(Ordering::Acquire)
    }

    /// Install the successor stamp. Written once, by the overwriter's
    /// post-commit.
    pub fn set_sstamp(&self, sstamp: u64) {
        debug_assert_ne!(sstamp, 0);
        self.sstamp.store(sstamp, Ordering::Release);
    }

    /// Reader stamp: largest commit LSN of any reader so far.
    #[inline]
    pub fn xstamp(&self) -> u64 {
        self.xstamp.load(Ordering::Acquire)
    }

    /// Raise `xstamp` to `to` if it is currently lower (monotonic max).
    pub fn advance_xstamp(&self, to: u64) {
        let mut cur = self.xstamp.load(Ordering::Acquire);
        while cur < to {
            match self
                .xstamp
                .compare_exchange_weak(cur, to, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Next-older version on the chain.
    #[inline]
    pub fn next(&self) -> FatPtr {
        self.next.load(Ordering::Acquire)
    }

    /// Link the next-older version. Owner-only, before publication (or by
    /// GC truncating a committed tail).
    pub fn set_next(&self, next: FatPtr) {
        self.next.store(next, Ordering::Release);
    }

    /// The reader bitmap word (manipulated by the reader list).
    #[inline]
    pub(crate) fn readers_word(&self) -> &AtomicU32 {
        &self.readers
    }

    /// Payload bytes; `None` for a tombstone.
    #[inline]
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    #[inline]
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.data.is_none()
    }

    /// Payload size in bytes (0 for tombstones).
    #[inline]
    #[must_use]
    pub fn size(&self) -> u32 {
        self.data.as_ref().map_or(0, |d| d.len() as u32)
    }
}
