//! The reader list: bounded tracking of which transactions read a version.
//!
//! A global table of reader slots holds the XIDs of transactions currently
//! registered as readers anywhere; each version's bitmap word marks, per
//! slot, whether that transaction read this version. Writers enumerate the
//! set bits at commit time to learn their predecessors.
//!
//! Capacity is deliberately bounded. A transaction that cannot claim a
//! slot still has its reads honored: registration then sets the tuple's
//! *pessimistic* bit, and a writer that sees it assumes the version was
//! read by a transaction that committed just before it
//! (`pstamp = cstamp - 1`). Correctness never depends on bitmap capacity,
//! only precision does.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

use ember_types::Xid;
use tracing::trace;

use crate::metrics::GLOBAL_ENGINE_METRICS;
use crate::tuple::Version;

/// Tuple bitmap bit marking "read by an unknown set".
pub const PESSIMISTIC_BIT: u32 = 1 << 31;

thread_local! {
    /// Core-sticky claim hint: the slot this thread claimed last.
    static SLOT_HINT: Cell<u32> = const { Cell::new(0) };
}

/// How a read registration was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A bitmap bit now names this transaction precisely.
    Tracked,
    /// Capacity was exhausted; the tuple is marked pessimistic instead.
    Pessimistic,
}

/// Global reader-slot table plus the per-tuple bitmap operations.
#[derive(Debug)]
pub struct ReaderSlots {
    xids: Box<[AtomicU64]>,
    width: u32,
}

impl ReaderSlots {
    /// A table of `width` slots (the per-tuple bitmap width; at most 24).
    #[must_use]
    pub fn new(width: u32) -> Self {
        assert!(width >= 1 && width <= crate::config::MAX_READER_SLOTS);
        let xids = (0..width).map(|_| AtomicU64::new(0)).collect();
        Self { xids, width }
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Claim a slot for `xid`, preferring this thread's last slot.
    /// `None` when every slot is held by a live reader.
    #[must_use]
    pub fn claim(&self, xid: Xid) -> Option<u32> {
        let hint = SLOT_HINT.get() % self.width;
        for probe in 0..self.width {
            let slot = (hint + probe) % self.width;
            if self.xids[slot as usize]
                .compare_exchange(0, xid.raw(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                SLOT_HINT.set(slot);
                trace!(target: "ember_mvcc::readers", %xid, slot, "reader slot claimed");
                return Some(slot);
            }
        }
        None
    }

    /// Release a slot claimed by `xid`.
    pub fn release(&self, slot: u32, xid: Xid) {
        let swapped = self.xids[slot as usize]
            .compare_exchange(xid.raw(), 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        debug_assert!(swapped, "releasing a reader slot we do not hold");
    }

    /// Raw XID word in `slot`; 0 when unclaimed. Enumerators must re-check
    /// through the context table's owner pattern before trusting it.
    #[must_use]
    pub fn xid_at(&self, slot: u32) -> u64 {
        self.xids[slot as usize].load(Ordering::Acquire)
    }

    /// Record a read of `tuple` by the transaction holding `slot`.
    pub fn register(&self, tuple: &Version, slot: Option<u32>) -> Registration {
        match slot {
            Some(slot) => {
                tuple
                    .readers_word()
                    .fetch_or(1 << slot, Ordering::AcqRel);
                Registration::Tracked
            }
            None => {
                tuple
                    .readers_word()
                    .fetch_or(PESSIMISTIC_BIT, Ordering::AcqRel);
                GLOBAL_ENGINE_METRICS.record_pessimistic_mark();
                trace!(target: "ember_mvcc::readers", "reader capacity exhausted; tuple marked pessimistic");
                Registration::Pessimistic
            }
        }
    }

    /// Remove the `slot` bit from `tuple`'s bitmap.
    pub fn deregister(&self, tuple: &Version, slot: u32) {
        tuple
            .readers_word()
            .fetch_and(!(1 << slot), Ordering::AcqRel);
    }

    /// Copy of `tuple`'s bitmap word.
    #[must_use]
    pub fn bitmap(&self, tuple: &Version) -> u32 {
        tuple.readers_word().load(Ordering::Acquire)
    }

    /// Whether a bitmap word carries the pessimistic flag.
    #[inline]
    #[must_use]
    pub const fn is_pessimistic(word: u32) -> bool {
        word & PESSIMISTIC_BIT != 0
    }

    /// Iterate the reader slots set in a bitmap word, lowest first.
    pub fn slots_in(&self, word: u32) -> impl Iterator<Item = u32> {
        let mut bits = word & ((1 << self.width) - 1);
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let slot = bits.trailing_zeros();
            bits &= bits - 1;
            Some(slot)
        })
    }
}
