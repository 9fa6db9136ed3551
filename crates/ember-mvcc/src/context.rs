//! The transaction context table.
//!
//! A fixed array of per-transaction contexts, one live transaction per
//! slot. The `owner` word doubles as the generation check: a slot is free
//! while `owner == 0`, mid-claim while the claiming sentinel is set, and
//! owned while it holds the packed XID of the occupant. Readers of a remote
//! context copy the fields they need, then re-read `owner`; a mismatch
//! means the slot was recycled and the copies are garbage. That pattern is
//! mandatory on every cross-transaction inspection and is packaged here as
//! [`XidTable::snapshot`].
//!
//! Claiming is three steps so the publish is clean: CAS `owner` from 0 to
//! the claiming sentinel, initialize every field, then release-store the
//! real XID. A reader that observes `owner == xid` therefore observes
//! initialized fields.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use ember_error::{EmberError, Result};
use ember_types::{Lsn, TxnState, Xid};
use tracing::trace;

/// Sentinel stored in `owner` between the claim CAS and the publish store.
/// Real packed XIDs fit in 48 bits, so bit 63 can never collide.
const CLAIMING: u64 = 1 << 63;

// ---------------------------------------------------------------------------
// CacheAligned
// ---------------------------------------------------------------------------

/// Forces cache-line alignment so adjacent contexts in the table never
/// share a line.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct CacheAligned<T>(pub T);

impl<T> std::ops::Deref for CacheAligned<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// XidContext
// ---------------------------------------------------------------------------

/// Published state of one live transaction.
///
/// All fields are owner-written; remote readers go through
/// [`XidTable::snapshot`] or re-check `owner` themselves.
#[derive(Debug, Default)]
pub struct XidContext {
    /// 0 = free; `CLAIMING` sentinel mid-claim; packed XID when owned.
    owner: AtomicU64,
    /// Begin stamp (LSN offset).
    begin: AtomicU64,
    /// End stamp; 0 until pre-commit claims one.
    end: AtomicU64,
    /// Largest predecessor commit stamp seen so far.
    pstamp: AtomicU64,
    /// Smallest successor commit stamp seen so far.
    sstamp: AtomicU64,
    /// [`TxnState`] discriminant.
    state: AtomicU8,
    /// Next generation seed for this slot.
    generation: AtomicU32,
}

impl XidContext {
    #[inline]
    pub fn state(&self) -> TxnState {
        TxnState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(TxnState::Aborted)
    }

    #[inline]
    pub fn set_state(&self, state: TxnState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    #[inline]
    pub fn begin(&self) -> Lsn {
        Lsn::new(self.begin.load(Ordering::Acquire))
    }

    #[inline]
    pub fn end(&self) -> Lsn {
        Lsn::new(self.end.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_end(&self, end: Lsn) {
        self.end.store(end.offset(), Ordering::Release);
    }

    #[inline]
    pub fn pstamp(&self) -> u64 {
        self.pstamp.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_pstamp(&self, pstamp: u64) {
        self.pstamp.store(pstamp, Ordering::Release);
    }

    #[inline]
    pub fn sstamp(&self) -> u64 {
        self.sstamp.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_sstamp(&self, sstamp: u64) {
        self.sstamp.store(sstamp, Ordering::Release);
    }

    #[inline]
    fn owner(&self) -> u64 {
        self.owner.load(Ordering::Acquire)
    }
}

/// Owner-checked copy of a remote context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtxSnapshot {
    pub state: TxnState,
    pub begin: Lsn,
    pub end: Lsn,
}

/// Outcome of waiting for a committing transaction to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitWaitOutcome {
    /// Left `Committing` into `Committed`, or the spin bound was exceeded
    /// (the conservative answer: treating an undecided peer as committed
    /// can only cause false aborts, never a wrong commit).
    Committed,
    /// Left `Committing` into `Aborted`.
    Aborted,
    /// The slot was recycled mid-wait; the transaction is finished but its
    /// outcome is unknown.
    Gone,
}

// ---------------------------------------------------------------------------
// XidTable
// ---------------------------------------------------------------------------

/// Fixed-size registry of live transactions.
#[derive(Debug)]
pub struct XidTable {
    slots: Box<[CacheAligned<XidContext>]>,
    cursor: AtomicUsize,
}

impl XidTable {
    /// A table with `slot_count` contexts (at most 2^16; the slot index
    /// must pack into a 16-bit XID field).
    #[must_use]
    pub fn new(slot_count: usize) -> Self {
        assert!(slot_count >= 2 && slot_count <= 1 << 16);
        let slots = (0..slot_count)
            .map(|_| CacheAligned(XidContext::default()))
            .collect();
        Self {
            slots,
            cursor: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Claim a slot and publish a fresh context.
    ///
    /// # Errors
    ///
    /// [`EmberError::TxnSlotsExhausted`] when every slot is owned.
    pub fn alloc(&self, begin: Lsn) -> Result<Xid> {
        let len = self.slots.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for probe in 0..len {
            let slot_idx = (start + probe) % len;
            let ctx = &self.slots[slot_idx].0;
            if ctx
                .owner
                .compare_exchange(0, CLAIMING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            // Slot is ours; generation bump is exclusive now.
            let generation = ctx.generation.fetch_add(1, Ordering::Relaxed) + 1;
            let xid = Xid::new(slot_idx as u16, generation);
            ctx.begin.store(begin.offset(), Ordering::Relaxed);
            ctx.end.store(Lsn::INVALID.offset(), Ordering::Relaxed);
            ctx.pstamp.store(0, Ordering::Relaxed);
            ctx.sstamp.store(u64::MAX, Ordering::Relaxed);
            ctx.state
                .store(TxnState::Embryo.as_u8(), Ordering::Relaxed);
            ctx.owner.store(xid.raw(), Ordering::Release);
            trace!(target: "ember_mvcc::context", %xid, begin = begin.offset(), "context claimed");
            return Ok(xid);
        }
        Err(EmberError::TxnSlotsExhausted)
    }

    /// Release `xid`'s slot. Must be called by the owner, after the
    /// transaction reached a terminal state and finished post-commit.
    pub fn free(&self, xid: Xid) {
        let ctx = self.ctx(xid);
        debug_assert_eq!(ctx.owner(), xid.raw(), "freeing a slot we do not own");
        debug_assert!(ctx.state().is_terminal());
        ctx.owner.store(0, Ordering::Release);
        trace!(target: "ember_mvcc::context", %xid, "context released");
    }

    /// The context behind `xid`'s slot. The returned reference is valid
    /// storage regardless of recycling; only the owner may write through
    /// it, and remote readers must apply the owner-check pattern.
    #[inline]
    #[must_use]
    pub fn ctx(&self, xid: Xid) -> &XidContext {
        &self.slots[xid.slot() as usize].0
    }

    /// Owner-checked copy of `xid`'s context. `None` when the slot no
    /// longer (or not yet) belongs to `xid`.
    #[must_use]
    pub fn snapshot(&self, xid: Xid) -> Option<CtxSnapshot> {
        let ctx = self.ctx(xid);
        if ctx.owner() != xid.raw() {
            return None;
        }
        let snap = CtxSnapshot {
            state: ctx.state(),
            begin: ctx.begin(),
            end: ctx.end(),
        };
        // Re-check after copying; a mismatch means the copies may mix two
        // occupancies.
        if ctx.owner() != xid.raw() {
            return None;
        }
        Some(snap)
    }

    /// Spin until `xid` leaves `Committing`, bounded by `spin_limit`.
    pub fn wait_for_commit_result(&self, xid: Xid, spin_limit: u32) -> CommitWaitOutcome {
        let ctx = self.ctx(xid);
        for _ in 0..spin_limit {
            if ctx.owner() != xid.raw() {
                return CommitWaitOutcome::Gone;
            }
            match ctx.state() {
                TxnState::Committing => std::hint::spin_loop(),
                TxnState::Committed => return CommitWaitOutcome::Committed,
                TxnState::Aborted => return CommitWaitOutcome::Aborted,
                // Not in pre-commit at all; treat as settled-elsewhere.
                _ => return CommitWaitOutcome::Gone,
            }
        }
        trace!(
            target: "ember_mvcc::context",
            %xid,
            spin_limit,
            "commit-result spin bound exceeded, taking conservative answer"
        );
        CommitWaitOutcome::Committed
    }

    /// Smallest begin stamp among live transactions; `None` when idle.
    /// This is the GC horizon input.
    #[must_use]
    pub fn min_active_begin(&self) -> Option<Lsn> {
        let mut min: Option<Lsn> = None;
        for slot in self.slots.iter() {
            let ctx = &slot.0;
            let owner = ctx.owner();
            if owner == 0 || owner & CLAIMING != 0 {
                continue;
            }
            let Some(xid) = Xid::from_raw(owner) else {
                continue;
            };
            let Some(snap) = self.snapshot(xid) else {
                continue;
            };
            if snap.state.is_terminal() {
                continue;
            }
            if snap.begin.is_valid() && min.is_none_or(|m| snap.begin < m) {
                min = Some(snap.begin);
            }
        }
        min
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_publishes_initialized_context() {
        let table = XidTable::new(4);
        let xid = table.alloc(Lsn::new(10)).unwrap();
        let snap = table.snapshot(xid).unwrap();
        assert_eq!(snap.state, TxnState::Embryo);
        assert_eq!(snap.begin, Lsn::new(10));
        assert!(!snap.end.is_valid());
        assert_eq!(table.ctx(xid).sstamp(), u64::MAX);
        assert_eq!(table.ctx(xid).pstamp(), 0);
    }

    #[test]
    fn snapshot_of_recycled_slot_is_rejected() {
        let table = XidTable::new(2);
        let first = table.alloc(Lsn::new(5)).unwrap();
        table.ctx(first).set_state(TxnState::Aborted);
        table.free(first);

        // Burn slots until the same slot is re-claimed.
        let mut reused = None;
        for _ in 0..4 {
            let next = table.alloc(Lsn::new(7)).unwrap();
            if next.slot() == first.slot() {
                reused = Some(next);
                break;
            }
            table.ctx(next).set_state(TxnState::Aborted);
            table.free(next);
        }
        let reused = reused.expect("slot was never reused");

        assert_ne!(first.raw(), reused.raw());
        assert!(table.snapshot(first).is_none(), "stale XID must not resolve");
        assert!(table.snapshot(reused).is_some());
    }

    #[test]
    fn exhaustion_is_an_error_not_a_hang() {
        let table = XidTable::new(2);
        let a = table.alloc(Lsn::new(1)).unwrap();
        let b = table.alloc(Lsn::new(1)).unwrap();
        assert_eq!(
            table.alloc(Lsn::new(1)),
            Err(EmberError::TxnSlotsExhausted)
        );
        table.ctx(a).set_state(TxnState::Aborted);
        table.free(a);
        assert!(table.alloc(Lsn::new(2)).is_ok());
        let _ = b;
    }

    #[test]
    fn wait_for_commit_result_sees_settlement() {
        let table = XidTable::new(2);
        let xid = table.alloc(Lsn::new(1)).unwrap();
        let ctx = table.ctx(xid);
        ctx.set_state(TxnState::Committing);
        ctx.set_end(Lsn::new(42));
        ctx.set_state(TxnState::Committed);
        assert_eq!(
            table.wait_for_commit_result(xid, 64),
            CommitWaitOutcome::Committed
        );
    }

    #[test]
    fn bounded_wait_returns_conservative_commit() {
        let table = XidTable::new(2);
        let xid = table.alloc(Lsn::new(1)).unwrap();
        table.ctx(xid).set_state(TxnState::Committing);
        // Never settles; the bound must fire with the safe answer.
        assert_eq!(
            table.wait_for_commit_result(xid, 8),
            CommitWaitOutcome::Committed
        );
    }

    #[test]
    fn min_active_begin_tracks_live_transactions() {
        let table = XidTable::new(4);
        assert_eq!(table.min_active_begin(), None);

        let a = table.alloc(Lsn::new(30)).unwrap();
        let b = table.alloc(Lsn::new(20)).unwrap();
        assert_eq!(table.min_active_begin(), Some(Lsn::new(20)));

        table.ctx(b).set_state(TxnState::Aborted);
        table.free(b);
        assert_eq!(table.min_active_begin(), Some(Lsn::new(30)));
        let _ = a;
    }
}
