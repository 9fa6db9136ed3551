//! The object vector: OID allocation and version-chain head words.
//!
//! One vector per table. Each allocated OID owns a single `AtomicU64` head
//! word holding the newest version of its chain (`Addr`-tagged) or `Null`.
//! Heads move only by CAS, with one exception: the self-overwrite collapse,
//! where the owning transaction already holds the in-flight head and may
//! plain-store the replacement. Every failed CAS returns control to the
//! caller, which re-reads the head and re-runs its visibility/conflict
//! logic.
//!
//! OIDs come from a global monotonic counter in per-thread extent windows;
//! the backing store grows ahead of the counter with at least 10% headroom,
//! publishing fresh chunks under a single grow lock while readers keep
//! using the chunks already published.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ember_error::{EmberError, Result};
use ember_types::{AtomicFatPtr, FatPtr, Lsn, Oid, PtrTag, TxnState, VersionIdx, Xid};
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::arena::VersionArena;
use crate::context::XidTable;
use crate::tuple::Version;

/// Head words per chunk.
const HEAD_CHUNK_SIZE: u64 = 1 << 16;

/// Traversal restarts tolerated before a read is declared unstable.
const MAX_TRAVERSAL_RESTARTS: u32 = 64;

static NEXT_VECTOR_UID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Per-thread OID windows, keyed by object-vector uid.
    static OID_WINDOWS: RefCell<HashMap<u64, OidWindow>> = RefCell::new(HashMap::new());
}

#[derive(Debug, Default, Clone, Copy)]
struct OidWindow {
    next: u64,
    remaining: u32,
}

#[derive(Debug)]
struct HeadChunk {
    words: Box<[AtomicFatPtr]>,
}

impl HeadChunk {
    fn new() -> Self {
        let words = (0..HEAD_CHUNK_SIZE).map(|_| AtomicFatPtr::null()).collect();
        Self { words }
    }
}

/// Grow-only map from OID to version-chain head.
#[derive(Debug)]
pub struct ObjectVector {
    uid: u64,
    chunks: RwLock<Vec<Arc<HeadChunk>>>,
    capacity: AtomicU64,
    grow: Mutex<()>,
    next_oid: AtomicU64,
    extent: u32,
}

impl ObjectVector {
    /// A vector handing out OIDs in windows of `extent`.
    #[must_use]
    pub fn new(extent: u32) -> Self {
        let vector = Self {
            uid: NEXT_VECTOR_UID.fetch_add(1, Ordering::Relaxed),
            chunks: RwLock::new(Vec::new()),
            capacity: AtomicU64::new(0),
            grow: Mutex::new(()),
            next_oid: AtomicU64::new(0),
            extent: extent.max(1),
        };
        vector.ensure_capacity(u64::from(vector.extent));
        vector
    }

    /// OIDs handed out so far (upper bound; windows may be partially used).
    #[must_use]
    pub fn allocated_hint(&self) -> u64 {
        self.next_oid.load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------
    // OID allocation
    // -------------------------------------------------------------------

    /// Allocate the next OID from this thread's window, fetching a fresh
    /// extent from the global counter when the window is empty. OIDs are
    /// dense globally but not per thread, and are never reused.
    pub fn alloc_oid(&self) -> Oid {
        OID_WINDOWS.with(|windows| {
            let mut windows = windows.borrow_mut();
            let window = windows.entry(self.uid).or_default();
            if window.remaining == 0 {
                let start = self
                    .next_oid
                    .fetch_add(u64::from(self.extent), Ordering::AcqRel);
                assert!(
                    start + u64::from(self.extent) <= u64::from(u32::MAX) + 1,
                    "OID space exhausted"
                );
                self.ensure_capacity(start + u64::from(self.extent));
                window.next = start;
                window.remaining = self.extent;
            }
            let oid = window.next;
            window.next += 1;
            window.remaining -= 1;
            Oid::new(oid as u32)
        })
    }

    /// Extend the backing store to cover `upto` words plus ≥10% headroom.
    fn ensure_capacity(&self, upto: u64) {
        if self.capacity.load(Ordering::Acquire) >= upto {
            return;
        }
        let _grow = self.grow.lock();
        let current = self.capacity.load(Ordering::Acquire);
        if current >= upto {
            return;
        }
        let target = upto + upto / 10;
        let chunks_needed = target.div_ceil(HEAD_CHUNK_SIZE) as usize;
        let mut chunks = self.chunks.write();
        while chunks.len() < chunks_needed {
            chunks.push(Arc::new(HeadChunk::new()));
        }
        let new_capacity = chunks.len() as u64 * HEAD_CHUNK_SIZE;
        drop(chunks);
        self.capacity.store(new_capacity, Ordering::Release);
        trace!(
            target: "ember_mvcc::store",
            uid = self.uid,
            capacity = new_capacity,
            "object vector grown"
        );
    }

    // -------------------------------------------------------------------
    // Head-word access
    // -------------------------------------------------------------------

    fn chunk_for(&self, oid: Oid) -> Arc<HeadChunk> {
        let chunk_idx = (u64::from(oid.get()) / HEAD_CHUNK_SIZE) as usize;
        let chunks = self.chunks.read();
        Arc::clone(&chunks[chunk_idx])
    }

    fn with_head<R>(&self, oid: Oid, f: impl FnOnce(&AtomicFatPtr) -> R) -> R {
        let chunk = self.chunk_for(oid);
        let offset = (u64::from(oid.get()) % HEAD_CHUNK_SIZE) as usize;
        f(&chunk.words[offset])
    }

    /// Current head word of `oid`'s chain.
    #[must_use]
    pub fn load_head(&self, oid: Oid) -> FatPtr {
        self.with_head(oid, |head| head.load(Ordering::Acquire))
    }

    /// CAS the head word. On failure returns the observed word.
    pub fn cas_head(&self, oid: Oid, current: FatPtr, new: FatPtr) -> std::result::Result<(), FatPtr> {
        self.with_head(oid, |head| {
            head.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
                .map(|_| ())
        })
    }

    // -------------------------------------------------------------------
    // Chain installation
    // -------------------------------------------------------------------

    /// Install the first version of a fresh OID: CAS `Null -> Addr(new)`.
    /// Failure means another transaction inserted first.
    pub fn install_insert(&self, oid: Oid, new: VersionIdx) -> bool {
        self.cas_head(oid, FatPtr::NULL, FatPtr::from_addr(new, ember_types::INVALID_SIZE_CODE))
            .is_ok()
    }

    /// Normal update install: link `new.next = old_head`, then CAS the
    /// head. Failure returns control to the caller for a fresh conflict
    /// check.
    pub fn install_update(
        &self,
        arena: &VersionArena,
        oid: Oid,
        old_head: FatPtr,
        new: VersionIdx,
    ) -> bool {
        let new_version = arena.get(new).expect("installing an unallocated version");
        new_version.set_next(old_head);
        self.cas_head(
            oid,
            old_head,
            FatPtr::from_addr(new, ember_types::INVALID_SIZE_CODE),
        )
        .is_ok()
    }

    /// Self-overwrite collapse: the caller owns the current in-flight head
    /// `old`, so the superseded version is skipped (`new.next = old.next`)
    /// and the head is plain-stored.
    pub fn collapse_self(&self, arena: &VersionArena, oid: Oid, old: VersionIdx, new: VersionIdx) {
        let old_version = arena.get(old).expect("collapsing an unallocated version");
        let new_version = arena.get(new).expect("installing an unallocated version");
        new_version.set_next(old_version.next());
        self.with_head(oid, |head| {
            debug_assert_eq!(head.load(Ordering::Acquire).as_addr(), Some(old));
            head.store(
                FatPtr::from_addr(new, ember_types::INVALID_SIZE_CODE),
                Ordering::Release,
            );
        });
    }

    /// Unlink the head version (abort path / insert-loser cleanup). The
    /// head is guaranteed to be the only in-flight version of the chain,
    /// so the CAS cannot legitimately fail.
    ///
    /// # Errors
    ///
    /// [`EmberError::InvariantViolation`] if the head is not `expected`.
    pub fn unlink_head(&self, arena: &VersionArena, oid: Oid, expected: VersionIdx) -> Result<()> {
        let head = self.load_head(oid);
        if head.as_addr() != Some(expected) {
            return Err(EmberError::InvariantViolation {
                detail: format!("unlink of {oid}: head {head:?} is not the expected {expected}"),
            });
        }
        let version = arena.get(expected).ok_or_else(|| EmberError::InvariantViolation {
            detail: format!("unlink of {oid}: head {expected} is unresolvable"),
        })?;
        self.cas_head(oid, head, version.next())
            .map_err(|seen| EmberError::InvariantViolation {
                detail: format!("unlink of {oid}: head moved to {seen:?} under the owner"),
            })
    }

    // -------------------------------------------------------------------
    // Traversal
    // -------------------------------------------------------------------

    /// Walk `oid`'s chain newest-to-oldest and return the version visible
    /// to a transaction that began at `begin`, applying the read-committed
    /// spin policy to in-flight versions when enabled.
    ///
    /// # Errors
    ///
    /// An abort-worthy [`EmberError::TransactionAborted`] with reason
    /// `UnstableRead` when the traversal keeps observing torn state past
    /// its restart budget.
    pub fn fetch_version(
        &self,
        arena: &VersionArena,
        contexts: &XidTable,
        oid: Oid,
        reader: Xid,
        begin: Lsn,
        read_committed_spin: bool,
        spin_limit: u32,
    ) -> Result<Option<(VersionIdx, Arc<Version>)>> {
        'restart: for _ in 0..MAX_TRAVERSAL_RESTARTS {
            let mut cur = self.load_head(oid);
            loop {
                let idx = match cur.tag() {
                    PtrTag::Null => return Ok(None),
                    PtrTag::Addr => cur.as_addr().expect("Addr word carries an index"),
                    _ => {
                        return Err(EmberError::InvariantViolation {
                            detail: format!("chain word of {oid} has tag {cur:?}"),
                        })
                    }
                };
                let Some(version) = arena.get(idx) else {
                    // The word went stale under us; start over from the head.
                    continue 'restart;
                };
                if self.judge_visibility(
                    contexts,
                    &version,
                    reader,
                    begin,
                    read_committed_spin,
                    spin_limit,
                )? {
                    return Ok(Some((idx, version)));
                }
                cur = version.next();
            }
        }
        Err(EmberError::aborted(ember_types::AbortReason::UnstableRead))
    }

    /// Visibility verdict for one version.
    fn judge_visibility(
        &self,
        contexts: &XidTable,
        version: &Version,
        reader: Xid,
        begin: Lsn,
        read_committed_spin: bool,
        spin_limit: u32,
    ) -> Result<bool> {
        let mut rounds: u32 = 0;
        loop {
            let clsn = version.clsn();
            match clsn.tag() {
                PtrTag::Log => {
                    let lsn = clsn.as_lsn().expect("Log word carries an LSN");
                    return Ok(lsn <= begin);
                }
                PtrTag::Xid => {
                    let owner = clsn.as_xid().expect("Xid word carries an XID");
                    if owner == reader {
                        // Read-own-writes.
                        return Ok(true);
                    }
                    let Some(snap) = contexts.snapshot(owner) else {
                        // Slot recycled: the creator finished. A committed
                        // creator retagged before releasing its slot, so
                        // re-reading settles this; an aborted one is mid-
                        // unlink and the version is simply not visible.
                        rounds += 1;
                        if rounds > spin_limit {
                            return Ok(false);
                        }
                        std::hint::spin_loop();
                        continue;
                    };
                    match snap.state {
                        TxnState::Committed => {
                            return Ok(snap.end.is_valid() && snap.end <= begin);
                        }
                        TxnState::Committing if read_committed_spin => {
                            rounds += 1;
                            if rounds > spin_limit {
                                return Ok(false);
                            }
                            std::hint::spin_loop();
                            continue;
                        }
                        _ => return Ok(false),
                    }
                }
                _ => {
                    return Err(EmberError::InvariantViolation {
                        detail: format!("creator stamp has tag {clsn:?}"),
                    })
                }
            }
        }
    }

    /// Find the overwriter of the committed version stamped `rlsn`.
    ///
    /// Walks from the chain head keeping the previously visited element;
    /// XID-tagged entries are skipped for matching purposes. The first
    /// LOG entry with `clsn == rlsn` identifies the read version, and the
    /// previously visited element (whatever its tag) is its overwriter.
    /// `None` when the read version is still the head, or the chain moved.
    #[must_use]
    pub fn fetch_overwriter(
        &self,
        arena: &VersionArena,
        oid: Oid,
        rlsn: Lsn,
    ) -> Option<(VersionIdx, Arc<Version>)> {
        let mut prev: Option<(VersionIdx, Arc<Version>)> = None;
        let mut cur = self.load_head(oid);
        while let Some(idx) = cur.as_addr() {
            let version = arena.get(idx)?;
            if let Some(lsn) = version.clsn().as_lsn() {
                if lsn == rlsn {
                    return prev;
                }
                if lsn < rlsn {
                    // Chains are strictly decreasing in LSN; we passed it.
                    return None;
                }
            }
            cur = version.next();
            prev = Some((idx, version));
        }
        None
    }
}
