//! Process-wide storage for version records.
//!
//! Chains address versions by [`VersionIdx`], not by pointer; the arena
//! resolves an index to its record. Slot recycling is the safety-critical
//! path: an index decoded from a chain word must resolve to the record it
//! named for as long as the decoding reader stays pinned, so slots are
//! recycled only through [`VersionArena::defer_free`].
//!
//! Allocation and index resolution go through sharded locks; every hot
//! coordination word (chain heads, stamps, bitmap bits) lives in the
//! records and head vectors themselves and is purely atomic.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use ember_types::VersionIdx;
use parking_lot::RwLock;

use crate::epoch::EpochManager;
use crate::tuple::Version;

/// Number of arena shards (power of two).
const SHARD_COUNT: usize = 16;

#[derive(Debug, Default)]
struct ShardInner {
    slots: Vec<Option<Arc<Version>>>,
    free: Vec<u32>,
}

#[derive(Debug, Default)]
struct Shard {
    inner: RwLock<ShardInner>,
}

/// Sharded slot storage for [`Version`] records.
#[derive(Debug)]
pub struct VersionArena {
    shards: Box<[Shard]>,
    next_shard: AtomicUsize,
    high_water: AtomicU64,
    live: AtomicU64,
}

impl VersionArena {
    #[must_use]
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Shard::default()).collect();
        Self {
            shards,
            next_shard: AtomicUsize::new(0),
            high_water: AtomicU64::new(0),
            live: AtomicU64::new(0),
        }
    }

    /// Store `version`, returning its index. The record is not reachable
    /// until the caller publishes the index through a chain word.
    pub fn alloc(&self, version: Version) -> VersionIdx {
        let shard_id = self.next_shard.fetch_add(1, Ordering::Relaxed) % SHARD_COUNT;
        let mut inner = self.shards[shard_id].inner.write();
        let offset = if let Some(offset) = inner.free.pop() {
            debug_assert!(inner.slots[offset as usize].is_none());
            inner.slots[offset as usize] = Some(Arc::new(version));
            offset
        } else {
            let offset = inner.slots.len() as u32;
            inner.slots.push(Some(Arc::new(version)));
            self.high_water.fetch_add(1, Ordering::Relaxed);
            offset
        };
        self.live.fetch_add(1, Ordering::Relaxed);
        VersionIdx::new(offset * SHARD_COUNT as u32 + shard_id as u32)
    }

    /// Resolve an index to its record. `None` only for slots already
    /// recycled, which a pinned reader can never observe for an index it
    /// decoded from a reachable chain word.
    #[must_use]
    pub fn get(&self, idx: VersionIdx) -> Option<Arc<Version>> {
        let (shard_id, offset) = Self::split(idx);
        let inner = self.shards[shard_id].inner.read();
        inner.slots.get(offset)?.clone()
    }

    /// Queue `idx` for recycling once no pinned reader can resolve it.
    pub fn defer_free(self: &Arc<Self>, epochs: &EpochManager, idx: VersionIdx) {
        let arena = Arc::clone(self);
        epochs.defer_free(move || arena.recycle(idx));
    }

    fn recycle(&self, idx: VersionIdx) {
        let (shard_id, offset) = Self::split(idx);
        let mut inner = self.shards[shard_id].inner.write();
        let slot = &mut inner.slots[offset];
        assert!(slot.is_some(), "double free of version slot {idx}");
        *slot = None;
        inner.free.push(offset as u32);
        drop(inner);
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    fn split(idx: VersionIdx) -> (usize, usize) {
        let raw = idx.get() as usize;
        (raw % SHARD_COUNT, raw / SHARD_COUNT)
    }

    /// Records currently resident.
    #[must_use]
    pub fn live_count(&self) -> u64 {
        self.live.load(Ordering::Relaxed)
    }

    /// Slots ever created (recycled ones included).
    #[must_use]
    pub fn high_water(&self) -> u64 {
        self.high_water.load(Ordering::Relaxed)
    }
}

impl Default for VersionArena {
    fn default() -> Self {
        Self::new()
    }
}
