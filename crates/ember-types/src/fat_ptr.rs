//! The packed tagged word that version chains are built from.
//!
//! A [`FatPtr`] is one `u64`: a 4-bit type tag, a 12-bit size code, and a
//! 48-bit payload. The tag discriminates the payload before anything is
//! dereferenced:
//!
//! - `Log`  — a committed log sequence number (the payload is the offset).
//! - `Xid`  — a live transaction identifier (the version is in-flight).
//! - `Addr` — a version-arena index (chain links and head words).
//! - `Null` — empty.
//!
//! Retagging a version's creator stamp from `Xid` to `Log` is the core
//! state transition of a version and is a single atomic store on the packed
//! word. All words that can be observed concurrently live in
//! [`AtomicFatPtr`]s and move only by whole-word load/store/CAS.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{Lsn, VersionIdx, Xid};

/// Bit position where the 4-bit tag begins.
const TAG_SHIFT: u32 = 60;

/// Bit position where the 12-bit size code begins.
const SIZE_SHIFT: u32 = 48;

/// Mask isolating the 48-bit payload.
const PAYLOAD_MASK: u64 = (1_u64 << SIZE_SHIFT) - 1;

/// Mask isolating the 12-bit size code (after shifting down).
const SIZE_MASK: u64 = 0xFFF;

const TAG_NULL: u64 = 0;
const TAG_LOG: u64 = 1;
const TAG_XID: u64 = 2;
const TAG_ADDR: u64 = 3;

/// Size code used when the allocation size class is not meaningful.
pub const INVALID_SIZE_CODE: u16 = 0xFFF;

/// Interpretation of a [`FatPtr`] payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PtrTag {
    /// Empty word.
    Null,
    /// Committed log sequence number.
    Log,
    /// Live transaction identifier.
    Xid,
    /// Version-arena index.
    Addr,
}

/// A packed tagged word. See the module docs for the layout.
#[derive(Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct FatPtr(u64);

impl FatPtr {
    /// The empty word.
    pub const NULL: Self = Self(0);

    /// Rebuild from a raw word (e.g. one loaded from an [`AtomicFatPtr`]).
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw packed word.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Pack a committed LSN.
    ///
    /// The offset must fit the 48-bit payload; the log manager never issues
    /// offsets outside that domain.
    #[inline]
    #[must_use]
    pub const fn from_lsn(lsn: Lsn) -> Self {
        debug_assert!(lsn.offset() <= Lsn::MAX_OFFSET);
        Self((TAG_LOG << TAG_SHIFT) | ((INVALID_SIZE_CODE as u64) << SIZE_SHIFT) | lsn.offset())
    }

    /// Pack a live transaction identifier.
    #[inline]
    #[must_use]
    pub const fn from_xid(xid: Xid) -> Self {
        Self((TAG_XID << TAG_SHIFT) | ((INVALID_SIZE_CODE as u64) << SIZE_SHIFT) | xid.raw())
    }

    /// Pack a version-arena index with its allocation size code.
    #[inline]
    #[must_use]
    pub const fn from_addr(idx: VersionIdx, size_code: u16) -> Self {
        Self(
            (TAG_ADDR << TAG_SHIFT)
                | (((size_code as u64) & SIZE_MASK) << SIZE_SHIFT)
                | idx.get() as u64,
        )
    }

    /// The word's type tag.
    #[inline]
    #[must_use]
    pub const fn tag(self) -> PtrTag {
        match self.0 >> TAG_SHIFT {
            TAG_LOG => PtrTag::Log,
            TAG_XID => PtrTag::Xid,
            TAG_ADDR => PtrTag::Addr,
            _ => PtrTag::Null,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        matches!(self.tag(), PtrTag::Null)
    }

    /// The size code field.
    #[inline]
    #[must_use]
    pub const fn size_code(self) -> u16 {
        ((self.0 >> SIZE_SHIFT) & SIZE_MASK) as u16
    }

    /// The payload as an LSN, if this word is `Log`-tagged.
    #[inline]
    #[must_use]
    pub const fn as_lsn(self) -> Option<Lsn> {
        match self.tag() {
            PtrTag::Log => Some(Lsn::new(self.0 & PAYLOAD_MASK)),
            _ => None,
        }
    }

    /// The payload as an XID, if this word is `Xid`-tagged.
    #[inline]
    #[must_use]
    pub const fn as_xid(self) -> Option<Xid> {
        match self.tag() {
            PtrTag::Xid => Xid::from_raw(self.0 & PAYLOAD_MASK),
            _ => None,
        }
    }

    /// The payload as a version-arena index, if this word is `Addr`-tagged.
    #[inline]
    #[must_use]
    pub const fn as_addr(self) -> Option<VersionIdx> {
        match self.tag() {
            PtrTag::Addr => Some(VersionIdx::new((self.0 & 0xFFFF_FFFF) as u32)),
            _ => None,
        }
    }
}

impl fmt::Debug for FatPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag() {
            PtrTag::Null => f.write_str("FatPtr(null)"),
            PtrTag::Log => write!(f, "FatPtr({})", Lsn::new(self.0 & PAYLOAD_MASK)),
            PtrTag::Xid => match self.as_xid() {
                Some(xid) => write!(f, "FatPtr({xid})"),
                None => write!(f, "FatPtr(xid:invalid:{:#x})", self.0),
            },
            PtrTag::Addr => write!(
                f,
                "FatPtr(v#{} sz={})",
                self.0 & 0xFFFF_FFFF,
                self.size_code()
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// AtomicFatPtr
// ---------------------------------------------------------------------------

/// An atomically accessed [`FatPtr`] word.
///
/// Chain heads, `next` links, and creator stamps are all words of this
/// type. A CAS publishes a fully initialized record: the record's fields
/// are written before its `Addr` word becomes reachable, so readers never
/// observe a partially constructed version.
#[derive(Debug)]
#[repr(transparent)]
pub struct AtomicFatPtr(AtomicU64);

impl AtomicFatPtr {
    #[inline]
    #[must_use]
    pub const fn new(ptr: FatPtr) -> Self {
        Self(AtomicU64::new(ptr.raw()))
    }

    /// The null word.
    #[inline]
    #[must_use]
    pub const fn null() -> Self {
        Self::new(FatPtr::NULL)
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> FatPtr {
        FatPtr::from_raw(self.0.load(order))
    }

    #[inline]
    pub fn store(&self, ptr: FatPtr, order: Ordering) {
        self.0.store(ptr.raw(), order);
    }

    /// Whole-word compare-and-swap. On failure returns the observed word.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: FatPtr,
        new: FatPtr,
        success: Ordering,
        failure: Ordering,
    ) -> Result<FatPtr, FatPtr> {
        self.0
            .compare_exchange(current.raw(), new.raw(), success, failure)
            .map(FatPtr::from_raw)
            .map_err(FatPtr::from_raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn tags_discriminate_payload_interpretation() {
        let log = FatPtr::from_lsn(Lsn::new(4096));
        let xid = FatPtr::from_xid(Xid::new(3, 9));
        let addr = FatPtr::from_addr(VersionIdx::new(77), 5);

        assert_eq!(log.tag(), PtrTag::Log);
        assert_eq!(log.as_lsn(), Some(Lsn::new(4096)));
        assert_eq!(log.as_xid(), None);

        assert_eq!(xid.tag(), PtrTag::Xid);
        assert_eq!(xid.as_xid(), Some(Xid::new(3, 9)));
        assert_eq!(xid.as_lsn(), None);

        assert_eq!(addr.tag(), PtrTag::Addr);
        assert_eq!(addr.as_addr(), Some(VersionIdx::new(77)));
        assert_eq!(addr.size_code(), 5);

        assert!(FatPtr::NULL.is_null());
    }

    #[test]
    fn retag_is_a_single_word_store() {
        // The XID -> LOG transition of a creator stamp is one store on the
        // packed word; a racing reader sees either the old XID word or the
        // new LOG word, never a blend.
        let word = AtomicFatPtr::new(FatPtr::from_xid(Xid::new(1, 1)));
        word.store(FatPtr::from_lsn(Lsn::new(250)), Ordering::Release);
        let seen = word.load(Ordering::Acquire);
        assert_eq!(seen.tag(), PtrTag::Log);
        assert_eq!(seen.as_lsn(), Some(Lsn::new(250)));
    }

    #[test]
    fn cas_reports_the_observed_word_on_failure() {
        let word = AtomicFatPtr::null();
        let a = FatPtr::from_addr(VersionIdx::new(1), INVALID_SIZE_CODE);
        let b = FatPtr::from_addr(VersionIdx::new(2), INVALID_SIZE_CODE);

        assert!(word
            .compare_exchange(FatPtr::NULL, a, Ordering::AcqRel, Ordering::Acquire)
            .is_ok());
        let err = word
            .compare_exchange(FatPtr::NULL, b, Ordering::AcqRel, Ordering::Acquire)
            .unwrap_err();
        assert_eq!(err, a);
    }

    proptest! {
        #[test]
        fn xid_payload_survives_packing(slot in any::<u16>(), generation in 1_u32..) {
            let xid = Xid::new(slot, generation);
            prop_assert_eq!(FatPtr::from_xid(xid).as_xid(), Some(xid));
        }

        #[test]
        fn lsn_payload_survives_packing(offset in 0_u64..(1 << 48)) {
            let lsn = Lsn::new(offset);
            prop_assert_eq!(FatPtr::from_lsn(lsn).as_lsn(), Some(lsn));
        }
    }
}
