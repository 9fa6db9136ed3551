//! Core identifier types for the EmberDB storage engine.
//!
//! This crate defines the vocabulary shared by every layer of the engine:
//! log sequence numbers, transaction identifiers, object identifiers, the
//! packed tagged word ([`FatPtr`]) that version chains are built from, and
//! the wire-visible transaction state and abort-reason enums.
//!
//! Everything here is `Copy`, allocation-free, and safe to read from any
//! thread; the atomic wrappers live next to the types they wrap.

pub mod fat_ptr;

pub use fat_ptr::{AtomicFatPtr, FatPtr, PtrTag, INVALID_SIZE_CODE};

use std::fmt;

// ---------------------------------------------------------------------------
// Lsn
// ---------------------------------------------------------------------------

/// Monotonic log sequence number.
///
/// Issued by the log manager; totally ordered. The zero value is the
/// reserved [`Lsn::INVALID`] sentinel ("no LSN yet"). Commit order across
/// the whole engine is the order of `Lsn`s handed out at pre-commit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Lsn(u64);

impl Lsn {
    /// Reserved sentinel: no LSN has been assigned.
    pub const INVALID: Self = Self(0);

    /// Largest offset that still packs into a [`FatPtr`] payload.
    pub const MAX_OFFSET: u64 = (1_u64 << 48) - 1;

    #[inline]
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Raw byte offset in the log.
    #[inline]
    #[must_use]
    pub const fn offset(self) -> u64 {
        self.0
    }

    /// Whether this is a real LSN (not the [`Lsn::INVALID`] sentinel).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lsn#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Oid
// ---------------------------------------------------------------------------

/// Stable 32-bit object identifier, assigned at first insert.
///
/// Keys the object vector; never reused within a process lifetime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Oid(u32);

impl Oid {
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// VersionIdx
// ---------------------------------------------------------------------------

/// Index of a version record in the process-wide version arena.
///
/// Version chains link through these rather than raw pointers; an index is
/// only recycled after an epoch-deferred free, so a reader that decoded one
/// from a chain word can always resolve it to the record it named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct VersionIdx(u32);

impl VersionIdx {
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for VersionIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Xid
// ---------------------------------------------------------------------------

/// Transaction identifier: a context-table slot plus a generation.
///
/// The generation makes slot reuse detectable: a context is only valid for
/// a reader while `ctx.owner` still equals the XID the reader started from.
/// Generations start at 1 so the packed raw value of a real XID is never 0
/// (0 is the free-slot sentinel in the context table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Xid {
    slot: u16,
    generation: u32,
}

impl Xid {
    #[inline]
    #[must_use]
    pub const fn new(slot: u16, generation: u32) -> Self {
        Self { slot, generation }
    }

    /// Context-table slot index.
    #[inline]
    #[must_use]
    pub const fn slot(self) -> u16 {
        self.slot
    }

    /// Slot generation at allocation time.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Pack into the 48-bit payload representation: generation in bits
    /// 47..16, slot in bits 15..0.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        ((self.generation as u64) << 16) | self.slot as u64
    }

    /// Unpack from a raw payload. Returns `None` for 0 (the free sentinel)
    /// and for values that do not fit the 48-bit domain.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        if raw == 0 || raw >> 48 != 0 {
            return None;
        }
        Some(Self {
            slot: (raw & 0xFFFF) as u16,
            generation: (raw >> 16) as u32,
        })
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xid#{}.{}", self.slot, self.generation)
    }
}

// ---------------------------------------------------------------------------
// TxnState
// ---------------------------------------------------------------------------

/// Transaction lifecycle state.
///
/// `Embryo → Active → Committing → {Committed | Aborted}`. `Committing`
/// means an end LSN has been claimed but post-commit stamp installation is
/// still in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum TxnState {
    /// Freshly allocated; has not read or written yet.
    Embryo = 0,
    /// Has performed at least one read or write.
    Active = 1,
    /// End LSN claimed; validation/post-commit in progress.
    Committing = 2,
    /// Fully committed.
    Committed = 3,
    /// Aborted.
    Aborted = 4,
}

impl TxnState {
    /// Decode from the `u8` discriminant stored in a context slot.
    #[inline]
    #[must_use]
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Embryo),
            1 => Some(Self::Active),
            2 => Some(Self::Committing),
            3 => Some(Self::Committed),
            4 => Some(Self::Aborted),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether the transaction has reached a terminal state.
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Embryo => "EMBRYO",
            Self::Active => "ACTIVE",
            Self::Committing => "COMMITTING",
            Self::Committed => "COMMITTED",
            Self::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// TxnFlags
// ---------------------------------------------------------------------------

/// Per-transaction behavior flags, combined with `|`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct TxnFlags(u32);

impl TxnFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// The transaction promises not to write; write operations error.
    pub const READ_ONLY: Self = Self(1);
    /// Bypass per-key read-set tracking. The caller promises not to mutate
    /// or accepts read-committed semantics for the scan.
    pub const LOW_LEVEL_SCAN: Self = Self(1 << 1);

    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for TxnFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for TxnFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut put = |f: &mut fmt::Formatter<'_>, s: &str| -> fmt::Result {
            if !first {
                f.write_str(" | ")?;
            }
            first = false;
            f.write_str(s)
        };
        if self.contains(Self::READ_ONLY) {
            put(f, "READ_ONLY")?;
        }
        if self.contains(Self::LOW_LEVEL_SCAN) {
            put(f, "LOW_LEVEL_SCAN")?;
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AbortReason
// ---------------------------------------------------------------------------

/// Why a transaction aborted. Wire-visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum AbortReason {
    /// Engine-internal failure (e.g. the log refused a pre-commit).
    Internal,
    /// Chain traversal observed a physically torn record.
    UnstableRead,
    /// Another transaction owns or committed a conflicting write.
    WriteWriteConflict,
    /// SSN exclusion check failed (`pstamp >= sstamp`).
    SsnExclusionFailure,
    /// Explicit user-signalled abort.
    User,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Internal => "internal",
            Self::UnstableRead => "unstable read",
            Self::WriteWriteConflict => "write-write conflict",
            Self::SsnExclusionFailure => "ssn exclusion failure",
            Self::User => "user",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xid_raw_is_never_zero_for_live_generations() {
        let x = Xid::new(0, 1);
        assert_ne!(x.raw(), 0);
        assert_eq!(Xid::from_raw(x.raw()), Some(x));
        assert_eq!(Xid::from_raw(0), None);
    }

    #[test]
    fn xid_generation_disambiguates_recycled_slot() {
        let first = Xid::new(7, 1);
        let reused = Xid::new(7, 2);
        assert_ne!(first.raw(), reused.raw());
        assert_eq!(first.slot(), reused.slot());
    }

    #[test]
    fn lsn_ordering_matches_offsets() {
        assert!(Lsn::new(100) < Lsn::new(150));
        assert!(!Lsn::INVALID.is_valid());
        assert!(Lsn::new(1).is_valid());
    }

    #[test]
    fn txn_state_discriminants_round_trip() {
        for state in [
            TxnState::Embryo,
            TxnState::Active,
            TxnState::Committing,
            TxnState::Committed,
            TxnState::Aborted,
        ] {
            assert_eq!(TxnState::from_u8(state.as_u8()), Some(state));
        }
        assert_eq!(TxnState::from_u8(5), None);
    }

    #[test]
    fn flags_combine_and_render() {
        let flags = TxnFlags::READ_ONLY | TxnFlags::LOW_LEVEL_SCAN;
        assert!(flags.contains(TxnFlags::READ_ONLY));
        assert!(flags.contains(TxnFlags::LOW_LEVEL_SCAN));
        assert_eq!(flags.to_string(), "READ_ONLY | LOW_LEVEL_SCAN");
        assert_eq!(TxnFlags::NONE.to_string(), "NONE");
    }
}
