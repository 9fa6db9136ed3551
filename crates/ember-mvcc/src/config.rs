//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Which commit-time protocol the engine runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitProtocol {
    /// Plain snapshot isolation: first-committer-wins on writes, no
    /// read validation.
    SnapshotIsolation,
    /// Snapshot isolation plus the serial safety net: commit requires
    /// `pstamp < sstamp`.
    #[default]
    SerialSafetyNet,
}

/// Tunables for the MVCC core.
///
/// The defaults reproduce the stock engine behavior; [`EngineConfig::validated`]
/// clamps out-of-domain values instead of erroring so a config file with an
/// oversized bitmap width degrades gracefully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Commit-time protocol.
    pub commit_protocol: CommitProtocol,
    /// LSN-delta age above which a committed version is read without SSN
    /// stamping or reader registration.
    pub old_version_threshold: u64,
    /// On visibility of an in-flight version, spin for commit settlement
    /// instead of skipping to the next version.
    pub read_committed_spin: bool,
    /// Width of the per-tuple reader bitmap / global reader-slot table.
    pub reader_slots: u32,
    /// OIDs reserved per thread-local window fetch.
    pub oid_extent_size: u32,
    /// Run the SSN exclusion check on every stamped read, not just at
    /// commit.
    pub early_ssn_checks: bool,
    /// Size of the transaction context table.
    pub context_slots: usize,
    /// Iteration bound for spins on a remote transaction's commit result.
    /// Past the bound the caller takes the conservative answer.
    pub commit_spin_limit: u32,
}

/// Widest reader bitmap the tuple word supports (the top bit is the
/// pessimistic flag).
pub const MAX_READER_SLOTS: u32 = 24;

/// Largest context table addressable by a 16-bit slot index.
pub const MAX_CONTEXT_SLOTS: usize = 1 << 16;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            commit_protocol: CommitProtocol::SerialSafetyNet,
            old_version_threshold: u64::from(u32::MAX),
            read_committed_spin: false,
            reader_slots: MAX_READER_SLOTS,
            oid_extent_size: 8192,
            early_ssn_checks: false,
            context_slots: 4096,
            commit_spin_limit: 16_384,
        }
    }
}

impl EngineConfig {
    /// A copy with every field clamped to its supported domain.
    #[must_use]
    pub fn validated(mut self) -> Self {
        self.reader_slots = self.reader_slots.clamp(1, MAX_READER_SLOTS);
        self.oid_extent_size = self.oid_extent_size.max(1);
        self.context_slots = self.context_slots.clamp(2, MAX_CONTEXT_SLOTS);
        self.commit_spin_limit = self.commit_spin_limit.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_stock_engine_behavior() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.commit_protocol, CommitProtocol::SerialSafetyNet);
        assert_eq!(cfg.old_version_threshold, u64::from(u32::MAX));
        assert_eq!(cfg.reader_slots, 24);
        assert_eq!(cfg.oid_extent_size, 8192);
        assert!(!cfg.read_committed_spin);
        assert!(!cfg.early_ssn_checks);
    }

    #[test]
    fn validation_clamps_out_of_domain_values() {
        let cfg = EngineConfig {
            reader_slots: 200,
            context_slots: usize::MAX,
            oid_extent_size: 0,
            commit_spin_limit: 0,
            ..EngineConfig::default()
        }
        .validated();
        assert_eq!(cfg.reader_slots, MAX_READER_SLOTS);
        assert_eq!(cfg.context_slots, MAX_CONTEXT_SLOTS);
        assert_eq!(cfg.oid_extent_size, 1);
        assert_eq!(cfg.commit_spin_limit, 1);
    }
}
