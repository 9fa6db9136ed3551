//! Maintenance pruning of committed chain tails.
//!
//! Versions below the newest committed version visible at the GC horizon
//! can never be read again: the horizon is the smallest begin stamp of any
//! live transaction (or the log tail when idle), and every future
//! transaction begins at or past it. Pruning truncates such tails and
//! retires them through the epoch manager.
//!
//! Pruning is an explicit maintenance call; scheduling it on a background
//! thread is the driver's concern.

use std::sync::Arc;

use ember_types::{FatPtr, Lsn, Oid};
use tracing::debug;

use crate::engine::{Engine, Table};
use crate::tuple::Version;

/// Result of a table pruning pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    /// OIDs whose chains were examined.
    pub chains_scanned: u64,
    /// Chains that had a tail truncated.
    pub chains_pruned: u64,
    /// Versions retired to the epoch manager.
    pub versions_retired: u64,
}

impl Engine {
    /// The reclamation horizon: no live transaction can read below it.
    #[must_use]
    pub fn gc_horizon(&self) -> Lsn {
        self.contexts()
            .min_active_begin()
            .unwrap_or_else(|| self.log().cur_lsn())
    }

    /// Prune every chain in `table` against the current horizon.
    pub fn prune_table(&self, table: &Arc<Table>) -> PruneStats {
        let _serialize = self.gc_lock.lock();
        let _pin = self.epochs().enter();
        let horizon = self.gc_horizon();
        let mut stats = PruneStats::default();

        let allocated = table.heads().allocated_hint().min(u64::from(u32::MAX));
        for raw in 0..allocated {
            let oid = Oid::new(raw as u32);
            stats.chains_scanned += 1;
            let retired = self.prune_chain(table, oid, horizon);
            if retired > 0 {
                stats.chains_pruned += 1;
                stats.versions_retired += retired;
            }
        }

        debug!(
            target: "ember_mvcc::gc",
            table = table.name(),
            horizon = horizon.offset(),
            chains_pruned = stats.chains_pruned,
            versions_retired = stats.versions_retired,
            "prune pass complete"
        );
        stats
    }

    /// Truncate one chain below its newest committed version at or under
    /// `horizon`. Returns how many versions were retired.
    fn prune_chain(&self, table: &Arc<Table>, oid: Oid, horizon: Lsn) -> u64 {
        // Find the pivot: the newest committed version any future
        // transaction could still select. In-flight versions are skipped
        // (their creators settle them).
        let mut cur = table.heads().load_head(oid);
        let mut pivot: Option<Arc<Version>> = None;
        while let Some(idx) = cur.as_addr() {
            let Some(version) = self.arena().get(idx) else {
                return 0;
            };
            cur = version.next();
            if let Some(lsn) = version.clsn().as_lsn() {
                if lsn <= horizon {
                    pivot = Some(version);
                    break;
                }
            }
        }
        let Some(pivot) = pivot else {
            return 0;
        };

        let mut tail = pivot.next();
        if tail.is_null() {
            return 0;
        }
        pivot.set_next(FatPtr::NULL);

        let mut retired = 0;
        while let Some(idx) = tail.as_addr() {
            let Some(version) = self.arena().get(idx) else {
                break;
            };
            tail = version.next();
            self.arena().defer_free(self.epochs(), idx);
            retired += 1;
        }
        retired
    }
}
