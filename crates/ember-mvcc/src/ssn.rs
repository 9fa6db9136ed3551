//! Commit-time serializability validation (the serial safety net).
//!
//! SSN maintains two bounds per transaction: `pstamp`, the largest commit
//! stamp of any transaction that must precede this one, and `sstamp`, the
//! smallest commit stamp of any transaction that must follow it. A commit
//! is admitted iff `pstamp < sstamp`; overlap means some dependency cycle
//! through this transaction is possible and it aborts.
//!
//! Evidence is gathered in two scans at pre-commit:
//!
//! - the **writer scan** walks the write set asking "who read the versions
//!   I am overwriting?" — committed readers bound `pstamp` from below;
//! - the **reader scan** walks the read set asking "who overwrote the
//!   versions I read?" — committed overwriters bound `sstamp` from above.
//!
//! Both scans race against the transactions they inspect and lean on the
//! owner-check pattern; every ambiguous answer here resolves toward more
//! aborts, never toward admitting a non-serializable commit. In
//! particular, the writer scan folds the overwritten version's `xstamp`
//! into `pstamp`, so a reader that finished post-commit (bitmap bit
//! already cleared) still counts, and a pessimistic tuple is charged as
//! read by a transaction that committed just before us.

use ember_error::{EmberError, Result};
use ember_types::{AbortReason, Lsn, PtrTag, TxnState, Xid};
use tracing::{debug, trace};

use crate::context::CommitWaitOutcome;
use crate::engine::Engine;
use crate::readers::ReaderSlots;
use crate::tuple::Version;
use crate::txn::Transaction;

impl Engine {
    /// Commit under the serial safety net.
    pub(crate) fn ssn_commit(&self, txn: &mut Transaction) -> Result<Lsn> {
        let end = self.enter_precommit(txn)?;
        let cstamp = end.offset();
        let ctx = self.ctx_of(txn);

        // Seed: if no overwriter evidence was collected during execution,
        // our own commit acts as the successor bound.
        if ctx.sstamp() > cstamp {
            ctx.set_sstamp(cstamp);
        }

        self.ssn_writer_scan(txn, cstamp);
        self.ssn_reader_scan(txn, cstamp);

        let ctx = self.ctx_of(txn);
        let pstamp = ctx.pstamp();
        let sstamp = ctx.sstamp();
        debug_assert!(pstamp <= cstamp.saturating_sub(1));
        if pstamp >= sstamp {
            trace!(
                target: "ember_mvcc::ssn",
                xid = %txn.xid,
                pstamp,
                sstamp,
                cstamp,
                "exclusion window closed"
            );
            self.abort_impl(txn, AbortReason::SsnExclusionFailure);
            return Err(EmberError::aborted(AbortReason::SsnExclusionFailure));
        }

        let intent = txn
            .log
            .take()
            .expect("unresolved transactions hold a log intent");
        self.log().commit(intent);
        ctx.set_state(TxnState::Committed);

        self.ssn_post_commit(txn, end, sstamp);
        self.finish_commit(txn, end);
        debug!(
            target: "ember_mvcc::ssn",
            xid = %txn.xid,
            cstamp,
            pstamp,
            sstamp,
            "ssn commit admitted"
        );
        Ok(end)
    }

    /// Bound `pstamp` from the readers of every version this transaction
    /// overwrites.
    fn ssn_writer_scan(&self, txn: &Transaction, cstamp: u64) {
        let ctx = self.ctx_of(txn);
        let mut pstamp = ctx.pstamp();

        for (&overwritten_idx, entry) in &txn.write_set {
            if entry.is_insert {
                continue;
            }
            let Some(overwritten) = self.arena().get(overwritten_idx) else {
                continue;
            };
            debug_assert_eq!(overwritten.sstamp(), 0, "overwriting an overwritten version");

            let age = self.overwritten_age(txn, &overwritten);
            if age >= self.config().old_version_threshold {
                // Old version: assume it was read by a transaction that
                // committed just before us. No finer bound is possible.
                pstamp = cstamp - 1;
                break;
            }

            let word = self.readers().bitmap(&overwritten);
            if ReaderSlots::is_pessimistic(word) {
                pstamp = cstamp - 1;
                break;
            }
            for slot in self.readers().slots_in(word) {
                let raw = self.readers().xid_at(slot);
                if raw == 0 || raw == txn.xid.raw() {
                    // Empty slot, or our own read.
                    continue;
                }
                let Some(rxid) = Xid::from_raw(raw) else {
                    continue;
                };
                let Some(snap) = self.contexts().snapshot(rxid) else {
                    // Reader finished and was recycled; its commit stamp
                    // is covered by the xstamp fold below.
                    continue;
                };
                if snap.end.is_valid()
                    && snap.end.offset() < cstamp
                    && matches!(
                        self.contexts()
                            .wait_for_commit_result(rxid, self.config().commit_spin_limit),
                        CommitWaitOutcome::Committed
                    )
                {
                    pstamp = pstamp.max(snap.end.offset());
                }
            }
            // Readers that already finished post-commit left the bitmap but
            // published their commit stamp on the tuple. Stamps at or past
            // our own belong to later committers, whose validation covers
            // that edge.
            let xstamp = overwritten.xstamp();
            if xstamp < cstamp {
                pstamp = pstamp.max(xstamp);
            }
        }

        ctx.set_pstamp(pstamp);
    }

    /// Bound `sstamp` from the overwriters of every version this
    /// transaction read (and did not itself overwrite).
    fn ssn_reader_scan(&self, txn: &Transaction, cstamp: u64) {
        let ctx = self.ctx_of(txn);
        let mut sstamp = ctx.sstamp();
        let spin_limit = self.config().commit_spin_limit;

        for entry in &txn.read_set {
            if txn.is_shadowed(entry.tuple) {
                continue;
            }
            let Some(read_version) = self.arena().get(entry.tuple) else {
                continue;
            };
            // Tracked reads are committed versions.
            let Some(rlsn) = read_version.clsn().as_lsn() else {
                continue;
            };
            let Some((_, overwriter)) =
                entry
                    .table
                    .heads()
                    .fetch_overwriter(self.arena(), entry.oid, rlsn)
            else {
                continue;
            };

            let mut rounds: u32 = 0;
            loop {
                let oclsn = overwriter.clsn();
                match oclsn.tag() {
                    PtrTag::Xid => {
                        let sxid = oclsn.as_xid().expect("Xid word carries an XID");
                        if sxid == txn.xid {
                            break;
                        }
                        let Some(snap) = self.contexts().snapshot(sxid) else {
                            // Recycled mid-inspection; the retag is about
                            // to land, re-read the stamp.
                            rounds += 1;
                            if rounds > spin_limit {
                                break;
                            }
                            std::hint::spin_loop();
                            continue;
                        };
                        if !snap.end.is_valid() {
                            // Not in pre-commit: it orders after us.
                            break;
                        }
                        if snap.end.offset() > cstamp {
                            // Serialized after us; the dependency is
                            // trivially satisfied.
                            break;
                        }
                        if matches!(
                            self.contexts().wait_for_commit_result(sxid, spin_limit),
                            CommitWaitOutcome::Committed
                        ) {
                            sstamp = sstamp.min(snap.end.offset());
                        }
                        // An aborted overwriter contributes nothing.
                        break;
                    }
                    PtrTag::Log => {
                        let tuple_sstamp = read_version.sstamp();
                        if tuple_sstamp != 0 {
                            sstamp = sstamp.min(tuple_sstamp);
                        }
                        break;
                    }
                    _ => break,
                }
            }
        }

        ctx.set_sstamp(sstamp);
    }

    /// Age of an overwritten version relative to our begin stamp. While
    /// the creator's retag is pending, the age comes from its context (it
    /// must have pre-committed for us to have installed above it).
    fn overwritten_age(&self, txn: &Transaction, overwritten: &Version) -> u64 {
        let spin_limit = self.config().commit_spin_limit;
        for _ in 0..spin_limit {
            let clsn = overwritten.clsn();
            match clsn.tag() {
                PtrTag::Log => {
                    let lsn = clsn.as_lsn().expect("Log word carries an LSN");
                    return txn.begin.offset().saturating_sub(lsn.offset());
                }
                PtrTag::Xid => {
                    let creator = clsn.as_xid().expect("Xid word carries an XID");
                    if let Some(snap) = self.contexts().snapshot(creator) {
                        if snap.end.is_valid() {
                            return txn.begin.offset().saturating_sub(snap.end.offset());
                        }
                    }
                    std::hint::spin_loop();
                }
                _ => break,
            }
        }
        // Unresolvable creator stamp: call the version young, which keeps
        // every precise check in play.
        0
    }

    /// Install stamps after the commit decision: successor stamps on
    /// overwritten versions, creator/reader stamps on our own, and reader
    /// stamps on everything we read.
    fn ssn_post_commit(&self, txn: &mut Transaction, end: Lsn, sstamp: u64) {
        let cstamp = end.offset();

        for (&overwritten_idx, entry) in &txn.write_set {
            let Some(new_version) = self.arena().get(entry.new) else {
                continue;
            };
            if !entry.is_insert {
                if let Some(overwritten) = self.arena().get(overwritten_idx) {
                    debug_assert!(sstamp != 0 && sstamp != u64::MAX);
                    overwritten.set_sstamp(sstamp);
                }
            }
            new_version.advance_xstamp(cstamp);
            new_version.set_clsn_committed(end);
        }

        for entry in &txn.read_set {
            if txn.is_shadowed(entry.tuple) {
                continue;
            }
            let Some(version) = self.arena().get(entry.tuple) else {
                continue;
            };
            version.advance_xstamp(cstamp);
            if let Some(slot) = txn.reader_slot {
                self.readers().deregister(&version, slot);
            }
        }
    }
}
