//! The engine: tables, transaction lifecycle, and the read/write paths.
//!
//! The engine owns the shared infrastructure (log sequencer, context
//! table, epoch manager, reader slots, version arena) and drives every
//! operation against a caller-held [`Transaction`]. Conflict policy on the
//! write path is first-committer-wins under snapshot isolation; a
//! write-write conflict aborts the transaction and the operation reports
//! `false`. Read visibility and SSN stamping follow the version-chain
//! rules in `store` and the commit-time validation in `ssn`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ember_error::{EmberError, Result};
use ember_index::{MemIndex, OrderedIndex};
use ember_log::LogManager;
use ember_types::{AbortReason, Lsn, Oid, PtrTag, TxnFlags, TxnState, VersionIdx};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::arena::VersionArena;
use crate::config::{CommitProtocol, EngineConfig};
use crate::context::{XidContext, XidTable};
use crate::epoch::{EpochManager, StalePinConfig};
use crate::metrics::GLOBAL_ENGINE_METRICS;
use crate::readers::ReaderSlots;
use crate::store::ObjectVector;
use crate::tuple::Version;
use crate::txn::{ReadEntry, Transaction, WriteEntry};

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// One named table: an ordered key index plus the version-chain store.
pub struct Table {
    name: String,
    fid: u32,
    index: Box<dyn OrderedIndex>,
    heads: ObjectVector,
}

impl Table {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table (file) identifier used in log records.
    #[must_use]
    pub const fn fid(&self) -> u32 {
        self.fid
    }

    #[must_use]
    pub fn index(&self) -> &dyn OrderedIndex {
        self.index.as_ref()
    }

    pub(crate) fn heads(&self) -> &ObjectVector {
        &self.heads
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("fid", &self.fid)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// What kind of write an installation request is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Insert,
    Update,
    Remove,
}

/// Outcome of a write installation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOutcome {
    Installed,
    Duplicate,
    NotFound,
    Conflict,
}

/// The storage engine.
pub struct Engine {
    cfg: EngineConfig,
    log: LogManager,
    contexts: XidTable,
    epochs: Arc<EpochManager>,
    readers: ReaderSlots,
    arena: Arc<VersionArena>,
    tables: RwLock<HashMap<String, Arc<Table>>>,
    next_fid: AtomicU32,
    /// Serializes maintenance pruning so retired versions are freed once.
    pub(crate) gc_lock: Mutex<()>,
}

impl Engine {
    /// Bring up an engine with `cfg` (clamped to supported domains).
    #[must_use]
    pub fn new(cfg: EngineConfig) -> Self {
        let cfg = cfg.validated();
        let engine = Self {
            log: LogManager::new(),
            contexts: XidTable::new(cfg.context_slots),
            epochs: Arc::new(EpochManager::new(StalePinConfig::default())),
            readers: ReaderSlots::new(cfg.reader_slots),
            arena: Arc::new(VersionArena::new()),
            tables: RwLock::new(HashMap::new()),
            next_fid: AtomicU32::new(1),
            gc_lock: Mutex::new(()),
            cfg,
        };
        debug!(target: "ember_mvcc::engine", cfg = ?engine.cfg, "engine initialized");
        engine
    }

    /// Engine configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// The log sequencer.
    #[must_use]
    pub const fn log(&self) -> &LogManager {
        &self.log
    }

    pub(crate) const fn contexts(&self) -> &XidTable {
        &self.contexts
    }

    pub(crate) const fn arena(&self) -> &Arc<VersionArena> {
        &self.arena
    }

    pub(crate) const fn epochs(&self) -> &Arc<EpochManager> {
        &self.epochs
    }

    pub(crate) const fn readers(&self) -> &ReaderSlots {
        &self.readers
    }

    /// Create (or return) the named table with the default in-memory index.
    pub fn create_table(&self, name: &str) -> Arc<Table> {
        self.create_table_with_index(name, Box::new(MemIndex::new()))
    }

    /// Create (or return) the named table over a caller-provided index.
    pub fn create_table_with_index(&self, name: &str, index: Box<dyn OrderedIndex>) -> Arc<Table> {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.get(name) {
            return Arc::clone(existing);
        }
        let table = Arc::new(Table {
            name: name.to_owned(),
            fid: self.next_fid.fetch_add(1, Ordering::Relaxed),
            index,
            heads: ObjectVector::new(self.cfg.oid_extent_size),
        });
        tables.insert(name.to_owned(), Arc::clone(&table));
        debug!(target: "ember_mvcc::engine", name, fid = table.fid, "table created");
        table
    }

    /// Look up a table by name.
    ///
    /// # Errors
    ///
    /// [`EmberError::NoSuchTable`] when it has not been created.
    pub fn table(&self, name: &str) -> Result<Arc<Table>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EmberError::NoSuchTable {
                name: name.to_owned(),
            })
    }

    /// Seal the log and drain deferred reclamation. Live transactions must
    /// be resolved first; their commits will fail with `Internal` after
    /// this.
    pub fn shutdown(&self) {
        self.log.seal();
        self.epochs.drain();
        debug!(
            target: "ember_mvcc::engine",
            live_versions = self.arena.live_count(),
            "engine shut down"
        );
    }

    /// Push deferred version reclamation toward completion (maintenance).
    pub fn reclaim(&self) {
        self.epochs.drain();
    }

    /// Version records currently resident in the arena (diagnostics).
    #[must_use]
    pub fn live_version_count(&self) -> u64 {
        self.arena.live_count()
    }

    // -------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------

    /// Begin a transaction.
    ///
    /// # Errors
    ///
    /// [`EmberError::TxnSlotsExhausted`] when the context table is full.
    pub fn begin(&self, flags: TxnFlags) -> Result<Transaction> {
        let begin = self.log.cur_lsn();
        let xid = self.contexts.alloc(begin)?;
        let guard = self.epochs.enter();
        let intent = self.log.new_tx_log();
        GLOBAL_ENGINE_METRICS.record_begin();
        trace!(target: "ember_mvcc::engine", %xid, begin = begin.offset(), %flags, "transaction begun");
        Ok(Transaction::new(xid, flags, begin, intent, guard))
    }

    /// Explicitly abort `txn`.
    pub fn abort(&self, mut txn: Transaction, reason: AbortReason) {
        if !txn.resolved {
            self.abort_impl(&mut txn, reason);
        }
    }

    /// Commit `txn`, returning its end LSN.
    ///
    /// # Errors
    ///
    /// [`EmberError::TransactionAborted`] when the commit path aborts the
    /// transaction (log refusal or SSN exclusion failure); the transaction
    /// is fully cleaned up either way.
    pub fn commit(&self, mut txn: Transaction) -> Result<Lsn> {
        self.ensure_unresolved(&txn)?;
        match self.cfg.commit_protocol {
            CommitProtocol::SnapshotIsolation => self.si_commit(&mut txn),
            CommitProtocol::SerialSafetyNet => self.ssn_commit(&mut txn),
        }
    }

    // -------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------

    /// Read `key`, returning the payload visible to `txn`.
    pub fn read(
        &self,
        txn: &mut Transaction,
        table: &Arc<Table>,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        self.ensure_unresolved(txn)?;
        self.activate(txn);
        let Some(oid) = table.index().lookup(key) else {
            return Ok(None);
        };
        match self.read_visible(txn, table, oid) {
            Ok(found) => Ok(found.map(|version| {
                version
                    .data()
                    .expect("tombstones were filtered by read_visible")
                    .to_vec()
            })),
            Err(err) => Err(self.abort_on_error(txn, err)),
        }
    }

    /// Scan key order from `first` (inclusive) up to `upper` (exclusive,
    /// unbounded when `None`), invoking `visitor(key, value)` for every
    /// visible non-tombstone binding until it returns `false`.
    pub fn scan(
        &self,
        txn: &mut Transaction,
        table: &Arc<Table>,
        first: &[u8],
        upper: Option<&[u8]>,
        visitor: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        self.ensure_unresolved(txn)?;
        self.activate(txn);
        let mut failure: Option<EmberError> = None;
        table.index().scan(first, true, &mut |key, oid| {
            if upper.is_some_and(|upper| key >= upper) {
                return false;
            }
            match self.read_visible(txn, table, oid) {
                Ok(None) => true,
                Ok(Some(version)) => {
                    visitor(key, version.data().expect("tombstones filtered"))
                }
                Err(err) => {
                    failure = Some(err);
                    false
                }
            }
        });
        match failure {
            Some(err) => Err(self.abort_on_error(txn, err)),
            None => Ok(()),
        }
    }

    /// Resolve the version of `oid` visible to `txn` and run the read-path
    /// stamping. `None` for empty chains and tombstones; a tombstone still
    /// stamps and registers exactly like a value-bearing version, so a
    /// later reinserter finds the reader in its bitmap.
    fn read_visible(
        &self,
        txn: &mut Transaction,
        table: &Arc<Table>,
        oid: Oid,
    ) -> Result<Option<Arc<Version>>> {
        let found = table.heads().fetch_version(
            &self.arena,
            &self.contexts,
            oid,
            txn.xid,
            txn.begin,
            self.cfg.read_committed_spin,
            self.cfg.commit_spin_limit,
        )?;
        let Some((idx, version)) = found else {
            return Ok(None);
        };
        self.do_tuple_read(txn, table, oid, idx, &version)?;
        if version.is_tombstone() {
            return Ok(None);
        }
        Ok(Some(version))
    }

    /// Record a successful tuple read: SSN stamping, reader registration,
    /// read-set append. Old versions skip all of it by design.
    fn do_tuple_read(
        &self,
        txn: &mut Transaction,
        table: &Arc<Table>,
        oid: Oid,
        idx: VersionIdx,
        version: &Version,
    ) -> Result<()> {
        GLOBAL_ENGINE_METRICS.record_tuple_read();
        if self.cfg.commit_protocol != CommitProtocol::SerialSafetyNet
            || txn.flags.contains(TxnFlags::LOW_LEVEL_SCAN)
        {
            return Ok(());
        }
        // In-flight reads (read-own-writes) carry no committed stamp yet.
        let Some(vlsn) = version.clsn().as_lsn() else {
            return Ok(());
        };

        let age = txn.begin.offset().saturating_sub(vlsn.offset());
        if age >= self.cfg.old_version_threshold {
            // Old version: read as if by a reader that committed just
            // before any future overwriter. No stamping, no registration.
            GLOBAL_ENGINE_METRICS.record_old_version_read();
            return Ok(());
        }

        let ctx = self.contexts.ctx(txn.xid);
        // The creator is a predecessor.
        if ctx.pstamp() < vlsn.offset() {
            ctx.set_pstamp(vlsn.offset());
        }

        let tuple_sstamp = version.sstamp();
        if tuple_sstamp == 0 {
            // No committed overwriter yet: register so future overwriters
            // find us, and remember the read for commit-time validation.
            if txn.reader_slot.is_none() {
                txn.reader_slot = self.readers.claim(txn.xid);
            }
            self.readers.register(version, txn.reader_slot);
            txn.read_set.push(ReadEntry {
                tuple: idx,
                oid,
                table: Arc::clone(table),
            });
        } else if ctx.sstamp() > tuple_sstamp {
            // The overwriter already committed; it is a successor of ours.
            ctx.set_sstamp(tuple_sstamp);
        }

        if self.cfg.early_ssn_checks && ctx.pstamp() >= ctx.sstamp() {
            return Err(EmberError::aborted(AbortReason::SsnExclusionFailure));
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------

    /// Insert `key = value`. `Ok(false)` on a duplicate key (the
    /// transaction stays live) or when racing another in-flight writer on
    /// the same key (the transaction is aborted; check
    /// [`Transaction::is_resolved`]).
    pub fn insert(
        &self,
        txn: &mut Transaction,
        table: &Arc<Table>,
        key: &[u8],
        value: &[u8],
    ) -> Result<bool> {
        self.check_writable(txn)?;
        self.activate(txn);

        if let Some(oid) = table.index().lookup(key) {
            return self.write_bound(txn, table, oid, Some(value), WriteKind::Insert);
        }

        // Fresh key: allocate an OID, publish the chain head, then bind the
        // key. Losing the binding race unlinks and falls back to the bound
        // path.
        let idx = self
            .arena
            .alloc(Version::in_flight(txn.xid, Some(value.into())));
        let oid = table.heads().alloc_oid();
        if !table.heads().install_insert(oid, idx) {
            return Err(EmberError::InvariantViolation {
                detail: format!("fresh {oid} already had a chain head"),
            });
        }
        if !table.index().insert_if_absent(key, oid) {
            table.heads().unlink_head(&self.arena, oid, idx)?;
            self.arena.defer_free(&self.epochs, idx);
            let Some(existing) = table.index().lookup(key) else {
                return Err(EmberError::InvariantViolation {
                    detail: "index rejected an insert but holds no binding".to_owned(),
                });
            };
            return self.write_bound(txn, table, existing, Some(value), WriteKind::Insert);
        }

        txn.log
            .as_mut()
            .expect("unresolved transactions hold a log intent")
            .log_insert(table.fid(), oid, value);
        txn.write_set.insert(
            idx,
            WriteEntry {
                new: idx,
                oid,
                table: Arc::clone(table),
                is_insert: true,
            },
        );
        trace!(target: "ember_mvcc::engine", xid = %txn.xid, %oid, "tuple inserted");
        Ok(true)
    }

    /// Update `key` to `value`. `Ok(false)` on a write-write conflict, in
    /// which case the transaction has been aborted.
    ///
    /// # Errors
    ///
    /// [`EmberError::KeyNotFound`] when no visible version exists (the
    /// transaction stays live).
    pub fn update(
        &self,
        txn: &mut Transaction,
        table: &Arc<Table>,
        key: &[u8],
        value: &[u8],
    ) -> Result<bool> {
        self.check_writable(txn)?;
        self.activate(txn);
        let Some(oid) = table.index().lookup(key) else {
            return Err(EmberError::KeyNotFound);
        };
        self.write_bound(txn, table, oid, Some(value), WriteKind::Update)
    }

    /// Delete `key` by installing a tombstone version. Same conflict
    /// contract as [`Engine::update`].
    pub fn remove(&self, txn: &mut Transaction, table: &Arc<Table>, key: &[u8]) -> Result<bool> {
        self.check_writable(txn)?;
        self.activate(txn);
        let Some(oid) = table.index().lookup(key) else {
            return Err(EmberError::KeyNotFound);
        };
        self.write_bound(txn, table, oid, None, WriteKind::Remove)
    }

    /// Write against an existing key binding, with the head-state conflict
    /// rules. Public result mapping: `Ok(true)` installed, `Ok(false)`
    /// duplicate (insert) or conflict-abort (update/remove/insert),
    /// `Err(KeyNotFound)` for updates of absent keys.
    fn write_bound(
        &self,
        txn: &mut Transaction,
        table: &Arc<Table>,
        oid: Oid,
        data: Option<&[u8]>,
        kind: WriteKind,
    ) -> Result<bool> {
        let outcome = self.install_write(txn, table, oid, data, kind)?;
        match outcome {
            WriteOutcome::Installed => Ok(true),
            WriteOutcome::Duplicate => Ok(false),
            WriteOutcome::NotFound => Err(EmberError::KeyNotFound),
            WriteOutcome::Conflict => {
                self.abort_impl(txn, AbortReason::WriteWriteConflict);
                Ok(false)
            }
        }
    }

    /// Consult the current chain head and install a new version under the
    /// head-state rules. Every failed CAS re-reads the head and re-runs
    /// the conflict logic.
    fn install_write(
        &self,
        txn: &mut Transaction,
        table: &Arc<Table>,
        oid: Oid,
        data: Option<&[u8]>,
        kind: WriteKind,
    ) -> Result<WriteOutcome> {
        loop {
            let head = table.heads().load_head(oid);
            match head.tag() {
                PtrTag::Null => {
                    // A previous insert of this key aborted; the binding
                    // survives with an empty chain and an insert revives it.
                    if kind != WriteKind::Insert {
                        return Ok(WriteOutcome::NotFound);
                    }
                    let idx = self.alloc_in_flight(txn, data);
                    if table.heads().install_insert(oid, idx) {
                        self.record_write(txn, table, oid, idx, None, data, kind);
                        return Ok(WriteOutcome::Installed);
                    }
                    self.arena.defer_free(&self.epochs, idx);
                    continue;
                }
                PtrTag::Addr => {
                    let head_idx = head.as_addr().expect("Addr word carries an index");
                    let Some(head_version) = self.arena.get(head_idx) else {
                        continue;
                    };
                    let clsn = head_version.clsn();
                    match clsn.tag() {
                        PtrTag::Log => {
                            let hlsn = clsn.as_lsn().expect("Log word carries an LSN");
                            if hlsn > txn.begin {
                                // First committer won already.
                                return Ok(self.newer_head_outcome(&head_version, kind));
                            }
                            if let Some(outcome) = self.judge_committed_head(&head_version, kind) {
                                return Ok(outcome);
                            }
                            let idx = self.alloc_in_flight(txn, data);
                            if table.heads().install_update(&self.arena, oid, head, idx) {
                                self.record_write(txn, table, oid, idx, Some(head_idx), data, kind);
                                return Ok(WriteOutcome::Installed);
                            }
                            self.arena.defer_free(&self.epochs, idx);
                            continue;
                        }
                        PtrTag::Xid => {
                            let owner = clsn.as_xid().expect("Xid word carries an XID");
                            if owner == txn.xid {
                                return Ok(self.collapse_own_head(
                                    txn, table, oid, head_idx, &head_version, data, kind,
                                ));
                            }
                            match self.contexts.snapshot(owner) {
                                None => {
                                    // Creator finished and was recycled;
                                    // the retag will surface on re-read.
                                    std::hint::spin_loop();
                                    continue;
                                }
                                Some(snap) if snap.state == TxnState::Committed => {
                                    if !snap.end.is_valid() || snap.end > txn.begin {
                                        return Ok(self.newer_head_outcome(&head_version, kind));
                                    }
                                    if let Some(outcome) =
                                        self.judge_committed_head(&head_version, kind)
                                    {
                                        return Ok(outcome);
                                    }
                                    // Committed predecessor whose retag has
                                    // not landed yet: normal install.
                                    let idx = self.alloc_in_flight(txn, data);
                                    if table.heads().install_update(&self.arena, oid, head, idx) {
                                        self.record_write(
                                            txn,
                                            table,
                                            oid,
                                            idx,
                                            Some(head_idx),
                                            data,
                                            kind,
                                        );
                                        return Ok(WriteOutcome::Installed);
                                    }
                                    self.arena.defer_free(&self.epochs, idx);
                                    continue;
                                }
                                // Embryo/Active/Committing/Aborted owner:
                                // somebody else's write is in flight.
                                Some(_) => return Ok(WriteOutcome::Conflict),
                            }
                        }
                        _ => {
                            return Err(EmberError::InvariantViolation {
                                detail: format!("creator stamp of {oid} has tag {clsn:?}"),
                            })
                        }
                    }
                }
                _ => {
                    return Err(EmberError::InvariantViolation {
                        detail: format!("chain head of {oid} has tag {head:?}"),
                    })
                }
            }
        }
    }

    /// Outcome for a write whose visible committed head blocks or redirects
    /// it. `None` means the write proceeds as a normal install.
    fn judge_committed_head(&self, head: &Version, kind: WriteKind) -> Option<WriteOutcome> {
        match (head.is_tombstone(), kind) {
            // Inserting over a committed tombstone is the reinsert case.
            (true, WriteKind::Insert) => None,
            (true, _) => Some(WriteOutcome::NotFound),
            (false, WriteKind::Insert) => Some(WriteOutcome::Duplicate),
            (false, _) => None,
        }
    }

    /// Outcome when the newest committed version postdates the snapshot.
    fn newer_head_outcome(&self, head: &Version, kind: WriteKind) -> WriteOutcome {
        if kind == WriteKind::Insert && !head.is_tombstone() {
            // The key demonstrably exists now.
            WriteOutcome::Duplicate
        } else {
            WriteOutcome::Conflict
        }
    }

    /// Self-overwrite: collapse the superseded in-flight head out of the
    /// chain and re-point the surviving write-set entry at the new version.
    #[allow(clippy::too_many_arguments)]
    fn collapse_own_head(
        &self,
        txn: &mut Transaction,
        table: &Arc<Table>,
        oid: Oid,
        old_idx: VersionIdx,
        old_version: &Version,
        data: Option<&[u8]>,
        kind: WriteKind,
    ) -> WriteOutcome {
        match (old_version.is_tombstone(), kind) {
            (false, WriteKind::Insert) => return WriteOutcome::Duplicate,
            (true, WriteKind::Update | WriteKind::Remove) => return WriteOutcome::NotFound,
            _ => {}
        }

        let key = txn
            .write_key_of_new(old_idx)
            .expect("own in-flight head must be in the write set");
        let new_idx = self.alloc_in_flight(txn, data);
        table.heads().collapse_self(&self.arena, oid, old_idx, new_idx);

        let entry = txn
            .write_set
            .get_mut(&key)
            .expect("write_key_of_new returned a live key");
        let was_insert = entry.is_insert;
        entry.new = new_idx;
        if was_insert {
            // Insert entries are keyed by their own version; re-key.
            let entry = txn.write_set.remove(&key).expect("entry existed above");
            txn.write_set.insert(new_idx, entry);
        }
        self.arena.defer_free(&self.epochs, old_idx);
        self.log_write(txn, table, oid, data, kind);
        trace!(target: "ember_mvcc::engine", xid = %txn.xid, %oid, "self-overwrite collapsed");
        WriteOutcome::Installed
    }

    fn alloc_in_flight(&self, txn: &Transaction, data: Option<&[u8]>) -> VersionIdx {
        self.arena
            .alloc(Version::in_flight(txn.xid, data.map(Into::into)))
    }

    /// Write-set and log bookkeeping for a fresh install.
    #[allow(clippy::too_many_arguments)]
    fn record_write(
        &self,
        txn: &mut Transaction,
        table: &Arc<Table>,
        oid: Oid,
        new: VersionIdx,
        overwritten: Option<VersionIdx>,
        data: Option<&[u8]>,
        kind: WriteKind,
    ) {
        let (key, is_insert) = match overwritten {
            Some(prev) => (prev, false),
            None => (new, true),
        };
        debug_assert!(
            !txn.write_set.contains_key(&key),
            "second write over one predecessor must collapse, not duplicate"
        );
        txn.write_set.insert(
            key,
            WriteEntry {
                new,
                oid,
                table: Arc::clone(table),
                is_insert,
            },
        );
        self.log_write(txn, table, oid, data, kind);
    }

    fn log_write(
        &self,
        txn: &mut Transaction,
        table: &Arc<Table>,
        oid: Oid,
        data: Option<&[u8]>,
        kind: WriteKind,
    ) {
        let intent = txn
            .log
            .as_mut()
            .expect("unresolved transactions hold a log intent");
        match kind {
            WriteKind::Insert => intent.log_insert(table.fid(), oid, data.unwrap_or_default()),
            WriteKind::Update => intent.log_update(table.fid(), oid, data.unwrap_or_default()),
            WriteKind::Remove => intent.log_delete(table.fid(), oid),
        }
    }

    // -------------------------------------------------------------------
    // Abort and SI commit
    // -------------------------------------------------------------------

    /// Abort `txn` with `reason`: unlink installs, deregister reads,
    /// discard the log intent, release the context slot.
    pub(crate) fn abort_impl(&self, txn: &mut Transaction, reason: AbortReason) {
        debug_assert!(!txn.resolved);
        let ctx = self.contexts.ctx(txn.xid);
        let was_committing = ctx.state() == TxnState::Committing;
        if !was_committing {
            ctx.set_state(TxnState::Aborted);
        }

        for (_, entry) in txn.write_set.drain() {
            debug_assert_eq!(
                self.arena
                    .get(entry.new)
                    .and_then(|v| v.clsn().as_xid()),
                Some(txn.xid),
                "aborting a version we do not own"
            );
            if let Err(err) = entry
                .table
                .heads()
                .unlink_head(&self.arena, entry.oid, entry.new)
            {
                tracing::error!(
                    target: "ember_mvcc::engine",
                    xid = %txn.xid,
                    oid = %entry.oid,
                    %err,
                    "abort unlink failed"
                );
                continue;
            }
            self.arena.defer_free(&self.epochs, entry.new);
        }

        if let Some(slot) = txn.reader_slot {
            for entry in txn.read_set.drain(..) {
                if let Some(version) = self.arena.get(entry.tuple) {
                    self.readers.deregister(&version, slot);
                }
            }
            self.readers.release(slot, txn.xid);
            txn.reader_slot = None;
        } else {
            txn.read_set.clear();
        }

        if let Some(intent) = txn.log.take() {
            self.log.discard(intent);
        }
        if was_committing {
            ctx.set_state(TxnState::Aborted);
        }
        self.contexts.free(txn.xid);
        txn.guard = None;
        txn.resolved = true;
        txn.outcome = Some(TxnState::Aborted);
        GLOBAL_ENGINE_METRICS.record_abort(reason);
        debug!(target: "ember_mvcc::engine", xid = %txn.xid, %reason, "transaction aborted");
    }

    /// Plain snapshot-isolation commit: no read validation, first committer
    /// already won on the write path.
    fn si_commit(&self, txn: &mut Transaction) -> Result<Lsn> {
        let end = self.enter_precommit(txn)?;
        let intent = txn
            .log
            .take()
            .expect("unresolved transactions hold a log intent");
        self.log.commit(intent);
        let ctx = self.contexts.ctx(txn.xid);
        ctx.set_state(TxnState::Committed);

        for entry in txn.write_set.values() {
            if let Some(version) = self.arena.get(entry.new) {
                version.set_clsn_committed(end);
            }
        }
        self.finish_commit(txn, end);
        Ok(end)
    }

    /// Shared commit prologue: state transition and end-LSN claim. On log
    /// refusal the transaction aborts with reason `Internal`.
    pub(crate) fn enter_precommit(&self, txn: &mut Transaction) -> Result<Lsn> {
        let ctx = self.contexts.ctx(txn.xid);
        match ctx.state() {
            TxnState::Embryo | TxnState::Active => ctx.set_state(TxnState::Committing),
            actual => {
                return Err(EmberError::InvalidTxnState {
                    expected: TxnState::Active,
                    actual,
                })
            }
        }

        let mut intent = txn.log.take().expect("unresolved transactions hold a log intent");
        match self.log.pre_commit(&mut intent) {
            Ok(end) => {
                txn.log = Some(intent);
                ctx.set_end(end);
                Ok(end)
            }
            Err(_) => {
                txn.log = Some(intent);
                self.abort_impl(txn, AbortReason::Internal);
                Err(EmberError::aborted(AbortReason::Internal))
            }
        }
    }

    /// Shared commit epilogue: commit the log intent was already done by
    /// the caller; release tracking resources and the context slot.
    pub(crate) fn finish_commit(&self, txn: &mut Transaction, end: Lsn) {
        if let Some(slot) = txn.reader_slot.take() {
            self.readers.release(slot, txn.xid);
        }
        self.contexts.free(txn.xid);
        txn.guard = None;
        txn.resolved = true;
        txn.outcome = Some(TxnState::Committed);
        GLOBAL_ENGINE_METRICS.record_commit();
        debug!(
            target: "ember_mvcc::engine",
            xid = %txn.xid,
            end = end.offset(),
            "transaction committed"
        );
    }

    // -------------------------------------------------------------------
    // Shared checks
    // -------------------------------------------------------------------

    fn ensure_unresolved(&self, txn: &Transaction) -> Result<()> {
        if txn.resolved {
            return Err(EmberError::InvalidTxnState {
                expected: TxnState::Active,
                actual: txn.outcome.unwrap_or(TxnState::Aborted),
            });
        }
        Ok(())
    }

    fn check_writable(&self, txn: &Transaction) -> Result<()> {
        self.ensure_unresolved(txn)?;
        if txn.flags.contains(TxnFlags::READ_ONLY) {
            return Err(EmberError::ReadOnlyTransaction);
        }
        Ok(())
    }

    fn activate(&self, txn: &Transaction) {
        let ctx = self.contexts.ctx(txn.xid);
        if ctx.state() == TxnState::Embryo {
            ctx.set_state(TxnState::Active);
        }
    }

    /// Convert an abort-worthy error into an executed abort.
    fn abort_on_error(&self, txn: &mut Transaction, err: EmberError) -> EmberError {
        if let Some(reason) = err.abort_reason() {
            if !txn.resolved {
                self.abort_impl(txn, reason);
            }
        }
        err
    }

    pub(crate) fn ctx_of(&self, txn: &Transaction) -> &XidContext {
        self.contexts.ctx(txn.xid)
    }

    /// The `(pstamp, sstamp)` pair currently published by an unresolved
    /// transaction's context (diagnostics and tests).
    #[must_use]
    pub fn ssn_stamps(&self, txn: &Transaction) -> (u64, u64) {
        let ctx = self.contexts.ctx(txn.xid);
        (ctx.pstamp(), ctx.sstamp())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("cfg", &self.cfg)
            .field("tables", &self.tables.read().len())
            .field("live_versions", &self.arena.live_count())
            .finish_non_exhaustive()
    }
}
