//! EmberDB: a main-memory, multi-version OLTP storage engine.
//!
//! The facade crate: re-exports the public surface of the engine core and
//! its seams.
//!
//! ```
//! use ember::{Engine, EngineConfig, TxnFlags};
//!
//! let engine = Engine::new(EngineConfig::default());
//! let table = engine.create_table("accounts");
//!
//! let mut txn = engine.begin(TxnFlags::NONE)?;
//! engine.insert(&mut txn, &table, b"alice", b"100")?;
//! engine.commit(txn)?;
//!
//! let mut txn = engine.begin(TxnFlags::NONE)?;
//! assert_eq!(engine.read(&mut txn, &table, b"alice")?, Some(b"100".to_vec()));
//! engine.commit(txn)?;
//!
//! engine.shutdown();
//! # Ok::<(), ember::EmberError>(())
//! ```

pub use ember_error::{EmberError, Result};
pub use ember_index::{MemIndex, OrderedIndex};
pub use ember_log::{LogManager, LogRecord, LogRecordKind, TxLog};
pub use ember_mvcc::{
    CommitProtocol, Engine, EngineConfig, EngineMetricsSnapshot, PruneStats, Table, Transaction,
    GLOBAL_ENGINE_METRICS,
};
pub use ember_types::{AbortReason, FatPtr, Lsn, Oid, PtrTag, TxnFlags, TxnState, VersionIdx, Xid};
