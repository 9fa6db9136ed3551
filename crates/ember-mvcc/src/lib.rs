//! Multi-version concurrency control core of the EmberDB storage engine.
//!
//! Per-key version chains over a grow-only object vector, snapshot
//! isolation visibility, write-write conflict detection at install time,
//! and a commit-time serializability certifier (the serial safety net)
//! with bounded reader tracking. Unlinked versions are reclaimed through
//! epoch-based deferral so chain traversals never race reclamation.
//!
//! The ordered key index and the durable log are consumed through the
//! seams in `ember-index` and `ember-log`; everything else lives here.

pub mod arena;
pub mod config;
pub mod context;
pub mod engine;
pub mod epoch;
pub mod gc;
pub mod metrics;
pub mod readers;
pub mod ssn;
pub mod store;
pub mod tuple;
pub mod txn;

pub use arena::VersionArena;
pub use config::{CommitProtocol, EngineConfig, MAX_CONTEXT_SLOTS, MAX_READER_SLOTS};
pub use context::{CommitWaitOutcome, CtxSnapshot, XidContext, XidTable};
pub use engine::{Engine, Table};
pub use epoch::{
    EpochGuard, EpochManager, EpochMetrics, EpochMetricsSnapshot, StalePinConfig,
    GLOBAL_EPOCH_METRICS,
};
pub use gc::PruneStats;
pub use metrics::{EngineMetrics, EngineMetricsSnapshot, GLOBAL_ENGINE_METRICS};
pub use readers::{ReaderSlots, Registration, PESSIMISTIC_BIT};
pub use store::ObjectVector;
pub use tuple::Version;
pub use txn::Transaction;
