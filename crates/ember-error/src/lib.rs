//! Error types for the EmberDB storage engine.
//!
//! All operational errors are transaction-scoped: the transaction that hits
//! one transitions to `Aborted`, its write set is unlinked, its readers are
//! deregistered and its log intent discarded. Errors never propagate
//! between transactions; a conflict at transaction A is merely information
//! that causes A to abort. [`EmberError::InvariantViolation`] is the one
//! fatal class.

use ember_types::{AbortReason, TxnState};
use thiserror::Error;

/// Primary error type for engine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmberError {
    // === Transaction outcomes ===
    /// The transaction aborted; the reason is wire-visible.
    #[error("transaction aborted: {reason}")]
    TransactionAborted { reason: AbortReason },

    /// An operation was issued against a transaction in the wrong state.
    #[error("invalid transaction state: expected {expected}, found {actual}")]
    InvalidTxnState { expected: TxnState, actual: TxnState },

    /// A write was issued on a read-only transaction.
    #[error("transaction is read-only")]
    ReadOnlyTransaction,

    // === Resource exhaustion ===
    /// Every context-table slot is owned by a live transaction.
    #[error("transaction context table exhausted")]
    TxnSlotsExhausted,

    // === Lookup failures ===
    /// The key does not exist (update/remove of an absent key).
    #[error("key not found")]
    KeyNotFound,

    /// The named table has not been created.
    #[error("no such table: {name}")]
    NoSuchTable { name: String },

    // === Collaborator failures ===
    /// The log manager refused to issue a commit LSN. Surfaces to the
    /// application as an abort with reason [`AbortReason::Internal`].
    #[error("log pre-commit failed")]
    LogPreCommitFailed,

    // === Fatal ===
    /// A structural invariant was observed violated (e.g. a null chain head
    /// during unlink). Not recoverable by aborting one transaction.
    #[error("invariant violation: {detail}")]
    InvariantViolation { detail: String },
}

impl EmberError {
    /// Shorthand for the abort outcome.
    #[must_use]
    pub const fn aborted(reason: AbortReason) -> Self {
        Self::TransactionAborted { reason }
    }

    /// The abort reason, if this error is a transaction abort.
    #[must_use]
    pub const fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            Self::TransactionAborted { reason } => Some(*reason),
            _ => None,
        }
    }
}

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, EmberError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_reason_is_preserved() {
        let err = EmberError::aborted(AbortReason::WriteWriteConflict);
        assert_eq!(err.abort_reason(), Some(AbortReason::WriteWriteConflict));
        assert_eq!(err.to_string(), "transaction aborted: write-write conflict");
        assert_eq!(EmberError::KeyNotFound.abort_reason(), None);
    }
}
