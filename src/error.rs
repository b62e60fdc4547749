//! Public error taxonomy for the engine.
//!
//! Cache/log-local failures (capacity, serialization, storage) surface
//! synchronously to the caller. Network-class failures are handled inside
//! the sync queue's retry state machine and only escalate after the retry
//! budget is exhausted.

use thiserror::Error;

use crate::mutation::MutationStatus;
use crate::storage::traits::StorageError;

#[derive(Error, Debug)]
pub enum EngineError {
    /// The item alone exceeds the configured cache limit, or eviction could
    /// not free enough space. Never silently dropped.
    #[error("item '{id}' ({size} bytes) cannot fit within cache limit of {limit} bytes")]
    Capacity {
        id: String,
        size: usize,
        limit: usize,
    },

    /// Network/timeout/server-busy failure. Retried automatically by the
    /// sync queue; callers only see this after retries are exhausted.
    #[error("transient sync failure: {0}")]
    TransientSync(String),

    /// Server-side validation rejection. The mutation is marked
    /// failed-terminal and surfaced for operator attention; never retried.
    #[error("permanent sync failure: {0}")]
    PermanentSync(String),

    /// The server snapshot could not be fetched. Reconciliation is skipped
    /// and draining continues against the previous baseline.
    #[error("server snapshot unavailable: {0}")]
    ReconciliationUnavailable(String),

    /// A status transition outside the pending → in-flight →
    /// {acknowledged | failed-terminal} state machine was attempted.
    #[error("invalid status transition for mutation {seq}: {from} -> {to}")]
    InvalidTransition {
        seq: u64,
        from: MutationStatus,
        to: MutationStatus,
    },

    /// No mutation with the given sequence number exists in the log.
    #[error("unknown mutation sequence {0}")]
    UnknownMutation(u64),

    /// `clear_terminal` was called on a mutation that is not failed-terminal.
    #[error("mutation {0} is not failed-terminal and cannot be cleared")]
    NotTerminal(u64),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl EngineError {
    /// Whether this error is worth retrying at a higher level.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientSync(_) | Self::ReconciliationUnavailable(_)
        )
    }
}
