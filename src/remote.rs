//! The boundary to the remote service.
//!
//! The engine never speaks HTTP itself; the surrounding application supplies
//! a [`RemoteService`] implementation. The contract is small: apply one
//! mutation (idempotent server-side, keyed by idempotency key) and fetch the
//! authoritative snapshot on reconnect.

use async_trait::async_trait;
use thiserror::Error;

use crate::content::ContentItem;
use crate::mutation::Mutation;
use crate::progress::ProgressSnapshot;

/// Failure classes at the remote boundary, mapped onto the retry taxonomy.
#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    /// Timeout, connectivity loss, server busy - safe to retry
    #[error("transient remote failure: {0}")]
    Transient(String),
    /// Validation rejection - retrying can only fail again
    #[error("permanent remote failure: {0}")]
    Permanent(String),
}

/// Server confirmation of one applied mutation.
#[derive(Debug, Clone, Default)]
pub struct RemoteAck {
    /// True if the server had already seen this idempotency key and
    /// collapsed the apply into a no-op.
    pub deduplicated: bool,
}

/// Authoritative server state pulled at reconnect.
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    /// Reconciled progress baseline. Mutations the server acknowledged
    /// before the outage are already reflected here.
    pub progress: ProgressSnapshot,
    /// Server-authored content updates since the last reconciliation.
    /// Newer `updated_at` wins over a locally cached copy of the same id.
    pub content: Vec<ContentItem>,
}

/// Abstract remote service the sync queue drains into.
///
/// Implementations are expected to deduplicate applies by
/// `mutation.idempotency_key`, making at-least-once delivery safe.
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn apply_mutation(&self, mutation: &Mutation) -> Result<RemoteAck, RemoteError>;
    async fn fetch_snapshot(&self) -> Result<ServerSnapshot, RemoteError>;
}
