//! Append-only mutation log with gapless sequencing and content pins.
//!
//! The log is the durability backbone of offline operation: every local
//! state-changing event lands here before anything attempts the network.
//! Sequence numbers are assigned under a single async lock held across the
//! persist, so a failed write never burns a number and the sequence stays
//! gapless even under concurrent appends.
//!
//! While a mutation is unresolved (pending or in-flight) it pins the content
//! item it references, keeping the cache from evicting evidence the server
//! has not yet seen.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::content::now_millis;
use crate::error::EngineError;
use crate::metrics;
use crate::mutation::{Mutation, MutationKind, MutationStatus};
use crate::storage::traits::StateStore;

pub struct MutationLog {
    store: Arc<dyn StateStore>,
    device_id: String,
    /// Highest assigned sequence number. The lock is held across the
    /// persist so the sequence survives write failures without gaps.
    next_seq: Mutex<u64>,
    /// content_id -> number of unresolved mutations referencing it
    pins: RwLock<HashMap<String, u32>>,
}

impl MutationLog {
    /// Open the log over an existing store, recovering state from a
    /// previous run.
    ///
    /// Mutations left in-flight by a crash are reverted to pending so the
    /// next drain retries them; their retry budget carries over.
    pub async fn open(
        store: Arc<dyn StateStore>,
        device_id: String,
    ) -> Result<Self, EngineError> {
        let max_seq = store.max_seq().await?;
        let unresolved = store.load_unresolved().await?;

        let mut pins: HashMap<String, u32> = HashMap::new();
        let mut recovered = 0usize;
        for mutation in &unresolved {
            if let Some(id) = &mutation.content_id {
                *pins.entry(id.clone()).or_default() += 1;
            }
            if mutation.status == MutationStatus::InFlight {
                let mut reverted = mutation.clone();
                reverted.status = MutationStatus::Pending;
                reverted.last_error = Some("interrupted by restart".to_string());
                store.update_mutation(&reverted).await?;
                recovered += 1;
            }
        }

        if !unresolved.is_empty() {
            info!(
                pending = unresolved.len(),
                recovered_in_flight = recovered,
                max_seq,
                "mutation log recovered from previous run"
            );
        }
        metrics::set_pending_mutations(unresolved.len());

        Ok(Self {
            store,
            device_id,
            next_seq: Mutex::new(max_seq),
            pins: RwLock::new(pins),
        })
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Append a new mutation and persist it before returning.
    ///
    /// The returned record carries the assigned sequence number and the
    /// idempotency key derived from it.
    pub async fn append(
        &self,
        kind: MutationKind,
        payload: Value,
        content_id: Option<String>,
    ) -> Result<Mutation, EngineError> {
        let mut next = self.next_seq.lock().await;
        let seq = *next + 1;
        let mutation = Mutation::new(&self.device_id, seq, kind, payload, content_id);
        self.store.insert_mutation(&mutation).await?;
        *next = seq;
        drop(next);

        if let Some(id) = &mutation.content_id {
            *self.pins.write().entry(id.clone()).or_default() += 1;
        }
        metrics::record_append(kind.as_str());
        debug!(seq, kind = %kind, "mutation appended");
        Ok(mutation)
    }

    /// Whether the given content item is pinned by an unresolved mutation.
    #[must_use]
    pub fn is_pinned(&self, content_id: &str) -> bool {
        self.pins.read().contains_key(content_id)
    }

    fn unpin(&self, content_id: &Option<String>) {
        if let Some(id) = content_id {
            let mut pins = self.pins.write();
            if let Some(count) = pins.get_mut(id) {
                *count -= 1;
                if *count == 0 {
                    pins.remove(id);
                }
            }
        }
    }

    async fn load_required(&self, seq: u64) -> Result<Mutation, EngineError> {
        self.store
            .get_mutation(seq)
            .await?
            .ok_or(EngineError::UnknownMutation(seq))
    }

    fn check_transition(
        mutation: &Mutation,
        to: MutationStatus,
    ) -> Result<(), EngineError> {
        if !mutation.status.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                seq: mutation.seq,
                from: mutation.status,
                to,
            });
        }
        Ok(())
    }

    /// Move a pending mutation to in-flight, counting the attempt.
    pub async fn mark_in_flight(&self, seq: u64) -> Result<Mutation, EngineError> {
        let mut mutation = self.load_required(seq).await?;
        Self::check_transition(&mutation, MutationStatus::InFlight)?;
        mutation.status = MutationStatus::InFlight;
        mutation.attempt_count += 1;
        self.store.update_mutation(&mutation).await?;
        Ok(mutation)
    }

    /// Record server confirmation. Releases the content pin.
    pub async fn mark_acknowledged(&self, seq: u64) -> Result<Mutation, EngineError> {
        let mut mutation = self.load_required(seq).await?;
        Self::check_transition(&mutation, MutationStatus::Acknowledged)?;
        mutation.status = MutationStatus::Acknowledged;
        mutation.acked_at = Some(now_millis());
        mutation.last_error = None;
        self.store.update_mutation(&mutation).await?;
        self.unpin(&mutation.content_id);
        debug!(seq, "mutation acknowledged");
        Ok(mutation)
    }

    /// Park a mutation as failed-terminal. Releases the content pin and
    /// leaves the record for operator attention.
    pub async fn mark_failed_terminal(
        &self,
        seq: u64,
        reason: &str,
    ) -> Result<Mutation, EngineError> {
        let mut mutation = self.load_required(seq).await?;
        Self::check_transition(&mutation, MutationStatus::FailedTerminal)?;
        mutation.status = MutationStatus::FailedTerminal;
        mutation.last_error = Some(reason.to_string());
        self.store.update_mutation(&mutation).await?;
        self.unpin(&mutation.content_id);
        warn!(seq, reason, "mutation parked as failed-terminal");
        Ok(mutation)
    }

    /// Revert an in-flight mutation to pending after a transient failure,
    /// persisting the error and the next allowed retry time.
    pub async fn revert_to_pending(
        &self,
        seq: u64,
        error: &str,
        next_retry_at: i64,
    ) -> Result<Mutation, EngineError> {
        let mut mutation = self.load_required(seq).await?;
        Self::check_transition(&mutation, MutationStatus::Pending)?;
        mutation.status = MutationStatus::Pending;
        mutation.last_error = Some(error.to_string());
        mutation.next_retry_at = next_retry_at;
        self.store.update_mutation(&mutation).await?;
        Ok(mutation)
    }

    /// All pending mutations, ascending by sequence.
    pub async fn iter_pending(&self) -> Result<Vec<Mutation>, EngineError> {
        Ok(self.store.load_by_status(MutationStatus::Pending).await?)
    }

    /// All pending and in-flight mutations, ascending by sequence.
    pub async fn unresolved(&self) -> Result<Vec<Mutation>, EngineError> {
        Ok(self.store.load_unresolved().await?)
    }

    /// All failed-terminal mutations awaiting attention.
    pub async fn failed_terminal(&self) -> Result<Vec<Mutation>, EngineError> {
        Ok(self
            .store
            .load_by_status(MutationStatus::FailedTerminal)
            .await?)
    }

    /// Explicitly discard a failed-terminal mutation after the user has
    /// dealt with it. Only terminal records may be cleared.
    pub async fn clear_terminal(&self, seq: u64) -> Result<(), EngineError> {
        let mutation = self.load_required(seq).await?;
        if mutation.status != MutationStatus::FailedTerminal {
            return Err(EngineError::NotTerminal(seq));
        }
        self.store.delete_mutation(seq).await?;
        info!(seq, "failed-terminal mutation cleared");
        Ok(())
    }

    /// Drop acknowledged mutations older than the retention window.
    /// Returns the number removed.
    pub async fn compact(&self, retention_days: u32) -> Result<u64, EngineError> {
        let cutoff = now_millis() - i64::from(retention_days) * 86_400_000;
        let purged = self.store.purge_acknowledged_before(cutoff).await?;
        if purged > 0 {
            info!(purged, retention_days, "compacted acknowledged mutations");
            metrics::record_compaction(purged);
        }
        Ok(purged)
    }
}
