// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tiered sync queue: drains the mutation log into the remote service.
//!
//! One drain pass walks the log in two tiers, reward-bearing mutations
//! first, then background bookkeeping, strictly ascending by sequence
//! within each tier. A failed-terminal mutation blocks everything behind it
//! in its own tier (causal order within a tier must hold) but never the
//! other tier.
//!
//! Only one drain runs at a time; a second call while one is active
//! returns immediately with an empty report. Shutdown cancels cleanly
//! between and during deliveries; an interrupted delivery is reverted to
//! pending so no work is lost.

pub mod backoff;

pub use backoff::BackoffPolicy;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::content::now_millis;
use crate::error::EngineError;
use crate::metrics;
use crate::mutation::{DrainTier, Mutation};
use crate::mutation_log::MutationLog;
use crate::remote::{RemoteError, RemoteService};

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    /// Sequence numbers acknowledged by the server this pass
    pub acknowledged: Vec<u64>,
    /// Sequence numbers that became failed-terminal this pass
    pub terminal: Vec<u64>,
    /// Terminal sequence numbers that held back at least one later entry
    /// in their tier
    pub blocked: Vec<u64>,
    /// True if the pass was cut short by shutdown
    pub cancelled: bool,
    /// True if the call was a no-op because a drain was already running
    pub skipped: bool,
}

impl DrainReport {
    /// True when everything attempted was acknowledged and nothing blocked.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.terminal.is_empty() && self.blocked.is_empty() && !self.cancelled && !self.skipped
    }
}

enum Delivery {
    Acked,
    Terminal(u64),
    Cancelled,
}

/// Releases the drain flag when a pass ends, normally or by early return.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncQueue {
    log: Arc<MutationLog>,
    remote: Arc<dyn RemoteService>,
    policy: BackoffPolicy,
    draining: AtomicBool,
    shutdown: watch::Receiver<bool>,
}

impl SyncQueue {
    pub fn new(
        log: Arc<MutationLog>,
        remote: Arc<dyn RemoteService>,
        policy: BackoffPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            log,
            remote,
            policy,
            draining: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Drain pending mutations to the remote, reward tier first.
    pub async fn drain(&self) -> Result<DrainReport, EngineError> {
        if self.draining.swap(true, Ordering::AcqRel) {
            debug!("drain already in progress, skipping");
            return Ok(DrainReport {
                skipped: true,
                ..DrainReport::default()
            });
        }
        let _guard = DrainGuard(&self.draining);
        let mut shutdown = self.shutdown.clone();
        let mut report = DrainReport::default();

        'tiers: for tier in [DrainTier::Reward, DrainTier::Background] {
            // An existing terminal mutation blocks everything behind it in
            // this tier, including entries appended after it
            let block_at = self
                .log
                .failed_terminal()
                .await?
                .into_iter()
                .filter(|m| m.kind.tier() == tier)
                .map(|m| m.seq)
                .min();

            let entries: Vec<Mutation> = self
                .log
                .iter_pending()
                .await?
                .into_iter()
                .filter(|m| m.kind.tier() == tier)
                .collect();
            let total = entries.len();
            for (position, entry) in entries.into_iter().enumerate() {
                if let Some(blocker) = block_at {
                    if blocker < entry.seq {
                        warn!(
                            blocker,
                            next = entry.seq,
                            ?tier,
                            "tier blocked behind failed-terminal mutation"
                        );
                        report.blocked.push(blocker);
                        continue 'tiers;
                    }
                }
                match self.deliver(entry, &mut shutdown, &mut report).await? {
                    Delivery::Acked => {}
                    Delivery::Terminal(seq) => {
                        report.terminal.push(seq);
                        // Only a blocker if something is actually behind it
                        if position + 1 < total {
                            report.blocked.push(seq);
                        }
                        continue 'tiers;
                    }
                    Delivery::Cancelled => {
                        report.cancelled = true;
                        break 'tiers;
                    }
                }
            }
        }

        metrics::record_drain(report.acknowledged.len(), report.terminal.len());
        metrics::set_pending_mutations(self.log.unresolved().await?.len());
        info!(
            acknowledged = report.acknowledged.len(),
            terminal = report.terminal.len(),
            blocked = report.blocked.len(),
            cancelled = report.cancelled,
            "drain pass finished"
        );
        Ok(report)
    }

    /// Deliver one mutation, retrying transient failures with backoff until
    /// acknowledged, terminal, or cancelled.
    async fn deliver(
        &self,
        mut entry: Mutation,
        shutdown: &mut watch::Receiver<bool>,
        report: &mut DrainReport,
    ) -> Result<Delivery, EngineError> {
        loop {
            if *shutdown.borrow() {
                return Ok(Delivery::Cancelled);
            }

            // Honor the persisted backoff window; it survives restarts
            let now = now_millis();
            if entry.next_retry_at > now {
                let wait = Duration::from_millis((entry.next_retry_at - now) as u64);
                tokio::select! {
                    () = tokio::time::sleep(wait) => {}
                    () = cancelled(shutdown) => return Ok(Delivery::Cancelled),
                }
            }

            let in_flight = self.log.mark_in_flight(entry.seq).await?;
            let outcome = tokio::select! {
                result = self.remote.apply_mutation(&in_flight) => Some(result),
                () = cancelled(shutdown) => None,
            };
            let Some(outcome) = outcome else {
                // The apply was abandoned mid-call; whether it landed is
                // unknown, so revert and let the idempotency key make the
                // eventual retry safe
                self.log
                    .revert_to_pending(in_flight.seq, "cancelled during delivery", 0)
                    .await?;
                return Ok(Delivery::Cancelled);
            };

            match outcome {
                Ok(ack) => {
                    metrics::record_apply_attempt("ack");
                    if ack.deduplicated {
                        debug!(seq = in_flight.seq, "server deduplicated retry");
                    }
                    self.log.mark_acknowledged(in_flight.seq).await?;
                    report.acknowledged.push(in_flight.seq);
                    return Ok(Delivery::Acked);
                }
                Err(RemoteError::Permanent(reason)) => {
                    metrics::record_apply_attempt("permanent");
                    self.log
                        .mark_failed_terminal(in_flight.seq, &reason)
                        .await?;
                    return Ok(Delivery::Terminal(in_flight.seq));
                }
                Err(RemoteError::Transient(reason)) => {
                    metrics::record_apply_attempt("transient");
                    if self.policy.exhausted(in_flight.attempt_count) {
                        warn!(
                            seq = in_flight.seq,
                            attempts = in_flight.attempt_count,
                            reason,
                            "retry budget exhausted"
                        );
                        self.log
                            .mark_failed_terminal(
                                in_flight.seq,
                                &format!("retries exhausted: {reason}"),
                            )
                            .await?;
                        return Ok(Delivery::Terminal(in_flight.seq));
                    }
                    let delay = self.policy.delay_for(in_flight.attempt_count);
                    let next_retry_at = now_millis() + delay.as_millis() as i64;
                    entry = self
                        .log
                        .revert_to_pending(in_flight.seq, &reason, next_retry_at)
                        .await?;
                    warn!(
                        seq = entry.seq,
                        attempt = entry.attempt_count,
                        delay_ms = delay.as_millis() as u64,
                        reason,
                        "transient failure, backing off"
                    );
                }
            }
        }
    }
}

/// Resolves when a true shutdown signal arrives. Pends forever if the
/// sender side is gone, which only happens while the owner is tearing the
/// queue down anyway.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
