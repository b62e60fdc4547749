// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The top-level engine facade.
//!
//! [`StudySyncEngine`] wires the content cache, mutation log, sync queue
//! and reconciliation engine over one shared [`StateStore`], and is the
//! only type the hosting application needs to talk to. Everything local
//! (reads, writes, recording activity) works identically online and
//! offline; connectivity only affects when the sync side runs.

mod types;

pub use types::{EngineState, SyncOutcome};

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cache::{CacheStats, ContentCache};
use crate::config::EngineConfig;
use crate::content::ContentItem;
use crate::error::EngineError;
use crate::mutation::{Mutation, MutationKind};
use crate::mutation_log::MutationLog;
use crate::progress::ProgressSnapshot;
use crate::queue::{BackoffPolicy, DrainReport, SyncQueue};
use crate::reconcile::ReconciliationEngine;
use crate::remote::RemoteService;
use crate::storage::{InMemoryStore, SqlStore, StateStore};

pub struct StudySyncEngine {
    config: EngineConfig,
    cache: Arc<ContentCache>,
    log: Arc<MutationLog>,
    queue: SyncQueue,
    reconciler: ReconciliationEngine,
    state: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,
    shutdown: watch::Sender<bool>,
}

impl StudySyncEngine {
    /// Open the engine with the store implied by the config: SQLite when
    /// `db_path` is set, in-memory otherwise.
    pub async fn open(
        config: EngineConfig,
        remote: Arc<dyn RemoteService>,
    ) -> Result<Self, EngineError> {
        let store: Arc<dyn StateStore> = match &config.db_path {
            Some(path) => Arc::new(SqlStore::open(path).await?),
            None => Arc::new(InMemoryStore::new()),
        };
        Self::with_store(config, remote, store).await
    }

    /// Open the engine over an explicit store.
    pub async fn with_store(
        config: EngineConfig,
        remote: Arc<dyn RemoteService>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, EngineError> {
        let (state, state_rx) = watch::channel(EngineState::Created);
        let _ = state.send(EngineState::Recovering);

        let log = Arc::new(MutationLog::open(store.clone(), config.device_id.clone()).await?);
        let cache =
            Arc::new(ContentCache::open(store.clone(), log.clone(), config.cache_max_bytes).await?);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let policy = BackoffPolicy::from_config(&config);
        let queue = SyncQueue::new(log.clone(), remote.clone(), policy, shutdown_rx);
        let reconciler =
            ReconciliationEngine::new(store.clone(), log.clone(), cache.clone(), remote);

        let _ = state.send(EngineState::Ready);
        info!(
            device_id = %config.device_id,
            cache_max_bytes = config.cache_max_bytes,
            durable = config.db_path.is_some(),
            "engine ready"
        );

        Ok(Self {
            config,
            cache,
            log,
            queue,
            reconciler,
            state,
            state_rx,
            shutdown,
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Watch channel for lifecycle state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    // --- content ---

    /// Cache a content item, evicting colder items as needed.
    pub async fn put_content(&self, item: ContentItem) -> Result<(), EngineError> {
        self.cache.put(item).await
    }

    /// Read a content item, bumping its access metadata.
    pub async fn get_content(&self, id: &str) -> Result<Option<ContentItem>, EngineError> {
        self.cache.get(id).await
    }

    /// Remove one content item from the cache.
    pub async fn remove_content(&self, id: &str) -> Result<(), EngineError> {
        self.cache.remove(id).await
    }

    /// Drop all cached content. Pending mutations are unaffected.
    pub async fn clear_cache(&self) -> Result<u64, EngineError> {
        self.cache.clear().await
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // --- activity recording ---

    /// Record a local state-changing event. It is durable once this
    /// returns and will be delivered on the next drain.
    pub async fn record(
        &self,
        kind: MutationKind,
        payload: Value,
        content_id: Option<String>,
    ) -> Result<Mutation, EngineError> {
        self.log.append(kind, payload, content_id).await
    }

    /// Pending and in-flight mutations, ascending by sequence.
    pub async fn unresolved(&self) -> Result<Vec<Mutation>, EngineError> {
        self.log.unresolved().await
    }

    /// Failed-terminal mutations awaiting user attention.
    pub async fn needs_attention(&self) -> Result<Vec<Mutation>, EngineError> {
        self.log.failed_terminal().await
    }

    /// Discard a failed-terminal mutation, unblocking its tier.
    pub async fn clear_terminal(&self, seq: u64) -> Result<(), EngineError> {
        self.log.clear_terminal(seq).await
    }

    // --- progress ---

    /// Optimistic progress: server baseline plus unresolved local XP.
    pub async fn working_progress(&self) -> Result<ProgressSnapshot, EngineError> {
        self.reconciler.working_view().await
    }

    /// Last reconciled server baseline.
    pub async fn baseline_progress(&self) -> Result<ProgressSnapshot, EngineError> {
        self.reconciler.baseline().await
    }

    // --- sync ---

    /// Drain pending mutations without reconciling first. Prefer
    /// [`sync`](Self::sync) on reconnect.
    pub async fn flush(&self) -> Result<DrainReport, EngineError> {
        let _ = self.state.send(EngineState::Draining);
        let result = self.queue.drain().await;
        let _ = self.state.send(EngineState::Ready);
        result
    }

    /// Full sync pass: reconcile against the server snapshot, then drain.
    ///
    /// If the snapshot cannot be fetched the drain still runs against the
    /// previous baseline; `reconciled` in the outcome reports which case
    /// happened.
    pub async fn sync(&self) -> Result<SyncOutcome, EngineError> {
        let _ = self.state.send(EngineState::Reconciling);
        let reconciled = match self.reconciler.reconcile().await {
            Ok(_) => true,
            Err(EngineError::ReconciliationUnavailable(reason)) => {
                warn!(reason, "draining against stale baseline");
                false
            }
            Err(err) => {
                let _ = self.state.send(EngineState::Ready);
                return Err(err);
            }
        };

        let _ = self.state.send(EngineState::Draining);
        let result = self.queue.drain().await;
        let _ = self.state.send(EngineState::Ready);
        Ok(SyncOutcome {
            reconciled,
            report: result?,
        })
    }

    /// Drop acknowledged mutations past the retention window.
    pub async fn compact(&self) -> Result<u64, EngineError> {
        self.log.compact(self.config.retention_days).await
    }

    /// Request shutdown. Any running drain cancels at the next await
    /// point; interrupted deliveries revert to pending.
    pub fn shutdown(&self) {
        info!("engine shutdown requested");
        let _ = self.state.send(EngineState::ShuttingDown);
        let _ = self.shutdown.send(true);
    }
}
