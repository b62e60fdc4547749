// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconciliation against the authoritative server snapshot.
//!
//! On reconnect the server snapshot is fetched and merged before any drain:
//! the server baseline replaces the local one (it already reflects every
//! mutation the server acknowledged, so acknowledged XP is never counted
//! twice), badges are unioned, and server-authored content replaces local
//! copies only when strictly newer.
//!
//! The optimistic working view shown to the user is always
//! `baseline + XP of unresolved local mutations`, so reward totals move the
//! instant an activity is recorded and settle to the server's truth as
//! mutations are acknowledged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::ContentCache;
use crate::content::now_millis;
use crate::error::EngineError;
use crate::metrics;
use crate::mutation::Mutation;
use crate::mutation_log::MutationLog;
use crate::progress::{level_for_xp, ProgressSnapshot};
use crate::remote::RemoteService;
use crate::storage::traits::StateStore;

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ReconciliationEngine {
    store: Arc<dyn StateStore>,
    log: Arc<MutationLog>,
    cache: Arc<ContentCache>,
    remote: Arc<dyn RemoteService>,
    running: AtomicBool,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn StateStore>,
        log: Arc<MutationLog>,
        cache: Arc<ContentCache>,
        remote: Arc<dyn RemoteService>,
    ) -> Self {
        Self {
            store,
            log,
            cache,
            remote,
            running: AtomicBool::new(false),
        }
    }

    /// Fetch the server snapshot and merge it into local state. Returns the
    /// new baseline.
    ///
    /// If the snapshot cannot be fetched this returns
    /// [`EngineError::ReconciliationUnavailable`]; the caller may still
    /// drain against the previous baseline. A concurrent call while a run
    /// is active returns the current baseline without fetching.
    pub async fn reconcile(&self) -> Result<ProgressSnapshot, EngineError> {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("reconciliation already running");
            return self.baseline().await;
        }
        let _guard = RunGuard(&self.running);

        let snapshot = match self.remote.fetch_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %err, "server snapshot unavailable, keeping stale baseline");
                metrics::record_reconcile("unavailable");
                return Err(EngineError::ReconciliationUnavailable(err.to_string()));
            }
        };

        // Server XP is authoritative; it already includes every mutation
        // the server acknowledged. Badges earned on either side are kept.
        let local = self.store.load_snapshot().await?.unwrap_or_default();
        let mut badges = snapshot.progress.badges.clone();
        for badge in local.badges {
            if !badges.contains(&badge) {
                badges.push(badge);
            }
        }
        let baseline = ProgressSnapshot {
            xp: snapshot.progress.xp,
            level: level_for_xp(snapshot.progress.xp),
            badges,
            last_reconciled_at: now_millis(),
        };
        self.store.store_snapshot(&baseline).await?;

        let mut applied = 0usize;
        let mut kept_local = 0usize;
        for item in snapshot.content {
            let id = item.id.clone();
            match self.cache.apply_server_item(item).await {
                Ok(true) => applied += 1,
                Ok(false) => kept_local += 1,
                Err(EngineError::Capacity { size, .. }) => {
                    // Pins can make the cache temporarily unevictable; the
                    // server copy is re-offered at the next reconciliation
                    warn!(id = %id, size, "server content did not fit, skipped");
                }
                Err(err) => return Err(err),
            }
        }

        metrics::record_reconcile("success");
        info!(
            xp = baseline.xp,
            level = baseline.level,
            content_applied = applied,
            content_kept_local = kept_local,
            "reconciled against server snapshot"
        );
        Ok(baseline)
    }

    /// The last reconciled baseline, or the default zero state if this
    /// device has never reconciled.
    pub async fn baseline(&self) -> Result<ProgressSnapshot, EngineError> {
        Ok(self.store.load_snapshot().await?.unwrap_or_default())
    }

    /// Optimistic working view: baseline plus the XP of every unresolved
    /// local mutation. Acknowledged mutations contribute nothing here;
    /// their XP arrives through the baseline instead, so nothing is ever
    /// double counted.
    pub async fn working_view(&self) -> Result<ProgressSnapshot, EngineError> {
        let baseline = self.baseline().await?;
        let pending_xp: u64 = self
            .log
            .unresolved()
            .await?
            .iter()
            .map(Mutation::xp_delta)
            .sum();
        Ok(baseline.with_xp_added(pending_xp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{ContentItem, ContentKind};
    use crate::mutation::MutationKind;
    use crate::remote::{RemoteAck, RemoteError, ServerSnapshot};
    use crate::storage::memory::InMemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    struct FakeRemote {
        snapshot: Mutex<Option<ServerSnapshot>>,
    }

    impl FakeRemote {
        fn with_snapshot(snapshot: ServerSnapshot) -> Arc<Self> {
            Arc::new(Self {
                snapshot: Mutex::new(Some(snapshot)),
            })
        }

        fn offline() -> Arc<Self> {
            Arc::new(Self {
                snapshot: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl RemoteService for FakeRemote {
        async fn apply_mutation(&self, _mutation: &Mutation) -> Result<RemoteAck, RemoteError> {
            Ok(RemoteAck::default())
        }

        async fn fetch_snapshot(&self) -> Result<ServerSnapshot, RemoteError> {
            self.snapshot
                .lock()
                .clone()
                .ok_or_else(|| RemoteError::Transient("offline".into()))
        }
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        log: Arc<MutationLog>,
        cache: Arc<ContentCache>,
    }

    async fn fixture(cache_max: usize) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let log = Arc::new(
            MutationLog::open(store.clone(), "device-1".to_string())
                .await
                .unwrap(),
        );
        let cache = Arc::new(
            ContentCache::open(store.clone(), log.clone(), cache_max)
                .await
                .unwrap(),
        );
        Fixture { store, log, cache }
    }

    fn engine(fx: &Fixture, remote: Arc<FakeRemote>) -> ReconciliationEngine {
        ReconciliationEngine::new(fx.store.clone(), fx.log.clone(), fx.cache.clone(), remote)
    }

    fn server_progress(xp: u64) -> ServerSnapshot {
        ServerSnapshot {
            progress: ProgressSnapshot {
                xp,
                level: level_for_xp(xp),
                badges: vec![],
                last_reconciled_at: 0,
            },
            content: vec![],
        }
    }

    #[tokio::test]
    async fn test_working_view_adds_unresolved_xp() {
        let fx = fixture(10_000).await;
        let remote = FakeRemote::with_snapshot(server_progress(100));
        let engine = engine(&fx, remote);

        engine.reconcile().await.unwrap();
        fx.log
            .append(MutationKind::QuizSubmission, json!({"xp": 10}), None)
            .await
            .unwrap();
        fx.log
            .append(MutationKind::FlashcardReview, json!({"xp": 5}), None)
            .await
            .unwrap();

        let view = engine.working_view().await.unwrap();
        assert_eq!(view.xp, 115);
    }

    #[tokio::test]
    async fn test_acknowledged_xp_never_double_counted() {
        let fx = fixture(10_000).await;
        let remote = FakeRemote::with_snapshot(server_progress(100));
        let engine = engine(&fx, remote.clone());
        engine.reconcile().await.unwrap();

        let m = fx
            .log
            .append(MutationKind::QuizSubmission, json!({"xp": 10}), None)
            .await
            .unwrap();
        fx.log
            .append(MutationKind::FlashcardReview, json!({"xp": 5}), None)
            .await
            .unwrap();
        assert_eq!(engine.working_view().await.unwrap().xp, 115);

        // The server acknowledges the quiz and includes it in a new
        // baseline of 110
        fx.log.mark_in_flight(m.seq).await.unwrap();
        fx.log.mark_acknowledged(m.seq).await.unwrap();
        *remote.snapshot.lock() = Some(server_progress(110));
        engine.reconcile().await.unwrap();

        // 110 baseline + 5 still pending, never 110 + 10 + 5
        assert_eq!(engine.working_view().await.unwrap().xp, 115);
    }

    #[tokio::test]
    async fn test_unavailable_snapshot_keeps_stale_baseline() {
        let fx = fixture(10_000).await;
        fx.store
            .store_snapshot(&ProgressSnapshot {
                xp: 200,
                level: level_for_xp(200),
                badges: vec![],
                last_reconciled_at: 1,
            })
            .await
            .unwrap();
        let engine = engine(&fx, FakeRemote::offline());

        let err = engine.reconcile().await.unwrap_err();
        assert!(matches!(err, EngineError::ReconciliationUnavailable(_)));
        assert_eq!(engine.baseline().await.unwrap().xp, 200);
    }

    #[tokio::test]
    async fn test_badges_unioned() {
        let fx = fixture(10_000).await;
        fx.store
            .store_snapshot(&ProgressSnapshot {
                xp: 50,
                level: 1,
                badges: vec!["early-bird".into(), "streak-3".into()],
                last_reconciled_at: 1,
            })
            .await
            .unwrap();
        let mut snapshot = server_progress(80);
        snapshot.progress.badges = vec!["streak-3".into(), "quiz-master".into()];
        let engine = engine(&fx, FakeRemote::with_snapshot(snapshot));

        let baseline = engine.reconcile().await.unwrap();
        assert_eq!(baseline.xp, 80);
        assert_eq!(baseline.badges.len(), 3);
        assert!(baseline.badges.contains(&"early-bird".to_string()));
        assert!(baseline.badges.contains(&"streak-3".to_string()));
        assert!(baseline.badges.contains(&"quiz-master".to_string()));
    }

    #[tokio::test]
    async fn test_newer_server_content_wins() {
        let fx = fixture(10_000).await;
        let mut local = ContentItem::new("doc.1".into(), ContentKind::Summary, vec![1; 50]);
        local.updated_at = 1_000;
        fx.cache.put(local).await.unwrap();

        let mut newer = ContentItem::new("doc.1".into(), ContentKind::Summary, vec![2; 50]);
        newer.updated_at = 2_000;
        let mut snapshot = server_progress(0);
        snapshot.content = vec![newer];
        let engine = engine(&fx, FakeRemote::with_snapshot(snapshot));

        engine.reconcile().await.unwrap();
        let got = fx.cache.get("doc.1").await.unwrap().unwrap();
        assert_eq!(got.payload, vec![2; 50]);
    }

    #[tokio::test]
    async fn test_stale_server_content_kept_local() {
        let fx = fixture(10_000).await;
        let mut local = ContentItem::new("doc.1".into(), ContentKind::Summary, vec![1; 50]);
        local.updated_at = 2_000;
        fx.cache.put(local).await.unwrap();

        let mut older = ContentItem::new("doc.1".into(), ContentKind::Summary, vec![2; 50]);
        older.updated_at = 1_000;
        let mut snapshot = server_progress(0);
        snapshot.content = vec![older];
        let engine = engine(&fx, FakeRemote::with_snapshot(snapshot));

        engine.reconcile().await.unwrap();
        let got = fx.cache.get("doc.1").await.unwrap().unwrap();
        assert_eq!(got.payload, vec![1; 50]);
    }

    #[tokio::test]
    async fn test_oversized_server_content_skipped_not_fatal() {
        let fx = fixture(100).await;
        let mut snapshot = server_progress(10);
        snapshot.content = vec![ContentItem::new(
            "big".into(),
            ContentKind::OcrText,
            vec![0; 500],
        )];
        let engine = engine(&fx, FakeRemote::with_snapshot(snapshot));

        let baseline = engine.reconcile().await.unwrap();
        assert_eq!(baseline.xp, 10);
        assert!(!fx.cache.contains("big"));
    }

    #[tokio::test]
    async fn test_level_recomputed_from_server_xp() {
        let fx = fixture(10_000).await;
        // Server reports xp without a trustworthy level field
        let mut snapshot = server_progress(650);
        snapshot.progress.level = 1;
        let engine = engine(&fx, FakeRemote::with_snapshot(snapshot));

        let baseline = engine.reconcile().await.unwrap();
        assert_eq!(baseline.level, level_for_xp(650));
        assert_eq!(baseline.level, 4);
    }
}
