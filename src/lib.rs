// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Offline-first content cache and synchronization engine for a study app.
//!
//! Everything the user does works locally first: generated study content
//! is cached under a byte budget, state-changing activity is appended to a
//! durable mutation log, and a tiered sync queue delivers it to the server
//! when connectivity allows. On reconnect the reconciliation engine merges
//! the authoritative server snapshot before the queue drains, so optimistic
//! local progress settles to the server's truth without double counting.
//!
//! ```text
//!                    ┌──────────────────┐
//!   put/get ───────► │   ContentCache   │──┐
//!                    └──────────────────┘  │
//!                    ┌──────────────────┐  │    ┌────────────┐
//!   record ────────► │   MutationLog    │──┼──► │ StateStore │
//!                    └────────┬─────────┘  │    │ (sqlite /  │
//!                             │ pins       │    │  memory)   │
//!                    ┌────────▼─────────┐  │    └────────────┘
//!   sync/flush ────► │    SyncQueue     │──┤
//!                    └──────────────────┘  │    ┌────────────┐
//!                    ┌──────────────────┐  ├──► │  Remote    │
//!                    │ Reconciliation   │──┘    │  Service   │
//!                    │     Engine       │       └────────────┘
//!                    └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use study_sync::{EngineConfig, MutationKind, RemoteService, StudySyncEngine};
//!
//! async fn run(remote: Arc<dyn RemoteService>) -> Result<(), study_sync::EngineError> {
//!     let engine = StudySyncEngine::open(EngineConfig::default(), remote).await?;
//!
//!     // Works offline: durable immediately, delivered on the next sync
//!     engine
//!         .record(MutationKind::XpGrant, json!({"xp": 10}), None)
//!         .await?;
//!
//!     // Optimistic progress reflects the grant right away
//!     let view = engine.working_progress().await?;
//!     assert_eq!(view.xp, 10);
//!
//!     // On reconnect: reconcile against the server, then drain
//!     engine.sync().await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod content;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod mutation;
pub mod mutation_log;
pub mod progress;
pub mod queue;
pub mod reconcile;
pub mod remote;
pub mod storage;

pub use cache::{CacheStats, ContentCache};
pub use config::EngineConfig;
pub use content::{ContentItem, ContentKind};
pub use engine::{EngineState, StudySyncEngine, SyncOutcome};
pub use error::EngineError;
pub use mutation::{idempotency_key, DrainTier, Mutation, MutationKind, MutationStatus};
pub use mutation_log::MutationLog;
pub use progress::{level_for_xp, ProgressSnapshot};
pub use queue::{BackoffPolicy, DrainReport, SyncQueue};
pub use reconcile::ReconciliationEngine;
pub use remote::{RemoteAck, RemoteError, RemoteService, ServerSnapshot};
pub use storage::{InMemoryStore, SqlStore, StateStore, StorageError};
