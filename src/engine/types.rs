use serde::Serialize;

/// Lifecycle state of the engine, published on a watch channel so the
/// hosting application can surface sync activity in its UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineState {
    /// Constructed, store not yet opened
    Created,
    /// Rebuilding cache index and mutation log from the store
    Recovering,
    /// Idle and serving local reads/writes
    Ready,
    /// Merging the server snapshot
    Reconciling,
    /// Delivering pending mutations
    Draining,
    /// Shutdown requested; in-flight work is being cancelled
    ShuttingDown,
}

impl EngineState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Recovering => "recovering",
            Self::Ready => "ready",
            Self::Reconciling => "reconciling",
            Self::Draining => "draining",
            Self::ShuttingDown => "shutting-down",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Combined outcome of a [`sync`](crate::engine::StudySyncEngine::sync) pass.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    /// True if the server snapshot was fetched and merged; false means the
    /// drain ran against the previous baseline.
    pub reconciled: bool,
    pub report: crate::queue::DrainReport,
}
