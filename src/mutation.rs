//! Mutation records and their delivery state machine.
//!
//! A [`Mutation`] is one local state-changing event (XP earned, flashcard
//! reviewed, quiz submitted, preference changed) awaiting remote
//! application. Each carries a gapless per-device sequence number and a
//! deterministic idempotency key so the server can collapse duplicate
//! retries of the same logical event.
//!
//! Delivery state is an explicit finite-state machine rather than ad hoc
//! flags:
//!
//! ```text
//! Pending ──► InFlight ──► Acknowledged
//!    ▲            │
//!    └────────────┼──────► FailedTerminal
//!      (transient retry)
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::content::now_millis;

/// Kind of state-changing event. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationKind {
    XpGrant,
    FlashcardReview,
    QuizSubmission,
    PreferenceChange,
}

/// Drain priority tier. Reward-bearing mutations drain before background
/// bookkeeping to bound reward latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DrainTier {
    Reward = 0,
    Background = 1,
}

impl MutationKind {
    #[must_use]
    pub fn tier(&self) -> DrainTier {
        match self {
            Self::XpGrant | Self::QuizSubmission | Self::FlashcardReview => DrainTier::Reward,
            Self::PreferenceChange => DrainTier::Background,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::XpGrant => "xp-grant",
            Self::FlashcardReview => "flashcard-review",
            Self::QuizSubmission => "quiz-submission",
            Self::PreferenceChange => "preference-change",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "xp-grant" => Some(Self::XpGrant),
            "flashcard-review" => Some(Self::FlashcardReview),
            "quiz-submission" => Some(Self::QuizSubmission),
            "preference-change" => Some(Self::PreferenceChange),
            _ => None,
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery status of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationStatus {
    /// Recorded locally, not yet attempted (or reverted for retry)
    Pending,
    /// Delivery attempt in progress
    InFlight,
    /// Server confirmed the apply - never re-drained
    Acknowledged,
    /// Server rejected, or retry budget exhausted - needs attention
    FailedTerminal,
}

impl MutationStatus {
    /// Whether the FSM permits moving from `self` to `next`.
    ///
    /// Transitions are monotonic except for the transient-failure revert
    /// (in-flight back to pending).
    #[must_use]
    pub fn can_transition_to(&self, next: MutationStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InFlight)
                | (Self::InFlight, Self::Acknowledged)
                | (Self::InFlight, Self::FailedTerminal)
                | (Self::InFlight, Self::Pending)
        )
    }

    /// Whether this status still holds a content-item pin.
    #[must_use]
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Pending | Self::InFlight)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in-flight",
            Self::Acknowledged => "acknowledged",
            Self::FailedTerminal => "failed-terminal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in-flight" => Some(Self::InFlight),
            "acknowledged" => Some(Self::Acknowledged),
            "failed-terminal" => Some(Self::FailedTerminal),
            _ => None,
        }
    }
}

impl std::fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One local state-changing event, immutable apart from delivery metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mutation {
    /// Gapless, strictly increasing per-device sequence number
    pub seq: u64,
    pub kind: MutationKind,
    /// Event payload (e.g. `{"xp": 10, "activity": "quiz"}`)
    pub payload: Value,
    /// Content item this event references (pins it against eviction while
    /// the mutation is unresolved)
    pub content_id: Option<String>,
    /// Stable across retries of the same logical event
    pub idempotency_key: String,
    pub status: MutationStatus,
    /// Delivery attempts so far (persisted so restarts keep the budget)
    pub attempt_count: u32,
    /// Earliest next delivery attempt (epoch millis, 0 = immediately)
    pub next_retry_at: i64,
    /// Last delivery error, if any
    pub last_error: Option<String>,
    /// Creation timestamp (epoch millis)
    pub created_at: i64,
    /// Acknowledgment timestamp (epoch millis) - drives retention compaction
    pub acked_at: Option<i64>,
}

impl Mutation {
    /// Create a fresh pending mutation.
    ///
    /// The idempotency key is derived deterministically from device identity
    /// and sequence number, so a retried append of the same logical event
    /// can never mint a second key.
    pub fn new(
        device_id: &str,
        seq: u64,
        kind: MutationKind,
        payload: Value,
        content_id: Option<String>,
    ) -> Self {
        Self {
            seq,
            kind,
            payload,
            content_id,
            idempotency_key: idempotency_key(device_id, seq),
            status: MutationStatus::Pending,
            attempt_count: 0,
            next_retry_at: 0,
            last_error: None,
            created_at: now_millis(),
            acked_at: None,
        }
    }

    /// XP contributed by this mutation, for the optimistic working view.
    ///
    /// Negative or missing values clamp to zero; a malformed payload must
    /// never shrink the progress counter.
    #[must_use]
    pub fn xp_delta(&self) -> u64 {
        match self.kind {
            MutationKind::PreferenceChange => 0,
            _ => self
                .payload
                .get("xp")
                .and_then(Value::as_i64)
                .unwrap_or(0)
                .max(0) as u64,
        }
    }
}

/// Deterministic idempotency key: hex SHA-256 over `device_id:seq`.
#[must_use]
pub fn idempotency_key(device_id: &str, seq: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(device_id.as_bytes());
    hasher.update(b":");
    hasher.update(seq.to_be_bytes());
    hex::encode(hasher.finalize())
}
