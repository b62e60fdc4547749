//! Cached study content.
//!
//! A [`ContentItem`] is one artifact produced by a collaborator (OCR
//! extraction, summary generation, quiz authoring) and cached for offline
//! use. The engine treats the payload as opaque bytes; only the metadata
//! drives caching decisions.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Current wall-clock time as epoch milliseconds.
pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Kind of cached study artifact. Closed set - collaborators may not invent
/// new kinds without a schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentKind {
    OcrText,
    Summary,
    Explanation,
    Keywords,
    Quiz,
    FlashcardSet,
    MindMap,
}

impl ContentKind {
    /// Eviction priority for this kind (higher = kept longer).
    ///
    /// Interactive study material (quizzes, flashcards) ranks above derived
    /// text, which ranks above raw OCR output that can be re-extracted.
    #[must_use]
    pub fn base_priority(&self) -> u8 {
        match self {
            Self::OcrText => 1,
            Self::Keywords => 2,
            Self::Summary | Self::Explanation => 3,
            Self::MindMap => 4,
            Self::Quiz | Self::FlashcardSet => 5,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OcrText => "ocr-text",
            Self::Summary => "summary",
            Self::Explanation => "explanation",
            Self::Keywords => "keywords",
            Self::Quiz => "quiz",
            Self::FlashcardSet => "flashcard-set",
            Self::MindMap => "mind-map",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ocr-text" => Some(Self::OcrText),
            "summary" => Some(Self::Summary),
            "explanation" => Some(Self::Explanation),
            "keywords" => Some(Self::Keywords),
            "quiz" => Some(Self::Quiz),
            "flashcard-set" => Some(Self::FlashcardSet),
            "mind-map" => Some(Self::MindMap),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cached study artifact.
///
/// # Example
///
/// ```
/// use study_sync::{ContentItem, ContentKind};
///
/// let item = ContentItem::new("subject.42.quiz.1".into(), ContentKind::Quiz, vec![0u8; 512]);
/// assert_eq!(item.priority, ContentKind::Quiz.base_priority());
/// assert!(item.size_bytes() >= 512);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    /// Stable identifier across devices (dotted path style)
    pub id: String,
    /// Artifact kind
    pub kind: ContentKind,
    /// Opaque serialized payload
    pub payload: Vec<u8>,
    /// Eviction priority (derived from kind, may be overridden upward)
    pub priority: u8,
    /// Creation timestamp (epoch millis)
    pub created_at: i64,
    /// Last authoring change (epoch millis) - server conflict resolution key
    pub updated_at: i64,
    /// Last read timestamp (epoch millis) - feeds eviction
    pub last_accessed: i64,
    /// Number of reads since creation
    pub access_count: u64,

    /// Cached computed size (lazily computed, not serialized)
    #[serde(skip)]
    cached_size: OnceLock<usize>,
}

impl ContentItem {
    /// Create a new item with priority derived from its kind.
    pub fn new(id: String, kind: ContentKind, payload: Vec<u8>) -> Self {
        let now = now_millis();
        Self {
            id,
            kind,
            payload,
            priority: kind.base_priority(),
            created_at: now,
            updated_at: now,
            last_accessed: now,
            access_count: 0,
            cached_size: OnceLock::new(),
        }
    }

    /// Rebuild an item from persisted columns.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        id: String,
        kind: ContentKind,
        payload: Vec<u8>,
        priority: u8,
        created_at: i64,
        updated_at: i64,
        last_accessed: i64,
        access_count: u64,
    ) -> Self {
        Self {
            id,
            kind,
            payload,
            priority,
            created_at,
            updated_at,
            last_accessed,
            access_count,
            cached_size: OnceLock::new(),
        }
    }

    /// Resident size in bytes: id + payload. Deterministic so that the
    /// cache's byte accounting is exact and testable.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        *self
            .cached_size
            .get_or_init(|| self.id.len() + self.payload.len())
    }

    /// Record a read. Returns the new access timestamp.
    pub fn record_access(&mut self) -> i64 {
        self.last_accessed = now_millis();
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed
    }
}
