use async_trait::async_trait;
use thiserror::Error;

use crate::content::ContentItem;
use crate::mutation::{Mutation, MutationStatus};
use crate::progress::ProgressSnapshot;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("record not found")]
    NotFound,
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("corrupt persisted record: {0}")]
    Corrupt(String),
}

/// Durable local state behind the engine: the three collections from the
/// persisted layout (`content_items`, `mutations`, `progress_snapshot`).
///
/// Implementations must be restart-safe: everything written here is expected
/// to round-trip identically after a process restart, in particular the
/// pending-mutation ordering the sync queue re-drains from.
#[async_trait]
pub trait StateStore: Send + Sync {
    // --- content_items ---

    /// Insert or fully replace a content item. No partial writes observable.
    async fn put_content(&self, item: &ContentItem) -> Result<(), StorageError>;
    async fn get_content(&self, id: &str) -> Result<Option<ContentItem>, StorageError>;
    async fn delete_content(&self, id: &str) -> Result<(), StorageError>;
    /// All items, unordered. Used to rebuild the cache index on startup.
    async fn list_content(&self) -> Result<Vec<ContentItem>, StorageError>;
    /// Persist an access-time bump without rewriting the payload.
    async fn touch_content(
        &self,
        id: &str,
        last_accessed: i64,
        access_count: u64,
    ) -> Result<(), StorageError>;
    /// Remove every content item. Returns the number removed.
    async fn clear_content(&self) -> Result<u64, StorageError>;

    // --- mutations ---

    async fn insert_mutation(&self, mutation: &Mutation) -> Result<(), StorageError>;
    async fn get_mutation(&self, seq: u64) -> Result<Option<Mutation>, StorageError>;
    /// Rewrite delivery metadata (status, attempts, retry time, error, ack).
    async fn update_mutation(&self, mutation: &Mutation) -> Result<(), StorageError>;
    async fn delete_mutation(&self, seq: u64) -> Result<(), StorageError>;
    /// All mutations with the given status, ascending by sequence.
    async fn load_by_status(&self, status: MutationStatus) -> Result<Vec<Mutation>, StorageError>;
    /// All pending and in-flight mutations, ascending by sequence.
    async fn load_unresolved(&self) -> Result<Vec<Mutation>, StorageError>;
    /// Highest assigned sequence number (0 if the log is empty).
    async fn max_seq(&self) -> Result<u64, StorageError>;
    /// Remove acknowledged mutations acked before `cutoff` (epoch millis).
    /// Returns the number removed.
    async fn purge_acknowledged_before(&self, cutoff: i64) -> Result<u64, StorageError>;

    // --- progress_snapshot ---

    async fn load_snapshot(&self) -> Result<Option<ProgressSnapshot>, StorageError>;
    async fn store_snapshot(&self, snapshot: &ProgressSnapshot) -> Result<(), StorageError>;
}
