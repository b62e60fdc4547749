//! In-memory [`StateStore`] for tests and ephemeral (no-durability) use.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::traits::{StateStore, StorageError};
use crate::content::ContentItem;
use crate::mutation::{Mutation, MutationStatus};
use crate::progress::ProgressSnapshot;

pub struct InMemoryStore {
    content: DashMap<String, ContentItem>,
    mutations: RwLock<BTreeMap<u64, Mutation>>,
    snapshot: RwLock<Option<ProgressSnapshot>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            content: DashMap::new(),
            mutations: RwLock::new(BTreeMap::new()),
            snapshot: RwLock::new(None),
        }
    }

    /// Current content item count
    #[must_use]
    pub fn content_len(&self) -> usize {
        self.content.len()
    }

    /// Current mutation count (all statuses)
    #[must_use]
    pub fn mutation_len(&self) -> usize {
        self.mutations.read().len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn put_content(&self, item: &ContentItem) -> Result<(), StorageError> {
        self.content.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn get_content(&self, id: &str) -> Result<Option<ContentItem>, StorageError> {
        Ok(self.content.get(id).map(|r| r.value().clone()))
    }

    async fn delete_content(&self, id: &str) -> Result<(), StorageError> {
        self.content.remove(id);
        Ok(())
    }

    async fn list_content(&self) -> Result<Vec<ContentItem>, StorageError> {
        Ok(self.content.iter().map(|r| r.value().clone()).collect())
    }

    async fn touch_content(
        &self,
        id: &str,
        last_accessed: i64,
        access_count: u64,
    ) -> Result<(), StorageError> {
        match self.content.get_mut(id) {
            Some(mut entry) => {
                entry.last_accessed = last_accessed;
                entry.access_count = access_count;
                Ok(())
            }
            None => Err(StorageError::NotFound),
        }
    }

    async fn clear_content(&self) -> Result<u64, StorageError> {
        let removed = self.content.len() as u64;
        self.content.clear();
        Ok(removed)
    }

    async fn insert_mutation(&self, mutation: &Mutation) -> Result<(), StorageError> {
        let mut log = self.mutations.write();
        if log.contains_key(&mutation.seq) {
            return Err(StorageError::Backend(format!(
                "duplicate mutation seq {}",
                mutation.seq
            )));
        }
        log.insert(mutation.seq, mutation.clone());
        Ok(())
    }

    async fn get_mutation(&self, seq: u64) -> Result<Option<Mutation>, StorageError> {
        Ok(self.mutations.read().get(&seq).cloned())
    }

    async fn update_mutation(&self, mutation: &Mutation) -> Result<(), StorageError> {
        let mut log = self.mutations.write();
        match log.get_mut(&mutation.seq) {
            Some(existing) => {
                *existing = mutation.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound),
        }
    }

    async fn delete_mutation(&self, seq: u64) -> Result<(), StorageError> {
        self.mutations.write().remove(&seq);
        Ok(())
    }

    async fn load_by_status(&self, status: MutationStatus) -> Result<Vec<Mutation>, StorageError> {
        // BTreeMap iteration is already seq-ascending
        Ok(self
            .mutations
            .read()
            .values()
            .filter(|m| m.status == status)
            .cloned()
            .collect())
    }

    async fn load_unresolved(&self) -> Result<Vec<Mutation>, StorageError> {
        Ok(self
            .mutations
            .read()
            .values()
            .filter(|m| m.status.is_unresolved())
            .cloned()
            .collect())
    }

    async fn max_seq(&self) -> Result<u64, StorageError> {
        Ok(self
            .mutations
            .read()
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0))
    }

    async fn purge_acknowledged_before(&self, cutoff: i64) -> Result<u64, StorageError> {
        let mut log = self.mutations.write();
        let doomed: Vec<u64> = log
            .values()
            .filter(|m| {
                m.status == MutationStatus::Acknowledged
                    && m.acked_at.map_or(false, |at| at < cutoff)
            })
            .map(|m| m.seq)
            .collect();
        for seq in &doomed {
            log.remove(seq);
        }
        Ok(doomed.len() as u64)
    }

    async fn load_snapshot(&self) -> Result<Option<ProgressSnapshot>, StorageError> {
        Ok(self.snapshot.read().clone())
    }

    async fn store_snapshot(&self, snapshot: &ProgressSnapshot) -> Result<(), StorageError> {
        *self.snapshot.write() = Some(snapshot.clone());
        Ok(())
    }
}
