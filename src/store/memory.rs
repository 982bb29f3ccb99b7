use crate::core::{CacheError, InstanceId, PassivationEntry, Result, SweepReport};
use crate::store::{PassivationStore, SweepListener};
use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{Level, event};

/// Process-local passivation store.
///
/// Entries are held in insertion-recency order, so capacity pressure expires
/// the entry that has been passivated the longest. Contents are lost on
/// restart, which suits tests and caches whose state is reconstructible.
pub struct MemoryStore {
    entries: Mutex<LruCache<InstanceId, PassivationEntry>>,
}

impl MemoryStore {
    pub fn new(max_size: Option<usize>) -> Self {
        let entries = match max_size.and_then(NonZeroUsize::new) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };

        Self {
            entries: Mutex::new(entries),
        }
    }
}

#[async_trait]
impl PassivationStore for MemoryStore {
    async fn passivate(&self, entry: PassivationEntry) -> Result<()> {
        let id = entry.id.clone();
        let mut entries = self.entries.lock().await;

        if let Some((evicted_id, _)) = entries.push(id.clone(), entry) {
            // Same-key pushes replace in place; a different key coming back
            // means the store was at capacity and dropped its oldest entry
            if evicted_id != id {
                event!(Level::WARN, id = %evicted_id, "store at capacity, oldest entry expired");
            }
        }

        Ok(())
    }

    async fn activate(&self, id: &InstanceId) -> Result<PassivationEntry> {
        self.entries
            .lock()
            .await
            .pop(id)
            .ok_or_else(|| CacheError::NotFound(id.clone()))
    }

    async fn remove(&self, id: &InstanceId) -> Result<bool> {
        Ok(self.entries.lock().await.pop(id).is_some())
    }

    async fn sweep(
        &self,
        idle_timeout: Duration,
        listener: &dyn SweepListener,
    ) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        // Collect and remove under the lock, notify after releasing it
        let expired: Vec<PassivationEntry> = {
            let mut entries = self.entries.lock().await;
            report.scanned = entries.len();

            let expired_ids: Vec<InstanceId> = entries
                .iter()
                .filter(|(_, entry)| entry.is_idle_longer_than(idle_timeout))
                .map(|(id, _)| id.clone())
                .collect();

            expired_ids
                .iter()
                .filter_map(|id| entries.pop(id))
                .collect()
        };

        for entry in expired {
            report.expired += 1;
            listener
                .entry_expired(&entry.id, entry.group.as_ref())
                .await;
        }

        Ok(report)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.lock().await.len())
    }

    async fn contains(&self, id: &InstanceId) -> Result<bool> {
        Ok(self.entries.lock().await.contains(id))
    }
}
