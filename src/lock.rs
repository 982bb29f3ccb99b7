use crate::core::{CacheError, InstanceId, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{Instant, timeout};

/// One lock per identity.
///
/// The `retired` flag is raised when the identity is removed while waiters
/// are queued; such waiters resolve the entry again instead of proceeding on
/// a lock that no longer guards anything.
struct LockEntry {
    mutex: Arc<Mutex<()>>,
    retired: AtomicBool,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            mutex: Arc::new(Mutex::new(())),
            retired: AtomicBool::new(false),
        }
    }
}

/// Serializes access per identity with a bounded wait.
///
/// Entries are created lazily on first access and retired when the identity
/// is removed. Waiters queue FIFO on the entry's mutex; a waiter that gives
/// up or is cancelled leaves no lock held.
pub struct LockManager {
    entries: Mutex<HashMap<InstanceId, Arc<LockEntry>>>,
}

/// Exclusive access to one identity, released on drop.
pub struct AccessGuard {
    id: InstanceId,
    _guard: OwnedMutexGuard<()>,
}

impl AccessGuard {
    pub fn id(&self) -> &InstanceId {
        &self.id
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the identity's lock, waiting at most `wait`.
    ///
    /// A busy identity yields [`CacheError::AccessTimeout`], never a pool
    /// error; the two exhaustion kinds stay distinguishable to callers.
    pub async fn lock(&self, id: &InstanceId, wait: Duration) -> Result<AccessGuard> {
        let deadline = Instant::now() + wait;

        loop {
            let entry = self.entry(id).await;
            let remaining = deadline.saturating_duration_since(Instant::now());

            let guard = match timeout(remaining, entry.mutex.clone().lock_owned()).await {
                Ok(guard) => guard,
                Err(_) => return Err(CacheError::AccessTimeout(id.clone(), wait)),
            };

            // The entry may have been retired while we were queued; the
            // replacement entry is the one that now guards this identity
            if entry.retired.load(Ordering::Acquire) {
                drop(guard);
                continue;
            }

            return Ok(AccessGuard {
                id: id.clone(),
                _guard: guard,
            });
        }
    }

    /// Acquire the identity's lock only if it is free right now.
    pub async fn try_lock(&self, id: &InstanceId) -> Option<AccessGuard> {
        let entry = self.entry(id).await;
        let guard = entry.mutex.clone().try_lock_owned().ok()?;

        if entry.retired.load(Ordering::Acquire) {
            return None;
        }

        Some(AccessGuard {
            id: id.clone(),
            _guard: guard,
        })
    }

    /// Retire the identity's lock entry after removal.
    ///
    /// Pending waiters observe the retirement and re-resolve against a fresh
    /// entry, so none of them proceeds under a stale lock.
    pub async fn retire(&self, id: &InstanceId) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.remove(id) {
            entry.retired.store(true, Ordering::Release);
        }
    }

    /// Number of live lock entries.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    async fn entry(&self, id: &InstanceId) -> Arc<LockEntry> {
        let mut entries = self.entries.lock().await;
        entries
            .entry(id.clone())
            .or_insert_with(|| Arc::new(LockEntry::new()))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_and_release() {
        let locks = LockManager::new();
        let id = InstanceId::new("a");

        let guard = locks.lock(&id, Duration::from_millis(50)).await.unwrap();
        assert_eq!(guard.id(), &id);
        drop(guard);

        // Released, so the next lock succeeds immediately
        let again = locks.lock(&id, Duration::from_millis(50)).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_busy_identity_times_out() {
        let locks = LockManager::new();
        let id = InstanceId::new("a");

        let _held = locks.lock(&id, Duration::from_millis(50)).await.unwrap();

        match locks.lock(&id, Duration::from_millis(50)).await {
            Err(CacheError::AccessTimeout(timed_out_id, _)) => assert_eq!(timed_out_id, id),
            other => panic!("expected AccessTimeout, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_distinct_identities_do_not_contend() {
        let locks = LockManager::new();

        let _a = locks
            .lock(&InstanceId::new("a"), Duration::from_millis(50))
            .await
            .unwrap();
        let b = locks
            .lock(&InstanceId::new("b"), Duration::from_millis(50))
            .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_try_lock() {
        let locks = LockManager::new();
        let id = InstanceId::new("a");

        let held = locks.try_lock(&id).await;
        assert!(held.is_some());
        assert!(locks.try_lock(&id).await.is_none());

        drop(held);
        assert!(locks.try_lock(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_retired_entry_is_replaced() {
        let locks = LockManager::new();
        let id = InstanceId::new("a");

        let guard = locks.lock(&id, Duration::from_millis(50)).await.unwrap();
        locks.retire(&id).await;
        drop(guard);

        // A fresh entry serves the identity after retirement
        let relocked = locks.lock(&id, Duration::from_millis(50)).await;
        assert!(relocked.is_ok());
        assert_eq!(locks.len().await, 1);
    }

    #[tokio::test]
    async fn test_waiter_survives_retirement() {
        let locks = Arc::new(LockManager::new());
        let id = InstanceId::new("a");

        let guard = locks.lock(&id, Duration::from_millis(100)).await.unwrap();

        let waiter_locks = locks.clone();
        let waiter_id = id.clone();
        let waiter = tokio::spawn(async move {
            waiter_locks
                .lock(&waiter_id, Duration::from_millis(500))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        locks.retire(&id).await;
        drop(guard);

        // The waiter notices the retired entry and locks the replacement
        let reacquired = waiter.await.unwrap();
        assert!(reacquired.is_ok());
    }
}
