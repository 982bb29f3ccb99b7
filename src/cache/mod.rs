mod housekeeping;
mod stats;

pub use stats::CacheStatsSnapshot;

use crate::core::{
    CacheConfig, CacheError, GroupId, InstanceId, LifecycleStatus, PassivationEntry, PoolConfig,
    Result, StoreConfig,
};
use crate::factory::InstanceFactory;
use crate::lock::{AccessGuard, LockManager};
use crate::pool::{PooledInstance, StrictMaxPool};
use crate::store::{
    PassivationStore, ReplicationListener, ReplicationTransport, SweepListener, decode_state,
    encode_state,
};
use async_trait::async_trait;
use housekeeping::{HousekeepingWorker, spawn_housekeeping_worker};
use stats::CacheStats;
use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{Level, event};

/// What the active map holds for an identity.
enum Resident<S> {
    /// In memory and idle; the map owns the pooled instance.
    Idle(ActiveEntry<S>),
    /// Checked out; the instance travels with the caller's handle.
    CheckedOut { group: Option<GroupId> },
}

/// An idle resident instance.
struct ActiveEntry<S> {
    instance: PooledInstance<S>,
    group: Option<GroupId>,
    last_access: Instant,
}

/// Shared cache state behind the public handle.
///
/// Also the receiving end of the two store callbacks: sweep expiry and
/// incoming replication events.
pub(crate) struct CacheInner<F: InstanceFactory> {
    config: CacheConfig,
    idle_timeout: Option<Duration>,
    pool: StrictMaxPool<F>,
    factory: Arc<F>,
    store: Option<Arc<dyn PassivationStore>>,
    locks: LockManager,
    entries: Mutex<HashMap<InstanceId, Resident<F::State>>>,
    groups: Mutex<HashMap<GroupId, HashSet<InstanceId>>>,
    stats: CacheStats,
    running: AtomicBool,
}

/// An instance checked out of a cache.
///
/// Dereferences to the instance state. The caller holds exclusive access to
/// the identity until the handle goes back through
/// [`InstanceCache::release`] or [`InstanceCache::remove`]; dropping it
/// without either loses the state and logs a warning.
pub struct CheckedOut<F: InstanceFactory> {
    id: InstanceId,
    group: Option<GroupId>,
    status: LifecycleStatus,
    instance: Option<PooledInstance<F::State>>,
    guard: Option<AccessGuard>,
    inner: Weak<CacheInner<F>>,
}

impl<F: InstanceFactory> CheckedOut<F> {
    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn group(&self) -> Option<&GroupId> {
        self.group.as_ref()
    }

    /// `New` on first use, `Active` once restored from memory or a store.
    pub fn status(&self) -> LifecycleStatus {
        self.status
    }

    /// Serial number of the underlying pooled instance.
    pub fn nr(&self) -> u64 {
        self.instance
            .as_ref()
            .expect("instance already returned to cache")
            .nr()
    }
}

impl<F: InstanceFactory> Deref for CheckedOut<F> {
    type Target = F::State;

    fn deref(&self) -> &F::State {
        self.instance
            .as_ref()
            .expect("instance already returned to cache")
            .state()
    }
}

impl<F: InstanceFactory> DerefMut for CheckedOut<F> {
    fn deref_mut(&mut self) -> &mut F::State {
        self.instance
            .as_mut()
            .expect("instance already returned to cache")
            .state_mut()
    }
}

impl<F: InstanceFactory> Drop for CheckedOut<F> {
    fn drop(&mut self) {
        let Some(instance) = self.instance.take() else {
            return;
        };
        eprintln!(
            "Warning: instance '{}' dropped while checked out. State is lost; the slot is reclaimed.",
            self.id
        );
        if let Some(inner) = self.inner.upgrade() {
            inner.pool.forget(instance);
            // Best effort: clear the checked-out marker so the identity can
            // be recreated
            if let Ok(mut entries) = inner.entries.try_lock() {
                if matches!(entries.get(&self.id), Some(Resident::CheckedOut { .. })) {
                    entries.remove(&self.id);
                }
            }
        }
    }
}

/// Bounded cache of stateful component instances.
///
/// Orchestrates the pool, the per-identity access locks, and an optional
/// passivation store. Checked-out instances are exclusive to their caller;
/// idle residents can be passivated by the housekeeping worker and come back
/// transparently on the next [`InstanceCache::get`].
///
/// # Examples
///
/// ```
/// use stasis::{CacheConfig, InstanceCache, InstanceFactory, InstanceId, PoolConfig, Result, StoreConfig};
/// use std::sync::Arc;
///
/// #[derive(serde::Serialize, serde::Deserialize)]
/// struct Session {
///     visits: u32,
/// }
///
/// struct SessionFactory;
///
/// #[async_trait::async_trait]
/// impl InstanceFactory for SessionFactory {
///     type State = Session;
///
///     async fn create(&self) -> Result<Session> {
///         Ok(Session { visits: 0 })
///     }
/// }
///
/// # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
/// # tokio_test::block_on(async {
/// let cache = InstanceCache::new(
///     CacheConfig::new("sessions"),
///     PoolConfig::new(16),
///     StoreConfig::in_memory(),
///     Arc::new(SessionFactory),
/// )?;
/// cache.start().await?;
///
/// let mut session = cache.get(&InstanceId::new("alice")).await?;
/// session.visits += 1;
/// cache.release(session).await?;
///
/// cache.stop().await?;
/// # Ok::<(), stasis::CacheError>(())
/// # })?;
/// # Ok(())
/// # }
/// ```
pub struct InstanceCache<F: InstanceFactory> {
    inner: Arc<CacheInner<F>>,
    worker: Mutex<Option<HousekeepingWorker>>,
}

impl<F: InstanceFactory> InstanceCache<F> {
    /// Build a cache whose store comes from `store_config`.
    ///
    /// A cluster backend needs [`InstanceCache::with_transport`] instead.
    /// With passivation disabled in `cache_config` no store is built and
    /// eviction destroys instances.
    pub fn new(
        cache_config: CacheConfig,
        pool_config: PoolConfig,
        store_config: StoreConfig,
        factory: Arc<F>,
    ) -> Result<Self> {
        let store = if cache_config.capabilities.supports_passivation {
            Some(store_config.build()?)
        } else {
            None
        };
        Self::assemble(cache_config, pool_config, store_config.idle_timeout, store, factory)
    }

    /// Build a cache with a replication transport wired into a cluster store.
    pub fn with_transport(
        cache_config: CacheConfig,
        pool_config: PoolConfig,
        store_config: StoreConfig,
        transport: Arc<dyn ReplicationTransport>,
        factory: Arc<F>,
    ) -> Result<Self> {
        let store = if cache_config.capabilities.supports_passivation {
            Some(store_config.build_with_transport(transport)?)
        } else {
            None
        };
        Self::assemble(cache_config, pool_config, store_config.idle_timeout, store, factory)
    }

    /// Build a cache around an already constructed store.
    pub fn with_store(
        cache_config: CacheConfig,
        pool_config: PoolConfig,
        idle_timeout: Option<Duration>,
        store: Arc<dyn PassivationStore>,
        factory: Arc<F>,
    ) -> Result<Self> {
        let store = cache_config
            .capabilities
            .supports_passivation
            .then_some(store);
        Self::assemble(cache_config, pool_config, idle_timeout, store, factory)
    }

    fn assemble(
        cache_config: CacheConfig,
        pool_config: PoolConfig,
        idle_timeout: Option<Duration>,
        store: Option<Arc<dyn PassivationStore>>,
        factory: Arc<F>,
    ) -> Result<Self> {
        cache_config.validate().map_err(CacheError::Config)?;
        let pool = StrictMaxPool::new(pool_config, factory.clone())?;

        Ok(Self {
            inner: Arc::new(CacheInner {
                config: cache_config,
                idle_timeout,
                pool,
                factory,
                store,
                locks: LockManager::new(),
                entries: Mutex::new(HashMap::new()),
                groups: Mutex::new(HashMap::new()),
                stats: CacheStats::default(),
                running: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Start the cache: start the store, warm the pool, spawn housekeeping.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(CacheError::Lifecycle(format!(
                "cache '{}' is already started",
                self.inner.config.name
            )));
        }

        let started = self.try_start().await;
        if started.is_err() {
            self.inner.running.store(false, Ordering::SeqCst);
        }
        started
    }

    async fn try_start(&self) -> Result<()> {
        if let Some(store) = &self.inner.store {
            store.start().await?;
            let weak = Arc::downgrade(&self.inner);
            let listener: Weak<dyn ReplicationListener> = weak;
            store.set_replication_listener(listener).await;
        }

        let warm = self.inner.pool.config().warm_size;
        if warm > 0 {
            self.inner.pool.warm(warm).await?;
        }

        let worker =
            spawn_housekeeping_worker(self.inner.clone(), self.inner.config.housekeeping_interval);
        *self.worker.lock().await = Some(worker);

        event!(Level::INFO, cache = %self.inner.config.name, "cache started");
        Ok(())
    }

    /// Stop the cache: flush residents to the store (or destroy them), drain
    /// the pool, stop the store. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(worker) = self.worker.lock().await.take() {
            worker.stop().await?;
        }

        self.inner.shutdown_flush().await;
        self.inner.pool.drain().await;

        if let Some(store) = &self.inner.store {
            store.stop().await?;
        }

        event!(Level::INFO, cache = %self.inner.config.name, "cache stopped");
        Ok(())
    }

    /// Check out the instance for `id`, creating it on first use.
    ///
    /// Waits up to the configured access timeout for the identity's lock and
    /// up to the pool's acquisition timeout for capacity; the two failures
    /// surface as [`CacheError::AccessTimeout`] and
    /// [`CacheError::PoolExhausted`] respectively.
    pub async fn get(&self, id: &InstanceId) -> Result<CheckedOut<F>> {
        self.checkout(id, None).await
    }

    /// Check out an instance that belongs to a passivation group.
    ///
    /// The group marker attaches on first use or activation; group members
    /// are passivated together.
    pub async fn get_in_group(&self, id: &InstanceId, group: &GroupId) -> Result<CheckedOut<F>> {
        self.checkout(id, Some(group)).await
    }

    async fn checkout(&self, id: &InstanceId, group: Option<&GroupId>) -> Result<CheckedOut<F>> {
        let inner = &self.inner;
        if !inner.running.load(Ordering::SeqCst) {
            return Err(CacheError::Stopped);
        }

        let group = if inner.config.capabilities.group_eviction {
            group.cloned()
        } else {
            None
        };

        let guard = inner.locks.lock(id, inner.config.access_timeout).await?;

        {
            let mut entries = inner.entries.lock().await;
            match entries.remove(id) {
                Some(Resident::Idle(entry)) => {
                    entries.insert(
                        id.clone(),
                        Resident::CheckedOut {
                            group: entry.group.clone(),
                        },
                    );
                    inner.stats.record_hit();
                    return Ok(self.handle(
                        id.clone(),
                        entry.group,
                        LifecycleStatus::Active,
                        entry.instance,
                        guard,
                    ));
                }
                // A marker while the lock was free is left over from an
                // abandoned handle; treat it as a miss
                Some(Resident::CheckedOut { .. }) | None => inner.stats.record_miss(),
            }
        }

        let wait = inner.pool.config().acquisition_timeout;

        if let Some(store) = &inner.store {
            match store.activate(id).await {
                Ok(stored) => {
                    let state: F::State = match decode_state(id, &stored.state) {
                        Ok(state) => state,
                        Err(err) => {
                            // The corrupt bytes are already out of the store;
                            // the identity is gone
                            inner.locks.retire(id).await;
                            return Err(err);
                        }
                    };

                    let mut pooled = match inner.pool.acquire_with_state(state, wait).await {
                        Ok(pooled) => pooled,
                        Err(err) => {
                            // Put the serialized copy back so the state
                            // survives the failed acquisition
                            if let Err(rollback_err) = store.passivate(stored).await {
                                event!(
                                    Level::WARN,
                                    id = %id,
                                    error = %rollback_err,
                                    "activation rollback failed; state lost"
                                );
                            }
                            return Err(err);
                        }
                    };

                    inner.factory.on_activate(pooled.state_mut());
                    inner.stats.record_activation();

                    let group = stored.group.clone().or(group);
                    inner.index_group_member(id, group.as_ref()).await;
                    inner.entries.lock().await.insert(
                        id.clone(),
                        Resident::CheckedOut {
                            group: group.clone(),
                        },
                    );
                    return Ok(self.handle(
                        id.clone(),
                        group,
                        LifecycleStatus::Active,
                        pooled,
                        guard,
                    ));
                }
                Err(CacheError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }

        // First use: nothing resident, nothing stored
        let pooled = inner.pool.acquire(wait).await?;
        inner.index_group_member(id, group.as_ref()).await;
        inner.entries.lock().await.insert(
            id.clone(),
            Resident::CheckedOut {
                group: group.clone(),
            },
        );
        Ok(self.handle(id.clone(), group, LifecycleStatus::New, pooled, guard))
    }

    fn handle(
        &self,
        id: InstanceId,
        group: Option<GroupId>,
        status: LifecycleStatus,
        instance: PooledInstance<F::State>,
        guard: AccessGuard,
    ) -> CheckedOut<F> {
        CheckedOut {
            id,
            group,
            status,
            instance: Some(instance),
            guard: Some(guard),
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Return a checked-out instance to the cache.
    ///
    /// The instance stays resident and idle; its access lock releases once
    /// the instance is back in the map, so a waiting caller finds it there.
    pub async fn release(&self, checked_out: CheckedOut<F>) -> Result<()> {
        self.inner.check_in(checked_out).await
    }

    /// Destroy a checked-out instance and erase the identity.
    pub async fn remove(&self, mut checked_out: CheckedOut<F>) -> Result<()> {
        let inner = &self.inner;
        let id = checked_out.id.clone();
        let group = checked_out.group.clone();
        let Some(instance) = checked_out.instance.take() else {
            return Ok(());
        };
        let guard = checked_out.guard.take();
        drop(checked_out);

        inner.entries.lock().await.remove(&id);
        inner.forget_group_member(&id, group.as_ref()).await;
        if let Some(store) = &inner.store {
            if let Err(err) = store.remove(&id).await {
                event!(Level::WARN, id = %id, error = %err, "store remove failed during removal");
            }
        }

        let result = inner.pool.discard(instance).await;
        inner.stats.record_removal();
        inner.locks.retire(&id).await;
        drop(guard);
        result
    }

    /// Destroy an instance by identity, wherever it currently lives.
    ///
    /// Resident instances are destroyed through the factory; passivated ones
    /// are deserialized for their teardown. Unknown identities yield
    /// [`CacheError::NotFound`].
    pub async fn remove_by_id(&self, id: &InstanceId) -> Result<()> {
        let inner = &self.inner;
        let guard = inner.locks.lock(id, inner.config.access_timeout).await?;

        let resident = inner.entries.lock().await.remove(id);
        match resident {
            Some(Resident::Idle(entry)) => {
                inner.forget_group_member(id, entry.group.as_ref()).await;
                if let Some(store) = &inner.store {
                    if let Err(err) = store.remove(id).await {
                        event!(Level::WARN, id = %id, error = %err, "store remove failed during removal");
                    }
                }
                let result = inner.pool.discard(entry.instance).await;
                inner.stats.record_removal();
                inner.locks.retire(id).await;
                drop(guard);
                result
            }
            Some(Resident::CheckedOut { group }) => {
                // Stale marker from an abandoned handle; the instance is
                // already gone
                inner.forget_group_member(id, group.as_ref()).await;
                if let Some(store) = &inner.store {
                    let _ = store.remove(id).await;
                }
                inner.stats.record_removal();
                inner.locks.retire(id).await;
                Ok(())
            }
            None => {
                let Some(store) = &inner.store else {
                    return Err(CacheError::NotFound(id.clone()));
                };
                match store.activate(id).await {
                    Ok(stored) => {
                        inner.forget_group_member(id, stored.group.as_ref()).await;
                        match decode_state::<F::State>(id, &stored.state) {
                            Ok(state) => {
                                if let Err(err) = inner.factory.destroy(state).await {
                                    event!(Level::WARN, id = %id, error = %err, "instance destroy failed during removal");
                                }
                            }
                            Err(err) => {
                                event!(Level::WARN, id = %id, error = %err, "corrupt entry dropped during removal");
                            }
                        }
                        inner.stats.record_removal();
                        inner.locks.retire(id).await;
                        Ok(())
                    }
                    Err(CacheError::NotFound(_)) => Err(CacheError::NotFound(id.clone())),
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Run `action` with exclusive access to the instance state, releasing
    /// the instance on every exit path.
    pub async fn with_exclusive_access<T, A>(&self, id: &InstanceId, action: A) -> Result<T>
    where
        A: FnOnce(&mut F::State) -> Result<T>,
    {
        let mut checked_out = self.get(id).await?;
        let outcome = action(&mut *checked_out);
        match self.release(checked_out).await {
            Ok(()) => outcome,
            Err(release_err) => outcome.and(Err(release_err)),
        }
    }

    /// Where an identity currently is in its lifecycle.
    pub async fn status(&self, id: &InstanceId) -> LifecycleStatus {
        match self.inner.entries.lock().await.get(id) {
            Some(Resident::Idle(_)) | Some(Resident::CheckedOut { .. }) => {
                return LifecycleStatus::Active;
            }
            None => {}
        }
        if let Some(store) = &self.inner.store {
            if store.contains(id).await.unwrap_or(false) {
                return LifecycleStatus::Passivated;
            }
        }
        LifecycleStatus::Removed
    }

    pub async fn stats(&self) -> CacheStatsSnapshot {
        let (resident, checked_out) = {
            let entries = self.inner.entries.lock().await;
            let checked_out = entries
                .values()
                .filter(|resident| matches!(resident, Resident::CheckedOut { .. }))
                .count();
            (entries.len(), checked_out)
        };
        let passivated = match &self.inner.store {
            Some(store) => store.len().await.unwrap_or(0),
            None => 0,
        };
        self.inner.stats.snapshot(resident, checked_out, passivated)
    }
}

impl<F: InstanceFactory> CacheInner<F> {
    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    async fn index_group_member(&self, id: &InstanceId, group: Option<&GroupId>) {
        if let Some(group) = group {
            self.groups
                .lock()
                .await
                .entry(group.clone())
                .or_default()
                .insert(id.clone());
        }
    }

    async fn forget_group_member(&self, id: &InstanceId, group: Option<&GroupId>) {
        if let Some(group) = group {
            let mut groups = self.groups.lock().await;
            if let Some(members) = groups.get_mut(group) {
                members.remove(id);
                if members.is_empty() {
                    groups.remove(group);
                }
            }
        }
    }

    async fn check_in(&self, mut co: CheckedOut<F>) -> Result<()> {
        let id = co.id.clone();
        let group = co.group.clone();
        let Some(instance) = co.instance.take() else {
            return Ok(());
        };
        let guard = co.guard.take();
        drop(co);

        if !self.running.load(Ordering::SeqCst) {
            // Shutting down: nothing stays resident
            self.entries.lock().await.remove(&id);
            let entry = ActiveEntry {
                instance,
                group,
                last_access: Instant::now(),
            };
            let result = self.passivate_or_destroy(&id, entry).await;
            drop(guard);
            return result;
        }

        {
            let mut entries = self.entries.lock().await;
            entries.insert(
                id.clone(),
                Resident::Idle(ActiveEntry {
                    instance,
                    group,
                    last_access: Instant::now(),
                }),
            );
        }
        drop(guard);

        self.enforce_watermark().await;
        Ok(())
    }

    /// One housekeeping pass: idle eviction, watermark eviction, store sweep.
    pub(crate) async fn housekeep(&self) -> Result<()> {
        self.evict_idle().await;
        self.enforce_watermark().await;

        if let (Some(store), Some(idle_timeout)) = (&self.store, self.idle_timeout) {
            store.sweep(idle_timeout, self).await?;
        }
        Ok(())
    }

    async fn evict_idle(&self) {
        let Some(idle_timeout) = self.idle_timeout else {
            return;
        };

        let victims: Vec<(InstanceId, Option<GroupId>)> = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .filter_map(|(id, resident)| match resident {
                    Resident::Idle(entry) if entry.last_access.elapsed() > idle_timeout => {
                        Some((id.clone(), entry.group.clone()))
                    }
                    _ => None,
                })
                .collect()
        };

        self.passivate_victims(victims).await;
    }

    async fn enforce_watermark(&self) {
        let Some(watermark) = self.config.active_watermark else {
            return;
        };

        let victims: Vec<(InstanceId, Option<GroupId>)> = {
            let entries = self.entries.lock().await;
            if entries.len() <= watermark {
                return;
            }
            let excess = entries.len() - watermark;

            // Least recently used idle residents go first
            let mut idle: Vec<(Instant, InstanceId, Option<GroupId>)> = entries
                .iter()
                .filter_map(|(id, resident)| match resident {
                    Resident::Idle(entry) => {
                        Some((entry.last_access, id.clone(), entry.group.clone()))
                    }
                    _ => None,
                })
                .collect();
            idle.sort_by_key(|(last_access, _, _)| *last_access);
            idle.into_iter()
                .take(excess)
                .map(|(_, id, group)| (id, group))
                .collect()
        };

        self.passivate_victims(victims).await;
    }

    async fn passivate_victims(&self, victims: Vec<(InstanceId, Option<GroupId>)>) {
        let mut grouped_done: HashSet<GroupId> = HashSet::new();
        for (id, group) in victims {
            let outcome = match (&group, &self.store) {
                (Some(group), Some(store)) if self.config.capabilities.group_eviction => {
                    if !grouped_done.insert(group.clone()) {
                        continue;
                    }
                    self.passivate_group(store, group).await
                }
                _ => self.passivate_one(&id).await.map(|_| ()),
            };
            if let Err(err) = outcome {
                event!(Level::WARN, id = %id, error = %err, "eviction failed");
            }
        }
    }

    /// Passivate a single idle instance, or destroy it when the cache has no
    /// store. Returns false when the instance was busy or gone.
    async fn passivate_one(&self, id: &InstanceId) -> Result<bool> {
        let Some(_guard) = self.locks.try_lock(id).await else {
            return Ok(false);
        };

        let entry = match self.entries.lock().await.remove(id) {
            Some(Resident::Idle(entry)) => entry,
            // The lock was free, so a marker here is stale; dropping it is
            // the cleanup
            Some(Resident::CheckedOut { .. }) | None => return Ok(false),
        };

        match &self.store {
            Some(store) => match self.try_passivate(store, id, entry).await {
                Ok(()) => Ok(true),
                Err((err, mut entry)) => {
                    self.factory.on_activate(entry.instance.state_mut());
                    self.entries
                        .lock()
                        .await
                        .insert(id.clone(), Resident::Idle(entry));
                    Err(err)
                }
            },
            None => {
                let result = self.pool.discard(entry.instance).await;
                self.stats.record_eviction();
                result.map(|()| true)
            }
        }
    }

    /// Serialize an idle instance into the store. On failure the entry comes
    /// back so the caller can decide between restoring and destroying it.
    async fn try_passivate(
        &self,
        store: &Arc<dyn PassivationStore>,
        id: &InstanceId,
        mut entry: ActiveEntry<F::State>,
    ) -> std::result::Result<(), (CacheError, ActiveEntry<F::State>)> {
        self.factory.on_passivate(entry.instance.state_mut());
        let bytes = match encode_state(entry.instance.state()) {
            Ok(bytes) => bytes,
            Err(err) => return Err((err, entry)),
        };

        if let Err(err) = store
            .passivate(PassivationEntry::new(id.clone(), entry.group.clone(), bytes))
            .await
        {
            return Err((err, entry));
        }

        self.pool.forget(entry.instance);
        self.stats.record_passivation();
        Ok(())
    }

    /// Passivate every idle member of a group, atomically.
    ///
    /// A busy member aborts the whole group before anything is written; a
    /// store failure midway rolls the written members back out of the store
    /// and restores every shell.
    async fn passivate_group(
        &self,
        store: &Arc<dyn PassivationStore>,
        group: &GroupId,
    ) -> Result<()> {
        let members: Vec<InstanceId> = {
            let groups = self.groups.lock().await;
            groups
                .get(group)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };
        if members.is_empty() {
            return Ok(());
        }

        let mut guards = Vec::with_capacity(members.len());
        for id in &members {
            match self.locks.try_lock(id).await {
                Some(guard) => guards.push(guard),
                None => return Ok(()),
            }
        }

        // Members already passivated are skipped; only resident idle shells
        // move
        let mut shells: Vec<(InstanceId, ActiveEntry<F::State>)> = Vec::new();
        {
            let mut entries = self.entries.lock().await;
            for id in &members {
                if let Some(Resident::Idle(entry)) = entries.remove(id) {
                    shells.push((id.clone(), entry));
                }
            }
        }
        if shells.is_empty() {
            return Ok(());
        }

        let mut failure: Option<(usize, CacheError)> = None;
        for (idx, (id, entry)) in shells.iter_mut().enumerate() {
            self.factory.on_passivate(entry.instance.state_mut());
            let bytes = match encode_state(entry.instance.state()) {
                Ok(bytes) => bytes,
                Err(err) => {
                    failure = Some((idx, err));
                    break;
                }
            };
            if let Err(err) = store
                .passivate(PassivationEntry::new(
                    id.clone(),
                    Some(group.clone()),
                    bytes,
                ))
                .await
            {
                failure = Some((idx, err));
                break;
            }
        }

        if let Some((failed_at, err)) = failure {
            for idx in 0..failed_at {
                let id = &shells[idx].0;
                if let Err(remove_err) = store.remove(id).await {
                    event!(Level::WARN, id = %id, error = %remove_err, "group rollback remove failed");
                }
            }
            let mut entries = self.entries.lock().await;
            for (idx, (id, mut entry)) in shells.into_iter().enumerate() {
                if idx <= failed_at {
                    self.factory.on_activate(entry.instance.state_mut());
                }
                entries.insert(id, Resident::Idle(entry));
            }
            return Err(err);
        }

        for (_, entry) in shells {
            self.pool.forget(entry.instance);
            self.stats.record_passivation();
        }
        Ok(())
    }

    async fn passivate_or_destroy(
        &self,
        id: &InstanceId,
        entry: ActiveEntry<F::State>,
    ) -> Result<()> {
        match &self.store {
            Some(store) => match self.try_passivate(store, id, entry).await {
                Ok(()) => Ok(()),
                Err((err, entry)) => {
                    event!(Level::WARN, id = %id, error = %err, "passivation failed, destroying instance");
                    let _ = self.pool.discard(entry.instance).await;
                    self.stats.record_eviction();
                    Err(err)
                }
            },
            None => {
                let result = self.pool.discard(entry.instance).await;
                self.stats.record_eviction();
                result
            }
        }
    }

    async fn shutdown_flush(&self) {
        let ids: Vec<InstanceId> = self.entries.lock().await.keys().cloned().collect();
        for id in ids {
            let guard = match self.locks.lock(&id, self.config.access_timeout).await {
                Ok(guard) => guard,
                Err(err) => {
                    event!(Level::WARN, id = %id, error = %err, "instance still busy at shutdown, skipping");
                    continue;
                }
            };
            if let Some(Resident::Idle(entry)) = self.entries.lock().await.remove(&id) {
                if let Err(err) = self.passivate_or_destroy(&id, entry).await {
                    event!(Level::WARN, id = %id, error = %err, "flush failed at shutdown");
                }
            }
            self.locks.retire(&id).await;
            drop(guard);
        }
    }
}

#[async_trait]
impl<F: InstanceFactory> SweepListener for CacheInner<F> {
    async fn entry_expired(&self, id: &InstanceId, group: Option<&GroupId>) {
        self.forget_group_member(id, group).await;
        self.locks.retire(id).await;
        self.stats.record_expiration();
    }
}

#[async_trait]
impl<F: InstanceFactory> ReplicationListener for CacheInner<F> {
    async fn entry_replicated(&self, id: &InstanceId) {
        // The replica just became the authoritative copy; drop the local
        // idle instance. A busy instance wins over the replica
        let Some(_guard) = self.locks.try_lock(id).await else {
            return;
        };
        match self.entries.lock().await.remove(id) {
            Some(Resident::Idle(entry)) => {
                self.pool.forget(entry.instance);
                self.stats.record_eviction();
                event!(
                    Level::DEBUG,
                    cache = %self.config.name,
                    id = %id,
                    "demoted local copy after replication"
                );
            }
            Some(Resident::CheckedOut { .. }) | None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Session {
        visits: u32,
        note: String,
    }

    struct SessionFactory {
        created: AtomicUsize,
        destroyed: AtomicUsize,
    }

    impl SessionFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                created: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl InstanceFactory for SessionFactory {
        type State = Session;

        async fn create(&self) -> Result<Session> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Session {
                visits: 0,
                note: String::new(),
            })
        }

        async fn destroy(&self, _state: Session) -> Result<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn quiet_config(name: &str) -> CacheConfig {
        // A long housekeeping interval keeps the worker out of short tests
        CacheConfig::new(name)
            .housekeeping_interval(Duration::from_secs(60))
            .access_timeout(Duration::from_millis(200))
    }

    async fn started_cache(name: &str) -> (InstanceCache<SessionFactory>, Arc<SessionFactory>) {
        let factory = SessionFactory::new();
        let cache = InstanceCache::new(
            quiet_config(name),
            PoolConfig::new(4).acquisition_timeout(Duration::from_millis(200)),
            StoreConfig::in_memory(),
            factory.clone(),
        )
        .unwrap();
        cache.start().await.unwrap();
        (cache, factory)
    }

    #[tokio::test]
    async fn test_get_before_start_is_stopped() {
        let factory = SessionFactory::new();
        let cache = InstanceCache::new(
            quiet_config("orders"),
            PoolConfig::new(2),
            StoreConfig::in_memory(),
            factory,
        )
        .unwrap();

        let result = cache.get(&InstanceId::new("s1")).await;
        assert!(matches!(result, Err(CacheError::Stopped)));
    }

    #[tokio::test]
    async fn test_first_use_then_hit_keeps_instance() {
        let (cache, factory) = started_cache("orders").await;
        let id = InstanceId::new("s1");

        let mut first = cache.get(&id).await.unwrap();
        assert_eq!(first.status(), LifecycleStatus::New);
        let nr = first.nr();
        first.visits = 7;
        first.note = "hello".to_string();
        cache.release(first).await.unwrap();

        let second = cache.get(&id).await.unwrap();
        assert_eq!(second.status(), LifecycleStatus::Active);
        assert_eq!(second.nr(), nr);
        assert_eq!(second.visits, 7);
        assert_eq!(second.note, "hello");
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        cache.release(second).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_destroys_and_forgets_identity() {
        let (cache, factory) = started_cache("orders").await;
        let id = InstanceId::new("s1");

        let held = cache.get(&id).await.unwrap();
        cache.remove(held).await.unwrap();
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(cache.status(&id).await, LifecycleStatus::Removed);

        // The identity can be recreated from scratch
        let recreated = cache.get(&id).await.unwrap();
        assert_eq!(recreated.status(), LifecycleStatus::New);
        assert_eq!(recreated.visits, 0);
        cache.release(recreated).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_by_id_unknown_is_not_found() {
        let (cache, _factory) = started_cache("orders").await;

        let result = cache.remove_by_id(&InstanceId::new("ghost")).await;
        assert!(matches!(result, Err(CacheError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_by_id_idle_resident() {
        let (cache, factory) = started_cache("orders").await;
        let id = InstanceId::new("s1");

        let held = cache.get(&id).await.unwrap();
        cache.release(held).await.unwrap();

        cache.remove_by_id(&id).await.unwrap();
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(cache.status(&id).await, LifecycleStatus::Removed);
    }

    #[tokio::test]
    async fn test_with_exclusive_access_mutates_in_place() {
        let (cache, _factory) = started_cache("orders").await;
        let id = InstanceId::new("s1");

        for _ in 0..3 {
            cache
                .with_exclusive_access(&id, |session| {
                    session.visits += 1;
                    Ok(())
                })
                .await
                .unwrap();
        }

        let total = cache
            .with_exclusive_access(&id, |session| Ok(session.visits))
            .await
            .unwrap();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn test_with_exclusive_access_releases_on_action_failure() {
        let (cache, _factory) = started_cache("orders").await;
        let id = InstanceId::new("s1");

        let result: Result<()> = cache
            .with_exclusive_access(&id, |_session| {
                Err(CacheError::Lifecycle("action failed".to_string()))
            })
            .await;
        assert!(result.is_err());

        // The lock was released, so the next access proceeds
        let held = cache.get(&id).await.unwrap();
        cache.release(held).await.unwrap();
    }

    #[tokio::test]
    async fn test_watermark_evicts_lru_to_store() {
        let factory = SessionFactory::new();
        let store = Arc::new(MemoryStore::new(None));
        let cache = InstanceCache::with_store(
            quiet_config("orders").active_watermark(1),
            PoolConfig::new(4).acquisition_timeout(Duration::from_millis(200)),
            None,
            store.clone(),
            factory,
        )
        .unwrap();
        cache.start().await.unwrap();

        let older = InstanceId::new("older");
        let newer = InstanceId::new("newer");

        let held = cache.get(&older).await.unwrap();
        cache.release(held).await.unwrap();
        let held = cache.get(&newer).await.unwrap();

        // Releasing the second resident pushes the count over the watermark;
        // the least recently used idle instance moves to the store
        cache.release(held).await.unwrap();

        assert_eq!(cache.status(&older).await, LifecycleStatus::Passivated);
        assert_eq!(cache.status(&newer).await, LifecycleStatus::Active);
        assert_eq!(store.len().await.unwrap(), 1);

        // Activation brings the state back
        let revived = cache.get(&older).await.unwrap();
        assert_eq!(revived.status(), LifecycleStatus::Active);
        let stats = cache.stats().await;
        assert_eq!(stats.passivations, 1);
        assert_eq!(stats.activations, 1);
        cache.release(revived).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_flushes_residents_to_store() {
        let factory = SessionFactory::new();
        let store = Arc::new(MemoryStore::new(None));
        let cache = InstanceCache::with_store(
            quiet_config("orders"),
            PoolConfig::new(4).acquisition_timeout(Duration::from_millis(200)),
            None,
            store.clone(),
            factory.clone(),
        )
        .unwrap();
        cache.start().await.unwrap();

        for name in ["a", "b"] {
            let mut held = cache.get(&InstanceId::new(name)).await.unwrap();
            held.visits = 1;
            cache.release(held).await.unwrap();
        }

        cache.stop().await.unwrap();
        assert_eq!(store.len().await.unwrap(), 2);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 0);

        // Idempotent
        cache.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_after_stop_does_not_keep_resident() {
        let factory = SessionFactory::new();
        let store = Arc::new(MemoryStore::new(None));
        let cache = InstanceCache::with_store(
            quiet_config("orders"),
            PoolConfig::new(4).acquisition_timeout(Duration::from_millis(200)),
            None,
            store.clone(),
            factory,
        )
        .unwrap();
        cache.start().await.unwrap();

        let held = cache.get(&InstanceId::new("s1")).await.unwrap();
        cache.stop().await.unwrap();

        cache.release(held).await.unwrap();
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_passivation_disabled_destroys_on_eviction() {
        let factory = SessionFactory::new();
        let cache = InstanceCache::new(
            quiet_config("workers")
                .without_passivation()
                .active_watermark(1),
            PoolConfig::new(4).acquisition_timeout(Duration::from_millis(200)),
            StoreConfig::in_memory(),
            factory.clone(),
        )
        .unwrap();
        cache.start().await.unwrap();

        for name in ["a", "b"] {
            let held = cache.get(&InstanceId::new(name)).await.unwrap();
            cache.release(held).await.unwrap();
        }

        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(cache.status(&InstanceId::new("a")).await, LifecycleStatus::Removed);
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let (cache, _factory) = started_cache("orders").await;
        let result = cache.start().await;
        assert!(matches!(result, Err(CacheError::Lifecycle(_))));
    }
}
