use crate::core::{CacheError, PoolConfig, Result};
use crate::factory::InstanceFactory;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{Level, event};

/// Strict-max instance pool
///
/// Enforces a hard upper bound on concurrently existing instances. Acquirers
/// beyond the bound block FIFO-fair until a slot frees or their timeout
/// elapses. Released instances keep their state as scratch and are reused
/// before the factory is asked for a fresh one.
pub struct StrictMaxPool<F: InstanceFactory> {
    /// Pool configuration
    config: PoolConfig,
    /// Factory creating and destroying instance state
    factory: Arc<F>,
    /// Capacity slots; one permit per live instance
    slots: Arc<Semaphore>,
    /// Idle shells available for reuse
    free: Arc<Mutex<Vec<Instance<F::State>>>>,
    /// Next instance number
    next_nr: AtomicU64,
    /// Instances created by the factory
    created_total: AtomicU64,
    /// Instances destroyed
    discarded_total: AtomicU64,
}

/// An instance shell: a pool-assigned number plus the component state.
#[derive(Debug)]
pub struct Instance<S> {
    nr: u64,
    state: S,
}

impl<S> Instance<S> {
    pub fn nr(&self) -> u64 {
        self.nr
    }

    fn into_state(self) -> S {
        self.state
    }
}

/// An instance checked out of the pool, holding its capacity slot.
///
/// Must travel back through [`StrictMaxPool::release`] or
/// [`StrictMaxPool::discard`]; dropping it returns the slot but loses the
/// state.
#[derive(Debug)]
pub struct PooledInstance<S> {
    instance: Option<Instance<S>>,
    _permit: OwnedSemaphorePermit,
}

impl<S> PooledInstance<S> {
    fn new(instance: Instance<S>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            instance: Some(instance),
            _permit: permit,
        }
    }

    pub fn nr(&self) -> u64 {
        self.instance
            .as_ref()
            .expect("instance already returned to pool")
            .nr
    }

    pub fn state(&self) -> &S {
        &self
            .instance
            .as_ref()
            .expect("instance already returned to pool")
            .state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self
            .instance
            .as_mut()
            .expect("instance already returned to pool")
            .state
    }

    fn take(&mut self) -> Option<Instance<S>> {
        self.instance.take()
    }
}

impl<S> Drop for PooledInstance<S> {
    fn drop(&mut self) {
        if self.instance.is_some() {
            eprintln!(
                "Warning: PooledInstance dropped without release or discard. State is lost; the slot is reclaimed."
            );
        }
    }
}

impl<F: InstanceFactory> StrictMaxPool<F> {
    pub fn new(config: PoolConfig, factory: Arc<F>) -> Result<Self> {
        config.validate().map_err(CacheError::Config)?;

        let max_size = config.max_size;
        Ok(Self {
            config,
            factory,
            slots: Arc::new(Semaphore::new(max_size)),
            free: Arc::new(Mutex::new(Vec::with_capacity(max_size))),
            next_nr: AtomicU64::new(1),
            created_total: AtomicU64::new(0),
            discarded_total: AtomicU64::new(0),
        })
    }

    /// Acquire an instance, creating one through the factory when no idle
    /// shell is available.
    ///
    /// Waits up to `wait` for a capacity slot; waiters are served in FIFO
    /// order and an abandoned waiter gives up its queue position without
    /// consuming a slot. Timing out yields [`CacheError::PoolExhausted`].
    pub async fn acquire(&self, wait: Duration) -> Result<PooledInstance<F::State>> {
        let permit = self.acquire_slot(wait).await?;

        // Reuse an idle shell before asking the factory for a new instance
        if let Some(instance) = self.free.lock().await.pop() {
            return Ok(PooledInstance::new(instance, permit));
        }

        // A factory failure drops the permit, so the slot is not leaked
        let state = self.factory.create().await?;
        self.created_total.fetch_add(1, Ordering::SeqCst);
        let nr = self.next_nr.fetch_add(1, Ordering::SeqCst);

        Ok(PooledInstance::new(Instance { nr, state }, permit))
    }

    /// Acquire a slot for state restored from a passivation store.
    ///
    /// The factory is not consulted: an idle shell has its scratch state
    /// replaced in place, or a fresh shell is wrapped around `state`.
    pub async fn acquire_with_state(
        &self,
        state: F::State,
        wait: Duration,
    ) -> Result<PooledInstance<F::State>> {
        let permit = self.acquire_slot(wait).await?;

        let instance = match self.free.lock().await.pop() {
            Some(mut shell) => {
                shell.state = state;
                shell
            }
            None => Instance {
                nr: self.next_nr.fetch_add(1, Ordering::SeqCst),
                state,
            },
        };

        Ok(PooledInstance::new(instance, permit))
    }

    /// Return an instance to the pool for reuse.
    pub async fn release(&self, mut pooled: PooledInstance<F::State>) {
        if let Some(instance) = pooled.take() {
            self.free.lock().await.push(instance);
        }
        // The slot frees when `pooled` drops, after the shell is back on the
        // free list, so a woken waiter finds it there
        drop(pooled);
    }

    /// Drop an instance whose state has moved elsewhere.
    ///
    /// No teardown runs and the shell is not kept for reuse; only the
    /// capacity slot returns. This is the passivation path: the serialized
    /// state now lives in a store, so the in-memory copy must not reappear
    /// on the free list.
    pub fn forget(&self, mut pooled: PooledInstance<F::State>) {
        let _ = pooled.take();
        drop(pooled);
    }

    /// Destroy an instance instead of returning it.
    ///
    /// The slot is reclaimed whether or not the factory's teardown succeeds;
    /// a teardown failure is logged and returned.
    pub async fn discard(&self, mut pooled: PooledInstance<F::State>) -> Result<()> {
        let result = match pooled.take() {
            Some(instance) => self.factory.destroy(instance.into_state()).await,
            None => Ok(()),
        };
        self.discarded_total.fetch_add(1, Ordering::SeqCst);
        drop(pooled);

        if let Err(err) = &result {
            event!(Level::WARN, error = %err, "instance destroy failed");
        }
        result
    }

    /// Pre-create idle instances, up to the remaining idle capacity.
    pub async fn warm(&self, count: usize) -> Result<()> {
        let mut free = self.free.lock().await;

        let idle_capacity = self.slots.available_permits().saturating_sub(free.len());
        for _ in 0..count.min(idle_capacity) {
            let state = self.factory.create().await?;
            self.created_total.fetch_add(1, Ordering::SeqCst);
            free.push(Instance {
                nr: self.next_nr.fetch_add(1, Ordering::SeqCst),
                state,
            });
        }

        Ok(())
    }

    /// Destroy all idle instances.
    ///
    /// Outstanding instances are unaffected; teardown failures are logged
    /// and the drain continues.
    pub async fn drain(&self) {
        let drained: Vec<Instance<F::State>> = {
            let mut free = self.free.lock().await;
            free.drain(..).collect()
        };

        for instance in drained {
            if let Err(err) = self.factory.destroy(instance.into_state()).await {
                event!(Level::WARN, error = %err, "instance destroy during drain failed");
            }
            self.discarded_total.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get pool statistics
    pub async fn stats(&self) -> PoolStats {
        let free = self.free.lock().await.len();
        let outstanding = self.config.max_size - self.slots.available_permits();

        PoolStats {
            max_size: self.config.max_size,
            free,
            outstanding,
            created_total: self.created_total.load(Ordering::SeqCst),
            discarded_total: self.discarded_total.load(Ordering::SeqCst),
        }
    }

    async fn acquire_slot(&self, wait: Duration) -> Result<OwnedSemaphorePermit> {
        timeout(wait, self.slots.clone().acquire_owned())
            .await
            .map_err(|_| CacheError::PoolExhausted(wait))?
            .map_err(|_| CacheError::Stopped)
    }
}

/// Instance pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub max_size: usize,
    pub free: usize,
    pub outstanding: usize,
    pub created_total: u64,
    pub discarded_total: u64,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} outstanding, {} free, {} created, {} discarded",
            self.outstanding, self.max_size, self.free, self.created_total, self.discarded_total
        )
    }
}
