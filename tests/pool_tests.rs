/// Strict-max pool tests
///
/// Tests for capacity enforcement, waiter handoff, and shell reuse
/// Run with: cargo test --test pool_tests

use serde::{Deserialize, Serialize};
use stasis::{CacheError, InstanceFactory, PoolConfig, Result, StrictMaxPool};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Barrier;

#[derive(Debug, Serialize, Deserialize)]
struct Worker {
    tag: String,
}

struct WorkerFactory {
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

impl WorkerFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl InstanceFactory for WorkerFactory {
    type State = Worker;

    async fn create(&self) -> Result<Worker> {
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Worker {
            tag: format!("worker-{}", n),
        })
    }

    async fn destroy(&self, _state: Worker) -> Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_capacity_is_a_hard_bound() {
    let factory = WorkerFactory::new();
    let pool = StrictMaxPool::new(PoolConfig::new(2), factory.clone()).unwrap();

    let _a = pool.acquire(Duration::from_millis(100)).await.unwrap();
    let _b = pool.acquire(Duration::from_millis(100)).await.unwrap();

    match pool.acquire(Duration::from_millis(100)).await {
        Err(CacheError::PoolExhausted(waited)) => {
            assert_eq!(waited, Duration::from_millis(100));
        }
        other => panic!("expected PoolExhausted, got {:?}", other.map(|p| p.nr())),
    }

    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_pool_exhausted_is_retryable() {
    let factory = WorkerFactory::new();
    let pool = StrictMaxPool::new(PoolConfig::new(1), factory).unwrap();

    let _held = pool.acquire(Duration::from_millis(50)).await.unwrap();
    let err = pool.acquire(Duration::from_millis(50)).await.unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_release_hands_shell_to_blocked_waiter() {
    let factory = WorkerFactory::new();
    let pool = Arc::new(StrictMaxPool::new(PoolConfig::new(2), factory.clone()).unwrap());

    // A and B fill the pool
    let a = pool.acquire(Duration::from_millis(100)).await.unwrap();
    let a_nr = a.nr();
    let _b = pool.acquire(Duration::from_millis(100)).await.unwrap();

    // C queues behind the full pool
    let waiter_pool = Arc::clone(&pool);
    let waiter = tokio::spawn(async move { waiter_pool.acquire(Duration::from_millis(500)).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.release(a).await;

    // C gets A's reclaimed shell, not a fresh instance
    let c = waiter.await.unwrap().unwrap();
    assert_eq!(c.nr(), a_nr);
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_waiters_are_served_in_fifo_order() {
    let factory = WorkerFactory::new();
    let pool = Arc::new(StrictMaxPool::new(PoolConfig::new(1), factory).unwrap());
    let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

    let held = pool.acquire(Duration::from_millis(100)).await.unwrap();

    let mut handles = vec![];
    for waiter_nr in 0..3 {
        let waiter_pool = Arc::clone(&pool);
        let order_clone = Arc::clone(&order);

        handles.push(tokio::spawn(async move {
            let instance = waiter_pool.acquire(Duration::from_secs(2)).await.unwrap();
            order_clone.lock().await.push(waiter_nr);
            waiter_pool.release(instance).await;
        }));

        // Queue positions are fixed by arrival order
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    pool.release(held).await;
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(*order.lock().await, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_timed_out_waiter_gives_up_queue_position() {
    let factory = WorkerFactory::new();
    let pool = Arc::new(StrictMaxPool::new(PoolConfig::new(1), factory).unwrap());

    let held = pool.acquire(Duration::from_millis(50)).await.unwrap();

    // This waiter times out while the slot is held
    let waiter_pool = Arc::clone(&pool);
    let timed_out = tokio::spawn(async move { waiter_pool.acquire(Duration::from_millis(50)).await });
    assert!(matches!(
        timed_out.await.unwrap(),
        Err(CacheError::PoolExhausted(_))
    ));

    // The abandoned wait left no claim on the slot
    pool.release(held).await;
    assert!(pool.acquire(Duration::from_millis(100)).await.is_ok());
}

#[tokio::test]
async fn test_discard_restores_capacity_and_destroys() {
    let factory = WorkerFactory::new();
    let pool = StrictMaxPool::new(PoolConfig::new(1), factory.clone()).unwrap();

    let instance = pool.acquire(Duration::from_millis(50)).await.unwrap();
    pool.discard(instance).await.unwrap();

    assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);

    // The slot is free again; a fresh instance fills it
    let replacement = pool.acquire(Duration::from_millis(50)).await.unwrap();
    assert_eq!(replacement.state().tag, "worker-1");
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_warmed_shells_serve_first_acquisitions() {
    let factory = WorkerFactory::new();
    let pool = StrictMaxPool::new(PoolConfig::new(4).warm_size(2), factory.clone()).unwrap();

    pool.warm(2).await.unwrap();
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);

    let _a = pool.acquire(Duration::from_millis(50)).await.unwrap();
    let _b = pool.acquire(Duration::from_millis(50)).await.unwrap();

    // Both came off the free list
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);

    let stats = pool.stats().await;
    assert_eq!(stats.outstanding, 2);
    assert_eq!(stats.free, 0);
}

#[tokio::test]
async fn test_capacity_never_exceeded_under_load() {
    let factory = WorkerFactory::new();
    let pool = Arc::new(
        StrictMaxPool::new(PoolConfig::new(4), factory.clone()).unwrap(),
    );

    let live = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(12));
    let mut handles = vec![];

    for _ in 0..12 {
        let pool_clone = Arc::clone(&pool);
        let live_clone = Arc::clone(&live);
        let peak_clone = Arc::clone(&peak);
        let barrier_clone = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            barrier_clone.wait().await;

            for _ in 0..10 {
                let instance = pool_clone.acquire(Duration::from_secs(2)).await.unwrap();
                let now_live = live_clone.fetch_add(1, Ordering::SeqCst) + 1;
                peak_clone.fetch_max(now_live, Ordering::SeqCst);

                tokio::time::sleep(Duration::from_millis(1)).await;

                live_clone.fetch_sub(1, Ordering::SeqCst);
                pool_clone.release(instance).await;
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 4);
    assert!(factory.created.load(Ordering::SeqCst) <= 4);

    let stats = pool.stats().await;
    assert_eq!(stats.outstanding, 0);
}
