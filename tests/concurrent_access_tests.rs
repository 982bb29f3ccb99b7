/// Concurrent access tests
///
/// Tests for multi-task contention, pool pressure with eviction churn, and
/// housekeeping racing live traffic
/// Run with: cargo test --test concurrent_access_tests

use serde::{Deserialize, Serialize};
use stasis::{
    CacheConfig, CacheError, InstanceCache, InstanceFactory, InstanceId, PoolConfig, Result,
    StoreConfig,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Barrier;

#[derive(Debug, Serialize, Deserialize)]
struct Session {
    visits: u32,
}

struct SessionFactory {
    created: AtomicUsize,
}

impl SessionFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            created: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl InstanceFactory for SessionFactory {
    type State = Session;

    async fn create(&self) -> Result<Session> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Session { visits: 0 })
    }
}

async fn started(
    cache_config: CacheConfig,
    pool_config: PoolConfig,
) -> (Arc<InstanceCache<SessionFactory>>, Arc<SessionFactory>) {
    let factory = SessionFactory::new();
    let cache = InstanceCache::new(
        cache_config,
        pool_config,
        StoreConfig::in_memory(),
        factory.clone(),
    )
    .unwrap();
    cache.start().await.unwrap();
    (Arc::new(cache), factory)
}

#[tokio::test]
async fn test_single_identity_increments_are_serialized() {
    let (cache, factory) = started(
        CacheConfig::new("serialized")
            .access_timeout(Duration::from_secs(5))
            .housekeeping_interval(Duration::from_secs(60)),
        PoolConfig::new(4),
    )
    .await;

    let id = InstanceId::new("hot");
    let num_tasks = 8;
    let increments_per_task = 20;
    let barrier = Arc::new(Barrier::new(num_tasks));
    let mut handles = vec![];

    for _ in 0..num_tasks {
        let cache_clone = Arc::clone(&cache);
        let id_clone = id.clone();
        let barrier_clone = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            barrier_clone.wait().await;

            for _ in 0..increments_per_task {
                cache_clone
                    .with_exclusive_access(&id_clone, |session| {
                        session.visits += 1;
                        Ok(())
                    })
                    .await
                    .unwrap();
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    let total = cache
        .with_exclusive_access(&id, |session| Ok(session.visits))
        .await
        .unwrap();
    assert_eq!(total, (num_tasks * increments_per_task) as u32);
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);

    cache.stop().await.unwrap();
}

#[tokio::test]
async fn test_distinct_identities_progress_independently() {
    let (cache, factory) = started(
        CacheConfig::new("parallel")
            .access_timeout(Duration::from_secs(5))
            .housekeeping_interval(Duration::from_secs(60)),
        PoolConfig::new(16),
    )
    .await;

    let num_tasks = 8;
    let cycles = 10;
    let barrier = Arc::new(Barrier::new(num_tasks));
    let mut handles = vec![];

    for task_id in 0..num_tasks {
        let cache_clone = Arc::clone(&cache);
        let barrier_clone = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            let id = InstanceId::new(format!("session-{}", task_id));
            barrier_clone.wait().await;

            for _ in 0..cycles {
                let mut session = cache_clone.get(&id).await.unwrap();
                session.visits += 1;
                cache_clone.release(session).await.unwrap();
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    // One instance per identity, every increment retained
    assert_eq!(factory.created.load(Ordering::SeqCst), num_tasks);
    for task_id in 0..num_tasks {
        let id = InstanceId::new(format!("session-{}", task_id));
        let visits = cache
            .with_exclusive_access(&id, |session| Ok(session.visits))
            .await
            .unwrap();
        assert_eq!(visits, cycles as u32, "identity {} lost updates", task_id);
    }

    let stats = cache.stats().await;
    assert_eq!(stats.resident, num_tasks);
    assert_eq!(stats.checked_out, 0);

    cache.stop().await.unwrap();
}

#[tokio::test]
async fn test_pool_pressure_forces_eviction_churn_without_losing_state() {
    // More identities than pool slots: progress depends on eviction freeing
    // capacity, and every mutation must survive its passivation round trips
    let (cache, _factory) = started(
        CacheConfig::new("churn")
            .access_timeout(Duration::from_secs(5))
            .active_watermark(1)
            .housekeeping_interval(Duration::from_secs(60)),
        PoolConfig::new(2).acquisition_timeout(Duration::from_secs(5)),
    )
    .await;

    let num_tasks = 4;
    let cycles = 5;
    let barrier = Arc::new(Barrier::new(num_tasks));
    let mut handles = vec![];

    for task_id in 0..num_tasks {
        let cache_clone = Arc::clone(&cache);
        let barrier_clone = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            let id = InstanceId::new(format!("tenant-{}", task_id));
            barrier_clone.wait().await;

            for _ in 0..cycles {
                cache_clone
                    .with_exclusive_access(&id, |session| {
                        session.visits += 1;
                        Ok(())
                    })
                    .await
                    .unwrap();
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    for task_id in 0..num_tasks {
        let id = InstanceId::new(format!("tenant-{}", task_id));
        let visits = cache
            .with_exclusive_access(&id, |session| Ok(session.visits))
            .await
            .unwrap();
        assert_eq!(visits, cycles as u32, "identity {} lost updates", task_id);
    }

    // Four identities never fit two slots at once
    let stats = cache.stats().await;
    assert!(stats.passivations >= 1);
    assert!(stats.activations >= 1);

    cache.stop().await.unwrap();
}

#[tokio::test]
async fn test_housekeeping_races_live_traffic() {
    // An aggressive worker interval makes watermark passes overlap the
    // checkout traffic below
    let (cache, _factory) = started(
        CacheConfig::new("racing")
            .access_timeout(Duration::from_secs(5))
            .active_watermark(2)
            .housekeeping_interval(Duration::from_millis(10)),
        PoolConfig::new(8).acquisition_timeout(Duration::from_secs(5)),
    )
    .await;

    let num_tasks = 4;
    let cycles = 10;
    let barrier = Arc::new(Barrier::new(num_tasks));
    let mut handles = vec![];

    for task_id in 0..num_tasks {
        let cache_clone = Arc::clone(&cache);
        let barrier_clone = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            let id = InstanceId::new(format!("session-{}", task_id));
            barrier_clone.wait().await;

            for _ in 0..cycles {
                let mut session = cache_clone.get(&id).await.unwrap();
                session.visits += 1;
                cache_clone.release(session).await.unwrap();

                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    for task_id in 0..num_tasks {
        let id = InstanceId::new(format!("session-{}", task_id));
        let visits = cache
            .with_exclusive_access(&id, |session| Ok(session.visits))
            .await
            .unwrap();
        assert_eq!(visits, cycles as u32, "identity {} lost updates", task_id);
    }

    cache.stop().await.unwrap();
}

#[tokio::test]
async fn test_contenders_time_out_then_recover() {
    let (cache, _factory) = started(
        CacheConfig::new("contended")
            .access_timeout(Duration::from_millis(40))
            .housekeeping_interval(Duration::from_secs(60)),
        PoolConfig::new(4),
    )
    .await;

    let id = InstanceId::new("slow");
    let held = cache.get(&id).await.unwrap();

    let mut contenders = vec![];
    for _ in 0..3 {
        let cache_clone = Arc::clone(&cache);
        let id_clone = id.clone();
        contenders.push(tokio::spawn(async move { cache_clone.get(&id_clone).await }));
    }

    for contender in contenders {
        match contender.await.unwrap() {
            Err(err @ CacheError::AccessTimeout(_, _)) => assert!(err.is_retryable()),
            other => panic!("expected AccessTimeout, got {:?}", other.map(|_| ())),
        }
    }

    // Once the holder releases, the identity serves callers again
    cache.release(held).await.unwrap();
    let recovered = cache.get(&id).await.unwrap();
    cache.release(recovered).await.unwrap();

    cache.stop().await.unwrap();
}
