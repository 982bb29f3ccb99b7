// ============================================================================
// Stasis Library
// ============================================================================

pub mod cache;
pub mod core;
pub mod factory;
pub mod lock;
pub mod pool;
pub mod registry;
pub mod store;

// Re-export main types for convenience
pub use cache::{CacheStatsSnapshot, CheckedOut, InstanceCache};
pub use core::{
    CacheCapabilities, CacheConfig, CacheError, ClusterStoreParams, FileStoreParams, GroupId,
    InstanceId, LifecycleStatus, PassivationEntry, PoolConfig, Result, StoreBackend, StoreConfig,
    SweepReport,
};
pub use factory::InstanceFactory;
pub use lock::{AccessGuard, LockManager};
pub use pool::{PoolStats, PooledInstance, StrictMaxPool};
pub use registry::{CacheRegistry, ManagedCache};

// Re-export store API
pub use store::{
    ClusterStore, FileStore, InMemoryTransport, MemoryStore, PassivationStore,
    ReplicationEnvelope, ReplicationListener, ReplicationOp, ReplicationTransport, SweepListener,
};
