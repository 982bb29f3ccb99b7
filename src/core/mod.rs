pub mod config;
pub mod error;
pub mod types;

pub use config::{
    CacheCapabilities, CacheConfig, ClusterStoreParams, FileStoreParams, PoolConfig, StoreBackend,
    StoreConfig,
};
pub use error::{CacheError, Result};
pub use types::{GroupId, InstanceId, LifecycleStatus, PassivationEntry, SweepReport};
