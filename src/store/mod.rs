pub mod cluster;
pub mod file;
pub mod memory;

pub use cluster::{
    ClusterStore, InMemoryTransport, ReplicationEnvelope, ReplicationListener, ReplicationOp,
    ReplicationTransport,
};
pub use file::FileStore;
pub use memory::MemoryStore;

use crate::core::{
    CacheError, GroupId, InstanceId, PassivationEntry, Result, StoreBackend, StoreConfig,
    SweepReport,
};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// A backend holding passivated instance state.
///
/// An entry lives in exactly one place at a time: `activate` removes it as it
/// hands it back, and a concurrent sweep of the same identity is serialized
/// against activation inside each backend.
#[async_trait]
pub trait PassivationStore: Send + Sync {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Persist a passivated entry. At capacity the oldest entries are
    /// forcibly expired first.
    async fn passivate(&self, entry: PassivationEntry) -> Result<()>;

    /// Take an entry out of the store. The entry no longer exists in the
    /// store once returned.
    async fn activate(&self, id: &InstanceId) -> Result<PassivationEntry>;

    /// Delete an entry if present. Idempotent; returns whether an entry was
    /// deleted.
    async fn remove(&self, id: &InstanceId) -> Result<bool>;

    /// Expire entries idle longer than `idle_timeout`, reporting each expiry
    /// to `listener`. Per-entry failures are skipped, never abort the pass.
    async fn sweep(&self, idle_timeout: Duration, listener: &dyn SweepListener)
    -> Result<SweepReport>;

    /// Number of stored entries.
    async fn len(&self) -> Result<usize>;

    /// Whether an entry exists for `id`.
    async fn contains(&self, id: &InstanceId) -> Result<bool>;

    /// Register the listener notified when a replicated entry lands on this
    /// node. Only replicated backends do anything here.
    async fn set_replication_listener(&self, _listener: Weak<dyn ReplicationListener>) {}
}

/// Receives expiry notifications during a sweep.
#[async_trait]
pub trait SweepListener: Send + Sync {
    async fn entry_expired(&self, id: &InstanceId, group: Option<&GroupId>);
}

/// For sweeping a store that has no cache on top.
#[async_trait]
impl SweepListener for () {
    async fn entry_expired(&self, _id: &InstanceId, _group: Option<&GroupId>) {}
}

/// Serialize instance state for a passivation entry.
pub fn encode_state<S: Serialize>(state: &S) -> Result<Vec<u8>> {
    rmp_serde::to_vec(state)
        .map_err(|err| CacheError::Lifecycle(format!("serialize instance state: {}", err)))
}

/// Deserialize instance state out of a passivation entry.
pub fn decode_state<S: DeserializeOwned>(id: &InstanceId, bytes: &[u8]) -> Result<S> {
    rmp_serde::from_slice(bytes).map_err(|err| CacheError::CorruptEntry(id.clone(), err.to_string()))
}

impl StoreConfig {
    /// Resolve the configured backend into a concrete store.
    ///
    /// The cluster backend needs a transport; use
    /// [`StoreConfig::build_with_transport`] for it.
    pub fn build(&self) -> Result<Arc<dyn PassivationStore>> {
        self.validate().map_err(CacheError::Config)?;

        match &self.backend {
            StoreBackend::InMemory => Ok(Arc::new(MemoryStore::new(self.max_size))),
            StoreBackend::File(params) => {
                Ok(Arc::new(FileStore::new(params.clone(), self.max_size)))
            }
            StoreBackend::Cluster(_) => Err(CacheError::Config(
                "cluster backend requires a replication transport; use build_with_transport"
                    .to_string(),
            )),
        }
    }

    /// Resolve the configured backend, wiring `transport` into a cluster
    /// backend. Other backends ignore the transport.
    pub fn build_with_transport(
        &self,
        transport: Arc<dyn ReplicationTransport>,
    ) -> Result<Arc<dyn PassivationStore>> {
        self.validate().map_err(CacheError::Config)?;

        match &self.backend {
            StoreBackend::Cluster(params) => Ok(Arc::new(ClusterStore::new(
                params.clone(),
                self.max_size,
                transport,
            ))),
            _ => self.build(),
        }
    }
}
