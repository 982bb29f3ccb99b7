use crate::core::{
    CacheError, ClusterStoreParams, GroupId, InstanceId, PassivationEntry, Result, SweepReport,
};
use crate::store::{PassivationStore, SweepListener};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{Level, event};

/// A replicated passivation operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplicationOp {
    /// Store a copy of a passivated entry.
    Put(PassivationEntry),
    /// The origin node took the entry over; drop local copies.
    Claim(InstanceId),
    /// The entry is gone cluster-wide.
    Remove(InstanceId),
}

impl ReplicationOp {
    pub fn id(&self) -> &InstanceId {
        match self {
            Self::Put(entry) => &entry.id,
            Self::Claim(id) | Self::Remove(id) => id,
        }
    }
}

/// One replicated operation addressed to a named cache.
///
/// Nodes ignore envelopes for caches they are not configured for, so several
/// bean caches can share one transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationEnvelope {
    /// Qualified cache name, `<container>/<bean-cache>`
    pub cache: String,
    /// Sending node
    pub origin: String,
    pub op: ReplicationOp,
}

/// Carries replicated operations between nodes.
#[async_trait]
pub trait ReplicationTransport: Send + Sync {
    /// Deliver an envelope to a target node.
    async fn replicate(&self, target: &str, envelope: ReplicationEnvelope) -> Result<()>;

    /// Check that a target node is reachable.
    async fn probe(&self, target: &str) -> Result<()> {
        let _ = target;
        Ok(())
    }
}

/// Notified when a replicated entry lands on this node.
#[async_trait]
pub trait ReplicationListener: Send + Sync {
    async fn entry_replicated(&self, id: &InstanceId);
}

/// Acknowledgment bookkeeping for one replicated write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationStatus {
    pub required_acks: usize,
    pub acknowledged_nodes: Vec<String>,
    pub failed_nodes: Vec<String>,
}

impl ReplicationStatus {
    /// True when enough nodes acknowledged the write.
    pub fn quorum_met(&self) -> bool {
        self.acknowledged_nodes.len() >= self.required_acks
    }
}

/// A locally stored entry together with the node that owns it.
#[derive(Debug, Clone)]
struct StoredReplica {
    entry: PassivationEntry,
    owner: String,
}

/// Replicated passivation store.
///
/// Passivation writes locally and replicates the entry to every peer;
/// activation takes the local copy and claims ownership cluster-wide, so an
/// entry keeps exactly one owner. Only the owner expires an entry, which
/// gives every entry a single eviction edge across the cluster.
pub struct ClusterStore {
    params: ClusterStoreParams,
    max_size: Option<usize>,
    transport: Arc<dyn ReplicationTransport>,
    entries: Mutex<HashMap<InstanceId, StoredReplica>>,
    /// Identity to owning node, the routing view handed to re-attach traffic
    mappings: Mutex<HashMap<InstanceId, String>>,
    listener: Mutex<Option<Weak<dyn ReplicationListener>>>,
    replication_failures: AtomicU64,
}

impl ClusterStore {
    pub fn new(
        params: ClusterStoreParams,
        max_size: Option<usize>,
        transport: Arc<dyn ReplicationTransport>,
    ) -> Self {
        Self {
            params,
            max_size,
            transport,
            entries: Mutex::new(HashMap::new()),
            mappings: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            replication_failures: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.params.node_id
    }

    /// The node currently hosting an identity, per the client-mappings view.
    pub async fn owner_of(&self, id: &InstanceId) -> Option<String> {
        self.mappings.lock().await.get(id).cloned()
    }

    /// Replication failures recorded in best-effort mode.
    pub fn replication_failures(&self) -> u64 {
        self.replication_failures.load(Ordering::Relaxed)
    }

    fn qualified_cache(&self) -> String {
        format!("{}/{}", self.params.cache_container, self.params.bean_cache)
    }

    fn required_acks(&self) -> usize {
        let members = self.params.peers.len() + 1;
        members / 2 + 1
    }

    /// Ship an operation to every peer and count acknowledgments. The local
    /// node is always the first acknowledger.
    async fn broadcast(&self, op: ReplicationOp) -> ReplicationStatus {
        let envelope = ReplicationEnvelope {
            cache: self.qualified_cache(),
            origin: self.params.node_id.clone(),
            op,
        };

        let calls = self.params.peers.iter().map(|peer| {
            let envelope = envelope.clone();
            let transport = self.transport.clone();
            let wait = self.params.replication_timeout;
            async move {
                let outcome = match timeout(wait, transport.replicate(peer, envelope)).await {
                    Ok(result) => result,
                    Err(_) => Err(CacheError::StoreUnavailable(format!(
                        "replication to '{}' timed out after {:?}",
                        peer, wait
                    ))),
                };
                (peer.clone(), outcome)
            }
        });

        let mut status = ReplicationStatus {
            required_acks: self.required_acks(),
            acknowledged_nodes: vec![self.params.node_id.clone()],
            failed_nodes: Vec::new(),
        };

        for (peer, outcome) in join_all(calls).await {
            match outcome {
                Ok(()) => status.acknowledged_nodes.push(peer),
                Err(err) => {
                    self.replication_failures.fetch_add(1, Ordering::Relaxed);
                    status.failed_nodes.push(format!("{} ({})", peer, err));
                }
            }
        }

        status
    }

    fn quorum_error(&self, action: &str, status: &ReplicationStatus) -> CacheError {
        CacheError::StoreUnavailable(format!(
            "Replication quorum not met for {}: required {}, acknowledged {}, failed: {}",
            action,
            status.required_acks,
            status.acknowledged_nodes.len(),
            status.failed_nodes.join("; ")
        ))
    }

    /// Undo a write on the peers that acknowledged it.
    async fn compensate(&self, id: &InstanceId, acknowledged: &[String]) {
        let envelope = ReplicationEnvelope {
            cache: self.qualified_cache(),
            origin: self.params.node_id.clone(),
            op: ReplicationOp::Remove(id.clone()),
        };

        for peer in acknowledged {
            if peer == &self.params.node_id {
                continue;
            }
            if let Err(err) = timeout(
                self.params.replication_timeout,
                self.transport.replicate(peer, envelope.clone()),
            )
            .await
            .unwrap_or_else(|_| {
                Err(CacheError::StoreUnavailable(
                    "compensation timed out".to_string(),
                ))
            }) {
                self.replication_failures.fetch_add(1, Ordering::Relaxed);
                event!(Level::WARN, peer = %peer, id = %id, error = %err, "compensating remove failed");
            }
        }
    }

    /// Apply an operation replicated from another node.
    pub async fn apply(&self, envelope: ReplicationEnvelope) -> Result<()> {
        if envelope.cache != self.qualified_cache() {
            event!(
                Level::DEBUG,
                cache = %envelope.cache,
                "ignoring envelope for foreign cache"
            );
            return Ok(());
        }

        let notify = match envelope.op {
            ReplicationOp::Put(entry) => {
                let id = entry.id.clone();
                self.entries.lock().await.insert(
                    id.clone(),
                    StoredReplica {
                        entry,
                        owner: envelope.origin.clone(),
                    },
                );
                self.mappings
                    .lock()
                    .await
                    .insert(id.clone(), envelope.origin.clone());
                event!(
                    Level::DEBUG,
                    cache = %self.params.client_mappings_cache,
                    id = %id,
                    owner = %envelope.origin,
                    "client mapping updated"
                );
                self.params.passivate_events_on_replicate.then_some(id)
            }
            ReplicationOp::Claim(id) => {
                self.entries.lock().await.remove(&id);
                self.mappings
                    .lock()
                    .await
                    .insert(id.clone(), envelope.origin.clone());
                None
            }
            ReplicationOp::Remove(id) => {
                self.entries.lock().await.remove(&id);
                self.mappings.lock().await.remove(&id);
                None
            }
        };

        // The replica is now the authoritative copy; tell the local cache so
        // it can demote its active instance
        if let Some(id) = notify {
            let listener = self.listener.lock().await.clone();
            if let Some(listener) = listener.and_then(|weak| weak.upgrade()) {
                listener.entry_replicated(&id).await;
            }
        }

        Ok(())
    }

    async fn owned_count(&self) -> usize {
        self.entries
            .lock()
            .await
            .values()
            .filter(|replica| replica.owner == self.params.node_id)
            .count()
    }

    /// Drop the longest-idle owned entry to make room for a new one.
    async fn evict_oldest_owned(&self) {
        let victim = {
            let entries = self.entries.lock().await;
            entries
                .values()
                .filter(|replica| replica.owner == self.params.node_id)
                .min_by_key(|replica| replica.entry.last_access)
                .map(|replica| replica.entry.id.clone())
        };

        if let Some(id) = victim {
            self.entries.lock().await.remove(&id);
            self.mappings.lock().await.remove(&id);
            event!(Level::WARN, id = %id, "store at capacity, oldest entry expired");
            let status = self.broadcast(ReplicationOp::Remove(id)).await;
            if !status.failed_nodes.is_empty() {
                event!(
                    Level::WARN,
                    failed = %status.failed_nodes.join("; "),
                    "capacity eviction did not reach all peers"
                );
            }
        }
    }
}

#[async_trait]
impl PassivationStore for ClusterStore {
    async fn start(&self) -> Result<()> {
        for peer in &self.params.peers {
            if let Err(err) = self.transport.probe(peer).await {
                event!(Level::WARN, peer = %peer, error = %err, "peer unreachable at start");
            }
        }
        Ok(())
    }

    async fn passivate(&self, entry: PassivationEntry) -> Result<()> {
        if let Some(max_size) = self.max_size {
            if self.owned_count().await >= max_size {
                self.evict_oldest_owned().await;
            }
        }

        let id = entry.id.clone();
        self.entries.lock().await.insert(
            id.clone(),
            StoredReplica {
                entry: entry.clone(),
                owner: self.params.node_id.clone(),
            },
        );
        self.mappings
            .lock()
            .await
            .insert(id.clone(), self.params.node_id.clone());

        let status = self.broadcast(ReplicationOp::Put(entry)).await;
        if self.params.require_quorum && !status.quorum_met() {
            // The write did not stick; undo it everywhere it landed
            self.entries.lock().await.remove(&id);
            self.mappings.lock().await.remove(&id);
            self.compensate(&id, &status.acknowledged_nodes).await;
            return Err(self.quorum_error("passivation", &status));
        }

        Ok(())
    }

    async fn activate(&self, id: &InstanceId) -> Result<PassivationEntry> {
        let replica = self
            .entries
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| CacheError::NotFound(id.clone()))?;
        self.mappings
            .lock()
            .await
            .insert(id.clone(), self.params.node_id.clone());

        // Ownership transfer: peers must drop their copies, otherwise a
        // stale replica could be activated a second time elsewhere
        let status = self.broadcast(ReplicationOp::Claim(id.clone())).await;
        if self.params.require_quorum && !status.quorum_met() {
            let owner = replica.owner.clone();
            self.entries.lock().await.insert(id.clone(), replica);
            self.mappings.lock().await.insert(id.clone(), owner);
            return Err(self.quorum_error("activation", &status));
        }

        Ok(replica.entry)
    }

    async fn remove(&self, id: &InstanceId) -> Result<bool> {
        let removed = self.entries.lock().await.remove(id).is_some();
        self.mappings.lock().await.remove(id);

        // Deletion is idempotent, so unreached peers converge on the next
        // remove or expiry rather than failing the caller
        let status = self.broadcast(ReplicationOp::Remove(id.clone())).await;
        if !status.failed_nodes.is_empty() {
            event!(
                Level::WARN,
                id = %id,
                failed = %status.failed_nodes.join("; "),
                "remove did not reach all peers"
            );
        }

        Ok(removed)
    }

    async fn sweep(
        &self,
        idle_timeout: Duration,
        listener: &dyn SweepListener,
    ) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        // Only owned entries are considered: the owner is the single node
        // allowed to expire an entry, replicas wait for its Remove
        let candidates: Vec<(InstanceId, Option<GroupId>)> = {
            let entries = self.entries.lock().await;
            report.scanned = entries
                .values()
                .filter(|replica| replica.owner == self.params.node_id)
                .count();
            entries
                .values()
                .filter(|replica| {
                    replica.owner == self.params.node_id
                        && replica.entry.is_idle_longer_than(idle_timeout)
                })
                .map(|replica| (replica.entry.id.clone(), replica.entry.group.clone()))
                .collect()
        };

        for (id, group) in candidates {
            // Re-check: the entry may have been activated since the scan
            if self.entries.lock().await.remove(&id).is_none() {
                continue;
            }
            self.mappings.lock().await.remove(&id);

            let status = self.broadcast(ReplicationOp::Remove(id.clone())).await;
            if !status.failed_nodes.is_empty() {
                event!(
                    Level::WARN,
                    id = %id,
                    failed = %status.failed_nodes.join("; "),
                    "expiry did not reach all peers"
                );
                report.failed += 1;
            }

            report.expired += 1;
            listener.entry_expired(&id, group.as_ref()).await;
        }

        Ok(report)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.lock().await.len())
    }

    async fn contains(&self, id: &InstanceId) -> Result<bool> {
        Ok(self.entries.lock().await.contains_key(id))
    }

    async fn set_replication_listener(&self, listener: Weak<dyn ReplicationListener>) {
        *self.listener.lock().await = Some(listener);
    }
}

/// In-memory transport for tests.
///
/// Simulates the network by applying envelopes directly to registered peer
/// stores; individual nodes can be marked unreachable to exercise quorum
/// handling.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    peers: Arc<Mutex<HashMap<String, Arc<ClusterStore>>>>,
    unreachable: Arc<Mutex<HashSet<String>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer store so it can receive replicated operations.
    pub async fn register_peer(
        &self,
        node_id: impl Into<String>,
        store: Arc<ClusterStore>,
    ) -> Result<()> {
        let node_id = node_id.into();
        if node_id.trim().is_empty() {
            return Err(CacheError::Config("node_id must not be empty".to_string()));
        }
        self.peers.lock().await.insert(node_id, store);
        Ok(())
    }

    /// Mark a node reachable or unreachable.
    pub async fn set_unreachable(&self, node_id: &str, down: bool) {
        let mut unreachable = self.unreachable.lock().await;
        if down {
            unreachable.insert(node_id.to_string());
        } else {
            unreachable.remove(node_id);
        }
    }

    async fn peer(&self, node_id: &str) -> Result<Arc<ClusterStore>> {
        if self.unreachable.lock().await.contains(node_id) {
            return Err(CacheError::StoreUnavailable(format!(
                "node '{}' is unreachable",
                node_id
            )));
        }
        self.peers.lock().await.get(node_id).cloned().ok_or_else(|| {
            CacheError::StoreUnavailable(format!(
                "replication target node '{}' is not registered",
                node_id
            ))
        })
    }
}

#[async_trait]
impl ReplicationTransport for InMemoryTransport {
    async fn replicate(&self, target: &str, envelope: ReplicationEnvelope) -> Result<()> {
        let peer = self.peer(target).await?;
        peer.apply(envelope).await
    }

    async fn probe(&self, target: &str) -> Result<()> {
        self.peer(target).await.map(|_| ())
    }
}
