use std::path::PathBuf;
use std::time::Duration;

/// Strict-max instance pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard upper bound on concurrently existing instances
    pub max_size: usize,

    /// How long an acquirer waits for a free slot before failing
    pub acquisition_timeout: Duration,

    /// Instances created up front when the cache starts
    pub warm_size: usize,
}

impl PoolConfig {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            acquisition_timeout: Duration::from_secs(5),
            warm_size: 0,
        }
    }

    /// Set the acquisition timeout
    pub fn acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.acquisition_timeout = timeout;
        self
    }

    /// Set the number of pre-created instances
    pub fn warm_size(mut self, warm: usize) -> Self {
        self.warm_size = warm;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_size == 0 {
            return Err("max_size must be > 0".to_string());
        }

        if self.warm_size > self.max_size {
            return Err("warm_size cannot exceed max_size".to_string());
        }

        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Passivation store configuration
///
/// The backend is a closed enumeration and is resolved into a concrete store
/// exactly once, when the owning cache is constructed.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum number of passivated entries; `None` means unbounded
    pub max_size: Option<usize>,

    /// Entries idle longer than this are expired by the sweep
    pub idle_timeout: Option<Duration>,

    /// Which backend holds passivated state
    pub backend: StoreBackend,
}

/// The supported passivation backends
#[derive(Debug, Clone)]
pub enum StoreBackend {
    /// Process-local map, lost on restart
    InMemory,
    /// One file per entry under a bucketed directory tree
    File(FileStoreParams),
    /// Entries replicated to peer nodes
    Cluster(ClusterStoreParams),
}

impl StoreConfig {
    pub fn new(backend: StoreBackend) -> Self {
        Self {
            max_size: None,
            idle_timeout: None,
            backend,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(StoreBackend::InMemory)
    }

    pub fn file(params: FileStoreParams) -> Self {
        Self::new(StoreBackend::File(params))
    }

    pub fn cluster(params: ClusterStoreParams) -> Self {
        Self::new(StoreBackend::Cluster(params))
    }

    /// Set the maximum number of passivated entries
    pub fn max_size(mut self, max: usize) -> Self {
        self.max_size = Some(max);
        self
    }

    /// Set the idle timeout after which entries expire
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_size == Some(0) {
            return Err("max_size must be > 0 when set".to_string());
        }

        if self.idle_timeout == Some(Duration::ZERO) {
            return Err("idle_timeout must be > 0 when set".to_string());
        }

        match &self.backend {
            StoreBackend::InMemory => Ok(()),
            StoreBackend::File(params) => params.validate(),
            StoreBackend::Cluster(params) => params.validate(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// File passivation store parameters
#[derive(Debug, Clone)]
pub struct FileStoreParams {
    /// Root directory of the store
    pub base_dir: PathBuf,

    /// Subdirectory for grouped entries
    pub groups_dir: String,

    /// Subdirectory for ungrouped entries
    pub sessions_dir: String,

    /// Fan-out of hashed bucket directories under each root
    pub subdirectory_count: u32,
}

impl FileStoreParams {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            groups_dir: "groups".to_string(),
            sessions_dir: "sessions".to_string(),
            subdirectory_count: 100,
        }
    }

    /// Set the subdirectory for grouped entries
    pub fn groups_dir(mut self, dir: &str) -> Self {
        self.groups_dir = dir.to_string();
        self
    }

    /// Set the subdirectory for ungrouped entries
    pub fn sessions_dir(mut self, dir: &str) -> Self {
        self.sessions_dir = dir.to_string();
        self
    }

    /// Set the bucket directory fan-out
    pub fn subdirectory_count(mut self, count: u32) -> Self {
        self.subdirectory_count = count;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.base_dir.as_os_str().is_empty() {
            return Err("base_dir cannot be empty".to_string());
        }

        if self.groups_dir.is_empty() || self.sessions_dir.is_empty() {
            return Err("groups_dir and sessions_dir cannot be empty".to_string());
        }

        if self.groups_dir == self.sessions_dir {
            return Err("groups_dir and sessions_dir must differ".to_string());
        }

        if self.subdirectory_count == 0 {
            return Err("subdirectory_count must be > 0".to_string());
        }

        Ok(())
    }
}

/// Cluster passivation store parameters
#[derive(Debug, Clone)]
pub struct ClusterStoreParams {
    /// Name of this node within the cluster
    pub node_id: String,

    /// Peer nodes entries replicate to
    pub peers: Vec<String>,

    /// Cache container the replicated caches live in
    pub cache_container: String,

    /// Name of the replicated entry cache
    pub bean_cache: String,

    /// Name of the replicated identity-to-owner routing cache
    pub client_mappings_cache: String,

    /// Treat an incoming replica as the passivation event and demote the
    /// local active copy
    pub passivate_events_on_replicate: bool,

    /// Upper bound on each replication call
    pub replication_timeout: Duration,

    /// Require a majority of the member set to acknowledge writes
    pub require_quorum: bool,
}

impl ClusterStoreParams {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            peers: Vec::new(),
            cache_container: "default".to_string(),
            bean_cache: "default".to_string(),
            client_mappings_cache: "client-mappings".to_string(),
            passivate_events_on_replicate: true,
            replication_timeout: Duration::from_secs(2),
            require_quorum: true,
        }
    }

    /// Add a peer node
    pub fn peer(mut self, node_id: &str) -> Self {
        self.peers.push(node_id.to_string());
        self
    }

    /// Set the cache container name
    pub fn cache_container(mut self, name: &str) -> Self {
        self.cache_container = name.to_string();
        self
    }

    /// Set the replicated entry cache name
    pub fn bean_cache(mut self, name: &str) -> Self {
        self.bean_cache = name.to_string();
        self
    }

    /// Set the routing cache name
    pub fn client_mappings_cache(mut self, name: &str) -> Self {
        self.client_mappings_cache = name.to_string();
        self
    }

    /// Enable or disable demotion on incoming replicas
    pub fn passivate_events_on_replicate(mut self, enabled: bool) -> Self {
        self.passivate_events_on_replicate = enabled;
        self
    }

    /// Set the per-call replication timeout
    pub fn replication_timeout(mut self, timeout: Duration) -> Self {
        self.replication_timeout = timeout;
        self
    }

    /// Require or waive quorum acknowledgment for writes
    pub fn require_quorum(mut self, required: bool) -> Self {
        self.require_quorum = required;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.node_id.trim().is_empty() {
            return Err("node_id cannot be empty".to_string());
        }

        if self.peers.iter().any(|peer| peer.trim().is_empty()) {
            return Err("peer node ids cannot be empty".to_string());
        }

        if self.peers.iter().any(|peer| peer == &self.node_id) {
            return Err("peers cannot include the local node".to_string());
        }

        if self.cache_container.is_empty() || self.bean_cache.is_empty() {
            return Err("cache_container and bean_cache cannot be empty".to_string());
        }

        if self.replication_timeout.is_zero() {
            return Err("replication_timeout must be > 0".to_string());
        }

        Ok(())
    }
}

/// Instance cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Name of the cache, unique within a registry
    pub name: String,

    /// How long a caller waits for a busy instance before failing
    pub access_timeout: Duration,

    /// Resident instance count above which idle instances are passivated;
    /// `None` disables watermark eviction
    pub active_watermark: Option<usize>,

    /// How often the housekeeping worker runs eviction and the store sweep
    pub housekeeping_interval: Duration,

    /// What this cache supports
    pub capabilities: CacheCapabilities,
}

/// Capabilities advertised by a cache
#[derive(Debug, Clone, Copy)]
pub struct CacheCapabilities {
    /// Idle instances can move to a passivation store; when false, eviction
    /// destroys them instead
    pub supports_passivation: bool,

    /// Group markers are honored and group members move together
    pub group_eviction: bool,
}

impl Default for CacheCapabilities {
    fn default() -> Self {
        Self {
            supports_passivation: true,
            group_eviction: true,
        }
    }
}

impl CacheConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            access_timeout: Duration::from_secs(5),
            active_watermark: None,
            housekeeping_interval: Duration::from_secs(1),
            capabilities: CacheCapabilities::default(),
        }
    }

    /// Set the default access timeout
    pub fn access_timeout(mut self, timeout: Duration) -> Self {
        self.access_timeout = timeout;
        self
    }

    /// Set the resident watermark
    pub fn active_watermark(mut self, watermark: usize) -> Self {
        self.active_watermark = Some(watermark);
        self
    }

    /// Set the housekeeping interval
    pub fn housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval = interval;
        self
    }

    /// Disable passivation; idle instances are destroyed on eviction
    pub fn without_passivation(mut self) -> Self {
        self.capabilities.supports_passivation = false;
        self
    }

    /// Disable group eviction; group markers are ignored
    pub fn without_group_eviction(mut self) -> Self {
        self.capabilities.group_eviction = false;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("cache name cannot be empty".to_string());
        }

        if self.access_timeout.is_zero() {
            return Err("access_timeout must be > 0".to_string());
        }

        if self.active_watermark == Some(0) {
            return Err("active_watermark must be > 0 when set".to_string());
        }

        if self.housekeeping_interval.is_zero() {
            return Err("housekeeping_interval must be > 0".to_string());
        }

        Ok(())
    }
}
