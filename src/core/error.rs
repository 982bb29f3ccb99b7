use crate::core::types::InstanceId;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Pool exhausted: no instance slot became free within {0:?}")]
    PoolExhausted(Duration),

    #[error("Access timeout: instance '{0}' is busy, gave up after {1:?}")]
    AccessTimeout(InstanceId, Duration),

    #[error("Instance '{0}' not found")]
    NotFound(InstanceId),

    #[error("Passivation store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Corrupt entry for instance '{0}': {1}")]
    CorruptEntry(InstanceId, String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("Cache is not running")]
    Stopped,
}

impl CacheError {
    /// Whether the failed operation may succeed if retried later.
    ///
    /// Exhaustion and busy conditions clear once other callers release
    /// instances; store outages clear once the backend recovers. A missing or
    /// corrupt entry will stay missing or corrupt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted(_) | Self::AccessTimeout(_, _) | Self::StoreUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
