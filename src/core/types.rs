use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Identity of a cached component instance.
///
/// Opaque to the cache; equality and hashing are the only operations the
/// runtime relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identity for a first-use instance.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identity of a passivation group.
///
/// All instances of a group passivate and activate together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for GroupId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Where an identity currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleStatus {
    /// Created but not yet released back after its first use.
    New,
    /// Resident in memory, either idle or checked out.
    Active,
    /// Serialized into a passivation store.
    Passivated,
    /// Removed, expired, or never seen.
    Removed,
}

/// A passivated instance as held by a store: the serialized state plus the
/// metadata needed for idle tracking and group eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassivationEntry {
    pub id: InstanceId,
    pub group: Option<GroupId>,
    pub state: Vec<u8>,
    pub last_access: DateTime<Utc>,
}

impl PassivationEntry {
    pub fn new(id: InstanceId, group: Option<GroupId>, state: Vec<u8>) -> Self {
        Self {
            id,
            group,
            state,
            last_access: Utc::now(),
        }
    }

    /// True when the entry has gone unused for longer than `idle_timeout`.
    pub fn is_idle_longer_than(&self, idle_timeout: Duration) -> bool {
        let idle = Utc::now().signed_duration_since(self.last_access);
        match chrono::Duration::from_std(idle_timeout) {
            Ok(limit) => idle > limit,
            Err(_) => false,
        }
    }
}

/// Counters from one sweep pass over a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries examined.
    pub scanned: usize,
    /// Entries expired and removed.
    pub expired: usize,
    /// Entries that failed to expire cleanly and were skipped.
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_round_trip() {
        let id = InstanceId::new("session-42");
        assert_eq!(id.as_str(), "session-42");
        assert_eq!(id.to_string(), "session-42");
        assert_eq!(InstanceId::from("session-42"), id);
    }

    #[test]
    fn test_random_ids_are_unique() {
        assert_ne!(InstanceId::random(), InstanceId::random());
    }

    #[test]
    fn test_entry_idle_check() {
        let mut entry = PassivationEntry::new(InstanceId::new("a"), None, vec![1, 2, 3]);
        assert!(!entry.is_idle_longer_than(Duration::from_secs(60)));

        entry.last_access = Utc::now() - chrono::Duration::seconds(90);
        assert!(entry.is_idle_longer_than(Duration::from_secs(60)));
        assert!(!entry.is_idle_longer_than(Duration::from_secs(120)));
    }

    #[test]
    fn test_entry_serialization_preserves_group() {
        let entry = PassivationEntry::new(
            InstanceId::new("a"),
            Some(GroupId::new("g1")),
            vec![0xAB, 0xCD],
        );
        let bytes = rmp_serde::to_vec(&entry).unwrap();
        let decoded: PassivationEntry = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded.id, entry.id);
        assert_eq!(decoded.group, Some(GroupId::new("g1")));
        assert_eq!(decoded.state, vec![0xAB, 0xCD]);
    }
}
