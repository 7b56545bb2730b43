//! Server instance definitions

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Server instance ID
pub type InstanceId = String;

/// Server instance as observed through the coordination service
///
/// Snapshot value: immutable for the duration of a planning cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInstance {
    /// Instance ID
    pub id: InstanceId,
    /// Tenant tags carried by this instance
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Capacity (maximum replicas of one table, also the load weight)
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    /// Liveness as reported by the membership service
    #[serde(default)]
    pub live: bool,
    /// Replica group this instance is pinned to (replica-group placement)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_group: Option<String>,
}

impl ServerInstance {
    /// Create new live instance without tags
    pub fn new(id: impl Into<InstanceId>) -> Self {
        Self {
            id: id.into(),
            tags: BTreeSet::new(),
            capacity: default_capacity(),
            live: true,
            replica_group: None,
        }
    }

    /// Add a tenant tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Set capacity
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    /// Pin to a replica group
    pub fn with_replica_group(mut self, group: impl Into<String>) -> Self {
        self.replica_group = Some(group.into());
        self
    }

    /// Set liveness
    pub fn with_live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    /// Check whether the instance carries a tenant tag
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Whether another replica fits under the capacity limit
    pub fn has_room(&self, load: usize) -> bool {
        load < self.capacity as usize
    }
}

fn default_capacity() -> u32 {
    1000
}
