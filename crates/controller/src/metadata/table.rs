//! Table configuration and persisted table record

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{Assignment, Segment, SegmentId};

/// Table name
pub type TableName = String;

/// Replica group topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaGroupSpec {
    /// Group names, in rollout order
    pub groups: Vec<String>,
}

impl ReplicaGroupSpec {
    /// Replicas hosted per group for a given replication factor
    pub fn replicas_per_group(&self, replicas: usize) -> usize {
        if self.groups.is_empty() {
            0
        } else {
            replicas / self.groups.len()
        }
    }
}

/// Per-table replication requirements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationSpec {
    /// Desired replica count
    pub replicas: usize,
    /// Tenant tag an instance must carry to host the table
    pub tenant_tag: String,
    /// Optional replica group topology
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_groups: Option<ReplicaGroupSpec>,
}

impl ReplicationSpec {
    pub fn new(replicas: usize, tenant_tag: impl Into<String>) -> Self {
        Self {
            replicas,
            tenant_tag: tenant_tag.into(),
            replica_groups: None,
        }
    }

    /// Attach replica groups
    pub fn with_replica_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.replica_groups = Some(ReplicaGroupSpec {
            groups: groups.into_iter().map(Into::into).collect(),
        });
        self
    }
}

/// Placement policy selected per table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Greedy load balancing across eligible instances
    #[default]
    Balanced,
    /// Independent placement per named replica group
    ReplicaGroup,
    /// Segments of one stream partition share a replica set
    PartitionAware,
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyKind::Balanced => write!(f, "balanced"),
            PolicyKind::ReplicaGroup => write!(f, "replica_group"),
            PolicyKind::PartitionAware => write!(f, "partition_aware"),
        }
    }
}

/// Table configuration (read at the start of every cycle, never mutated here)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Table name
    pub name: TableName,
    /// Replication requirements
    pub replication: ReplicationSpec,
    /// Placement policy
    #[serde(default)]
    pub policy: PolicyKind,
}

impl TableConfig {
    pub fn new(name: impl Into<TableName>, replication: ReplicationSpec) -> Self {
        Self {
            name: name.into(),
            replication,
            policy: PolicyKind::default(),
        }
    }

    pub fn with_policy(mut self, policy: PolicyKind) -> Self {
        self.policy = policy;
        self
    }
}

/// Persisted state of one table in the coordination service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRecord {
    /// Segment metadata
    #[serde(default)]
    pub segments: BTreeMap<SegmentId, Segment>,
    /// Replica placement and states
    #[serde(default)]
    pub assignment: Assignment,
}

impl TableRecord {
    /// Partition of a segment, if known
    pub fn partition_of(&self, segment: &str) -> Option<u32> {
        self.segments.get(segment).and_then(|s| s.partition)
    }
}
