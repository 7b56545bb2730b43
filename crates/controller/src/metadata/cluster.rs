//! Cluster view
//!
//! Point-in-time snapshot of the instance roster and one table's persisted
//! record. Every planning cycle works on its own view and never holds a
//! handle to the coordination service across cycles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::{Assignment, InstanceId, ServerInstance, TableName, TableRecord};
use crate::coordinator::Coordinator;
use crate::error::{AssignmentError, Result};

/// Version token of a persisted table record
pub type Version = u64;

/// Snapshot of the cluster as seen by one planning cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterView {
    /// Table this view was read for
    pub table: TableName,
    /// Instance roster keyed by ID
    pub instances: BTreeMap<InstanceId, ServerInstance>,
    /// Persisted table record
    pub record: TableRecord,
    /// Version token of `record`
    pub version: Version,
    /// When the view was read
    pub observed_at: DateTime<Utc>,
}

impl ClusterView {
    /// Build a view from already-read parts
    pub fn new(
        table: impl Into<TableName>,
        instances: impl IntoIterator<Item = ServerInstance>,
        record: TableRecord,
        version: Version,
    ) -> Self {
        Self {
            table: table.into(),
            instances: instances.into_iter().map(|i| (i.id.clone(), i)).collect(),
            record,
            version,
            observed_at: Utc::now(),
        }
    }

    /// Read a fresh view, bounding each coordinator call by `timeout`
    pub async fn load(
        coordinator: &dyn Coordinator,
        table: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let instances = tokio::time::timeout(timeout, coordinator.instances())
            .await
            .map_err(|_| {
                AssignmentError::InstanceUnavailable(format!(
                    "instance roster read timed out after {:?}",
                    timeout
                ))
            })??;

        let versioned = tokio::time::timeout(timeout, coordinator.read_table(table))
            .await
            .map_err(|_| {
                AssignmentError::InstanceUnavailable(format!(
                    "read of table {} timed out after {:?}",
                    table, timeout
                ))
            })??;

        Ok(Self::new(table, instances, versioned.record, versioned.version))
    }

    /// Current assignment
    pub fn assignment(&self) -> &Assignment {
        &self.record.assignment
    }

    /// Get instance
    pub fn instance(&self, id: &str) -> Option<&ServerInstance> {
        self.instances.get(id)
    }

    /// Whether an instance is present and live
    pub fn is_live(&self, id: &str) -> bool {
        self.instances.get(id).map(|i| i.live).unwrap_or(false)
    }

    /// Live instances
    pub fn live_instances(&self) -> impl Iterator<Item = &ServerInstance> {
        self.instances.values().filter(|i| i.live)
    }

    /// Whether both views observed an identical roster
    pub fn same_roster(&self, other: &ClusterView) -> bool {
        self.instances == other.instances
    }

    /// Non-terminal replica count per instance for this table
    pub fn loads(&self) -> BTreeMap<InstanceId, usize> {
        self.record.assignment.instance_loads()
    }

    /// Summary statistics
    pub fn stats(&self, replicas: usize) -> ViewStats {
        let assignment = self.assignment();
        ViewStats {
            total_instances: self.instances.len(),
            live_instances: self.live_instances().count(),
            segments: assignment.len(),
            under_replicated_segments: assignment
                .segment_ids()
                .filter(|s| assignment.active_instances(s).len() < replicas)
                .count(),
            unavailable_segments: assignment
                .segment_ids()
                .filter(|s| assignment.serving_count(s) == 0)
                .count(),
            version: self.version,
        }
    }
}

/// View statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewStats {
    pub total_instances: usize,
    pub live_instances: usize,
    pub segments: usize,
    pub under_replicated_segments: usize,
    pub unavailable_segments: usize,
    pub version: Version,
}
