//! Instance selector
//!
//! Narrows the instance roster to the servers allowed to host a table and
//! orders them so that new replicas land on the least utilized servers first.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{AssignmentError, Result};
use crate::metadata::{ClusterView, InstanceId, ReplicationSpec, ServerInstance};

/// Candidate filter and ordering
#[derive(Debug, Clone)]
pub struct InstanceSelector {
    /// Whether instances at capacity are filtered out of new placements
    pub enforce_capacity: bool,
}

impl Default for InstanceSelector {
    fn default() -> Self {
        Self {
            enforce_capacity: true,
        }
    }
}

impl InstanceSelector {
    /// Whether an instance may host (or keep hosting) replicas of the table
    ///
    /// Capacity is not considered: an instance at capacity keeps what it has.
    pub fn is_eligible_host(&self, spec: &ReplicationSpec, instance: &ServerInstance) -> bool {
        instance.live && instance.has_tag(&spec.tenant_tag)
    }

    /// Ordered candidates for new replicas, without failing on a shortfall
    pub fn eligible(&self, spec: &ReplicationSpec, view: &ClusterView) -> Vec<ServerInstance> {
        self.select_excluding(spec, view, &BTreeSet::new())
    }

    /// Ordered candidates, failing when fewer than the replication factor remain
    pub fn select(
        &self,
        spec: &ReplicationSpec,
        view: &ClusterView,
    ) -> Result<Vec<ServerInstance>> {
        let candidates = self.eligible(spec, view);
        if candidates.len() < spec.replicas {
            return Err(AssignmentError::InsufficientCapacity {
                table: view.table.clone(),
                required: spec.replicas,
                available: candidates.len(),
            });
        }
        Ok(candidates)
    }

    /// Ordered candidates, skipping the excluded instances
    pub fn select_excluding(
        &self,
        spec: &ReplicationSpec,
        view: &ClusterView,
        exclude: &BTreeSet<InstanceId>,
    ) -> Vec<ServerInstance> {
        let loads = view.loads();

        let mut candidates: Vec<_> = view
            .instances
            .values()
            .filter(|i| self.is_eligible_host(spec, i))
            .filter(|i| !exclude.contains(&i.id))
            .filter(|i| !self.enforce_capacity || i.has_room(load_of(&loads, &i.id)))
            .cloned()
            .collect();

        candidates.sort_by(|a, b| {
            compare_load(a, load_of(&loads, &a.id), b, load_of(&loads, &b.id))
        });
        candidates
    }
}

/// Load lookup with a zero default
pub fn load_of(loads: &BTreeMap<InstanceId, usize>, id: &str) -> usize {
    loads.get(id).copied().unwrap_or(0)
}

/// Order two instances by capacity-weighted load, then by ID
///
/// `load_a / cap_a` is compared against `load_b / cap_b` by cross
/// multiplication so that the order stays exact. Equal loads fall back to the
/// lexical order of instance IDs.
pub fn compare_load(
    a: &ServerInstance,
    load_a: usize,
    b: &ServerInstance,
    load_b: usize,
) -> Ordering {
    let weighted_a = load_a as u128 * b.capacity.max(1) as u128;
    let weighted_b = load_b as u128 * a.capacity.max(1) as u128;
    weighted_a.cmp(&weighted_b).then_with(|| a.id.cmp(&b.id))
}
