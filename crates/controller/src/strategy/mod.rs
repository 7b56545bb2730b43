//! Assignment strategies
//!
//! A [`PlacementPolicy`] computes the replica set of a new segment and the
//! full target assignment of a table. One implementation exists per
//! [`PolicyKind`]; the table configuration picks it at the start of a cycle.

mod balanced;
mod partition;
mod replica_group;

pub use balanced::BalancedPolicy;
pub use partition::PartitionAwarePolicy;
pub use replica_group::{GroupLayout, ReplicaGroupPolicy};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::Result;
use crate::metadata::{
    Assignment, ClusterView, InstanceId, InstanceStateMap, PolicyKind, Segment, SegmentId,
    SegmentState, ServerInstance, TableConfig,
};
use crate::selector::{compare_load, load_of, InstanceSelector};

/// Rebalance options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceConfig {
    /// Replicas that must stay serving every segment while moving
    #[serde(default = "default_min_available_replicas")]
    pub min_available_replicas: usize,
    /// Whether replica group boundaries are respected
    #[serde(default = "default_true")]
    pub honor_replica_groups: bool,
    /// Whether replicas in ERROR may be moved to other instances
    #[serde(default)]
    pub move_errored: bool,
    /// Compute the plan without applying it
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            min_available_replicas: default_min_available_replicas(),
            honor_replica_groups: true,
            move_errored: false,
            dry_run: false,
        }
    }
}

fn default_min_available_replicas() -> usize {
    1
}

fn default_true() -> bool {
    true
}

/// Inputs shared by every policy during one cycle
#[derive(Debug, Clone, Copy)]
pub struct PlacementContext<'a> {
    pub table: &'a TableConfig,
    pub view: &'a ClusterView,
    pub selector: &'a InstanceSelector,
}

impl<'a> PlacementContext<'a> {
    pub fn new(
        table: &'a TableConfig,
        view: &'a ClusterView,
        selector: &'a InstanceSelector,
    ) -> Self {
        Self {
            table,
            view,
            selector,
        }
    }

    /// Instances allowed to host the table
    pub fn hosts(&self) -> Vec<&'a ServerInstance> {
        self.view
            .instances
            .values()
            .filter(|i| self.selector.is_eligible_host(&self.table.replication, i))
            .collect()
    }

    /// Partition of a segment, from its recorded metadata
    pub fn partition_of(&self, segment: &str) -> Option<u32> {
        self.view.record.partition_of(segment)
    }
}

/// Placement policy
pub trait PlacementPolicy: Send + Sync {
    /// Policy kind
    fn kind(&self) -> PolicyKind;

    /// Pick the instances for a newly created segment
    ///
    /// Returns `min(replicas, candidates)` distinct instances, deterministic
    /// for a given cluster state.
    fn assign_segment(
        &self,
        segment: &Segment,
        current: &Assignment,
        ctx: &PlacementContext<'_>,
    ) -> Result<Vec<InstanceId>>;

    /// Compute the target assignment of the whole table
    fn rebalance_table(
        &self,
        current: &Assignment,
        config: &RebalanceConfig,
        ctx: &PlacementContext<'_>,
    ) -> Result<Assignment>;
}

/// Policy implementation for a kind
pub fn policy_for(kind: PolicyKind) -> Box<dyn PlacementPolicy> {
    match kind {
        PolicyKind::Balanced => Box::new(BalancedPolicy),
        PolicyKind::ReplicaGroup => Box::new(ReplicaGroupPolicy),
        PolicyKind::PartitionAware => Box::new(PartitionAwarePolicy),
    }
}

/// Running load of a fixed set of host instances
#[derive(Debug, Clone)]
pub(crate) struct LoadTracker {
    hosts: BTreeMap<InstanceId, ServerInstance>,
    loads: BTreeMap<InstanceId, usize>,
    enforce_capacity: bool,
}

impl LoadTracker {
    /// Tracker starting at zero load
    pub(crate) fn empty<'a>(
        hosts: impl IntoIterator<Item = &'a ServerInstance>,
        enforce_capacity: bool,
    ) -> Self {
        Self {
            hosts: hosts.into_iter().map(|i| (i.id.clone(), i.clone())).collect(),
            loads: BTreeMap::new(),
            enforce_capacity,
        }
    }

    /// Tracker seeded with the loads of an existing assignment
    pub(crate) fn from_assignment<'a>(
        hosts: impl IntoIterator<Item = &'a ServerInstance>,
        current: &Assignment,
        enforce_capacity: bool,
    ) -> Self {
        let mut tracker = Self::empty(hosts, enforce_capacity);
        tracker.loads = current.instance_loads();
        tracker
    }

    pub(crate) fn len(&self) -> usize {
        self.hosts.len()
    }

    pub(crate) fn is_host(&self, id: &str) -> bool {
        self.hosts.contains_key(id)
    }

    pub(crate) fn host_ids(&self) -> impl Iterator<Item = &InstanceId> {
        self.hosts.keys()
    }

    pub(crate) fn capacity(&self, id: &str) -> u32 {
        self.hosts.get(id).map(|i| i.capacity).unwrap_or(0)
    }

    pub(crate) fn load(&self, id: &str) -> usize {
        load_of(&self.loads, id)
    }

    pub(crate) fn add(&mut self, id: &str, count: usize) {
        *self.loads.entry(id.to_string()).or_insert(0) += count;
    }

    pub(crate) fn remove(&mut self, id: &str, count: usize) {
        if let Some(load) = self.loads.get_mut(id) {
            *load = load.saturating_sub(count);
        }
    }

    /// Least loaded hosts with room, skipping `exclude`
    pub(crate) fn pick(&self, exclude: &BTreeSet<InstanceId>, count: usize) -> Vec<InstanceId> {
        let mut candidates: Vec<_> = self
            .hosts
            .values()
            .filter(|i| !exclude.contains(&i.id))
            .filter(|i| !self.enforce_capacity || i.has_room(self.load(&i.id)))
            .collect();

        candidates.sort_by(|a, b| compare_load(a, self.load(&a.id), b, self.load(&b.id)));
        candidates
            .into_iter()
            .take(count)
            .map(|i| i.id.clone())
            .collect()
    }

    /// Hosts ordered from most to least loaded
    pub(crate) fn most_loaded_first(&self) -> Vec<InstanceId> {
        let mut ids: Vec<_> = self.hosts.values().collect();
        ids.sort_by(|a, b| compare_load(b, self.load(&b.id), a, self.load(&a.id)));
        ids.into_iter().map(|i| i.id.clone()).collect()
    }
}

/// State a newly placed replica is expected to reach
pub fn new_replica_state(current: Option<&InstanceStateMap>) -> SegmentState {
    let consuming = current
        .map(|replicas| replicas.values().any(|s| *s == SegmentState::Consuming))
        .unwrap_or(false);
    if consuming {
        SegmentState::Consuming
    } else {
        SegmentState::Online
    }
}

/// Turn per-segment instance sets into a target assignment
///
/// Kept replicas retain their recorded state; new ones target the state
/// given by [`new_replica_state`].
pub(crate) fn build_target(
    current: &Assignment,
    sets: BTreeMap<SegmentId, BTreeSet<InstanceId>>,
) -> Assignment {
    sets.into_iter()
        .map(|(segment, instances)| {
            let replicas = current.segment(&segment);
            let fresh = new_replica_state(replicas);
            let states: InstanceStateMap = instances
                .into_iter()
                .map(|instance| {
                    let state = replicas
                        .and_then(|r| r.get(&instance))
                        .copied()
                        .filter(|s| !s.is_terminal())
                        .unwrap_or(fresh);
                    (instance, state)
                })
                .collect();
            (segment, states)
        })
        .collect()
}

/// Replicas of a segment worth keeping in place
///
/// A replica is kept when its instance is still a host and it is not an
/// errored replica that the rebalance is allowed to move. Returns the kept
/// set and the instances excluded from re-selection for this segment.
pub(crate) fn kept_replicas(
    replicas: &InstanceStateMap,
    tracker: &LoadTracker,
    config: &RebalanceConfig,
) -> (BTreeSet<InstanceId>, BTreeSet<InstanceId>) {
    let mut kept = BTreeSet::new();
    let mut excluded = BTreeSet::new();

    for (instance, state) in replicas {
        if state.is_terminal() || !tracker.is_host(instance) {
            continue;
        }
        if *state == SegmentState::Error && config.move_errored {
            excluded.insert(instance.clone());
            continue;
        }
        kept.insert(instance.clone());
    }
    (kept, excluded)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_replica_state() {
        let mut replicas = InstanceStateMap::new();
        assert_eq!(new_replica_state(None), SegmentState::Online);
        replicas.insert("server_a".to_string(), SegmentState::Online);
        assert_eq!(new_replica_state(Some(&replicas)), SegmentState::Online);
        replicas.insert("server_b".to_string(), SegmentState::Consuming);
        assert_eq!(new_replica_state(Some(&replicas)), SegmentState::Consuming);
    }

    #[test]
    fn test_tracker_pick_respects_capacity() {
        let hosts = vec![
            ServerInstance::new("server_a").with_capacity(1),
            ServerInstance::new("server_b").with_capacity(5),
        ];
        let mut tracker = LoadTracker::empty(&hosts, true);
        tracker.add("server_a", 1);

        assert_eq!(tracker.pick(&BTreeSet::new(), 2), vec!["server_b".to_string()]);
        assert_eq!(tracker.most_loaded_first()[0], "server_a");
        tracker.remove("server_a", 1);
        assert_eq!(tracker.pick(&BTreeSet::new(), 2).len(), 2);
    }

    #[test]
    fn test_policy_for() {
        for kind in [
            PolicyKind::Balanced,
            PolicyKind::ReplicaGroup,
            PolicyKind::PartitionAware,
        ] {
            assert_eq!(policy_for(kind).kind(), kind);
        }
    }
}
