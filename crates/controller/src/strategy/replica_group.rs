//! Replica-group aware placement
//!
//! Host instances are partitioned into the table's named replica groups and
//! every segment gets `replicas / groups` replicas inside each group. Groups
//! are placed and rebalanced independently, so a rollout can take one group
//! down while the others keep serving.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::balanced::{balance, place_segment};
use super::{
    build_target, BalancedPolicy, LoadTracker, PlacementContext, PlacementPolicy, RebalanceConfig,
};
use crate::error::{AssignmentError, Result};
use crate::metadata::{
    Assignment, ClusterView, InstanceId, PolicyKind, ReplicaGroupSpec, Segment, SegmentId,
    ServerInstance,
};

/// Instance membership of each replica group, in rollout order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupLayout {
    pub groups: Vec<(String, BTreeSet<InstanceId>)>,
}

impl GroupLayout {
    /// Partition hosts into groups
    ///
    /// Instances pinned to a known group join it; pins to unknown groups make
    /// the instance unusable for the table. Unpinned instances, in ID order,
    /// join whichever group currently has the fewest members.
    pub fn build<'a>(
        spec: &ReplicaGroupSpec,
        hosts: impl IntoIterator<Item = &'a ServerInstance>,
    ) -> Self {
        let mut groups: Vec<(String, BTreeSet<InstanceId>)> = spec
            .groups
            .iter()
            .map(|name| (name.clone(), BTreeSet::new()))
            .collect();

        let mut hosts: Vec<_> = hosts.into_iter().collect();
        hosts.sort_by(|a, b| a.id.cmp(&b.id));

        let mut unpinned = Vec::new();
        for host in hosts {
            match &host.replica_group {
                Some(pin) => {
                    if let Some((_, members)) = groups.iter_mut().find(|(name, _)| name == pin) {
                        members.insert(host.id.clone());
                    }
                }
                None => unpinned.push(host),
            }
        }

        for host in unpinned {
            if let Some((_, members)) = groups.iter_mut().min_by_key(|(_, members)| members.len()) {
                members.insert(host.id.clone());
            }
        }

        Self { groups }
    }

    /// Group an instance belongs to
    pub fn group_of(&self, instance: &str) -> Option<&str> {
        self.groups
            .iter()
            .find(|(_, members)| members.contains(instance))
            .map(|(name, _)| name.as_str())
    }

    /// Group names in rollout order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|(name, _)| name.as_str())
    }
}

/// Replica-group placement policy
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplicaGroupPolicy;

impl ReplicaGroupPolicy {
    /// Group layout and replicas per group for the table
    pub fn layout(ctx: &PlacementContext<'_>) -> Result<(GroupLayout, usize)> {
        let replication = &ctx.table.replication;
        let spec = replication.replica_groups.as_ref().ok_or_else(|| {
            AssignmentError::InvalidConfig(format!(
                "table {} uses {} placement without replica groups",
                ctx.table.name,
                PolicyKind::ReplicaGroup
            ))
        })?;

        let groups = spec.groups.len();
        if groups == 0 || replication.replicas < groups || replication.replicas % groups != 0 {
            return Err(AssignmentError::InvalidConfig(format!(
                "table {}: {} replicas cannot be split evenly across {} replica groups",
                ctx.table.name, replication.replicas, groups
            )));
        }

        let layout = GroupLayout::build(spec, ctx.hosts());
        Ok((layout, spec.replicas_per_group(replication.replicas)))
    }
}

impl PlacementPolicy for ReplicaGroupPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::ReplicaGroup
    }

    fn assign_segment(
        &self,
        segment: &Segment,
        current: &Assignment,
        ctx: &PlacementContext<'_>,
    ) -> Result<Vec<InstanceId>> {
        let (layout, per_group) = Self::layout(ctx)?;

        let mut chosen = Vec::new();
        for (_, members) in &layout.groups {
            let hosts = group_hosts(ctx.view, members);
            let tracker =
                LoadTracker::from_assignment(hosts, current, ctx.selector.enforce_capacity);
            chosen.extend(place_segment(&segment.id, current, &tracker, per_group));
        }
        Ok(chosen)
    }

    fn rebalance_table(
        &self,
        current: &Assignment,
        config: &RebalanceConfig,
        ctx: &PlacementContext<'_>,
    ) -> Result<Assignment> {
        if !config.honor_replica_groups {
            return BalancedPolicy.rebalance_table(current, config, ctx);
        }

        let (layout, per_group) = Self::layout(ctx)?;
        let segments: Vec<_> = current.segment_ids().cloned().collect();

        let mut sets: BTreeMap<SegmentId, BTreeSet<InstanceId>> = segments
            .iter()
            .map(|s| (s.clone(), BTreeSet::new()))
            .collect();
        for (_, members) in &layout.groups {
            let tracker =
                LoadTracker::empty(group_hosts(ctx.view, members), ctx.selector.enforce_capacity);
            for (segment, instances) in balance(&segments, current, tracker, per_group, config) {
                sets.entry(segment).or_default().extend(instances);
            }
        }

        Ok(build_target(current, sets))
    }
}

fn group_hosts<'v>(
    view: &'v ClusterView,
    members: &'v BTreeSet<InstanceId>,
) -> impl Iterator<Item = &'v ServerInstance> {
    members.iter().filter_map(move |id| view.instance(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ReplicationSpec, SegmentState, TableConfig};
    use crate::selector::InstanceSelector;
    use crate::strategy::test_support::*;

    fn group_table() -> TableConfig {
        TableConfig::new(
            "events",
            ReplicationSpec::new(2, "analytics").with_replica_groups(["a", "b"]),
        )
        .with_policy(PolicyKind::ReplicaGroup)
    }

    fn instances() -> Vec<ServerInstance> {
        vec![
            tagged("server_1").with_replica_group("a"),
            tagged("server_2").with_replica_group("a"),
            tagged("server_3").with_replica_group("b"),
            tagged("server_4").with_replica_group("b"),
        ]
    }

    #[test]
    fn test_layout_pins_and_spreads() {
        let spec = ReplicaGroupSpec {
            groups: vec!["a".to_string(), "b".to_string()],
        };
        let hosts = vec![
            tagged("server_1").with_replica_group("b"),
            tagged("server_2"),
            tagged("server_3"),
            tagged("server_4").with_replica_group("z"),
        ];
        let layout = GroupLayout::build(&spec, &hosts);

        assert_eq!(layout.group_of("server_1"), Some("b"));
        assert_eq!(layout.group_of("server_2"), Some("a"));
        assert_eq!(layout.group_of("server_3"), Some("a"));
        assert_eq!(layout.group_of("server_4"), None);
        assert_eq!(layout.names().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_one_replica_per_group() {
        let table = group_table();
        let current = Assignment::new();
        let view = view(instances(), record(current.clone()));
        let selector = InstanceSelector::default();
        let ctx = PlacementContext::new(&table, &view, &selector);

        let chosen = ReplicaGroupPolicy
            .assign_segment(&Segment::new("events", "seg_1"), &current, &ctx)
            .unwrap();
        assert_eq!(chosen, vec!["server_1".to_string(), "server_3".to_string()]);
    }

    #[test]
    fn test_rebalance_stays_inside_group() {
        let table = group_table();
        let mut current = Assignment::new();
        current.set_state("seg_1", "server_1", SegmentState::Online);
        current.set_state("seg_1", "server_3", SegmentState::Online);
        current.set_state("seg_2", "server_1", SegmentState::Online);
        current.set_state("seg_2", "server_3", SegmentState::Online);

        // server_3 left the cluster
        let roster: Vec<_> = instances()
            .into_iter()
            .filter(|i| i.id != "server_3")
            .collect();
        let view = view(roster, record(current.clone()));
        let selector = InstanceSelector::default();
        let ctx = PlacementContext::new(&table, &view, &selector);

        let target = ReplicaGroupPolicy
            .rebalance_table(&current, &RebalanceConfig::default(), &ctx)
            .unwrap();
        for segment in ["seg_1", "seg_2"] {
            let set = target.active_instances(segment);
            assert!(set.contains("server_4"), "{:?}", set);
            assert_eq!(set.len(), 2);
        }
    }

    #[test]
    fn test_uneven_groups_rejected() {
        let table = TableConfig::new(
            "events",
            ReplicationSpec::new(3, "analytics").with_replica_groups(["a", "b"]),
        );
        let view = view(instances(), record(Assignment::new()));
        let selector = InstanceSelector::default();
        let ctx = PlacementContext::new(&table, &view, &selector);

        let err = ReplicaGroupPolicy
            .assign_segment(&Segment::new("events", "seg_1"), &Assignment::new(), &ctx)
            .unwrap_err();
        assert!(matches!(err, AssignmentError::InvalidConfig(_)));
    }
}
