//! Partition-aware placement
//!
//! All segments that came from the same upstream stream partition are pinned
//! to one replica set, so a consumer keeps reading a partition from the same
//! servers. Segments without a partition fall back to balanced placement.

use std::collections::{BTreeMap, BTreeSet};

use super::balanced::{balance, place_segment};
use super::{build_target, LoadTracker, PlacementContext, PlacementPolicy, RebalanceConfig};
use crate::error::Result;
use crate::metadata::{Assignment, InstanceId, PolicyKind, Segment, SegmentId, SegmentState};

/// Partition-aware placement policy
#[derive(Debug, Clone, Copy, Default)]
pub struct PartitionAwarePolicy;

impl PlacementPolicy for PartitionAwarePolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::PartitionAware
    }

    fn assign_segment(
        &self,
        segment: &Segment,
        current: &Assignment,
        ctx: &PlacementContext<'_>,
    ) -> Result<Vec<InstanceId>> {
        let tracker =
            LoadTracker::from_assignment(ctx.hosts(), current, ctx.selector.enforce_capacity);
        let wanted = ctx.table.replication.replicas.min(tracker.len());

        if let Some(partition) = segment.partition {
            let members = partition_members(current, ctx, partition, Some(&segment.id));
            if let Some(set) = dominant_set(current, &members) {
                if set.len() == wanted && set.iter().all(|i| tracker.is_host(i)) {
                    return Ok(set.into_iter().collect());
                }
            }
        }

        Ok(place_segment(
            &segment.id,
            current,
            &tracker,
            ctx.table.replication.replicas,
        ))
    }

    fn rebalance_table(
        &self,
        current: &Assignment,
        config: &RebalanceConfig,
        ctx: &PlacementContext<'_>,
    ) -> Result<Assignment> {
        let mut tracker = LoadTracker::empty(ctx.hosts(), ctx.selector.enforce_capacity);
        let wanted = ctx.table.replication.replicas.min(tracker.len());

        let mut partitions: BTreeMap<u32, Vec<SegmentId>> = BTreeMap::new();
        let mut loose = Vec::new();
        for segment in current.segment_ids() {
            match ctx.partition_of(segment) {
                Some(partition) => partitions.entry(partition).or_default().push(segment.clone()),
                None => loose.push(segment.clone()),
            }
        }

        let mut sets: BTreeMap<SegmentId, BTreeSet<InstanceId>> = BTreeMap::new();

        // One replica set per partition, starting from the one most segments use
        for members in partitions.values() {
            let weight = members.len();
            let errored = if config.move_errored {
                errored_instances(current, members)
            } else {
                BTreeSet::new()
            };
            let mut set: BTreeSet<InstanceId> = dominant_set(current, members)
                .unwrap_or_default()
                .into_iter()
                .filter(|i| tracker.is_host(i) && !errored.contains(i))
                .take(wanted)
                .collect();

            let needed = wanted - set.len();
            let mut exclude = errored;
            exclude.extend(set.iter().cloned());
            for instance in tracker.pick(&exclude, needed) {
                set.insert(instance);
            }
            for instance in &set {
                tracker.add(instance, weight);
            }
            for segment in members {
                sets.insert(segment.clone(), set.clone());
            }
        }

        // Segments outside any partition balance over what is left
        sets.extend(balance(
            &loose,
            current,
            tracker,
            ctx.table.replication.replicas,
            config,
        ));

        Ok(build_target(current, sets))
    }
}

/// Segments of a partition, optionally skipping one
fn partition_members(
    current: &Assignment,
    ctx: &PlacementContext<'_>,
    partition: u32,
    skip: Option<&SegmentId>,
) -> Vec<SegmentId> {
    current
        .segment_ids()
        .filter(|s| Some(*s) != skip)
        .filter(|s| ctx.partition_of(s) == Some(partition))
        .cloned()
        .collect()
}

/// Instances holding an ERROR replica of any of `members`
fn errored_instances(current: &Assignment, members: &[SegmentId]) -> BTreeSet<InstanceId> {
    members
        .iter()
        .filter_map(|segment| current.segment(segment))
        .flat_map(|replicas| replicas.iter())
        .filter(|(_, state)| **state == SegmentState::Error)
        .map(|(instance, _)| instance.clone())
        .collect()
}

/// Active instance set shared by the most segments (ties: smallest set order)
fn dominant_set(current: &Assignment, members: &[SegmentId]) -> Option<BTreeSet<InstanceId>> {
    let mut counts: BTreeMap<BTreeSet<InstanceId>, usize> = BTreeMap::new();
    for segment in members {
        let set = current.active_instances(segment);
        if !set.is_empty() {
            *counts.entry(set).or_insert(0) += 1;
        }
    }

    let mut best: Option<(BTreeSet<InstanceId>, usize)> = None;
    for (set, count) in counts {
        if best.as_ref().map(|(_, c)| count > *c).unwrap_or(true) {
            best = Some((set, count));
        }
    }
    best.map(|(set, _)| set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::TableRecord;
    use crate::selector::InstanceSelector;
    use crate::strategy::test_support::*;

    fn partitioned_record(entries: &[(&str, u32, &[&str])]) -> TableRecord {
        let mut record = TableRecord::default();
        for (segment, partition, instances) in entries {
            record.segments.insert(
                segment.to_string(),
                Segment::new("events", *segment).with_partition(*partition),
            );
            for instance in *instances {
                record
                    .assignment
                    .set_state(segment, instance, SegmentState::Online);
            }
        }
        record
    }

    fn roster() -> Vec<crate::metadata::ServerInstance> {
        vec![
            tagged("server_a"),
            tagged("server_b"),
            tagged("server_c"),
            tagged("server_d"),
        ]
    }

    #[test]
    fn test_new_segment_follows_partition() {
        let record = partitioned_record(&[
            ("p0_seg_0", 0, &["server_c", "server_d"]),
            ("p1_seg_0", 1, &["server_a", "server_b"]),
        ]);
        let current = record.assignment.clone();
        let table = table(2);
        let view = view(roster(), record);
        let selector = InstanceSelector::default();
        let ctx = PlacementContext::new(&table, &view, &selector);

        let segment = Segment::new("events", "p0_seg_1").with_partition(0);
        let chosen = PartitionAwarePolicy
            .assign_segment(&segment, &current, &ctx)
            .unwrap();
        assert_eq!(chosen, vec!["server_c".to_string(), "server_d".to_string()]);
    }

    #[test]
    fn test_new_partition_uses_least_loaded() {
        let record = partitioned_record(&[("p0_seg_0", 0, &["server_a", "server_b"])]);
        let current = record.assignment.clone();
        let table = table(2);
        let view = view(roster(), record);
        let selector = InstanceSelector::default();
        let ctx = PlacementContext::new(&table, &view, &selector);

        let segment = Segment::new("events", "p7_seg_0").with_partition(7);
        let chosen = PartitionAwarePolicy
            .assign_segment(&segment, &current, &ctx)
            .unwrap();
        assert_eq!(chosen, vec!["server_c".to_string(), "server_d".to_string()]);
    }

    #[test]
    fn test_rebalance_realigns_partition() {
        let record = partitioned_record(&[
            ("p0_seg_0", 0, &["server_a", "server_b"]),
            ("p0_seg_1", 0, &["server_a", "server_b"]),
            ("p0_seg_2", 0, &["server_a", "server_c"]),
        ]);
        let current = record.assignment.clone();
        let table = table(2);
        let view = view(roster(), record);
        let selector = InstanceSelector::default();
        let ctx = PlacementContext::new(&table, &view, &selector);

        let target = PartitionAwarePolicy
            .rebalance_table(&current, &RebalanceConfig::default(), &ctx)
            .unwrap();
        for segment in ["p0_seg_0", "p0_seg_1", "p0_seg_2"] {
            assert_eq!(replicas(&target, segment), vec!["server_a", "server_b"]);
        }
    }

    #[test]
    fn test_errored_replica_moves_when_allowed() {
        let mut record = partitioned_record(&[("p0_seg_0", 0, &["server_a", "server_b"])]);
        record
            .assignment
            .set_state("p0_seg_0", "server_b", SegmentState::Error);
        let current = record.assignment.clone();
        let table = table(2);
        let view = view(roster()[..3].to_vec(), record);
        let selector = InstanceSelector::default();
        let ctx = PlacementContext::new(&table, &view, &selector);

        let pinned = PartitionAwarePolicy
            .rebalance_table(&current, &RebalanceConfig::default(), &ctx)
            .unwrap();
        assert_eq!(replicas(&pinned, "p0_seg_0"), vec!["server_a", "server_b"]);
        assert_eq!(pinned.state("p0_seg_0", "server_b"), Some(SegmentState::Error));

        let options = RebalanceConfig {
            move_errored: true,
            ..Default::default()
        };
        let moved = PartitionAwarePolicy
            .rebalance_table(&current, &options, &ctx)
            .unwrap();
        assert_eq!(replicas(&moved, "p0_seg_0"), vec!["server_a", "server_c"]);
        assert_eq!(moved.state("p0_seg_0", "server_c"), Some(SegmentState::Online));
    }
}
