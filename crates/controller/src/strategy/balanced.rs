//! Balanced placement
//!
//! Greedy bin-packing by replica count: keep every replica that may stay,
//! fill empty slots from the least loaded hosts, then move replicas off
//! instances above their capacity-weighted share.

use std::collections::{BTreeMap, BTreeSet};

use super::{
    build_target, kept_replicas, LoadTracker, PlacementContext, PlacementPolicy, RebalanceConfig,
};
use crate::error::Result;
use crate::metadata::{Assignment, InstanceId, PolicyKind, Segment, SegmentId, SegmentState};

/// Balanced placement policy
#[derive(Debug, Clone, Copy, Default)]
pub struct BalancedPolicy;

impl PlacementPolicy for BalancedPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Balanced
    }

    fn assign_segment(
        &self,
        segment: &Segment,
        current: &Assignment,
        ctx: &PlacementContext<'_>,
    ) -> Result<Vec<InstanceId>> {
        let tracker =
            LoadTracker::from_assignment(ctx.hosts(), current, ctx.selector.enforce_capacity);
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
        let tracker = LoadTracker::empty(ctx.hosts(), ctx.selector.enforce_capacity);
        let segments: Vec<_> = current.segment_ids().cloned().collect();
        let sets = balance(
            &segments,
            current,
            tracker,
            ctx.table.replication.replicas,
            config,
        );
        Ok(build_target(current, sets))
    }
}

/// Replica set for one segment against a tracker seeded with current loads
///
/// Replicas already recorded on hosts are kept; the remaining slots go to the
/// least loaded hosts.
pub(crate) fn place_segment(
    segment: &str,
    current: &Assignment,
    tracker: &LoadTracker,
    replicas: usize,
) -> Vec<InstanceId> {
    let wanted = replicas.min(tracker.len());

    let mut chosen: Vec<InstanceId> = current
        .active_instances(segment)
        .into_iter()
        .filter(|i| tracker.is_host(i))
        .take(wanted)
        .collect();

    let exclude: BTreeSet<_> = chosen.iter().cloned().collect();
    chosen.extend(tracker.pick(&exclude, wanted - chosen.len()));
    chosen
}

/// Balanced instance sets for `segments` over the tracker's hosts
pub(crate) fn balance(
    segments: &[SegmentId],
    current: &Assignment,
    mut tracker: LoadTracker,
    replicas: usize,
    config: &RebalanceConfig,
) -> BTreeMap<SegmentId, BTreeSet<InstanceId>> {
    let wanted = replicas.min(tracker.len());
    let mut sets: BTreeMap<SegmentId, BTreeSet<InstanceId>> = BTreeMap::new();
    let mut excluded: BTreeMap<SegmentId, BTreeSet<InstanceId>> = BTreeMap::new();

    // Keep what may stay
    for segment in segments {
        let (mut kept, skip) = match current.segment(segment) {
            Some(replicas) => kept_replicas(replicas, &tracker, config),
            None => Default::default(),
        };
        trim(segment, &mut kept, current, wanted);
        for instance in &kept {
            tracker.add(instance, 1);
        }
        sets.insert(segment.clone(), kept);
        excluded.insert(segment.clone(), skip);
    }

    // Fill empty slots
    for segment in segments {
        let Some(set) = sets.get_mut(segment) else {
            continue;
        };
        let needed = wanted.saturating_sub(set.len());
        if needed == 0 {
            continue;
        }
        let mut exclude = excluded.get(segment).cloned().unwrap_or_default();
        exclude.extend(set.iter().cloned());
        for instance in tracker.pick(&exclude, needed) {
            tracker.add(&instance, 1);
            set.insert(instance);
        }
    }

    // Move replicas off instances above their share
    let total = segments.len() * wanted;
    for over in tracker.most_loaded_first() {
        while tracker.load(&over) > fair_share(&tracker, &over, total) {
            let Some((segment, under)) =
                find_move(segments, &sets, &excluded, &tracker, current, &over, total)
            else {
                break;
            };
            if let Some(set) = sets.get_mut(&segment) {
                set.remove(&over);
                set.insert(under.clone());
            }
            tracker.remove(&over, 1);
            tracker.add(&under, 1);
        }
    }

    sets
}

/// Pick a segment hosted on `over` and an under-loaded instance to move it to
///
/// Later segments move first; errored replicas are pinned in place.
fn find_move(
    segments: &[SegmentId],
    sets: &BTreeMap<SegmentId, BTreeSet<InstanceId>>,
    excluded: &BTreeMap<SegmentId, BTreeSet<InstanceId>>,
    tracker: &LoadTracker,
    current: &Assignment,
    over: &str,
    total: usize,
) -> Option<(SegmentId, InstanceId)> {
    let mut unders = tracker.pick(&BTreeSet::new(), tracker.len());
    unders.retain(|id| id != over && tracker.load(id) < fair_share(tracker, id, total));

    for under in unders {
        for segment in segments.iter().rev() {
            let Some(set) = sets.get(segment) else {
                continue;
            };
            if !set.contains(over) || set.contains(&under) {
                continue;
            }
            if current.state(segment, over) == Some(SegmentState::Error) {
                continue;
            }
            if excluded
                .get(segment)
                .map(|skip| skip.contains(&under))
                .unwrap_or(false)
            {
                continue;
            }
            return Some((segment.clone(), under));
        }
    }
    None
}

/// Capacity-weighted share of `total` replicas for one instance, rounded up
fn fair_share(tracker: &LoadTracker, instance: &str, total: usize) -> usize {
    let capacities: Vec<_> = tracker
        .host_ids()
        .map(|id| tracker_capacity(tracker, id))
        .collect();
    let sum: u128 = capacities.iter().sum();
    if sum == 0 {
        return total;
    }
    let own = tracker_capacity(tracker, instance);
    ((total as u128 * own + sum - 1) / sum) as usize
}

fn tracker_capacity(tracker: &LoadTracker, instance: &str) -> u128 {
    tracker.capacity(instance).max(1) as u128
}

/// Drop surplus kept replicas: non-serving first, then by descending ID
fn trim(segment: &str, kept: &mut BTreeSet<InstanceId>, current: &Assignment, wanted: usize) {
    while kept.len() > wanted {
        let victim = kept
            .iter()
            .rev()
            .find(|i| {
                !current
                    .state(segment, i)
                    .map(|s| s.is_serving())
                    .unwrap_or(false)
            })
            .or_else(|| kept.iter().next_back())
            .cloned();
        match victim {
            Some(instance) => {
                kept.remove(&instance);
            }
            None => break,
        }
    }
}
