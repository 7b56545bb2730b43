//! Segment assignment
//!
//! Maps each segment to the instances hosting it and the lifecycle state of
//! every replica. Ordered maps keep iteration deterministic so that the same
//! input always produces the same plan.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::{InstanceId, SegmentId, SegmentState};

/// Replica states of one segment (instance -> state)
pub type InstanceStateMap = BTreeMap<InstanceId, SegmentState>;

/// Table assignment (segment -> instance -> state)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Assignment {
    segments: BTreeMap<SegmentId, InstanceStateMap>,
}

impl Assignment {
    /// Create empty assignment
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Check if no segment is assigned
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Iterate segments in ID order
    pub fn iter(&self) -> impl Iterator<Item = (&SegmentId, &InstanceStateMap)> {
        self.segments.iter()
    }

    /// Segment IDs in order
    pub fn segment_ids(&self) -> impl Iterator<Item = &SegmentId> {
        self.segments.keys()
    }

    /// Get replica states of a segment
    pub fn segment(&self, segment: &str) -> Option<&InstanceStateMap> {
        self.segments.get(segment)
    }

    /// Check whether a segment is present
    pub fn contains_segment(&self, segment: &str) -> bool {
        self.segments.contains_key(segment)
    }

    /// Recorded state of a replica
    pub fn state(&self, segment: &str, instance: &str) -> Option<SegmentState> {
        self.segments.get(segment)?.get(instance).copied()
    }

    /// Record a replica state (no validation, see [`crate::lifecycle`])
    pub fn set_state(&mut self, segment: &str, instance: &str, state: SegmentState) {
        self.segments
            .entry(segment.to_string())
            .or_default()
            .insert(instance.to_string(), state);
    }

    /// Replace all replicas of a segment
    pub fn set_segment(&mut self, segment: SegmentId, replicas: InstanceStateMap) {
        self.segments.insert(segment, replicas);
    }

    /// Remove a segment entirely
    pub fn remove_segment(&mut self, segment: &str) -> Option<InstanceStateMap> {
        self.segments.remove(segment)
    }

    /// Instances holding a non-terminal state for the segment
    pub fn active_instances(&self, segment: &str) -> BTreeSet<InstanceId> {
        self.segments
            .get(segment)
            .map(|replicas| {
                replicas
                    .iter()
                    .filter(|(_, state)| !state.is_terminal())
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of replicas currently serving the segment
    pub fn serving_count(&self, segment: &str) -> usize {
        self.segments
            .get(segment)
            .map(|replicas| replicas.values().filter(|s| s.is_serving()).count())
            .unwrap_or(0)
    }

    /// Whether any replica of the segment is consuming
    pub fn is_consuming(&self, segment: &str) -> bool {
        self.segments
            .get(segment)
            .map(|replicas| replicas.values().any(|s| *s == SegmentState::Consuming))
            .unwrap_or(false)
    }

    /// Non-terminal replica count per instance
    pub fn instance_loads(&self) -> BTreeMap<InstanceId, usize> {
        let mut loads = BTreeMap::new();
        for replicas in self.segments.values() {
            for (instance, state) in replicas {
                if !state.is_terminal() {
                    *loads.entry(instance.clone()).or_insert(0) += 1;
                }
            }
        }
        loads
    }

    /// All instances holding at least one non-terminal replica
    pub fn instances(&self) -> BTreeSet<InstanceId> {
        self.instance_loads().into_keys().collect()
    }

    /// Remove dropped replicas, and segments left without any replica
    pub fn purge_dropped(&mut self) -> usize {
        let mut purged = 0;
        for replicas in self.segments.values_mut() {
            let before = replicas.len();
            replicas.retain(|_, state| !state.is_terminal());
            purged += before - replicas.len();
        }
        self.segments.retain(|_, replicas| !replicas.is_empty());
        purged
    }
}

impl FromIterator<(SegmentId, InstanceStateMap)> for Assignment {
    fn from_iter<T: IntoIterator<Item = (SegmentId, InstanceStateMap)>>(iter: T) -> Self {
        Self {
            segments: iter.into_iter().collect(),
        }
    }
}
