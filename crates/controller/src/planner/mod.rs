//! Rebalance planner
//!
//! Diffs the current assignment of a table against its target and produces an
//! ordered, availability-preserving [`RebalancePlan`]:
//!
//! - per segment, new replicas are brought up before old ones are dropped
//! - non-serving replicas are dropped before serving ones
//! - a serving replica is never dropped when that would leave the segment
//!   below `min(min_available, target replicas)` serving replicas; such
//!   removals are held and reported
//! - with a replica-group layout, each group is a stage of its own and
//!   stages run strictly one after another
//!
//! Applying the plan is the job of [`executor::PlanExecution`].

pub mod executor;

pub use executor::{Advance, PlanExecution, Progress};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::error::{AssignmentError, Result};
use crate::lifecycle;
use crate::metadata::{Assignment, InstanceId, SegmentId, SegmentState, TableName, Version};
use crate::strategy::GroupLayout;

/// Step kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Bring up a new replica
    Add,
    /// Retire a replica
    Remove,
}

/// One state change of a (segment, instance) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub segment: SegmentId,
    pub instance: InstanceId,
    pub from: SegmentState,
    pub to: SegmentState,
    pub kind: StepKind,
}

impl std::fmt::Display for PlanStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} on {}: {} -> {}",
            self.segment, self.instance, self.from, self.to
        )
    }
}

/// Steps run together; stages run one after another
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStage {
    /// Replica group this stage covers, if any
    pub group: Option<String>,
    pub steps: Vec<PlanStep>,
}

/// Ordered rebalance plan of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalancePlan {
    pub table: TableName,
    /// Version of the record the plan was computed against
    pub base_version: Version,
    pub created_at: DateTime<Utc>,
    pub stages: Vec<PlanStage>,
    /// Instances that host no replica now and will host some after the plan
    pub instances_added: BTreeSet<InstanceId>,
    /// Instances that host replicas now and none after the plan
    pub instances_removed: BTreeSet<InstanceId>,
    /// Segments with removals withheld to keep them available
    pub held: Vec<SegmentId>,
    /// Segments left with fewer replicas than the replication factor
    pub degraded: Vec<SegmentId>,
    /// Serving replicas each segment must keep while the plan runs
    #[serde(default)]
    pub floors: BTreeMap<SegmentId, usize>,
}

impl RebalancePlan {
    /// All steps in execution order
    pub fn steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.stages.iter().flat_map(|stage| stage.steps.iter())
    }

    /// Total number of steps
    pub fn len(&self) -> usize {
        self.stages.iter().map(|stage| stage.steps.len()).sum()
    }

    /// Check if the plan moves nothing
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Minimum serving replicas of a segment during the plan
    pub fn floor(&self, segment: &str) -> usize {
        self.floors.get(segment).copied().unwrap_or(0)
    }
}

/// Rebalance planner of one table
#[derive(Debug, Clone)]
pub struct RebalancePlanner {
    table: TableName,
    replicas: usize,
    layout: Option<GroupLayout>,
}

impl RebalancePlanner {
    /// Create planner for a table with `replicas` replicas per segment
    pub fn new(table: impl Into<TableName>, replicas: usize) -> Self {
        Self {
            table: table.into(),
            replicas,
            layout: None,
        }
    }

    /// Stage the plan by replica group
    pub fn with_layout(mut self, layout: GroupLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    /// Plan the moves from `current` to `target`
    ///
    /// Only replica membership is diffed; a replica present on both sides
    /// keeps its recorded state.
    pub fn plan(
        &self,
        current: &Assignment,
        target: &Assignment,
        min_available: usize,
    ) -> Result<RebalancePlan> {
        if min_available > self.replicas {
            return Err(AssignmentError::InvalidConfig(format!(
                "table {}: min available replicas {} exceeds replication factor {}",
                self.table, min_available, self.replicas
            )));
        }

        let segments: BTreeSet<&SegmentId> =
            current.segment_ids().chain(target.segment_ids()).collect();

        let stage_count = self.stage_names().len();
        let mut adds: Vec<Vec<(SegmentId, InstanceId, SegmentState)>> =
            vec![Vec::new(); stage_count];
        let mut removes: Vec<Vec<(SegmentId, InstanceId)>> = vec![Vec::new(); stage_count];
        let mut floors = BTreeMap::new();
        let mut degraded = Vec::new();

        for segment in segments {
            let before = current.active_instances(segment);
            let after = target.active_instances(segment);

            if target.contains_segment(segment) && after.len() < self.replicas {
                degraded.push(segment.clone());
            }
            floors.insert(segment.clone(), min_available.min(after.len()));

            for instance in after.difference(&before) {
                let to = target
                    .state(segment, instance)
                    .unwrap_or(SegmentState::Offline);
                adds[self.stage_of(instance)].push((segment.clone(), instance.clone(), to));
            }
            for instance in before.difference(&after) {
                removes[self.stage_of(instance)].push((segment.clone(), instance.clone()));
            }
        }

        // Simulate the plan so that every removal is checked against the
        // serving count it will actually see
        let mut simulated = current.clone();
        let mut stages = Vec::with_capacity(stage_count);
        let mut deferred: Vec<(SegmentId, InstanceId)> = Vec::new();

        for (index, group) in self.stage_names().into_iter().enumerate() {
            let mut steps = Vec::new();

            for (segment, instance, to) in std::mem::take(&mut adds[index]) {
                if to != SegmentState::Offline {
                    lifecycle::validate(&segment, &instance, SegmentState::Offline, to)?;
                }
                simulated.set_state(&segment, &instance, to);
                steps.push(PlanStep {
                    segment,
                    instance,
                    from: SegmentState::Offline,
                    to,
                    kind: StepKind::Add,
                });
            }

            let mut candidates = std::mem::take(&mut deferred);
            candidates.append(&mut removes[index]);
            candidates.sort_by_key(|(segment, instance)| {
                let serving = simulated
                    .state(segment, instance)
                    .map(|s| s.is_serving())
                    .unwrap_or(false);
                (serving, segment.clone(), instance.clone())
            });

            for (segment, instance) in candidates {
                let Some(from) = simulated.state(&segment, &instance) else {
                    continue;
                };
                let floor = floors.get(&segment).copied().unwrap_or(0);
                if from.is_serving() && simulated.serving_count(&segment) <= floor {
                    deferred.push((segment, instance));
                    continue;
                }

                lifecycle::validate(&segment, &instance, from, SegmentState::Dropped)?;
                simulated.set_state(&segment, &instance, SegmentState::Dropped);
                steps.push(PlanStep {
                    segment,
                    instance,
                    from,
                    to: SegmentState::Dropped,
                    kind: StepKind::Remove,
                });
            }

            stages.push(PlanStage { group, steps });
        }

        let held: Vec<SegmentId> = deferred
            .into_iter()
            .map(|(segment, _)| segment)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if !held.is_empty() {
            warn!(
                "Table {}: holding removals of {} segments to keep them available",
                self.table,
                held.len()
            );
        }
        if !degraded.is_empty() {
            warn!(
                "Table {}: {} segments stay below {} replicas",
                self.table,
                degraded.len(),
                self.replicas
            );
        }

        let before = current.instances();
        let after = target.instances();
        let plan = RebalancePlan {
            table: self.table.clone(),
            base_version: 0,
            created_at: Utc::now(),
            stages: stages.into_iter().filter(|s| !s.steps.is_empty()).collect(),
            instances_added: after.difference(&before).cloned().collect(),
            instances_removed: before.difference(&after).cloned().collect(),
            held,
            degraded,
            floors,
        };
        debug!(
            "Planned {} steps in {} stages for table {}",
            plan.len(),
            plan.stages.len(),
            self.table
        );
        Ok(plan)
    }

    /// Stage names: one per group plus a trailing stage for ungrouped instances
    fn stage_names(&self) -> Vec<Option<String>> {
        match &self.layout {
            Some(layout) => layout
                .names()
                .map(|name| Some(name.to_string()))
                .chain(std::iter::once(None))
                .collect(),
            None => vec![None],
        }
    }

    fn stage_of(&self, instance: &str) -> usize {
        match &self.layout {
            Some(layout) => layout
                .names()
                .position(|name| Some(name) == layout.group_of(instance))
                .unwrap_or(layout.groups.len()),
            None => 0,
        }
    }
}
