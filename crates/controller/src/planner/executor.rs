//! Plan execution
//!
//! Applies a [`RebalancePlan`] one refresh cycle at a time. Every call to
//! [`PlanExecution::advance`] works against a freshly read [`ClusterView`]:
//!
//! 1. additions of the current stage not yet recorded are recorded OFFLINE
//! 2. additions are converged once the view reports their target state
//! 3. a removal runs only after every addition of its segment converged, and
//!    only if the view still has enough serving replicas without it
//!
//! Progress is derived from the view, so a lost write (conflict) is simply
//! redone on the next cycle. Segments whose additions do not converge, or
//! whose removals stay blocked, within `max_refresh_cycles` are stalled:
//! their removals are withheld.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use super::{PlanStep, RebalancePlan, StepKind};
use crate::error::{AssignmentError, Result};
use crate::lifecycle;
use crate::metadata::{
    ClusterView, InstanceId, SegmentId, SegmentState, ServerInstance, TableRecord,
};

/// Execution progress after one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Progress {
    /// Waiting for replicas to converge
    Waiting,
    /// Every stage finished (stalled segments excluded)
    Completed,
    /// The instance roster changed since execution started
    Superseded,
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Progress::Waiting => write!(f, "waiting"),
            Progress::Completed => write!(f, "completed"),
            Progress::Superseded => write!(f, "superseded"),
        }
    }
}

/// Result of one execution cycle
#[derive(Debug, Clone)]
pub struct Advance {
    /// Updated record to publish, if this cycle changed anything
    pub record: Option<TableRecord>,
    pub progress: Progress,
}

/// In-flight execution of a plan
#[derive(Debug, Clone)]
pub struct PlanExecution {
    plan: RebalancePlan,
    roster: BTreeMap<InstanceId, ServerInstance>,
    max_refresh_cycles: u32,
    stage: usize,
    waits: BTreeMap<SegmentId, u32>,
    stalled: BTreeSet<SegmentId>,
    applied: usize,
    started_at: DateTime<Utc>,
}

impl PlanExecution {
    /// Start executing `plan` against the roster of `view`
    pub fn new(plan: RebalancePlan, view: &ClusterView, max_refresh_cycles: u32) -> Self {
        Self {
            plan,
            roster: view.instances.clone(),
            max_refresh_cycles,
            stage: 0,
            waits: BTreeMap::new(),
            stalled: BTreeSet::new(),
            applied: 0,
            started_at: Utc::now(),
        }
    }

    pub fn plan(&self) -> &RebalancePlan {
        &self.plan
    }

    /// Segments whose additions never converged
    pub fn stalled(&self) -> Vec<SegmentId> {
        self.stalled.iter().cloned().collect()
    }

    /// Steps written so far
    pub fn applied(&self) -> usize {
        self.applied
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whether every stage has finished
    pub fn is_finished(&self) -> bool {
        self.stage >= self.plan.stages.len()
    }

    /// Stalled migration error, if any segment stalled
    pub fn stall_error(&self) -> Option<AssignmentError> {
        if self.stalled.is_empty() {
            return None;
        }
        Some(AssignmentError::StalledMigration {
            table: self.plan.table.clone(),
            segments: self.stalled(),
        })
    }

    /// Run one refresh cycle against a fresh view
    pub fn advance(&mut self, view: &ClusterView) -> Result<Advance> {
        let roster_changed = view.instances != self.roster;
        if roster_changed {
            info!(
                "Instance roster of table {} changed, superseding plan",
                self.plan.table
            );
            return Ok(Advance {
                record: None,
                progress: Progress::Superseded,
            });
        }

        let mut record = view.record.clone();
        let mut changed = false;

        while !self.is_finished() {
            let steps = self.plan.stages[self.stage].steps.clone();
            let mut pending: BTreeSet<SegmentId> = BTreeSet::new();
            let mut stage_changed = false;

            for step in steps.iter().filter(|s| s.kind == StepKind::Add) {
                if self.stalled.contains(&step.segment) {
                    continue;
                }
                match record.assignment.state(&step.segment, &step.instance) {
                    None | Some(SegmentState::Dropped) => {
                        lifecycle::record_new(
                            &mut record.assignment,
                            &step.segment,
                            &step.instance,
                            SegmentState::Offline,
                        )?;
                        self.applied += 1;
                        stage_changed = true;
                        pending.insert(step.segment.clone());
                    }
                    Some(state) if converged(state, step.to) => {}
                    Some(_) => {
                        pending.insert(step.segment.clone());
                    }
                }
            }

            let mut blocked: BTreeSet<SegmentId> = BTreeSet::new();
            for step in steps.iter().filter(|s| s.kind == StepKind::Remove) {
                if self.stalled.contains(&step.segment) {
                    continue;
                }
                if pending.contains(&step.segment) || self.earlier_adds_pending(&record, step) {
                    blocked.insert(step.segment.clone());
                    continue;
                }
                match record.assignment.state(&step.segment, &step.instance) {
                    None | Some(SegmentState::Dropped) => {}
                    Some(state) => {
                        let floor = self.plan.floor(&step.segment);
                        let serving = record.assignment.serving_count(&step.segment);
                        if state.is_serving() && serving <= floor {
                            debug!(
                                "Removal of {} waits for {} to be served by more replicas",
                                step.instance, step.segment
                            );
                            blocked.insert(step.segment.clone());
                            continue;
                        }
                        lifecycle::transition(
                            &self.plan.table,
                            &mut record.assignment,
                            &step.segment,
                            &step.instance,
                            SegmentState::Dropped,
                        )?;
                        self.applied += 1;
                        stage_changed = true;
                    }
                }
            }

            // Additions count a wait once the view shows them; blocked
            // removals count one every cycle
            let waiting: BTreeSet<SegmentId> = pending
                .iter()
                .filter(|segment| self.waiting_in_view(view, &steps, segment))
                .chain(blocked.iter().filter(|segment| !pending.contains(*segment)))
                .cloned()
                .collect();
            for segment in waiting {
                self.count_wait(segment);
            }

            changed |= stage_changed;
            // A stage finishes only once the view confirms its writes
            let stage_done = !stage_changed
                && pending
                    .iter()
                    .chain(blocked.iter())
                    .all(|segment| self.stalled.contains(segment));
            if !stage_done {
                break;
            }
            debug!(
                "Stage {} of table {} finished",
                self.stage, self.plan.table
            );
            self.stage += 1;
        }

        let progress = if self.is_finished() {
            Progress::Completed
        } else {
            Progress::Waiting
        };
        Ok(Advance {
            record: changed.then_some(record),
            progress,
        })
    }

    /// Whether `segment` has a recorded addition in `view` that has not converged
    fn waiting_in_view(&self, view: &ClusterView, steps: &[PlanStep], segment: &str) -> bool {
        steps
            .iter()
            .filter(|s| s.kind == StepKind::Add && s.segment == segment)
            .any(|s| match view.assignment().state(&s.segment, &s.instance) {
                Some(state) => !state.is_terminal() && !converged(state, s.to),
                None => false,
            })
    }

    /// Whether an addition of the step's segment in an earlier stage is unconverged
    fn earlier_adds_pending(&self, record: &TableRecord, step: &PlanStep) -> bool {
        self.plan.stages[..self.stage]
            .iter()
            .flat_map(|stage| stage.steps.iter())
            .filter(|s| s.kind == StepKind::Add && s.segment == step.segment)
            .filter(|s| !self.stalled.contains(&s.segment))
            .any(|s| {
                !record
                    .assignment
                    .state(&s.segment, &s.instance)
                    .map(|state| converged(state, s.to))
                    .unwrap_or(false)
            })
    }

    /// Spend one refresh cycle of a segment's budget, stalling it when exhausted
    fn count_wait(&mut self, segment: SegmentId) {
        let waits = self.waits.entry(segment.clone()).or_insert(0);
        *waits += 1;
        if *waits >= self.max_refresh_cycles {
            warn!(
                "Segment {} of table {} did not converge after {} refresh cycles, withholding its removals",
                segment, self.plan.table, waits
            );
            self.stalled.insert(segment);
        }
    }
}

/// Whether a replica in `state` has reached a planned target
///
/// A replica planned to serve has arrived in either serving state: a
/// consuming segment may commit while its new replica comes up.
fn converged(state: SegmentState, target: SegmentState) -> bool {
    state == target || (target.is_serving() && state.is_serving())
}
