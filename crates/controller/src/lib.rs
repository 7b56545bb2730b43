//! Controller - Segment assignment and rebalancing engine
//!
//! Decides which servers host every segment of a table, in which lifecycle
//! state, and moves a table from its current placement to a new one without
//! losing availability.
//!
//! # Features
//! - Capacity-aware instance selection with tenant tags
//! - Balanced, replica-group and partition-aware placement
//! - Availability-preserving rebalance plans, applied stage by stage
//! - Segment lifecycle validation
//! - Optimistic-concurrency publishing with bounded retries
//!
//! # Usage Example
//! ```ignore
//! use controller::{Controller, config::Config};
//! use controller::coordinator::{LocalCoordinator, StaticTableConfigs};
//!
//! let config = Config::from_file("controller.yaml")?;
//! let tables = Arc::new(StaticTableConfigs::new(config.tables.clone()));
//! let controller = Controller::new(config, Arc::new(LocalCoordinator::new()), tables);
//! controller.assign_segment(Segment::new("events", "events_0"), false).await?;
//! ```

pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lifecycle;
pub mod metadata;
pub mod planner;
pub mod publisher;
pub mod selector;
pub mod strategy;

// Re-export commonly used types
pub use error::{AssignmentError, Result};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use config::Config;
use coordinator::{Coordinator, TableConfigProvider};
use metadata::{
    ClusterView, InstanceId, PolicyKind, Segment, SegmentId, SegmentState, TableConfig, TableName,
    Version,
};
use planner::{PlanExecution, Progress, RebalancePlan, RebalancePlanner};
use publisher::AssignmentPublisher;
use selector::InstanceSelector;
use strategy::{policy_for, PlacementContext, RebalanceConfig, ReplicaGroupPolicy};

/// Placement of a newly registered segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentAssignment {
    pub table: TableName,
    pub segment: SegmentId,
    pub instances: Vec<InstanceId>,
    /// State the replicas were recorded in
    pub state: SegmentState,
    /// Record version after the write
    pub version: Version,
}

/// How a rebalance ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceOutcome {
    /// Plan computed, nothing applied
    DryRun,
    /// The table already matched its target
    NoChange,
    /// Every step applied
    Completed,
    /// The roster kept changing; the next cycle picks the table up again
    Superseded,
}

/// Result of a rebalance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceReport {
    pub table: TableName,
    pub outcome: RebalanceOutcome,
    /// Last computed plan
    pub plan: RebalancePlan,
    /// Steps written to the coordination service
    pub applied: usize,
    /// Times the plan was recomputed after a roster change
    pub restarts: u32,
    pub finished_at: DateTime<Utc>,
}

/// Segment assignment controller
pub struct Controller {
    config: Config,
    tables: Arc<dyn TableConfigProvider>,
    publisher: AssignmentPublisher,
    selector: InstanceSelector,
}

impl Controller {
    /// Create controller
    pub fn new(
        config: Config,
        coordinator: Arc<dyn Coordinator>,
        tables: Arc<dyn TableConfigProvider>,
    ) -> Self {
        let publisher = AssignmentPublisher::new(
            coordinator,
            config.coordinator.request_timeout(),
            config.publisher.retry_policy(),
        );
        let selector = config.placement.selector();

        info!(
            "Controller initialized: cluster={}, max_refresh_cycles={}",
            config.controller.cluster_name, config.controller.max_refresh_cycles
        );

        Self {
            config,
            tables,
            publisher,
            selector,
        }
    }

    /// Get configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get coordination service
    pub fn coordinator(&self) -> &Arc<dyn Coordinator> {
        self.publisher.coordinator()
    }

    /// Get table config provider
    pub fn tables(&self) -> &Arc<dyn TableConfigProvider> {
        &self.tables
    }

    /// Configuration of a table
    pub async fn table_config(&self, table: &str) -> Result<TableConfig> {
        self.tables
            .table_config(table)
            .await
            .ok_or_else(|| AssignmentError::TableNotFound(table.to_string()))
    }

    /// Fresh view of a table
    pub async fn view(&self, table: &str) -> Result<ClusterView> {
        self.publisher.load_view(table).await
    }

    /// Place a newly created segment and record its replicas
    ///
    /// Replicas are recorded CONSUMING for a realtime segment and ONLINE for
    /// an uploaded one. Registering a segment again with a higher generation
    /// refreshes its metadata and keeps its placement.
    pub async fn assign_segment(
        &self,
        segment: Segment,
        realtime: bool,
    ) -> Result<SegmentAssignment> {
        let table = segment.table.clone();
        let config = self.table_config(&table).await?;
        let initial = if realtime {
            SegmentState::Consuming
        } else {
            SegmentState::Online
        };

        self.publisher
            .run_cycle(&table, |view| {
                let segment = segment.clone();
                let config = &config;
                let table = &table;
                async move {
                    let mut record = view.record.clone();

                    if let Some(recorded) = record.segments.get(&segment.id) {
                        if segment.generation <= recorded.generation {
                            return Err(AssignmentError::SupersededSegment {
                                segment: segment.id.clone(),
                                generation: segment.generation,
                                recorded: recorded.generation,
                            });
                        }
                    }

                    let id = segment.id.clone();
                    let existing = record.assignment.active_instances(&id);
                    let instances: Vec<InstanceId> = if existing.is_empty() {
                        let placed = self.place(config, &segment, &view)?;
                        for instance in &placed {
                            lifecycle::record_new(&mut record.assignment, &id, instance, initial)?;
                        }
                        placed
                    } else {
                        info!(
                            "Segment {} of table {} re-registered at generation {}, keeping its placement",
                            id, table, segment.generation
                        );
                        existing.into_iter().collect()
                    };
                    record.segments.insert(id.clone(), segment);

                    let version = self.publisher.publish(table, record, view.version).await?;
                    info!(
                        "Assigned segment {} of table {} to {:?} ({})",
                        id, table, instances, initial
                    );
                    Ok(SegmentAssignment {
                        table: table.clone(),
                        segment: id,
                        instances,
                        state: initial,
                        version,
                    })
                }
            })
            .await
    }

    /// Pick instances for a new segment against one view
    fn place(
        &self,
        config: &TableConfig,
        segment: &Segment,
        view: &ClusterView,
    ) -> Result<Vec<InstanceId>> {
        let replication = &config.replication;
        let eligible = self.selector.eligible(replication, view);
        if eligible.len() < replication.replicas && !self.config.placement.allow_under_replicated {
            return Err(AssignmentError::InsufficientCapacity {
                table: config.name.clone(),
                required: replication.replicas,
                available: eligible.len(),
            });
        }

        let ctx = PlacementContext::new(config, view, &self.selector);
        let instances = policy_for(config.policy).assign_segment(segment, view.assignment(), &ctx)?;
        if instances.is_empty() {
            return Err(AssignmentError::InsufficientCapacity {
                table: config.name.clone(),
                required: replication.replicas,
                available: 0,
            });
        }
        if instances.len() < replication.replicas {
            warn!(
                "Segment {} of table {} placed on {} of {} replicas",
                segment.id,
                config.name,
                instances.len(),
                replication.replicas
            );
        }
        Ok(instances)
    }

    /// Compute the rebalance plan of a table against one view
    pub fn compute_plan(
        &self,
        config: &TableConfig,
        view: &ClusterView,
        options: &RebalanceConfig,
    ) -> Result<RebalancePlan> {
        let ctx = PlacementContext::new(config, view, &self.selector);
        let current = view.assignment();
        let target = policy_for(config.policy).rebalance_table(current, options, &ctx)?;

        let mut planner = RebalancePlanner::new(&config.name, config.replication.replicas);
        if config.policy == PolicyKind::ReplicaGroup && options.honor_replica_groups {
            let (layout, _) = ReplicaGroupPolicy::layout(&ctx)?;
            planner = planner.with_layout(layout);
        }

        let mut plan = planner.plan(current, &target, options.min_available_replicas)?;
        plan.base_version = view.version;
        Ok(plan)
    }

    /// Dry-run rebalance: the plan the table would follow right now
    pub async fn plan_rebalance(
        &self,
        table: &str,
        options: &RebalanceConfig,
    ) -> Result<RebalancePlan> {
        let config = self.table_config(table).await?;
        self.publisher
            .run_cycle(table, |view| {
                let config = &config;
                async move { self.compute_plan(config, &view, options) }
            })
            .await
    }

    /// Rebalance a table and apply the plan
    ///
    /// Returns once every stage finished. Segments whose new replicas never
    /// come up fail the call with `StalledMigration`; their old replicas stay.
    pub async fn rebalance(
        &self,
        table: &str,
        options: RebalanceConfig,
    ) -> Result<RebalanceReport> {
        let config = self.table_config(table).await?;
        let max_restarts = self.config.controller.max_superseded_restarts;
        let mut restarts = 0;
        let mut applied = 0;

        loop {
            let (plan, view) = self
                .publisher
                .run_cycle(table, |view| {
                    let config = &config;
                    let options = &options;
                    async move {
                        let plan = self.compute_plan(config, &view, options)?;
                        Ok((plan, view))
                    }
                })
                .await?;

            let report = |outcome, plan: RebalancePlan, applied| RebalanceReport {
                table: table.to_string(),
                outcome,
                plan,
                applied,
                restarts,
                finished_at: Utc::now(),
            };

            if options.dry_run {
                return Ok(report(RebalanceOutcome::DryRun, plan, 0));
            }
            if plan.is_empty() {
                debug!("Table {} is balanced", table);
                return Ok(report(RebalanceOutcome::NoChange, plan, applied));
            }

            info!(
                "Rebalancing table {}: {} steps, {} instances added, {} removed",
                table,
                plan.len(),
                plan.instances_added.len(),
                plan.instances_removed.len()
            );

            let mut execution =
                PlanExecution::new(plan, &view, self.config.controller.max_refresh_cycles);
            let progress = self.execute(table, &mut execution, view).await?;
            applied += execution.applied();

            match progress {
                Progress::Completed => {
                    if let Some(err) = execution.stall_error() {
                        error!("Rebalance of table {} stalled: {}", table, err);
                        return Err(err);
                    }
                    info!("Rebalance of table {} completed: {} steps applied", table, applied);
                    return Ok(report(
                        RebalanceOutcome::Completed,
                        execution.plan().clone(),
                        applied,
                    ));
                }
                Progress::Superseded if restarts < max_restarts => {
                    restarts += 1;
                    info!(
                        "Restarting rebalance of table {} ({}/{})",
                        table, restarts, max_restarts
                    );
                }
                Progress::Superseded | Progress::Waiting => {
                    warn!("Rebalance of table {} superseded, leaving it to the next cycle", table);
                    return Ok(report(
                        RebalanceOutcome::Superseded,
                        execution.plan().clone(),
                        applied,
                    ));
                }
            }
        }
    }

    /// Drive an execution until it completes or is superseded
    async fn execute(
        &self,
        table: &str,
        execution: &mut PlanExecution,
        mut view: ClusterView,
    ) -> Result<Progress> {
        let retry = *self.publisher.retry_policy();
        let mut failures = 0;

        loop {
            let advance = execution.advance(&view)?;
            if let Some(record) = advance.record {
                match self.publisher.publish(table, record, view.version).await {
                    Ok(_) => failures = 0,
                    Err(e) if e.is_transient() && failures + 1 < retry.max_attempts => {
                        // Progress is derived from the view, the next cycle redoes the write
                        failures += 1;
                        warn!("Write during rebalance of table {} failed: {}", table, e);
                    }
                    Err(e) => return Err(e),
                }
            } else if advance.progress != Progress::Waiting {
                return Ok(advance.progress);
            }

            tokio::time::sleep(self.config.controller.refresh_interval()).await;
            view = loop {
                match self.publisher.load_view(table).await {
                    Ok(view) => break view,
                    Err(e) if e.is_transient() && failures + 1 < retry.max_attempts => {
                        failures += 1;
                        warn!("Refresh of table {} failed: {}", table, e);
                        tokio::time::sleep(retry.backoff(failures)).await;
                    }
                    Err(e) => return Err(e),
                }
            };
        }
    }

    /// Record a state change reported by a server or the ingestion subsystem
    ///
    /// Returns `false` when the replica already was in the requested state.
    pub async fn transition(
        &self,
        table: &str,
        segment: &str,
        instance: &str,
        to: SegmentState,
    ) -> Result<bool> {
        self.publisher
            .run_cycle(table, |view| async move {
                let mut record = view.record.clone();
                if record.assignment.state(segment, instance) == Some(to) {
                    return Ok(false);
                }
                lifecycle::transition(table, &mut record.assignment, segment, instance, to)?;
                self.publisher.publish(table, record, view.version).await?;
                Ok(true)
            })
            .await
    }

    /// Retire a segment: every replica is marked DROPPED
    ///
    /// Returns the number of replicas dropped.
    pub async fn drop_segment(&self, table: &str, segment: &str) -> Result<usize> {
        self.publisher
            .run_cycle(table, |view| async move {
                let mut record = view.record.clone();
                let Some(replicas) = record.assignment.segment(segment).cloned() else {
                    return Err(AssignmentError::SegmentNotFound {
                        table: table.to_string(),
                        segment: segment.to_string(),
                    });
                };

                let mut dropped = 0;
                for (instance, state) in replicas {
                    if !state.is_terminal() {
                        lifecycle::transition(
                            table,
                            &mut record.assignment,
                            segment,
                            &instance,
                            SegmentState::Dropped,
                        )?;
                        dropped += 1;
                    }
                }
                if dropped > 0 {
                    self.publisher.publish(table, record, view.version).await?;
                    info!("Dropped segment {} of table {} ({} replicas)", segment, table, dropped);
                }
                Ok(dropped)
            })
            .await
    }

    /// Forget dropped replicas, and segments with nothing left
    ///
    /// Returns the number of replica entries removed.
    pub async fn compact(&self, table: &str) -> Result<usize> {
        self.publisher
            .run_cycle(table, |view| async move {
                let mut record = view.record.clone();
                let purged = record.assignment.purge_dropped();
                if purged == 0 {
                    return Ok(0);
                }
                let assignment = &record.assignment;
                record.segments.retain(|id, _| assignment.contains_segment(id));
                self.publisher.publish(table, record, view.version).await?;
                debug!("Compacted table {}: {} dropped replicas removed", table, purged);
                Ok(purged)
            })
            .await
    }

    /// Compact and rebalance every configured table once
    pub async fn reconcile(&self) -> Vec<(TableName, Result<RebalanceReport>)> {
        let mut results = Vec::new();
        for table in self.tables.table_names().await {
            if let Err(e) = self.compact(&table).await {
                warn!("Compaction of table {} failed: {}", table, e);
            }
            let result = self.rebalance(&table, self.config.rebalance.clone()).await;
            if let Err(e) = &result {
                warn!("Reconciliation of table {} failed: {}", table, e);
            }
            results.push((table, result));
        }
        results
    }

    /// Start periodic reconciliation task
    pub fn start_reconciler(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        use tokio::time::interval;

        let period = self.config.reconcile.interval();
        tokio::spawn(async move {
            let mut interval = interval(period);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let results = self.reconcile().await;
                let failed = results.iter().filter(|(_, r)| r.is_err()).count();
                info!(
                    "Reconciled {} tables, {} failed",
                    results.len(),
                    failed
                );
            }
        })
    }
}
