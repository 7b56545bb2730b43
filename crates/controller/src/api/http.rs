//! HTTP admin API
//!
//! RESTful API over the controller operations and the local instance roster

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::coordinator::{LocalCoordinator, RegisterResult};
use crate::error::AssignmentError;
use crate::metadata::{
    Assignment, InstanceId, Segment, SegmentId, SegmentState, ServerInstance, TableConfig,
    TableName, Version, ViewStats,
};
use crate::planner::RebalancePlan;
use crate::strategy::RebalanceConfig;
use crate::{Controller, RebalanceReport, SegmentAssignment};

/// Shared handler state
#[derive(Clone)]
struct AppState {
    controller: Arc<Controller>,
    roster: Arc<LocalCoordinator>,
}

/// HTTP API service
pub struct HttpApi {
    state: AppState,
}

impl HttpApi {
    /// Create HTTP API
    pub fn new(controller: Arc<Controller>, roster: Arc<LocalCoordinator>) -> Self {
        Self {
            state: AppState { controller, roster },
        }
    }

    /// Create router
    pub fn router(self) -> Router {
        Router::new()
            // Cluster
            .route("/api/v1/cluster", get(get_cluster))
            // Instances
            .route("/api/v1/instances", get(list_instances))
            .route("/api/v1/instances", post(register_instance))
            .route("/api/v1/instances/:instance_id", get(get_instance))
            .route("/api/v1/instances/:instance_id", delete(remove_instance))
            .route("/api/v1/instances/:instance_id/live", post(set_instance_live))
            // Tables
            .route("/api/v1/tables", get(list_tables))
            .route("/api/v1/tables/:table", get(get_table))
            .route("/api/v1/tables/:table/segments", post(assign_segment))
            .route("/api/v1/tables/:table/segments/:segment", delete(drop_segment))
            .route(
                "/api/v1/tables/:table/segments/:segment/state",
                post(transition_segment),
            )
            // Rebalance
            .route("/api/v1/tables/:table/plan", get(get_plan))
            .route("/api/v1/tables/:table/rebalance", post(rebalance_table))
            .with_state(self.state)
    }
}

// ==================== Response types ====================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    fn err(msg: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        })
    }
}

type ApiResult<T> = (StatusCode, Json<ApiResponse<T>>);

fn respond<T: Serialize>(result: crate::Result<T>, success: StatusCode) -> ApiResult<T> {
    match result {
        Ok(data) => (success, ApiResponse::ok(data)),
        Err(e) => (status_of(&e), ApiResponse::err(e.to_string())),
    }
}

/// Persist the coordinator snapshot after a successful change
async fn persist<T: Serialize>(state: &AppState, reply: ApiResult<T>) -> ApiResult<T> {
    let (status, Json(body)) = reply;
    if body.success {
        if let Err(e) = state.roster.save().await {
            return (StatusCode::INTERNAL_SERVER_ERROR, ApiResponse::err(e.to_string()));
        }
    }
    (status, Json(body))
}

fn status_of(error: &AssignmentError) -> StatusCode {
    match error {
        AssignmentError::TableNotFound(_)
        | AssignmentError::SegmentNotFound { .. }
        | AssignmentError::ReplicaNotFound { .. } => StatusCode::NOT_FOUND,
        AssignmentError::IllegalTransition { .. } | AssignmentError::InvalidConfig(_) => {
            StatusCode::BAD_REQUEST
        }
        AssignmentError::Conflict { .. } | AssignmentError::SupersededSegment { .. } => {
            StatusCode::CONFLICT
        }
        AssignmentError::InsufficientCapacity { .. } | AssignmentError::InstanceUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        AssignmentError::StalledMigration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ==================== Request types ====================

#[derive(Debug, Deserialize)]
struct SetLiveRequest {
    live: bool,
}

#[derive(Debug, Deserialize)]
struct AssignSegmentRequest {
    segment: SegmentId,
    #[serde(default)]
    generation: u64,
    #[serde(default)]
    partition: Option<u32>,
    /// Realtime segments start CONSUMING
    #[serde(default)]
    realtime: bool,
}

#[derive(Debug, Deserialize)]
struct TransitionRequest {
    instance: InstanceId,
    state: SegmentState,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    is_new: bool,
}

#[derive(Debug, Serialize)]
struct ClusterOverview {
    name: String,
    instance_count: usize,
    live_instance_count: usize,
    tables: Vec<TableName>,
}

#[derive(Debug, Serialize)]
struct TableOverview {
    config: TableConfig,
    version: Version,
    stats: ViewStats,
    assignment: Assignment,
}

#[derive(Debug, Serialize)]
struct TransitionResult {
    changed: bool,
}

#[derive(Debug, Serialize)]
struct DropResult {
    dropped: usize,
}

// ==================== Handlers ====================

// Cluster
async fn get_cluster(State(state): State<AppState>) -> ApiResult<ClusterOverview> {
    let instances = state.roster.list_instances();
    (
        StatusCode::OK,
        ApiResponse::ok(ClusterOverview {
            name: state.controller.config().controller.cluster_name.clone(),
            instance_count: instances.len(),
            live_instance_count: instances.iter().filter(|i| i.live).count(),
            tables: state.controller.tables().table_names().await,
        }),
    )
}

// Instances
async fn list_instances(State(state): State<AppState>) -> ApiResult<Vec<ServerInstance>> {
    (StatusCode::OK, ApiResponse::ok(state.roster.list_instances()))
}

async fn get_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> ApiResult<ServerInstance> {
    match state.roster.instance(&instance_id) {
        Some(instance) => (StatusCode::OK, ApiResponse::ok(instance)),
        None => (
            StatusCode::NOT_FOUND,
            ApiResponse::err(format!("Instance {} not found", instance_id)),
        ),
    }
}

async fn register_instance(
    State(state): State<AppState>,
    Json(instance): Json<ServerInstance>,
) -> ApiResult<RegisterResponse> {
    let id = instance.id.clone();
    let result = state.roster.register_instance(instance);
    if let Err(e) = state.roster.save().await {
        return (StatusCode::INTERNAL_SERVER_ERROR, ApiResponse::err(e.to_string()));
    }

    info!("Instance {} registered via HTTP API", id);
    let is_new = result == RegisterResult::NewInstance;
    (StatusCode::CREATED, ApiResponse::ok(RegisterResponse { is_new }))
}

async fn set_instance_live(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(req): Json<SetLiveRequest>,
) -> ApiResult<()> {
    if !state.roster.set_live(&instance_id, req.live) {
        return (
            StatusCode::NOT_FOUND,
            ApiResponse::err(format!("Instance {} not found", instance_id)),
        );
    }
    if let Err(e) = state.roster.save().await {
        return (StatusCode::INTERNAL_SERVER_ERROR, ApiResponse::err(e.to_string()));
    }
    (StatusCode::OK, ApiResponse::ok(()))
}

async fn remove_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> ApiResult<ServerInstance> {
    match state.roster.remove_instance(&instance_id) {
        Some(instance) => {
            if let Err(e) = state.roster.save().await {
                return (StatusCode::INTERNAL_SERVER_ERROR, ApiResponse::err(e.to_string()));
            }
            (StatusCode::OK, ApiResponse::ok(instance))
        }
        None => (
            StatusCode::NOT_FOUND,
            ApiResponse::err(format!("Instance {} not found", instance_id)),
        ),
    }
}

// Tables
async fn list_tables(State(state): State<AppState>) -> ApiResult<Vec<TableConfig>> {
    let provider = state.controller.tables();
    let mut configs = Vec::new();
    for name in provider.table_names().await {
        if let Some(config) = provider.table_config(&name).await {
            configs.push(config);
        }
    }
    (StatusCode::OK, ApiResponse::ok(configs))
}

async fn get_table(
    State(state): State<AppState>,
    Path(table): Path<String>,
) -> ApiResult<TableOverview> {
    let controller = &state.controller;
    let result = async {
        let config = controller.table_config(&table).await?;
        let view = controller.view(&table).await?;
        Ok::<_, AssignmentError>(TableOverview {
            stats: view.stats(config.replication.replicas),
            version: view.version,
            assignment: view.record.assignment,
            config,
        })
    }
    .await;
    respond(result, StatusCode::OK)
}

async fn assign_segment(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Json(req): Json<AssignSegmentRequest>,
) -> ApiResult<SegmentAssignment> {
    let mut segment = Segment::new(table, req.segment).with_generation(req.generation);
    segment.partition = req.partition;

    let result = state.controller.assign_segment(segment, req.realtime).await;
    persist(&state, respond(result, StatusCode::CREATED)).await
}

async fn transition_segment(
    State(state): State<AppState>,
    Path((table, segment)): Path<(String, String)>,
    Json(req): Json<TransitionRequest>,
) -> ApiResult<TransitionResult> {
    let result = state
        .controller
        .transition(&table, &segment, &req.instance, req.state)
        .await
        .map(|changed| TransitionResult { changed });
    persist(&state, respond(result, StatusCode::OK)).await
}

async fn drop_segment(
    State(state): State<AppState>,
    Path((table, segment)): Path<(String, String)>,
) -> ApiResult<DropResult> {
    let result = state
        .controller
        .drop_segment(&table, &segment)
        .await
        .map(|dropped| DropResult { dropped });
    persist(&state, respond(result, StatusCode::OK)).await
}

// Rebalance
async fn get_plan(
    State(state): State<AppState>,
    Path(table): Path<String>,
) -> ApiResult<RebalancePlan> {
    let options = state.controller.config().rebalance.clone();
    let result = state.controller.plan_rebalance(&table, &options).await;
    respond(result, StatusCode::OK)
}

async fn rebalance_table(
    State(state): State<AppState>,
    Path(table): Path<String>,
    options: Option<Json<RebalanceConfig>>,
) -> ApiResult<RebalanceReport> {
    let options = options
        .map(|Json(options)| options)
        .unwrap_or_else(|| state.controller.config().rebalance.clone());
    info!("Rebalance of table {} requested via HTTP API", table);

    let result = state.controller.rebalance(&table, options).await;
    persist(&state, respond(result, StatusCode::OK)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::coordinator::StaticTableConfigs;

    async fn app_state(data_dir: &std::path::Path) -> AppState {
        let roster = Arc::new(LocalCoordinator::open(data_dir).await.unwrap());
        roster.register_instance(ServerInstance::new("server_a"));
        roster.register_instance(ServerInstance::new("server_b"));
        let controller = Arc::new(Controller::new(
            Config::default(),
            roster.clone(),
            Arc::new(StaticTableConfigs::new(Vec::new())),
        ));
        AppState { controller, roster }
    }

    #[tokio::test]
    async fn test_roster_changes_are_saved() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path()).await;

        let (status, Json(body)) = set_instance_live(
            State(state.clone()),
            Path("server_a".to_string()),
            Json(SetLiveRequest { live: false }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.success);

        let reopened = LocalCoordinator::open(dir.path()).await.unwrap();
        assert!(!reopened.instance("server_a").unwrap().live);
    }

    #[tokio::test]
    async fn test_failed_save_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let state = app_state(&data_dir).await;
        std::fs::remove_dir_all(&data_dir).unwrap();

        let (status, Json(body)) = set_instance_live(
            State(state.clone()),
            Path("server_a".to_string()),
            Json(SetLiveRequest { live: false }),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.success);
        assert!(body.error.is_some());

        let (status, Json(body)) =
            remove_instance(State(state.clone()), Path("server_b".to_string())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.data.is_none());

        let (status, _) = remove_instance(State(state), Path("server_z".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
