//! HTTP control plane server for the platform orchestrator (Section 4.9).
//!
//! Event endpoints enqueue an async op and return 202; preview endpoints are
//! synchronous 200s; `/api/ops/{id}/events` is a resumable SSE stream over
//! the Op Event Hub.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use futures_util::{
    stream::{self, Stream},
    StreamExt,
};
use orch_core::{
    Config, Delivery, DeliveryStage, EventKind, Id, OpEvent, OpKind, Project, ProjectSpec,
    ProjectStatus, RollbackScope,
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::artifact_store::{ArtifactError, ArtifactStore};
use crate::delivery_planner::{Blocker, DeliveryPlanner, RollbackPreview, TransitionPreview};
use crate::orchestrator::{ConflictError, EnqueueError, EnqueueOptions, Orchestrator, OrchestratorError};
use crate::storage::{Storage, StorageError};

pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Arc<Storage>,
    pub artifacts: Arc<ArtifactStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub delivery_planner: Arc<DeliveryPlanner>,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/events/registration", post(post_registration))
        .route("/api/events/deployment", post(post_deployment))
        .route("/api/events/promotion", post(post_promotion))
        .route("/api/events/promotion/preview", post(post_promotion_preview))
        .route("/api/events/release", post(post_release))
        .route("/api/events/rollback", post(post_rollback))
        .route("/api/events/rollback/preview", post(post_rollback_preview))
        .route("/api/webhooks/source", post(post_source_webhook))
        .route("/api/projects", get(list_projects))
        .route("/api/projects/{id}", get(get_project).put(put_project).delete(delete_project))
        .route("/api/projects/{id}/artifacts", get(list_artifacts))
        .route("/api/projects/{id}/artifacts/{*path}", get(get_artifact))
        .route("/api/projects/{id}/ops", get(list_project_ops))
        .route("/api/ops/{id}", get(get_op))
        .route("/api/ops/{id}/events", get(stream_op_events))
        .route("/api/system", get(system_info))
        .route("/api/healthz", get(healthz))
        .with_state(state)
}

// --- Error taxonomy (Section 7) ---

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    requested_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    active_op: Option<orch_core::Operation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_rolled_back: Option<bool>,
}

enum ApiError {
    Validation(String),
    NotFound(String),
    Conflict(Box<ConflictError>),
    Enqueue(Box<EnqueueError>),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorBody { error: msg, reason: None, next_step: None, requested_kind: None, active_op: None, project_rolled_back: None },
            ),
            ApiError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                ErrorBody { error: msg, reason: None, next_step: None, requested_kind: None, active_op: None, project_rolled_back: None },
            ),
            ApiError::Conflict(c) => (
                StatusCode::CONFLICT,
                ErrorBody {
                    error: "project operation conflict".to_string(),
                    reason: Some(c.reason),
                    next_step: None,
                    requested_kind: Some(c.requested_kind.as_str()),
                    active_op: Some(c.active_op),
                    project_rolled_back: None,
                },
            ),
            ApiError::Enqueue(e) => {
                error!(op_id = %e.op_id, project_id = %e.project_id, reason = %e.reason, "enqueue failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        error: "failed to enqueue operation".to_string(),
                        reason: Some(e.reason),
                        next_step: Some(e.next_step),
                        requested_kind: None,
                        active_op: None,
                        project_rolled_back: e.project_rolled_back,
                    },
                )
            }
            ApiError::Internal(msg) => {
                error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody { error: msg, reason: None, next_step: None, requested_kind: None, active_op: None, project_rolled_back: None },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::Conflict(c) => ApiError::Conflict(c),
            OrchestratorError::Enqueue(e) => ApiError::Enqueue(e),
            OrchestratorError::Storage(s) => s.into(),
            OrchestratorError::Bus(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::ProjectNotFound(id) => ApiError::NotFound(format!("project {id} not found")),
            StorageError::OperationNotFound(id) => ApiError::NotFound(format!("operation {id} not found")),
            StorageError::ReleaseNotFound(id) => ApiError::NotFound(format!("release {id} not found")),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ArtifactError> for ApiError {
    fn from(e: ArtifactError) -> Self {
        match e {
            ArtifactError::PathEscape(path) => ApiError::Validation(format!("invalid artifact path: {path}")),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

fn blockers_summary(blockers: &[Blocker]) -> String {
    blockers
        .iter()
        .map(|b| format!("{} ({})", b.code, b.why))
        .collect::<Vec<_>>()
        .join("; ")
}

// --- Registration (Section 3, Section 4.9 scenario 1) ---

#[derive(Debug, Deserialize)]
struct RegistrationRequest {
    action: String,
    #[serde(default)]
    spec: Option<serde_json::Value>,
    #[serde(default)]
    project_id: Option<String>,
}

fn parse_spec_shape(value: serde_json::Value) -> Result<ProjectSpec, ApiError> {
    let mut spec: ProjectSpec =
        serde_json::from_value(value).map_err(|e| ApiError::Validation(format!("invalid spec: {e}")))?;
    spec.normalize();
    Ok(spec)
}

async fn post_registration(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegistrationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = match req.action.as_str() {
        "create" => OpKind::Create,
        "update" => OpKind::Update,
        "delete" => OpKind::Delete,
        other => return Err(ApiError::Validation(format!("unknown action {other}"))),
    };

    let project_id = match kind {
        OpKind::Create => {
            let spec_value = req
                .spec
                .clone()
                .ok_or_else(|| ApiError::Validation("create requires spec".to_string()))?;
            let spec = parse_spec_shape(spec_value)?;
            let id = Id::new();
            let placeholder = Project {
                id: id.clone(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
                spec,
                status: ProjectStatus::new("registering"),
            };
            state.storage.put_project(&placeholder).await?;
            id
        }
        OpKind::Update => {
            if req.spec.is_none() {
                return Err(ApiError::Validation("update requires spec".to_string()));
            }
            let raw = req
                .project_id
                .clone()
                .ok_or_else(|| ApiError::Validation("update requires project_id".to_string()))?;
            Id::from_string(raw)
        }
        _ => {
            let raw = req
                .project_id
                .clone()
                .ok_or_else(|| ApiError::Validation("delete requires project_id".to_string()))?;
            Id::from_string(raw)
        }
    };

    let payload = serde_json::json!({ "spec": req.spec });
    let op = state
        .orchestrator
        .enqueue_op(kind, &project_id, EnqueueOptions { delivery: None, payload })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "op": op }))))
}

// --- Deployment / promotion / release / rollback (Section 4.7, 4.8) ---

#[derive(Debug, Deserialize)]
struct DeploymentRequest {
    project_id: String,
    environment: String,
}

async fn post_deployment(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeploymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project_id = Id::from_string(req.project_id);
    let project = state.storage.get_project(&project_id).await?;
    if !project.spec.environments.contains_key(&req.environment) {
        return Err(ApiError::Validation(format!("unknown environment {}", req.environment)));
    }

    let delivery = Delivery {
        stage: DeliveryStage::Deploy,
        environment: req.environment.clone(),
        from_env: None,
        to_env: None,
    };
    let op = state
        .orchestrator
        .enqueue_op(OpKind::Deploy, &project_id, EnqueueOptions { delivery: Some(delivery), payload: serde_json::json!({}) })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "op": op }))))
}

#[derive(Debug, Deserialize)]
struct TransitionRequest {
    project_id: String,
    from_env: String,
    to_env: String,
}

async fn preview_transition(
    state: &AppState,
    req: &TransitionRequest,
    stage: DeliveryStage,
) -> Result<TransitionPreview, ApiError> {
    let project_id = Id::from_string(req.project_id.clone());
    Ok(state
        .delivery_planner
        .preview_transition(&project_id, &req.from_env, &req.to_env, stage)
        .await?)
}

async fn enqueue_transition(
    state: &AppState,
    req: TransitionRequest,
    stage: DeliveryStage,
) -> Result<impl IntoResponse, ApiError> {
    let preview = preview_transition(state, &req, stage).await?;
    if !preview.ready {
        return Err(ApiError::Validation(format!(
            "{} blocker(s) prevent this transition: {}",
            preview.blockers.len(),
            blockers_summary(&preview.blockers)
        )));
    }

    let project_id = Id::from_string(req.project_id);
    let kind = match stage {
        DeliveryStage::Promote => OpKind::Promote,
        DeliveryStage::Release => OpKind::Release,
        DeliveryStage::Deploy => OpKind::Deploy,
    };
    let delivery = Delivery {
        stage,
        environment: req.to_env.clone(),
        from_env: Some(req.from_env),
        to_env: Some(req.to_env),
    };
    let op = state
        .orchestrator
        .enqueue_op(kind, &project_id, EnqueueOptions { delivery: Some(delivery), payload: serde_json::json!({}) })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "op": op }))))
}

async fn post_promotion(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TransitionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    enqueue_transition(&state, req, DeliveryStage::Promote).await
}

async fn post_promotion_preview(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TransitionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let preview = preview_transition(&state, &req, DeliveryStage::Promote).await?;
    Ok(Json(preview))
}

async fn post_release(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TransitionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    enqueue_transition(&state, req, DeliveryStage::Release).await
}

#[derive(Debug, Deserialize)]
struct RollbackRequest {
    project_id: String,
    target_release_id: String,
    #[serde(default)]
    scope: Option<RollbackScope>,
    #[serde(default)]
    #[serde(rename = "override")]
    force_override: bool,
}

async fn preview_rollback(state: &AppState, req: &RollbackRequest) -> Result<RollbackPreview, ApiError> {
    let project_id = Id::from_string(req.project_id.clone());
    let target_release_id = Id::from_string(req.target_release_id.clone());
    let scope = req.scope.unwrap_or(RollbackScope::CodeOnly);
    Ok(state
        .delivery_planner
        .preview_rollback(&project_id, &target_release_id, scope, req.force_override)
        .await?)
}

async fn post_rollback(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RollbackRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let preview = preview_rollback(&state, &req).await?;
    if !preview.ready {
        return Err(ApiError::Validation(format!(
            "{} blocker(s) prevent this rollback: {}",
            preview.blockers.len(),
            blockers_summary(&preview.blockers)
        )));
    }

    let project_id = Id::from_string(req.project_id);
    let scope = req.scope.unwrap_or(RollbackScope::CodeOnly);
    let payload = serde_json::json!({
        "target_release_id": req.target_release_id,
        "rollback_scope": scope,
    });
    let op = state
        .orchestrator
        .enqueue_op(OpKind::Rollback, &project_id, EnqueueOptions { delivery: None, payload })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "op": op }))))
}

async fn post_rollback_preview(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RollbackRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let preview = preview_rollback(&state, &req).await?;
    Ok(Json(preview))
}

// --- Source webhook (Section 6 "Webhook acceptance") ---

#[derive(Debug, Deserialize)]
struct SourceWebhookRequest {
    project_id: String,
    #[serde(default)]
    repo: Option<String>,
    #[serde(default)]
    branch: Option<String>,
    #[serde(rename = "ref", default)]
    git_ref: Option<String>,
}

#[derive(Debug, Serialize)]
struct WebhookAcceptance {
    accepted: bool,
    reason: Option<String>,
    op: Option<orch_core::Operation>,
}

async fn post_source_webhook(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SourceWebhookRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project_id = Id::from_string(req.project_id);
    state.storage.get_project(&project_id).await?;

    if let Some(repo) = &req.repo {
        if repo != "source" {
            let body = WebhookAcceptance {
                accepted: false,
                reason: Some("ignored: webhook is not for the source repo".to_string()),
                op: None,
            };
            return Ok((StatusCode::ACCEPTED, Json(body)));
        }
    }

    let branch_candidate = req.branch.or(req.git_ref);
    let is_main = branch_candidate.as_deref().is_some_and(crate::git::is_main_branch);
    if !is_main {
        let body = WebhookAcceptance {
            accepted: false,
            reason: Some("ignored: only main branch triggers CI".to_string()),
            op: None,
        };
        return Ok((StatusCode::ACCEPTED, Json(body)));
    }

    let op = state
        .orchestrator
        .enqueue_op(OpKind::Ci, &project_id, EnqueueOptions::default())
        .await?;
    let body = WebhookAcceptance { accepted: true, reason: None, op: Some(op) };
    Ok((StatusCode::ACCEPTED, Json(body)))
}

// --- Project CRUD ---

async fn list_projects(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let projects = state.storage.list_projects().await?;
    Ok(Json(serde_json::json!({ "projects": projects })))
}

async fn get_project(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let project = state.storage.get_project(&Id::from_string(id)).await?;
    Ok(Json(project))
}

async fn put_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(spec_value): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    let project_id = Id::from_string(id);
    state.storage.get_project(&project_id).await?;
    let payload = serde_json::json!({ "spec": spec_value });
    let op = state
        .orchestrator
        .enqueue_op(OpKind::Update, &project_id, EnqueueOptions { delivery: None, payload })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "op": op }))))
}

async fn delete_project(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let project_id = Id::from_string(id);
    state.storage.get_project(&project_id).await?;
    let op = state
        .orchestrator
        .enqueue_op(OpKind::Delete, &project_id, EnqueueOptions::default())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "op": op }))))
}

// --- Artifacts ---

async fn list_artifacts(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let project_id = Id::from_string(id);
    state.storage.get_project(&project_id).await?;
    let files = state.artifacts.list_files(&project_id)?;
    Ok(Json(serde_json::json!({ "files": files })))
}

async fn get_artifact(
    State(state): State<Arc<AppState>>,
    Path((id, path)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let project_id = Id::from_string(id);
    state.storage.get_project(&project_id).await?;
    let bytes = state.artifacts.read_file(&project_id, &path)?;
    Ok(bytes)
}

// --- Operations ---

#[derive(Debug, Deserialize, Default)]
struct ListOpsQuery {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    before: Option<String>,
}

async fn list_project_ops(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ListOpsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let project_id = Id::from_string(id);
    let page = state
        .storage
        .list_project_ops(&project_id, query.limit.unwrap_or(0), query.cursor.as_deref(), query.before.as_deref())
        .await?;
    Ok(Json(serde_json::json!({ "ops": page.ops, "next_cursor": page.next_cursor })))
}

async fn get_op(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let op = state.storage.get_op(&Id::from_string(id)).await?;
    Ok(Json(op))
}

const SSE_HEARTBEAT: Duration = Duration::from_secs(15);

fn to_sse_event(event: &OpEvent) -> Result<SseEvent, Infallible> {
    let json = serde_json::to_string(&event.data).unwrap_or_default();
    Ok(SseEvent::default()
        .id(event.seq.to_string())
        .event(event.kind.as_str())
        .data(json))
}

async fn stream_op_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let op_id = Id::from_string(id);
    state.storage.get_op(&op_id).await?;

    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let event_hub = state.orchestrator.event_hub().clone();
    let subscription = event_hub.subscribe(&op_id, last_event_id).await;

    let mut replay: VecDeque<OpEvent> = subscription.replay.into();
    if subscription.needs_bootstrap {
        if let Ok(op) = state.storage.get_op(&op_id).await {
            replay.push_front(OpEvent {
                op_id: op_id.clone(),
                seq: 0,
                kind: EventKind::OpBootstrap,
                data: serde_json::json!({ "op": op }),
                emitted_at: Utc::now(),
            });
        }
    }

    let stream = stream::unfold(
        (replay, subscription.receiver),
        |(mut replay, mut receiver)| async move {
            if let Some(event) = replay.pop_front() {
                return Some((to_sse_event(&event), (replay, receiver)));
            }
            match tokio::time::timeout(SSE_HEARTBEAT, receiver.recv()).await {
                Ok(Some(event)) => Some((to_sse_event(&event), (replay, receiver))),
                Ok(None) => None,
                Err(_) => {
                    let heartbeat = Ok(SseEvent::default().event("op.heartbeat").data("{}"));
                    Some((heartbeat, (replay, receiver)))
                }
            }
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// --- System / health ---

async fn system_info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "bind_addr": state.config.bind_addr,
        "data_dir": state.config.data_dir,
        "image_builder_mode": state.config.image_builder_mode,
        "history_cap": state.config.history_cap,
        "event_buffer": state.config.event_buffer,
        "max_deliver": state.config.max_deliver,
    }))
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::delivery_planner::DeliveryPlanner;
    use crate::event_hub::OpEventHub;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn create_test_app() -> (Router, Arc<AppState>, TempDir) {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let storage = Arc::new(storage);
        let bus = MessageBus::new(storage.pool().clone());
        let event_hub = OpEventHub::new(256, Duration::from_secs(600));
        let artifacts = Arc::new(ArtifactStore::new(dir.path()));
        let orchestrator = Orchestrator::new(storage.clone(), bus, event_hub, 200);
        let delivery_planner = Arc::new(DeliveryPlanner::new(storage.clone(), artifacts.clone()));
        let state = Arc::new(AppState {
            config: Arc::new(Config::default()),
            storage,
            artifacts,
            orchestrator,
            delivery_planner,
        });
        let app = create_router(state.clone());
        (app, state, dir)
    }

    #[tokio::test]
    async fn registration_create_returns_202_with_queued_op() {
        let (app, _state, _dir) = create_test_app().await;
        let body = serde_json::json!({
            "action": "create",
            "spec": {
                "apiVersion": orch_core::API_VERSION,
                "kind": orch_core::KIND,
                "name": "svc-a",
                "runtime": "go_1.26",
                "capabilities": ["http"],
                "environments": {"dev": {"vars": {"LOG_LEVEL": "info"}}},
                "networkPolicies": {"ingress": "internal", "egress": "internal"},
            }
        });
        let request = axum::http::Request::post("/api/events/registration")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["op"]["status"], "queued");
    }

    #[tokio::test]
    async fn concurrent_update_while_create_running_is_409() {
        let (app, state, _dir) = create_test_app().await;
        let project = Project {
            id: Id::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            spec: ProjectSpec {
                api_version: orch_core::API_VERSION.to_string(),
                kind: orch_core::KIND.to_string(),
                name: "svc-a".to_string(),
                runtime: "go_1.26".to_string(),
                capabilities: vec![],
                environments: Default::default(),
                network_policies: Default::default(),
            },
            status: ProjectStatus::new("created"),
        };
        state.storage.put_project(&project).await.unwrap();
        let op = state
            .orchestrator
            .enqueue_op(OpKind::Create, &project.id, EnqueueOptions::default())
            .await
            .unwrap();
        let mut running = state.storage.get_op(&op.id).await.unwrap();
        running.status = orch_core::OpStatus::Running;
        state.storage.put_op(&running, 200).await.unwrap();

        let body = serde_json::json!({ "action": "update", "project_id": project.id, "spec": {} });
        let request = axum::http::Request::post("/api/events/registration")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value["reason"].as_str().unwrap().contains("active operation"));
    }

    #[tokio::test]
    async fn webhook_ignores_non_main_branch() {
        let (app, state, _dir) = create_test_app().await;
        let project = Project {
            id: Id::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            spec: ProjectSpec {
                api_version: orch_core::API_VERSION.to_string(),
                kind: orch_core::KIND.to_string(),
                name: "svc-a".to_string(),
                runtime: "go_1.26".to_string(),
                capabilities: vec![],
                environments: Default::default(),
                network_policies: Default::default(),
            },
            status: ProjectStatus::new("created"),
        };
        state.storage.put_project(&project).await.unwrap();

        let body = serde_json::json!({ "project_id": project.id, "branch": "refs/heads/dev" });
        let request = axum::http::Request::post("/api/webhooks/source")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["accepted"], false);
    }

    #[tokio::test]
    async fn webhook_accepts_main_branch_and_enqueues_ci() {
        let (app, state, _dir) = create_test_app().await;
        let project = Project {
            id: Id::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            spec: ProjectSpec {
                api_version: orch_core::API_VERSION.to_string(),
                kind: orch_core::KIND.to_string(),
                name: "svc-a".to_string(),
                runtime: "go_1.26".to_string(),
                capabilities: vec![],
                environments: Default::default(),
                network_policies: Default::default(),
            },
            status: ProjectStatus::new("created"),
        };
        state.storage.put_project(&project).await.unwrap();

        let body = serde_json::json!({ "project_id": project.id, "branch": "main" });
        let request = axum::http::Request::post("/api/webhooks/source")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["accepted"], true);
        assert_eq!(value["op"]["kind"], "ci");
    }

    #[tokio::test]
    async fn promote_without_source_release_is_400() {
        let (app, state, _dir) = create_test_app().await;
        let mut environments = std::collections::BTreeMap::new();
        environments.insert("dev".to_string(), orch_core::EnvironmentSpec::default());
        environments.insert("prod".to_string(), orch_core::EnvironmentSpec::default());
        let project = Project {
            id: Id::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            spec: ProjectSpec {
                api_version: orch_core::API_VERSION.to_string(),
                kind: orch_core::KIND.to_string(),
                name: "svc-a".to_string(),
                runtime: "go_1.26".to_string(),
                capabilities: vec![],
                environments,
                network_policies: Default::default(),
            },
            status: ProjectStatus::new("created"),
        };
        state.storage.put_project(&project).await.unwrap();

        let body = serde_json::json!({ "project_id": project.id, "from_env": "dev", "to_env": "prod" });
        let request = axum::http::Request::post("/api/events/promotion/preview")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["ready"], false);
        assert_eq!(value["blockers"][0]["code"], "source_not_delivered");

        let request = axum::http::Request::post("/api/events/promotion")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn artifact_path_escape_is_rejected() {
        let (app, state, _dir) = create_test_app().await;
        let project = Project {
            id: Id::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            spec: ProjectSpec {
                api_version: orch_core::API_VERSION.to_string(),
                kind: orch_core::KIND.to_string(),
                name: "svc-a".to_string(),
                runtime: "go_1.26".to_string(),
                capabilities: vec![],
                environments: Default::default(),
                network_policies: Default::default(),
            },
            status: ProjectStatus::new("created"),
        };
        state.storage.put_project(&project).await.unwrap();

        let request = axum::http::Request::get(format!("/api/projects/{}/artifacts/../../etc/passwd", project.id))
            .body(axum::body::Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let (app, _state, _dir) = create_test_app().await;
        let request = axum::http::Request::get("/api/healthz").body(axum::body::Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
