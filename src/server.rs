//! The HTTP surface: JSON-in/JSON-out routes over the engine and pipeline.
//!
//! Error bodies are always `{"detail": ...}`: 400 for validation problems,
//! 404 for missing sessions/branches/rounds/refs, 409 for a blocked round,
//! 500 otherwise. Executor failures during a run are not errors here; they
//! come back as 200 with the logs populated.

use crate::engine::{Engine, EngineError};
use crate::executor::ExecutorError;
use crate::ir::{IrDoc, IrError};
use crate::item::Item;
use crate::llm::TrafficEvent;
use crate::node::Metrics;
use crate::pipeline::{ChatPipeline, PipelineError, SendOutcome, SendRequest};
use crate::state::StateMap;
use crate::store::model::RoundStatus;
use crate::store::StoreError;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

/// Builds the full API router.
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/api/flow/run", post(flow_run))
        .route("/api/flow/validate", post(flow_validate))
        .route("/api/flow/reload", post(flow_reload))
        .route("/api/chat/session/start", post(chat_session_start))
        .route("/api/chat/send", post(chat_send))
        .route(
            "/api/chat/round/{session_id}/{branch_id}/{round_no}/status",
            get(chat_round_status),
        )
        .route("/api/chat/round/reroll", post(chat_round_reroll))
        .route("/api/chat/branch", post(chat_branch))
        .route("/api/debug/traffic", get(debug_traffic))
        .route("/api/debug/traffic/clear", post(debug_traffic_clear))
        .with_state(engine)
}

// --------- error mapping ---------

/// JSON API error with its HTTP status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: Value,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<Value>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::NotFound { .. } => Self::new(StatusCode::NOT_FOUND, err.to_string()),
            StoreError::RoundBlocked { round_no, blockers } => Self::new(
                StatusCode::CONFLICT,
                json!({
                    "error": "round_blocked",
                    "round_no": round_no,
                    "blockers": blockers,
                }),
            ),
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        }
    }
}

impl From<ExecutorError> for ApiError {
    fn from(err: ExecutorError) -> Self {
        match &err {
            ExecutorError::Flow(IrError::NotFound { .. }) => {
                Self::new(StatusCode::NOT_FOUND, err.to_string())
            }
            ExecutorError::Flow(IrError::Validation { .. }) => {
                Self::new(StatusCode::BAD_REQUEST, err.to_string())
            }
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Store(inner) => inner.into(),
            PipelineError::Executor(inner) => inner.into(),
            PipelineError::BranchMismatch { .. } => {
                Self::new(StatusCode::NOT_FOUND, err.to_string())
            }
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Store(inner) => inner.into(),
            EngineError::Executor(inner) => inner.into(),
            EngineError::Config(inner) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, inner.to_string())
            }
        }
    }
}

// --------- flow surface ---------

#[derive(Debug, Deserialize)]
struct RunFlowRequest {
    #[serde(rename = "ref")]
    reference: String,
    #[serde(default)]
    items: Vec<Item>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default = "default_true")]
    use_world_state: bool,
    #[serde(default)]
    initial_state: Option<StateMap>,
    /// Resource overrides need in-process wiring; a value here is logged
    /// and ignored.
    #[serde(default)]
    resources: Option<Value>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct RunFlowResponse {
    items: Vec<Item>,
    logs: Vec<String>,
    metrics: Metrics,
    state_snapshot: StateMap,
}

async fn flow_run(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<RunFlowRequest>,
) -> Result<Json<RunFlowResponse>, ApiError> {
    if request.resources.is_some() {
        tracing::warn!("ignoring 'resources' overrides on /api/flow/run");
    }
    let (result, state_snapshot) = engine
        .run_flow(
            &request.reference,
            request.items,
            request.session_id.as_deref(),
            request.use_world_state,
            request.initial_state,
        )
        .await?;
    Ok(Json(RunFlowResponse {
        items: result.items,
        logs: result.logs,
        metrics: result.metrics,
        state_snapshot,
    }))
}

#[derive(Debug, Deserialize)]
struct ValidateRequest {
    doc: Value,
}

#[derive(Debug, Serialize)]
struct ValidateResponse {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn flow_validate(Json(request): Json<ValidateRequest>) -> Json<ValidateResponse> {
    let outcome = match serde_json::from_value::<IrDoc>(request.doc) {
        Ok(doc) => doc.validate().err().map(|e| match e {
            IrError::Validation { message } => message,
            other => other.to_string(),
        }),
        Err(parse) => Some(parse.to_string()),
    };
    Json(ValidateResponse {
        valid: outcome.is_none(),
        error: outcome,
    })
}

#[derive(Debug, Deserialize)]
struct ReloadRequest {
    #[serde(default)]
    dirs: Option<Vec<PathBuf>>,
}

#[derive(Debug, Serialize)]
struct ReloadResponse {
    flows: Vec<String>,
    node_types: Vec<String>,
}

async fn flow_reload(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<ReloadRequest>,
) -> Json<ReloadResponse> {
    let (flows, node_types) = engine.reload(request.dirs);
    Json(ReloadResponse { flows, node_types })
}

// --------- chat surface ---------

#[derive(Debug, Deserialize)]
struct ChatStartRequest {
    #[serde(default)]
    initial_state: Option<StateMap>,
    #[serde(default = "default_true")]
    use_world_state: bool,
}

#[derive(Debug, Serialize)]
struct ChatStartResponse {
    session_id: String,
    branch_id: String,
    state_snapshot: StateMap,
}

async fn chat_session_start(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<ChatStartRequest>,
) -> Result<Json<ChatStartResponse>, ApiError> {
    let pipeline = ChatPipeline::new(engine);
    let (session_id, branch_id, state_snapshot) =
        pipeline.start_session(request.initial_state, request.use_world_state)?;
    Ok(Json(ChatStartResponse {
        session_id,
        branch_id,
        state_snapshot,
    }))
}

#[derive(Debug, Deserialize)]
struct ChatSendRequest {
    session_id: String,
    #[serde(default)]
    branch_id: Option<String>,
    user_input: String,
    #[serde(default = "default_main_ref", rename = "ref")]
    reference: String,
    #[serde(default)]
    extras: Option<Value>,
}

fn default_main_ref() -> String {
    "main@1".to_string()
}

async fn chat_send(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<ChatSendRequest>,
) -> Result<Json<SendOutcome>, ApiError> {
    let pipeline = ChatPipeline::new(engine);
    let outcome = pipeline
        .send(SendRequest {
            session_id: request.session_id,
            branch_id: request.branch_id,
            user_input: request.user_input,
            reference: request.reference,
            extras: request.extras,
        })
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Serialize)]
struct RoundStatusResponse {
    round_no: u64,
    status: RoundStatus,
    blockers: Vec<String>,
}

async fn chat_round_status(
    State(engine): State<Arc<Engine>>,
    Path((session_id, branch_id, round_no)): Path<(String, String, u64)>,
) -> Result<Json<RoundStatusResponse>, ApiError> {
    let pipeline = ChatPipeline::new(engine);
    let report = pipeline.round_status(&session_id, &branch_id, round_no)?;
    Ok(Json(RoundStatusResponse {
        round_no: report.round_no,
        status: report.status,
        blockers: report.blockers,
    }))
}

#[derive(Debug, Deserialize)]
struct RerollRequest {
    session_id: String,
    branch_id: String,
    round_no: u64,
    #[serde(default = "default_main_ref", rename = "ref")]
    reference: String,
    #[serde(default)]
    extras: Option<Value>,
}

async fn chat_round_reroll(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<RerollRequest>,
) -> Result<Json<SendOutcome>, ApiError> {
    let pipeline = ChatPipeline::new(engine);
    let outcome = pipeline
        .reroll(
            &request.session_id,
            &request.branch_id,
            request.round_no,
            &request.reference,
            request.extras.as_ref(),
        )
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct BranchRequest {
    session_id: String,
    #[serde(default)]
    from_round: Option<u64>,
    #[serde(default)]
    parent_branch_id: Option<String>,
    #[serde(default = "default_true")]
    set_active: bool,
}

#[derive(Debug, Serialize)]
struct BranchResponse {
    branch_id: String,
}

async fn chat_branch(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<BranchRequest>,
) -> Result<Json<BranchResponse>, ApiError> {
    let pipeline = ChatPipeline::new(engine);
    let branch_id = pipeline.branch(
        &request.session_id,
        request.from_round,
        request.parent_branch_id.as_deref(),
        request.set_active,
    )?;
    Ok(Json(BranchResponse { branch_id }))
}

// --------- debug surface ---------

#[derive(Debug, Deserialize)]
struct TrafficQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn debug_traffic(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<TrafficQuery>,
) -> Json<Vec<TrafficEvent>> {
    Json(engine.traffic().events(query.limit.unwrap_or(200)))
}

async fn debug_traffic_clear(State(engine): State<Arc<Engine>>) -> Json<Value> {
    engine.traffic().clear();
    Json(json!({ "cleared": true }))
}
