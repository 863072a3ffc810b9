//! HTTP API surface.
//!
//! Thin translation layer: decode the body or query, call the
//! manager or hypervisor collaborator, map error kinds to status
//! codes, encode JSON. Submit bodies may arrive as YAML per
//! content-type. Every job echoed back carries the redacted
//! definition; credentials never cross this boundary.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use vmexport_protocol::{
    defaults, CancelRequest, CancelResponse, CapabilityTable, ErrorResponse, ExportError,
    HealthResponse, Job, JobProgress, QueryRequest, QueryResponse, SubmitRequest, SubmitResponse,
    VmInfo, VmListResponse, VmOpResponse, VmRequest,
};

use crate::hypervisor::HypervisorClient;
use crate::manager::JobManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<JobManager>,
    pub hypervisor: Arc<dyn HypervisorClient>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(daemon_status))
        .route("/capabilities", get(capabilities))
        .route("/jobs/submit", post(submit_jobs))
        .route("/jobs/query", post(query_jobs).get(query_jobs_get))
        .route("/jobs/cancel", post(cancel_jobs))
        .route("/jobs/progress/:id", get(job_progress))
        .route("/jobs/logs/:id", get(job_logs))
        .route("/jobs/:id", get(get_job))
        .route("/vms/list", get(list_vms))
        .route("/vms/info", post(vm_info))
        .route("/vms/shutdown", post(vm_shutdown))
        .route("/vms/poweroff", post(vm_poweroff))
        .route("/vms/remove-cdrom", post(vm_remove_cdrom))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Error rendering
// ============================================================================

pub struct ApiError(ExportError);

impl From<ExportError> for ApiError {
    fn from(err: ExportError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse {
            error: self.0.kind().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Liveness & status
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::ok(env!("CARGO_PKG_VERSION")))
}

async fn daemon_status(State(state): State<AppState>) -> Json<vmexport_protocol::DaemonStatus> {
    Json(state.manager.status())
}

async fn capabilities(State(state): State<AppState>) -> Json<CapabilityTable> {
    Json(state.manager.capabilities().clone())
}

// ============================================================================
// Jobs
// ============================================================================

async fn submit_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SubmitResponse>, ApiError> {
    let request = parse_submit_body(&headers, &body)?;
    Ok(Json(state.manager.submit_batch(request.into_definitions())))
}

/// Submit bodies are JSON unless the content-type says YAML.
fn parse_submit_body(headers: &HeaderMap, body: &[u8]) -> Result<SubmitRequest, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");
    if content_type.contains("yaml") || content_type.contains("yml") {
        serde_yaml::from_slice(body)
            .map_err(|e| ExportError::InvalidDefinition(format!("invalid YAML body: {}", e)).into())
    } else {
        serde_json::from_slice(body)
            .map_err(|e| ExportError::InvalidDefinition(format!("invalid JSON body: {}", e)).into())
    }
}

async fn query_jobs(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Json<QueryResponse> {
    Json(run_query(&state.manager, request))
}

#[derive(Debug, Default, Deserialize)]
struct QueryParams {
    #[serde(default)]
    all: bool,
}

async fn query_jobs_get(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
) -> Json<QueryResponse> {
    Json(run_query(
        &state.manager,
        QueryRequest {
            all: params.all,
            ..QueryRequest::default()
        },
    ))
}

fn run_query(manager: &JobManager, request: QueryRequest) -> QueryResponse {
    let jobs: Vec<Job> = match request.job_ids.filter(|ids| !ids.is_empty()) {
        Some(ids) => manager.jobs_by_ids(&ids),
        None => {
            let statuses = request.status.unwrap_or_default();
            manager.list_jobs(&statuses, 0)
        }
    };
    let jobs: Vec<Job> = jobs.iter().map(Job::redacted).collect();
    QueryResponse {
        total: jobs.len(),
        jobs,
        timestamp: Utc::now(),
    }
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = state.manager.get_job(&id)?;
    Ok(Json(job.redacted()))
}

async fn cancel_jobs(
    State(state): State<AppState>,
    Json(request): Json<CancelRequest>,
) -> Json<CancelResponse> {
    Json(state.manager.cancel_batch(&request.job_ids))
}

async fn job_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Option<JobProgress>>, ApiError> {
    let job = state.manager.get_job(&id)?;
    Ok(Json(job.progress))
}

async fn job_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    state.manager.get_job(&id)?;
    let path = vmexport_logging::job_log_path(&id);
    let contents = tokio::fs::read_to_string(&path)
        .await
        .map_err(|_| ExportError::NotFound(format!("no logs recorded for job {}", id)))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        contents,
    )
        .into_response())
}

// ============================================================================
// VM operations (dispatched to the hypervisor collaborator)
// ============================================================================

fn op_timeout(request: &VmRequest) -> Duration {
    Duration::from_secs(request.timeout_secs.unwrap_or(defaults::VM_OP_TIMEOUT_SECS))
}

async fn list_vms(State(state): State<AppState>) -> Result<Json<VmListResponse>, ApiError> {
    let vms = state
        .hypervisor
        .list_vms(Duration::from_secs(defaults::VM_LIST_TIMEOUT_SECS))
        .await?;
    Ok(Json(VmListResponse {
        total: vms.len(),
        vms,
        timestamp: Utc::now(),
    }))
}

async fn vm_info(
    State(state): State<AppState>,
    Json(request): Json<VmRequest>,
) -> Result<Json<VmInfo>, ApiError> {
    let timeout = op_timeout(&request);
    Ok(Json(
        state.hypervisor.vm_info(&request.vm_path, timeout).await?,
    ))
}

async fn vm_shutdown(
    State(state): State<AppState>,
    Json(request): Json<VmRequest>,
) -> Result<Json<VmOpResponse>, ApiError> {
    let timeout = op_timeout(&request);
    Ok(Json(
        state
            .hypervisor
            .shutdown_vm(&request.vm_path, timeout)
            .await?,
    ))
}

async fn vm_poweroff(
    State(state): State<AppState>,
    Json(request): Json<VmRequest>,
) -> Result<Json<VmOpResponse>, ApiError> {
    let timeout = op_timeout(&request);
    Ok(Json(
        state
            .hypervisor
            .poweroff_vm(&request.vm_path, timeout)
            .await?,
    ))
}

async fn vm_remove_cdrom(
    State(state): State<AppState>,
    Json(request): Json<VmRequest>,
) -> Result<Json<VmOpResponse>, ApiError> {
    let timeout = op_timeout(&request);
    Ok(Json(
        state
            .hypervisor
            .remove_cdrom(&request.vm_path, timeout)
            .await?,
    ))
}
