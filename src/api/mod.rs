use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::dispatcher::{DispatchStats, Dispatcher};
use crate::error::DispatchError;
use crate::scheduler::{AssignmentOutcome, Engine, FailureOutcome, Heartbeat, Job, JobRequest};

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub source_url: String,
    pub target_codec: String,
    pub job_size: f64,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct CompleteJobRequest {
    pub output_url: String,
}

#[derive(Debug, Deserialize)]
pub struct FailJobRequest {
    pub error_message: String,
}

#[derive(Debug, Deserialize)]
pub struct BenchmarkRequest {
    pub engine_id: String,
    pub benchmark_time: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = match &self {
            DispatchError::JobNotFound(_) | DispatchError::EngineNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            DispatchError::InvalidState { .. } => StatusCode::CONFLICT,
            DispatchError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            DispatchError::Persistence(_) | DispatchError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, DispatchError>;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/jobs/{job_id}", get(get_job_handler))
        .route("/jobs/{job_id}/complete", post(complete_job_handler))
        .route("/jobs/{job_id}/fail", post(fail_job_handler))
        .route("/engines", get(list_engines_handler))
        .route("/engines/{engine_id}/jobs", get(engine_jobs_handler))
        .route("/engines/heartbeat", post(heartbeat_handler))
        .route("/engines/benchmark", post(benchmark_handler))
        .route("/assign", post(assign_handler))
        .route("/status", get(status_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn run_api(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting dispatch API");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn submit_job_handler(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitJobRequest>,
) -> ApiResult<(StatusCode, Json<SubmitJobResponse>)> {
    let max_retries = payload
        .max_retries
        .unwrap_or_else(|| state.dispatcher.default_max_retries());
    let request = JobRequest::new(
        payload.source_url,
        payload.target_codec,
        payload.job_size,
        max_retries,
    );
    let job_id = state.dispatcher.submit_job(request).await?;
    Ok((StatusCode::CREATED, Json(SubmitJobResponse { job_id })))
}

async fn list_jobs_handler(State(state): State<ApiState>) -> Json<Vec<Job>> {
    Json(state.dispatcher.list_jobs().await)
}

async fn get_job_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.dispatcher.get_job(&job_id).await?))
}

async fn complete_job_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<Uuid>,
    Json(payload): Json<CompleteJobRequest>,
) -> ApiResult<Json<MessageResponse>> {
    state
        .dispatcher
        .report_completion(&job_id, &payload.output_url)
        .await?;
    Ok(Json(MessageResponse {
        message: format!("Job {} marked as completed", job_id),
    }))
}

async fn fail_job_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<Uuid>,
    Json(payload): Json<FailJobRequest>,
) -> ApiResult<Json<FailureOutcome>> {
    let outcome = state
        .dispatcher
        .report_failure(&job_id, &payload.error_message)
        .await?;
    Ok(Json(outcome))
}

async fn list_engines_handler(State(state): State<ApiState>) -> Json<Vec<Engine>> {
    Json(state.dispatcher.list_engines().await)
}

async fn engine_jobs_handler(
    State(state): State<ApiState>,
    Path(engine_id): Path<String>,
) -> ApiResult<Json<Vec<Job>>> {
    Ok(Json(state.dispatcher.jobs_for_engine(&engine_id).await?))
}

async fn heartbeat_handler(
    State(state): State<ApiState>,
    Json(heartbeat): Json<Heartbeat>,
) -> ApiResult<Json<MessageResponse>> {
    let engine_id = heartbeat.engine_id.clone();
    state.dispatcher.heartbeat(heartbeat).await?;
    Ok(Json(MessageResponse {
        message: format!("Heartbeat received from engine {}", engine_id),
    }))
}

async fn benchmark_handler(
    State(state): State<ApiState>,
    Json(payload): Json<BenchmarkRequest>,
) -> ApiResult<Json<MessageResponse>> {
    state
        .dispatcher
        .report_benchmark(&payload.engine_id, payload.benchmark_time)
        .await?;
    Ok(Json(MessageResponse {
        message: format!("Benchmark result received from engine {}", payload.engine_id),
    }))
}

async fn assign_handler(State(state): State<ApiState>) -> ApiResult<Json<AssignmentOutcome>> {
    Ok(Json(state.dispatcher.trigger_assignment().await?))
}

async fn status_handler(State(state): State<ApiState>) -> Json<DispatchStats> {
    Json(state.dispatcher.stats().await)
}
