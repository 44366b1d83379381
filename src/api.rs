//! Job control HTTP API.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{JobError, WorkerError};
use crate::jobs::{EventKind, JobManager, JobState};
use crate::worker::WorkerRuntime;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_PAGE: usize = 1000;

#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<JobManager>,
    pub runtime: Arc<WorkerRuntime>,
}

pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/jobs", post(create_job).get(list_jobs))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/jobs/{id}/checkpoint", post(checkpoint_job))
        .route("/api/jobs/{id}/resume", post(resume_job))
        .route("/api/jobs/{id}/transition", post(transition_job))
        .route("/api/jobs/{id}/complete", post(complete_job))
        .route("/api/jobs/{id}/fail", post(fail_job))
        .route("/api/jobs/{id}/events", post(append_event).get(list_events))
        .route("/api/jobs/{id}/transitions", get(list_transitions))
        .with_state(state)
}

// ── Error mapping ───────────────────────────────────────────────────

fn status_for(err: &JobError) -> StatusCode {
    match err {
        JobError::NotFound { .. } => StatusCode::NOT_FOUND,
        JobError::InvalidTransition { .. }
        | JobError::NotAccepting { .. }
        | JobError::JobTerminal { .. }
        | JobError::StaleAttempt { .. }
        | JobError::NoCheckpointAvailable { .. } => StatusCode::CONFLICT,
        JobError::InvalidEvent { .. } | JobError::InvalidOwner { .. } => StatusCode::BAD_REQUEST,
        JobError::CheckpointTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        JobError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn job_error(err: JobError) -> Response {
    let status = status_for(&err);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %err, "Job API storage failure");
    } else {
        debug!(error = %err, "Job API request rejected");
    }
    (
        status,
        Json(json!({"error": err.code(), "message": err.to_string()})),
    )
        .into_response()
}

fn worker_error(err: WorkerError) -> Response {
    match err {
        WorkerError::Job(e) => job_error(e),
        e @ WorkerError::NoHandler { .. } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": e.code(), "message": e.to_string()})),
        )
            .into_response(),
        e @ WorkerError::Closed => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": e.code(), "message": e.to_string()})),
        )
            .into_response(),
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "bad_request", "message": message.into()})),
    )
        .into_response()
}

fn parse_id(id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id).map_err(|_| bad_request(format!("Invalid job ID: {id}")))
}

fn ok<T: serde::Serialize>(result: Result<T, JobError>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(e) => job_error(e),
    }
}

// ── REST Endpoints ──────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok", "service": "job-relay"}))
}

#[derive(Deserialize)]
struct CreateJobRequest {
    owner_id: String,
    #[serde(rename = "type")]
    job_type: String,
    #[serde(default)]
    params: serde_json::Value,
    /// Queue the job on the in-process runtime right away.
    #[serde(default)]
    dispatch: bool,
}

async fn create_job(State(state): State<ApiState>, Json(req): Json<CreateJobRequest>) -> Response {
    if req.owner_id.trim().is_empty() || req.job_type.trim().is_empty() {
        return bad_request("owner_id and type are required");
    }

    let job = match state
        .manager
        .create_job(&req.owner_id, &req.job_type, req.params)
        .await
    {
        Ok(job) => job,
        Err(e) => return job_error(e),
    };

    let job = if req.dispatch {
        if let Err(e) = state.runtime.dispatch(job.id).await {
            return worker_error(e);
        }
        match state.manager.status(job.id).await {
            Ok(job) => job,
            Err(e) => return job_error(e),
        }
    } else {
        job
    };

    (
        StatusCode::CREATED,
        Json(json!({"job_id": job.id, "job": job})),
    )
        .into_response()
}

#[derive(Deserialize)]
struct ListJobsQuery {
    owner_id: String,
    limit: Option<usize>,
}

async fn list_jobs(State(state): State<ApiState>, Query(query): Query<ListJobsQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_PAGE);
    ok(state.manager.list_jobs(&query.owner_id, limit).await)
}

async fn get_job(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let job_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    ok(state.manager.status(job_id).await)
}

#[derive(Deserialize, Default)]
struct CancelRequest {
    reason: Option<String>,
}

async fn cancel_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Option<Json<CancelRequest>>,
) -> Response {
    let job_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let req = body.map(|Json(req)| req).unwrap_or_default();
    ok(state.manager.cancel(job_id, req.reason).await)
}

#[derive(Deserialize)]
struct CheckpointRequest {
    progress: u8,
    step: String,
    #[serde(default)]
    payload: serde_json::Value,
    attempt: Option<u32>,
}

async fn checkpoint_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<CheckpointRequest>,
) -> Response {
    let job_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let result = match req.attempt {
        Some(attempt) => {
            state
                .manager
                .checkpoint_for_attempt(job_id, attempt, req.progress, &req.step, req.payload)
                .await
        }
        None => {
            state
                .manager
                .checkpoint(job_id, req.progress, &req.step, req.payload)
                .await
        }
    };
    match result {
        Ok(checkpoint) => (StatusCode::CREATED, Json(checkpoint)).into_response(),
        Err(e) => job_error(e),
    }
}

async fn resume_job(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let job_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.runtime.resume(job_id).await {
        Ok((resumed, handle)) => Json(json!({
            "job": resumed.job,
            "checkpoint": resumed.checkpoint,
            "event": resumed.event,
            "local_attempt": handle.is_some(),
        }))
        .into_response(),
        Err(e) => worker_error(e),
    }
}

#[derive(Deserialize)]
struct TransitionRequest {
    state: JobState,
    reason: Option<String>,
}

async fn transition_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<TransitionRequest>,
) -> Response {
    let job_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    ok(state.manager.transition(job_id, req.state, req.reason).await)
}

#[derive(Deserialize)]
struct CompleteRequest {
    #[serde(default)]
    result: serde_json::Value,
    attempt: Option<u32>,
}

async fn complete_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<CompleteRequest>,
) -> Response {
    let job_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let result = match req.attempt {
        Some(attempt) => {
            state
                .manager
                .complete_attempt(job_id, attempt, req.result)
                .await
        }
        None => state.manager.complete(job_id, req.result).await,
    };
    ok(result)
}

#[derive(Deserialize)]
struct FailRequest {
    error: String,
    attempt: Option<u32>,
}

async fn fail_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<FailRequest>,
) -> Response {
    let job_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let result = match req.attempt {
        Some(attempt) => state.manager.fail_attempt(job_id, attempt, &req.error).await,
        None => state.manager.fail(job_id, &req.error).await,
    };
    ok(result)
}

#[derive(Deserialize)]
struct AppendEventRequest {
    #[serde(rename = "type")]
    kind: EventKind,
    #[serde(default)]
    payload: serde_json::Value,
    attempt: Option<u32>,
}

async fn append_event(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<AppendEventRequest>,
) -> Response {
    let job_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let result = match req.attempt {
        Some(attempt) => {
            state
                .manager
                .append_for_attempt(job_id, attempt, req.kind, req.payload)
                .await
        }
        None => {
            state
                .manager
                .append_event(job_id, req.kind, req.payload)
                .await
        }
    };
    match result {
        Ok(event) => (StatusCode::CREATED, Json(event)).into_response(),
        Err(e) => job_error(e),
    }
}

#[derive(Deserialize)]
struct ListEventsQuery {
    #[serde(default)]
    after: u64,
    limit: Option<usize>,
}

async fn list_events(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<ListEventsQuery>,
) -> Response {
    let job_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let limit = query.limit.unwrap_or(MAX_PAGE).min(MAX_PAGE);
    ok(state.manager.events(job_id, query.after, limit).await)
}

async fn list_transitions(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let job_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    ok(state.manager.transitions(job_id).await)
}
