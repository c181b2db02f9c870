use std::net::SocketAddr;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::GridError;
use crate::scheduler::{CancelOutcome, GridScheduler, Job, JobOutcome, JobSpecification};

#[derive(Clone)]
pub struct StatusState {
    pub scheduler: GridScheduler,
}

impl StatusState {
    pub fn new(scheduler: GridScheduler) -> Self {
        Self { scheduler }
    }
}

#[derive(Serialize)]
struct JobResponse {
    specification: JobSpecification,
    state: String,
    assigned_node: Option<String>,
    items: usize,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    failure: Option<String>,
}

#[derive(Serialize)]
struct SubmitJobResponse {
    success: bool,
    job: Option<JobSpecification>,
    error: Option<String>,
}

#[derive(Serialize)]
struct CancelJobResponse {
    cancelled: bool,
    outcome: String,
}

#[derive(Serialize)]
struct RepositoryChangedResponse {
    function_repository_version: i64,
}

pub fn router(state: StatusState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/nodes", get(list_nodes_handler))
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/api/jobs/cancel", post(cancel_job_handler))
        .route("/api/repository/changed", post(repository_changed_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_status_api(addr: SocketAddr, state: StatusState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting status API");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind status API");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Status API failed");
    }
}

async fn list_nodes_handler(State(state): State<StatusState>) -> impl IntoResponse {
    Json(state.scheduler.tracker().snapshot())
}

async fn list_jobs_handler(State(state): State<StatusState>) -> impl IntoResponse {
    let jobs: Vec<JobResponse> = state
        .scheduler
        .registry()
        .all_records()
        .into_iter()
        .map(|record| JobResponse {
            specification: record.specification,
            state: record.state.to_string(),
            assigned_node: record.assigned_node,
            items: record.job.items.len(),
            created_at: record.created_at,
            completed_at: record.completed_at,
            failure: match record.outcome {
                Some(JobOutcome::Failed { reason }) => Some(reason),
                _ => None,
            },
        })
        .collect();

    Json(jobs)
}

async fn submit_job_handler(
    State(state): State<StatusState>,
    Json(job): Json<Job>,
) -> impl IntoResponse {
    match state.scheduler.submit(job) {
        Ok(spec) => (
            StatusCode::OK,
            Json(SubmitJobResponse {
                success: true,
                job: Some(spec),
                error: None,
            }),
        ),
        Err(e) => {
            let status = match &e {
                GridError::RegistryFull(_) => StatusCode::SERVICE_UNAVAILABLE,
                GridError::DuplicateJob(_) => StatusCode::CONFLICT,
                _ => StatusCode::BAD_REQUEST,
            };
            (
                status,
                Json(SubmitJobResponse {
                    success: false,
                    job: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

async fn cancel_job_handler(
    State(state): State<StatusState>,
    Json(spec): Json<JobSpecification>,
) -> impl IntoResponse {
    let result = state.scheduler.cancel(&spec);
    let (status, outcome) = match &result {
        CancelOutcome::Cancelled { .. } => (StatusCode::OK, "cancelled".to_string()),
        CancelOutcome::AlreadyTerminal(job_state) => (StatusCode::OK, job_state.to_string()),
        CancelOutcome::Unknown => (StatusCode::NOT_FOUND, "unknown".to_string()),
    };
    (
        status,
        Json(CancelJobResponse {
            cancelled: result.is_cancelled(),
            outcome,
        }),
    )
}

async fn repository_changed_handler(State(state): State<StatusState>) -> impl IntoResponse {
    Json(RepositoryChangedResponse {
        function_repository_version: state.scheduler.on_repository_changed(),
    })
}
