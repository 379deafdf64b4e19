use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use chrono::Utc;
use common::{
    CleanupResponse, ErrorResponse, HistoryResponse, JobDetailResponse, JobId, JobStats, JobStatus, JobSummary,
    LogsResponse, StatusResponse,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

use crate::history::HistoryService;
use crate::metrics::MetricsCollector;
use crate::store::{StoreError, StoreResult};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 1000;
const DEFAULT_KEEP_DAYS: u32 = 30;

#[derive(Clone)]
pub struct AppState {
    pub history: HistoryService,
    pub metrics: Arc<MetricsCollector>,
    pub stale_after: Duration,
    /// Reported under `components.dispatcher` in `/status`.
    pub dispatcher: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Job {0} not found")]
    NotFound(JobId),
    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ApiError::NotFound(id),
            StoreError::InvalidId(id) => ApiError::BadRequest(format!("Invalid job id {:?}", id)),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(detail) => {
                log::error!("API request failed: {}", detail);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (code, Json(ErrorResponse { detail: self.to_string() })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/jobs/history", get(history))
        .route("/jobs/stats", get(stats))
        .route("/jobs/history/cleanup", delete(cleanup))
        .route("/jobs/history/{id}", get(job_detail))
        .route("/jobs/history/{id}/logs", get(job_logs))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Store reads touch the filesystem; keep them off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    let joined = tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(joined?)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now(),
    }))
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let now = Utc::now();
    let history = state.history.clone();
    let stale_after = state.stale_after;
    let stale = blocking(move || history.stale_running(stale_after, now)).await;

    let mut components = BTreeMap::new();
    components.insert("api".to_string(), "running".to_string());
    components.insert("dispatcher".to_string(), state.dispatcher.clone());
    let stale_running = match stale {
        Ok(stale) => {
            components.insert("queue_store".to_string(), "available".to_string());
            stale
        }
        Err(e) => {
            log::warn!("Queue store unavailable for status: {}", e);
            components.insert("queue_store".to_string(), format!("error: {}", e));
            Vec::new()
        }
    };

    Json(StatusResponse {
        app: "sandrun".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: now,
        identity: state.history.identity().to_string(),
        components,
        stale_running,
    })
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.export(),
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub status: Option<String>,
    pub status_filter: Option<String>,
}

async fn history(State(state): State<AppState>, Query(query): Query<HistoryQuery>) -> ApiResult<HistoryResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if limit == 0 {
        return Err(ApiError::BadRequest("limit must be at least 1".to_string()));
    }
    let limit = limit.min(MAX_HISTORY_LIMIT);
    let status = match query.status.or(query.status_filter).filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            raw.parse::<JobStatus>()
                .map_err(|e| ApiError::BadRequest(e.to_string()))?,
        ),
        None => None,
    };

    let history = state.history.clone();
    let jobs: Vec<JobSummary> = blocking(move || history.history(limit, status)).await?;
    Ok(Json(HistoryResponse {
        total: jobs.len(),
        jobs,
    }))
}

async fn stats(State(state): State<AppState>) -> ApiResult<JobStats> {
    let history = state.history.clone();
    Ok(Json(blocking(move || history.stats()).await?))
}

async fn job_detail(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<JobDetailResponse> {
    let history = state.history.clone();
    let job = blocking(move || history.job(&JobId(id))).await?;
    Ok(Json(JobDetailResponse {
        job: JobSummary::from(&job),
        logs: job.logs,
    }))
}

async fn job_logs(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<LogsResponse> {
    let history = state.history.clone();
    Ok(Json(blocking(move || history.logs(&JobId(id))).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupQuery {
    pub older_than_days: Option<u32>,
    pub keep_days: Option<u32>,
}

async fn cleanup(State(state): State<AppState>, Query(query): Query<CleanupQuery>) -> ApiResult<CleanupResponse> {
    let days = query.older_than_days.or(query.keep_days).unwrap_or(DEFAULT_KEEP_DAYS);
    let history = state.history.clone();
    let report = blocking(move || history.cleanup(days)).await?;
    log::info!("Cleanup via API removed {} record(s) older than {} days", report.deleted, days);
    Ok(Json(CleanupResponse {
        message: format!("Cleaned up {} old job records", report.deleted),
        deleted: report.deleted,
        failed: report.failed,
    }))
}
