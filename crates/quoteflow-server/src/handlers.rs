use axum::{
    Json,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use quoteflow_core::JobOutcome;
use serde::Serialize;
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::server::AppState;

#[derive(Serialize)]
pub struct HealthResponse<'a> {
    status: &'a str,
    cache_mode: &'a str,
    remote_available: bool,
    connections: usize,
    jobs: usize,
}

pub async fn root() -> impl IntoResponse {
    let body = json!({
        "service": "quoteflow",
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(body))
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let body = HealthResponse {
        status: "ok",
        cache_mode: state.cache.mode(),
        remote_available: state.cache.is_remote_available().await,
        connections: state.broadcaster.connection_count(),
        jobs: state.scheduler.job_statuses().len(),
    };
    (StatusCode::OK, Json(body)).into_response()
}

pub async fn metrics() -> Response {
    match crate::metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

// ---- Admin ----

pub async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.job_statuses())
}

pub async fn refresh_job(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let body = match state.scheduler.force_refresh(&name).await? {
        JobOutcome::Succeeded { bytes } => json!({
            "job": name,
            "outcome": "succeeded",
            "bytes": bytes,
        }),
        JobOutcome::Failed {
            error,
            retry_scheduled,
        } => json!({
            "job": name,
            "outcome": "failed",
            "error": error,
            "retry_scheduled": retry_scheduled,
        }),
        JobOutcome::AlreadyRunning => json!({
            "job": name,
            "outcome": "already_running",
        }),
    };
    Ok((StatusCode::OK, Json(body)).into_response())
}

/// Latest payload prefetched by a job.
pub async fn job_data(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    state.scheduler.job_status(&name)?;
    let response = match state.scheduler.get_prefetched_json::<Value>(&name).await {
        Some(data) => (StatusCode::OK, Json(data)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no data cached for job {name}") })),
        )
            .into_response(),
    };
    Ok(response)
}

pub async fn cache_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.cache.stats())
}

pub async fn broadcaster_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.broadcaster.metrics())
}
