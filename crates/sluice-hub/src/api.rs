//! # API Handlers
//!
//! Axum handlers for health, metrics, and query submission.

use crate::health::{Health, HealthReport};
use crate::metrics::render_prometheus;
use crate::pipeline::Pipeline;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use sluice_core::{FetchRequest, Response};
use std::sync::Arc;
use std::time::Instant;

pub struct AppState {
    pub pipeline: Pipeline,
    pub health: Arc<Health>,
    pub start_time: Instant,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .route("/metrics", get(metrics_prometheus))
        .route("/api/pipeline", get(pipeline_info))
        .route("/api/fetch", post(fetch))
        .with_state(state)
}

pub async fn live() -> &'static str {
    "ok"
}

pub async fn ready(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthReport>) {
    let report = state.health.report();
    let status = if report.ready && !state.pipeline.is_shutting_down() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

pub async fn metrics_prometheus(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = render_prometheus(&state.pipeline.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

#[derive(Debug, Serialize)]
pub struct PipelineInfo {
    pub stages: Vec<String>,
    pub highwatermark: u64,
    pub uptime_secs: u64,
}

pub async fn pipeline_info(State(state): State<Arc<AppState>>) -> Json<PipelineInfo> {
    Json(PipelineInfo {
        stages: state.pipeline.stages(),
        highwatermark: state.pipeline.highwatermark(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// Run a fetch request to completion and return every response, ending
/// with the end marker.
pub async fn fetch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FetchRequest>,
) -> Result<Json<Vec<Response>>, (StatusCode, String)> {
    match state.pipeline.submit(request).await {
        Ok(responses) => Ok(Json(responses.collect().await)),
        Err(e) => Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string())),
    }
}
