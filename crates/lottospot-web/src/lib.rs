//! Axum trigger endpoint for the ingestion pipeline.
//!
//! One route, two invocation shapes: `GET /api/ingest` runs the incremental
//! mode, `GET /api/ingest?start=..&end=..` runs a backfill. Callers must
//! present the admin bearer token, except the trusted scheduler which is
//! recognized by its own header. The whole invocation runs under a
//! wall-clock budget; backfill ranges that would exceed it must be chunked
//! by the caller into multiple invocations.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use lottospot_sync::{IngestPipeline, RunOutcome};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "lottospot-web";

/// Header the trusted scheduler sets on its own invocations; distinct from
/// the shared-secret credential.
pub const SCHEDULER_HEADER: &str = "x-cron-trigger";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
    pub admin_token: String,
    pub run_budget: Duration,
}

impl AppState {
    pub fn new(pipeline: Arc<IngestPipeline>, admin_token: impl Into<String>, run_budget: Duration) -> Self {
        Self {
            pipeline,
            admin_token: admin_token.into(),
            run_budget,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct IngestQuery {
    start: Option<u32>,
    end: Option<u32>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/ingest", get(ingest_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving ingestion trigger");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<IngestQuery>,
) -> Response {
    if !authorized(&state, &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        )
            .into_response();
    }

    match (query.start, query.end) {
        (None, None) => run_incremental(&state).await,
        (Some(start), Some(end)) => run_backfill(&state, start, end).await,
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "start and end must be supplied together" })),
        )
            .into_response(),
    }
}

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let bearer_ok = !state.admin_token.is_empty()
        && headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == format!("Bearer {}", state.admin_token))
            .unwrap_or(false);
    let scheduler_ok = headers
        .get(SCHEDULER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "1")
        .unwrap_or(false);
    bearer_ok || scheduler_ok
}

async fn run_incremental(state: &AppState) -> Response {
    match tokio::time::timeout(state.run_budget, state.pipeline.run_incremental()).await {
        Err(_) => budget_exceeded(state.run_budget),
        Ok(Ok(RunOutcome::Completed {
            draw_no,
            winner_count,
        })) => Json(json!({
            "success": true,
            "drawNo": draw_no,
            "winnerCount": winner_count,
        }))
        .into_response(),
        Ok(Ok(RunOutcome::NoDataYet { draw_no })) => Json(json!({
            "success": false,
            "message": "no data yet",
            "drawNo": draw_no,
        }))
        .into_response(),
        Ok(Err(err)) => failure(err.to_string()),
    }
}

async fn run_backfill(state: &AppState, start: u32, end: u32) -> Response {
    match tokio::time::timeout(state.run_budget, state.pipeline.run_backfill(start, end)).await {
        Err(_) => budget_exceeded(state.run_budget),
        Ok(Ok(summary)) => Json(json!({
            "success": true,
            "summary": summary,
        }))
        .into_response(),
        Ok(Err(err)) => failure(err.to_string()),
    }
}

fn budget_exceeded(budget: Duration) -> Response {
    warn!(budget_secs = budget.as_secs(), "run budget exceeded");
    failure(format!(
        "run exceeded the {}s budget; chunk backfills into smaller ranges",
        budget.as_secs()
    ))
}

fn failure(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "error": message })),
    )
        .into_response()
}
