//! Read-only status dashboard over the run surface: running tasks, the
//! live status tree of a run, and log tailing.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::schedule::model::{LogChunk, TaskPhase};
use crate::schedule::Scheduler;

#[derive(Clone)]
pub struct DashboardState {
    pub scheduler: Arc<Scheduler>,
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/running", get(running_handler))
        .route("/api/task/:id/status", get(status_handler))
        .route("/api/task/:id/log", get(log_handler))
        .layer(cors)
        .with_state(state);

    tracing::info!(addr = %addr, "starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "dashboard server failed");
    }
}

async fn running_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    match state.scheduler.running_tasks().await {
        Ok(tasks) => (StatusCode::OK, Json(json!({ "running": tasks }))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn status_handler(
    State(state): State<DashboardState>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    match state.scheduler.task_tree_status(&task_id).await {
        Ok((tree, finished)) => (
            StatusCode::OK,
            Json(json!({ "tree": tree, "finished": finished })),
        ),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

#[derive(Deserialize)]
struct LogParams {
    phase: i32,
    real_id: String,
    #[serde(default)]
    offset: i64,
}

async fn log_handler(
    State(state): State<DashboardState>,
    Path(task_id): Path<String>,
    Query(params): Query<LogParams>,
) -> impl IntoResponse {
    let Some(phase) = TaskPhase::from_code(params.phase) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("unknown phase {}", params.phase) })),
        );
    };
    match state
        .scheduler
        .task_real_log(&task_id, phase, &params.real_id, params.offset)
        .await
    {
        Ok(LogChunk::Frame(frame)) => (
            StatusCode::OK,
            Json(json!({ "log": String::from_utf8_lossy(&frame), "eof": false })),
        ),
        Ok(LogChunk::Eof) => (StatusCode::OK, Json(json!({ "log": "", "eof": true }))),
        Ok(LogChunk::Pending) => (StatusCode::OK, Json(json!({ "log": "", "eof": false }))),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}
