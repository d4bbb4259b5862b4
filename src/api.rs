use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::lock::ResourceClass;
use crate::metrics::Metrics;
use crate::orchestrator::RunStatus;
use crate::scheduler::{SchedulerStatus, SyncScheduler};

#[derive(Clone)]
pub struct AppState {
    scheduler: Arc<SyncScheduler>,
}

/// Control routes; `/metrics` is mounted when a recorder is given.
pub fn router(scheduler: Arc<SyncScheduler>, metrics: Option<&Metrics>) -> Router {
    let state = AppState { scheduler };
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/sync/status", get(status))
        .route("/sync/start", post(start))
        .route("/sync/stop", post(stop))
        .route("/sync/trigger/{class}", post(trigger))
        .layer(CorsLayer::very_permissive())
        .with_state(state);
    match metrics {
        Some(m) => app.merge(m.router()),
        None => app,
    }
}

#[derive(Serialize)]
struct ToggleResp {
    changed: bool,
    status: SchedulerStatus,
}

async fn status(State(state): State<AppState>) -> Json<SchedulerStatus> {
    Json(state.scheduler.status())
}

async fn start(State(state): State<AppState>) -> Json<ToggleResp> {
    let changed = state.scheduler.start();
    Json(ToggleResp {
        changed,
        status: state.scheduler.status(),
    })
}

async fn stop(State(state): State<AppState>) -> Json<ToggleResp> {
    let changed = state.scheduler.stop();
    Json(ToggleResp {
        changed,
        status: state.scheduler.status(),
    })
}

async fn trigger(State(state): State<AppState>, Path(class): Path<String>) -> Response {
    let class: ResourceClass = match class.parse() {
        Ok(c) => c,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e })),
            )
                .into_response()
        }
    };
    let summary = state.scheduler.trigger_now(class).await;
    let code = match summary.status {
        RunStatus::SkippedConflict => StatusCode::CONFLICT,
        _ => StatusCode::OK,
    };
    (code, Json(summary)).into_response()
}
