//! HTTP routes: GitHub webhook, build detail, cancellation, project approval, health.

pub mod webhook;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::error::StoreError;
use crate::events::build::PipelineState;
use crate::models::build::CiBuild;
use crate::models::project::CiProject;
use crate::models::result::CiBuildResult;
use crate::services::orchestrator::Orchestrator;

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook/github", post(webhook_handler))
        .route("/builds/{owner}/{name}/{number}", get(build_detail))
        .route("/api/builds/{build_id}/cancel", post(cancel_build))
        .route("/api/projects/{owner}/{name}/approve", post(approve_project))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Webhook ──

async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    crate::metrics::webhook_received(
        headers
            .get("x-github-event")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown"),
    );

    webhook::handle_webhook(&state.orchestrator, &headers, body).await
}

// ── Builds ──

#[derive(Debug, Serialize)]
pub struct BuildDetail {
    pub title: String,
    pub project: CiProject,
    pub build: CiBuild,
    pub state: Option<PipelineState>,
    pub color: &'static str,
    pub pull_request_url: String,
    pub running: bool,
    pub result: Option<CiBuildResult>,
}

async fn build_detail(
    State(state): State<AppState>,
    Path((owner, name, number)): Path<(String, String, i32)>,
) -> Result<Json<BuildDetail>, StatusCode> {
    let store = state.orchestrator.store();
    let internal = |e: StoreError| {
        tracing::error!("Build detail lookup failed: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    };

    let project = store
        .find_project(&owner, &name)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let build = store
        .find_build_by_number(project.id, number)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let result = store.get_result(build.id).await.map_err(internal)?;

    Ok(Json(BuildDetail {
        title: format!("{} - {}", build.display_name(&project), build.build_number),
        state: PipelineState::parse(&build.state),
        color: CiBuild::color(result.as_ref()),
        pull_request_url: build.pull_request_url(&project),
        running: state.orchestrator.is_running(build.id),
        project,
        build,
        result,
    }))
}

async fn cancel_build(State(state): State<AppState>, Path(build_id): Path<i64>) -> StatusCode {
    if state.orchestrator.cancel(build_id) {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}

// ── Projects ──

/// Let the events of an unapproved project start pipelines.
async fn approve_project(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<Json<CiProject>, StatusCode> {
    let store = state.orchestrator.store();
    let internal = |e: StoreError| {
        tracing::error!("Project approval failed: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    };

    let project = store
        .find_project(&owner, &name)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    store
        .set_project_approved(project.id, true)
        .await
        .map_err(internal)?;
    tracing::info!(project = %project, "Project approved");

    let project = store.get_project(project.id).await.map_err(internal)?;
    Ok(Json(project))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
