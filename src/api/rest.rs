use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;

use crate::backends::proxmox::GuestSummary;
use crate::domain::fleet_service::FleetService;
use crate::domain::node::Node;
use crate::domain::types::{CommandOutcome, DaemonHealth};
use crate::error::{EngineError, StoreError};

/// Shared application state for all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub fleet: Arc<FleetService>,
}

type ApiError = (StatusCode, String);

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/nodes", get(nodes))
        .route("/api/v1/nodes/{id}", get(node))
        .route("/api/v1/nodes/{id}/wake", post(wake))
        .route("/api/v1/nodes/{id}/suspend", post(suspend))
        .route("/api/v1/nodes/{id}/shutdown", post(shutdown))
        .route("/api/v1/nodes/{id}/stop", post(stop))
        .route("/api/v1/nodes/{id}/reconcile", post(reconcile_node))
        .route("/api/v1/nodes/{id}/guests", get(guests))
        .route("/api/v1/detect", post(detect))
        .route("/api/v1/reconcile", post(reconcile))
        .with_state(state)
}

fn not_found(e: StoreError) -> ApiError {
    match e {
        StoreError::NotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        StoreError::Persist(_) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn engine_error(e: EngineError) -> ApiError {
    match e {
        EngineError::Store(inner) => not_found(inner),
        EngineError::Rejected(_) | EngineError::Topology(_) => {
            (StatusCode::BAD_REQUEST, e.to_string())
        }
        EngineError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        _ => (StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

async fn health(State(state): State<AppState>) -> Json<DaemonHealth> {
    Json(state.fleet.health().await)
}

async fn nodes(State(state): State<AppState>) -> Json<Vec<Node>> {
    Json(state.fleet.nodes().await)
}

async fn node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Node>, ApiError> {
    state.fleet.node(&id).await.map(Json).map_err(not_found)
}

async fn wake(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CommandOutcome>, ApiError> {
    state.fleet.wake(&id).await.map(Json).map_err(not_found)
}

async fn suspend(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CommandOutcome>, ApiError> {
    state.fleet.suspend(&id).await.map(Json).map_err(not_found)
}

async fn shutdown(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CommandOutcome>, ApiError> {
    state.fleet.shutdown(&id).await.map(Json).map_err(not_found)
}

async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CommandOutcome>, ApiError> {
    state.fleet.stop(&id).await.map(Json).map_err(not_found)
}

async fn reconcile_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CommandOutcome>, ApiError> {
    state
        .fleet
        .reconcile_node(&id)
        .await
        .map(Json)
        .map_err(not_found)
}

async fn guests(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<GuestSummary>>, ApiError> {
    state.fleet.guests(&id).await.map(Json).map_err(engine_error)
}

/// Out-of-cycle detection pass; returns once every node was probed.
async fn detect(State(state): State<AppState>) -> Json<CommandOutcome> {
    Json(state.fleet.detect_now().await)
}

async fn reconcile(State(state): State<AppState>) -> Json<CommandOutcome> {
    Json(state.fleet.reconcile_now().await)
}
