//! `cadence-server`: the HTTP input adapter (component M, §6). A thin axum
//! router over `cadence_runtime::Store`/`EventBus`, in the same "router +
//! shared state + delegate straight to the engine" shape the teacher's own
//! REST surface uses.

mod dto;
mod error;
mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use cadence_runtime::{Config, EventBus, Store};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub events: Arc<dyn EventBus>,
    pub config: Config,
}

/// Builds the full router (§6's nine operations plus `/healthz`), wrapped in
/// `TraceLayer` so every request is logged the way the teacher wraps its
/// example binaries.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/tasks", post(handlers::create_task).get(handlers::list_tasks))
        .route("/tasks/:id/run-now", post(handlers::run_now))
        .route("/tasks/:id/snooze", post(handlers::snooze))
        .route("/tasks/:id/pause", post(handlers::pause))
        .route("/tasks/:id/resume", post(handlers::resume))
        .route("/runs", get(handlers::list_runs))
        .route("/runs/:id", get(handlers::get_run))
        .route("/events/:topic", post(handlers::publish_event))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
