//! API route definitions.

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::handlers::{health, pipelines, runs};
use crate::middleware::{cors_layer, request_id};
use crate::state::AppState;
use crate::ws::ws_handler;

/// Create the main API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_routes())
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .with_state(state)
}

/// Router with the standard middleware stack applied.
pub fn build_app(state: AppState) -> Router {
    create_router(state)
        .layer(axum_middleware::from_fn(request_id))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/pipelines", pipeline_routes())
        .nest("/runs", run_routes())
        .route("/ws", get(ws_handler))
}

fn pipeline_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(pipelines::list_pipelines).post(pipelines::register_pipeline),
        )
        .route("/{id}", get(pipelines::get_pipeline))
        .route("/{id}/triggers", get(pipelines::list_triggers))
        .route("/{id}/runs", post(runs::trigger_run))
}

fn run_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(runs::list_runs))
        .route("/{run_id}", get(runs::get_run))
        .route("/{run_id}/cancel", post(runs::cancel_run))
}
