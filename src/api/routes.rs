//! API route definitions

use super::auth::PredictionAuth;
use crate::supervisor::Supervisor;
use axum::{
    Router,
    routing::{any, delete, get, post, put},
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub auth: Arc<PredictionAuth>,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and status
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .nest("/admin", admin_router())
        .merge(prediction_router())
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

/// Route lifecycle, worker pool and credential management.
///
/// Kept under its own prefix so no user name can collide with an admin path.
fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/routes", get(handlers::list_routes))
        .route("/deployments", post(handlers::create_deployment))
        .route("/routes/{user}/{model}", delete(handlers::delete_route))
        .route("/routes/{user}/{model}/sleep", post(handlers::sleep_route))
        .route("/routes/{user}/{model}/wake", post(handlers::wake_route))
        .route("/routes/{user}/{model}/restart", post(handlers::restart_route))
        .route("/routes/{user}/{model}/logs", get(handlers::route_logs))
        .route("/users/{user}", delete(handlers::delete_user))
        .route("/workers", get(handlers::list_workers))
        .route("/workers", post(handlers::add_worker))
        .route("/workers/{id}", delete(handlers::remove_worker))
        .route("/workers/{id}/release", post(handlers::release_worker))
        .route("/auth", put(handlers::set_auth))
}

/// Prediction traffic, authorized per request. Clients call the model path
/// with and without a trailing slash.
fn prediction_router() -> Router<AppState> {
    Router::new()
        .route("/{user}/models/{model}", any(handlers::predict))
        .route("/{user}/models/{model}/", any(handlers::predict))
}
