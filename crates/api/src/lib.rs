//! HTTP gateway for the durable order orchestrator.
//!
//! Starts order-processing instances, serves their status and history, and
//! exposes health and Prometheus metrics endpoints.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use history_store::HistoryStore;
use metrics_exporter_prometheus::PrometheusHandle;
use orchestrator::{
    InMemoryNotificationPublisher, InMemoryOrderRepository, OrchestrationRuntime, RuntimeConfig,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use routes::orders::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<H: HistoryStore + Clone + 'static>(
    state: Arc<AppState<H>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::render))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/orders/start", post(routes::orders::start::<H>))
        .route("/orders/status/{id}", get(routes::orders::status::<H>))
        .route(
            "/orders/status/{id}/history",
            get(routes::orders::history::<H>),
        )
        .route("/orders/{id}/cancel", post(routes::orders::cancel::<H>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates the application state with in-memory order collaborators.
pub fn create_default_state<H: HistoryStore + Clone + 'static>(
    history_store: H,
    config: RuntimeConfig,
) -> Arc<AppState<H>> {
    let runtime = OrchestrationRuntime::new(
        history_store,
        InMemoryOrderRepository::new(),
        InMemoryNotificationPublisher::new(),
        config,
    );

    Arc::new(AppState { runtime })
}
