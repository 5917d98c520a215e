use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::handlers;
use crate::metrics::stream;
use crate::middleware::timing;
use crate::AppState;

/// Builds the full Axum `Router` with all routes and middleware.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // ── Service ─────────────────────────────────────────────
        .route("/", get(handlers::health::root))
        .route("/health", get(handlers::health::health))
        // ── Metrics reporting ───────────────────────────────────
        .route("/api/v1/metrics", get(stream::get_metrics))
        .route("/api/v1/metrics/stream", get(stream::metrics_stream))
        .route(
            "/api/v1/metrics/endpoint",
            get(handlers::stats::endpoint_stats),
        )
        .route("/api/v1/metrics/model", get(handlers::stats::model_stats))
        .route(
            "/api/v1/metrics/system",
            get(handlers::stats::system_metrics),
        )
        // ── Administration ──────────────────────────────────────
        .route(
            "/api/v1/metrics/reset",
            post(handlers::stats::reset_metrics),
        )
        .fallback(handlers::not_found)
        // ── Global middleware (applied bottom-up) ───────────────
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            timing::timing_middleware,
        ))
        .layer(CorsLayer::permissive())
        // ── Provide shared state to all routes above ────────────
        .with_state(state)
}
