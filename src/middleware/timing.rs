use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::Instant;

use crate::AppState;

/// Key shared by every request that matched no route.
pub const UNMATCHED_ROUTE: &str = "<unmatched>";

/// Records every request into the registry under `"METHOD <route template>"`
/// and adds two response headers:
///
///   X-Response-Time-Us:  total handler wall time in microseconds
///   Server-Timing:       same value as `total;dur=<ms>`
///
/// Keying on the matched template keeps one key per route, not per URL.
pub async fn timing_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map_or(UNMATCHED_ROUTE, MatchedPath::as_str)
        .to_owned();
    let key = format!("{} {}", req.method(), route);

    let start = Instant::now();
    let mut response = next.run(req).await;
    let elapsed = start.elapsed();
    let latency_ms = elapsed.as_secs_f64() * 1000.0;
    let status = response.status().as_u16();

    state.metrics.record_request(&key, latency_ms, status);

    // ── Inject response headers ─────────────────────────────────
    if let Ok(val) = elapsed.as_micros().to_string().parse() {
        response.headers_mut().insert("X-Response-Time-Us", val);
    }

    let server_timing = format!("total;dur={latency_ms:.3}");
    if let Ok(val) = server_timing.parse() {
        response.headers_mut().insert("Server-Timing", val);
    }

    tracing::debug!(status, endpoint = %key, latency_ms, "request");

    response
}
