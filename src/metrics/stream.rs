use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;

use super::registry::MetricsSummary;
use crate::AppState;

// ─── GET /api/v1/metrics ─────────────────────────────────────────
/// Full summary as a single JSON document.

pub async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSummary> {
    Json(state.metrics.get_summary())
}

// ─── GET /api/v1/metrics/stream ──────────────────────────────────
/// Server-Sent Events endpoint.
/// Pushes a full `MetricsSummary` every `stream_interval`. System figures
/// inside it still follow the sampler's cache gate.

pub async fn metrics_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let interval = tokio::time::interval(state.stream_interval);

    let stream = IntervalStream::new(interval).map(move |_| {
        let summary = state.metrics.get_summary();
        let event = match Event::default().json_data(&summary) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize metrics summary");
                Event::default().comment("serialization error")
            }
        };
        Ok(event)
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
