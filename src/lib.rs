//! In-process runtime metrics for the incident-reporting backend.
//!
//! The collector lives in [`metrics`]: per-key rolling latency windows,
//! atomic counters, nearest-rank percentiles, a cache-gated host sampler,
//! and wrappers that time arbitrary calls. The remaining modules host it
//! behind a small axum reporting surface.

use std::sync::Arc;
use std::time::Duration;

pub mod config;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod server;

/// Shared application state available to every handler via `State<Arc<AppState>>`.
pub struct AppState {
    /// The one registry for this process; middleware records, reporting reads.
    pub metrics: Arc<metrics::MetricsRegistry>,

    /// Tick period of the SSE summary stream.
    pub stream_interval: Duration,
}
