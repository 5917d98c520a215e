use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

use super::counters::CounterTable;
use super::percentiles::PercentileSet;
use super::system::{ResourceProbe, SystemSampler, SystemSnapshot, DEFAULT_REFRESH_INTERVAL};
use super::window::{RollingWindow, DEFAULT_WINDOW_SIZE};

// ─── Configuration ───────────────────────────────────────────────

/// Default cap on distinct keys per family (endpoints, models).
pub const DEFAULT_MAX_KEYS: usize = 1024;

/// Key that absorbs observations for new keys once a family is full.
pub const OVERFLOW_KEY: &str = "<other>";

/// Status codes at or above this count as errors.
const ERROR_STATUS_THRESHOLD: u16 = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsConfig {
    /// Samples kept per key for percentile computation
    pub window_size: usize,
    /// Minimum age of the cached system snapshot
    pub system_refresh: Duration,
    /// Distinct keys per family before folding into `OVERFLOW_KEY`; 0 = unlimited
    pub max_keys: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            system_refresh: DEFAULT_REFRESH_INTERVAL,
            max_keys: DEFAULT_MAX_KEYS,
        }
    }
}

// ─── Public types ────────────────────────────────────────────────

/// Derived statistics for one endpoint key. Durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointStats {
    pub endpoint: String,
    pub total_requests: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub latency_p50: f64,
    pub latency_p95: f64,
    pub latency_p99: f64,
    pub avg_latency: f64,
}

/// Derived statistics for one model key. Durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStats {
    pub model: String,
    pub total_calls: u64,
    pub avg_inference_ms: f64,
    pub p95_inference_ms: f64,
    pub p99_inference_ms: f64,
}

/// Complete report returned by `get_summary()`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub uptime_seconds: f64,
    pub uptime_formatted: String,
    pub total_requests: u64,
    pub total_errors: u64,
    pub overall_error_rate: f64,
    pub requests_per_second: f64,
    pub endpoints: BTreeMap<String, EndpointStats>,
    pub models: BTreeMap<String, ModelStats>,
    pub system: SystemSnapshot,
    pub started_at: DateTime<Utc>,
    pub last_reset: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

/// Process-wide metrics store.
///
/// Construct once at startup and share behind an `Arc`. Record calls touch
/// only the key's own window lock and atomic counters; reads snapshot the
/// windows before sorting.
pub struct MetricsRegistry {
    endpoints: SeriesFamily,
    models: SeriesFamily,

    requests: CounterTable,
    errors: CounterTable,
    model_calls: CounterTable,

    sampler: SystemSampler,

    start_time: Instant,
    started_at: DateTime<Utc>,
    last_reset: RwLock<DateTime<Utc>>,
}

// ─── Per-family window storage ───────────────────────────────────

struct SeriesFamily {
    label: &'static str,
    windows: DashMap<String, Arc<RollingWindow<f64>>>,
    window_size: usize,
    max_keys: usize,
    overflow_warned: AtomicBool,
}

impl SeriesFamily {
    fn new(label: &'static str, window_size: usize, max_keys: usize) -> Self {
        Self {
            label,
            windows: DashMap::new(),
            window_size,
            max_keys,
            overflow_warned: AtomicBool::new(false),
        }
    }

    /// Map `key` to the key actually stored, folding new keys into
    /// `OVERFLOW_KEY` once the family is at its cap. The cap is checked
    /// without a global lock, so a burst of new keys may overshoot it by
    /// the number of concurrent first writers.
    fn resolve<'a>(&self, key: &'a str) -> &'a str {
        if self.max_keys == 0 || self.windows.contains_key(key) {
            return key;
        }
        if self.windows.len() < self.max_keys {
            return key;
        }
        if !self.overflow_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                family = self.label,
                max_keys = self.max_keys,
                key,
                "key limit reached, folding new keys into {OVERFLOW_KEY}"
            );
        }
        OVERFLOW_KEY
    }

    fn window(&self, key: &str) -> Arc<RollingWindow<f64>> {
        if let Some(w) = self.windows.get(key) {
            return Arc::clone(w.value());
        }
        let entry = self
            .windows
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(RollingWindow::new(self.window_size)));
        Arc::clone(entry.value())
    }

    fn push(&self, key: &str, sample: f64) {
        // Clone the Arc out so the shard lock is released before the window lock
        self.window(key).push(sample);
    }

    fn snapshot(&self, key: &str) -> Vec<f64> {
        let Some(window) = self.windows.get(key).map(|w| Arc::clone(w.value())) else {
            return Vec::new();
        };
        window.snapshot()
    }

    fn clear(&self) {
        for w in self.windows.iter() {
            w.value().clear();
        }
    }
}

// ─── MetricsRegistry impl ────────────────────────────────────────

impl MetricsRegistry {
    pub fn new(config: MetricsConfig, probe: Box<dyn ResourceProbe>) -> Self {
        let now = Utc::now();
        Self {
            endpoints: SeriesFamily::new("endpoints", config.window_size, config.max_keys),
            models: SeriesFamily::new("models", config.window_size, config.max_keys),
            requests: CounterTable::new(),
            errors: CounterTable::new(),
            model_calls: CounterTable::new(),
            sampler: SystemSampler::new(probe, config.system_refresh),
            start_time: Instant::now(),
            started_at: now,
            last_reset: RwLock::new(now),
        }
    }

    /// Record one finished request. Status codes >= 400 count as errors.
    pub fn record_request(&self, endpoint: &str, latency_ms: f64, status_code: u16) {
        let key = self.endpoints.resolve(endpoint);
        self.endpoints.push(key, latency_ms);
        // Requests before errors keeps errors <= requests for any reader
        self.requests.increment(key);
        if status_code >= ERROR_STATUS_THRESHOLD {
            self.errors.increment(key);
        }
    }

    /// Record one model inference, successful or not.
    pub fn record_model_inference(&self, model_name: &str, duration_ms: f64) {
        let key = self.models.resolve(model_name);
        self.models.push(key, duration_ms);
        self.model_calls.increment(key);
    }

    /// Unknown endpoints yield the all-zero shape.
    pub fn get_endpoint_stats(&self, endpoint: &str) -> EndpointStats {
        // Errors are read first: a request landing between the two loads
        // can only raise the request count.
        let errors = self.errors.get(endpoint);
        let requests = self.requests.get(endpoint);
        // A reset racing a writer can leave a stray error increment
        let errors = errors.min(requests);
        let latency = PercentileSet::from_samples(self.endpoints.snapshot(endpoint));

        EndpointStats {
            endpoint: endpoint.to_owned(),
            total_requests: requests,
            error_count: errors,
            error_rate: ratio(errors, requests),
            latency_p50: latency.p50,
            latency_p95: latency.p95,
            latency_p99: latency.p99,
            avg_latency: latency.mean,
        }
    }

    /// Unknown models yield the all-zero shape.
    pub fn get_model_stats(&self, model_name: &str) -> ModelStats {
        let timing = PercentileSet::from_samples(self.models.snapshot(model_name));
        ModelStats {
            model: model_name.to_owned(),
            total_calls: self.model_calls.get(model_name),
            avg_inference_ms: timing.mean,
            p95_inference_ms: timing.p95,
            p99_inference_ms: timing.p99,
        }
    }

    pub fn get_system_metrics(&self) -> SystemSnapshot {
        self.sampler.sample()
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn last_reset(&self) -> DateTime<Utc> {
        *self.last_reset.read()
    }

    /// Build the full report for reporting endpoints.
    pub fn get_summary(&self) -> MetricsSummary {
        let uptime_seconds = self.uptime().as_secs_f64();

        let total_errors = self.errors.total();
        let total_requests = self.requests.total();
        let total_errors = total_errors.min(total_requests);

        let requests_per_second = if uptime_seconds > 0.0 {
            total_requests as f64 / uptime_seconds
        } else {
            0.0
        };

        let endpoints = self
            .requests
            .active_keys()
            .into_iter()
            .map(|key| {
                let stats = self.get_endpoint_stats(&key);
                (key, stats)
            })
            .collect();

        let models = self
            .model_calls
            .active_keys()
            .into_iter()
            .map(|key| {
                let stats = self.get_model_stats(&key);
                (key, stats)
            })
            .collect();

        MetricsSummary {
            uptime_seconds,
            uptime_formatted: format_uptime(uptime_seconds),
            total_requests,
            total_errors,
            overall_error_rate: ratio(total_errors, total_requests),
            requests_per_second,
            endpoints,
            models,
            system: self.get_system_metrics(),
            started_at: self.started_at,
            last_reset: self.last_reset(),
            timestamp: Utc::now(),
        }
    }

    /// Clear every window and counter. Keys stay allocated and uptime is
    /// untouched.
    pub fn reset(&self) {
        self.endpoints.clear();
        self.models.clear();
        self.requests.reset();
        self.errors.reset();
        self.model_calls.reset();

        let now = Utc::now();
        *self.last_reset.write() = now;
        tracing::info!(at = %now, "metrics reset");
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// `"2d 3h 4m"`, `"3h 4m 5s"` or `"4m 5s"` depending on magnitude.
pub fn format_uptime(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let secs = total % 60;

    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m {secs}s")
    } else {
        format!("{minutes}m {secs}s")
    }
}
