//! Command-line / environment configuration for the metrics host.

use clap::{Parser, ValueEnum};
use std::time::Duration;

use crate::metrics::registry::{MetricsConfig, DEFAULT_MAX_KEYS};
use crate::metrics::system::{
    AcceleratorProbe, NoAccelerator, NvidiaSmi, DEFAULT_ACCELERATOR_TIMEOUT,
};
use crate::metrics::window::DEFAULT_WINDOW_SIZE;

/// Parse a window size, rejecting zero
fn parse_window_size(s: &str) -> Result<usize, String> {
    let size: usize = s
        .parse()
        .map_err(|e| format!("Invalid window size: {}", e))?;
    if size == 0 {
        return Err("window size must be at least 1".into());
    }
    Ok(size)
}

/// How accelerator memory is sampled
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AcceleratorKind {
    /// Use nvidia-smi when installed, otherwise report no accelerator
    Auto,
    /// Require nvidia-smi; a missing binary is reported as a sampling error
    NvidiaSmi,
    /// Never query an accelerator
    None,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "incident-metrics", version, about = "Runtime metrics collector for the incident backend")]
pub struct Config {
    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0", env = "METRICS_HOST")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8000, env = "METRICS_PORT")]
    pub port: u16,

    /// Samples kept per endpoint / model for percentiles
    #[arg(long, default_value_t = DEFAULT_WINDOW_SIZE, env = "METRICS_WINDOW_SIZE", value_parser = parse_window_size)]
    pub window_size: usize,

    /// Minimum seconds between real system resource samples
    #[arg(long, default_value_t = 5, env = "METRICS_SYSTEM_REFRESH_SECS")]
    pub system_refresh_secs: u64,

    /// Distinct keys per family before new keys fold into "<other>" (0 = unlimited)
    #[arg(long, default_value_t = DEFAULT_MAX_KEYS, env = "METRICS_MAX_KEYS")]
    pub max_keys: usize,

    /// Milliseconds between summaries on the SSE stream
    #[arg(long, default_value_t = 1000, env = "METRICS_STREAM_INTERVAL_MS")]
    pub stream_interval_ms: u64,

    /// Accelerator sampling backend
    #[arg(long, value_enum, default_value = "auto", env = "METRICS_ACCELERATOR")]
    pub accelerator: AcceleratorKind,

    /// Milliseconds before a running nvidia-smi query is killed
    #[arg(long, default_value_t = DEFAULT_ACCELERATOR_TIMEOUT.as_millis() as u64, env = "METRICS_ACCELERATOR_TIMEOUT_MS")]
    pub accelerator_timeout_ms: u64,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info", env = "METRICS_LOG_LEVEL")]
    pub log_level: String,
}

impl Config {
    /// Formatted listen address (e.g. "0.0.0.0:8000")
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsConfig {
        MetricsConfig {
            window_size: self.window_size,
            system_refresh: Duration::from_secs(self.system_refresh_secs),
            max_keys: self.max_keys,
        }
    }

    #[must_use]
    pub fn stream_interval(&self) -> Duration {
        // tokio::time::interval panics on a zero period
        Duration::from_millis(self.stream_interval_ms.max(1))
    }

    pub fn accelerator_probe(&self) -> Box<dyn AcceleratorProbe> {
        let timeout = Duration::from_millis(self.accelerator_timeout_ms);
        match self.accelerator {
            AcceleratorKind::Auto => Box::new(NvidiaSmi::new(false).with_timeout(timeout)),
            AcceleratorKind::NvidiaSmi => Box::new(NvidiaSmi::new(true).with_timeout(timeout)),
            AcceleratorKind::None => Box::new(NoAccelerator),
        }
    }
}
