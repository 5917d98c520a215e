use serde::Serialize;

/// Percentile breakdown of one window snapshot (milliseconds).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PercentileSet {
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub count: usize,
}

impl PercentileSet {
    /// Sort the samples and derive the nearest-rank set.
    /// Returns zeroed values for an empty snapshot.
    pub fn from_samples(mut samples: Vec<f64>) -> Self {
        if samples.is_empty() {
            return Self::empty();
        }
        samples.sort_by(f64::total_cmp);

        let count = samples.len();
        let sum: f64 = samples.iter().sum();

        Self {
            mean: sum / count as f64,
            p50: percentile(&samples, 0.50),
            p95: percentile(&samples, 0.95),
            p99: percentile(&samples, 0.99),
            count,
        }
    }

    /// All-zero placeholder for keys with no samples.
    pub fn empty() -> Self {
        Self {
            mean: 0.0,
            p50: 0.0,
            p95: 0.0,
            p99: 0.0,
            count: 0,
        }
    }
}

/// Nearest-rank percentile over ascending `sorted` data.
///
/// `p` is a fraction in `[0, 1]`; the index is `floor(p * len)` clamped to
/// the last element. No interpolation. Empty input yields `0.0`.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p.clamp(0.0, 1.0) * sorted.len() as f64).floor() as usize;
    sorted[rank.min(sorted.len() - 1)]
}
