use std::time::Duration;

use thiserror::Error;

/// A resource probe could not read a metric.
///
/// Never escapes the sampler: it is rendered into the snapshot's
/// `gpu_error` field instead.
#[derive(Debug, Error)]
pub enum SamplingError {
    #[error("{0} is not installed")]
    CommandUnavailable(&'static str),

    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: &'static str,
        status: String,
        stderr: String,
    },

    /// The child was killed after running past its deadline.
    #[error("{command} timed out after {after:?}")]
    Timeout {
        command: &'static str,
        after: Duration,
    },

    #[error("unparseable accelerator output: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
