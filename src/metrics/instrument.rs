//! Timing wrappers that feed the registry.
//!
//! `Instrument` measures wall-clock time around a unit of work and makes
//! exactly one record call per invocation, on every exit path: success,
//! error, panic, and (for futures) being dropped before completion. The
//! wrapped result is returned untouched.

use std::future::{Future, IntoFuture};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt};

use super::registry::MetricsRegistry;

/// Status recorded for a request-style call that returned `Ok`.
pub const SUCCESS_STATUS: u16 = 200;
/// Default status recorded for a request-style call that returned `Err` or panicked.
pub const FAILURE_STATUS: u16 = 500;
/// Status recorded when an instrumented future is dropped before completing.
pub const CANCELLED_STATUS: u16 = 499;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Request { endpoint: String, failure_status: u16 },
    Model { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Failed,
    Cancelled,
}

/// Measures calls and records them as requests or model inferences.
#[derive(Clone)]
pub struct Instrument {
    registry: Arc<MetricsRegistry>,
    target: Target,
}

impl Instrument {
    /// Record calls via `record_request`.
    pub fn endpoint(registry: Arc<MetricsRegistry>, endpoint: impl Into<String>) -> Self {
        Self {
            registry,
            target: Target::Request {
                endpoint: endpoint.into(),
                failure_status: FAILURE_STATUS,
            },
        }
    }

    /// Record calls via `record_model_inference`, whatever the outcome.
    pub fn model(registry: Arc<MetricsRegistry>, name: impl Into<String>) -> Self {
        Self {
            registry,
            target: Target::Model { name: name.into() },
        }
    }

    /// Status used for failed request-style calls. No effect on model targets.
    pub fn with_failure_status(mut self, status: u16) -> Self {
        if let Target::Request { failure_status, .. } = &mut self.target {
            *failure_status = status;
        }
        self
    }

    /// Run a blocking operation under measurement.
    pub fn call<T, E>(&self, op: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        let mut recording = self.start();
        let result = op();
        recording.outcome = outcome_of(&result);
        result
    }

    /// Await an operation under measurement. Dropping the returned future
    /// early records the call as cancelled.
    pub async fn call_async<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: IntoFuture<Output = Result<T, E>>,
    {
        let mut recording = self.start();
        let result = op.await;
        recording.outcome = outcome_of(&result);
        result
    }

    /// Wrap a blocking callable into one of the same shape that is
    /// measured on every invocation.
    pub fn wrap<T, E, F>(self, mut op: F) -> impl FnMut() -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
    {
        move || self.call(&mut op)
    }

    /// Wrap a future-producing callable; each returned future is measured.
    pub fn wrap_async<T, E, F, Fut>(self, op: F) -> impl Fn() -> BoxFuture<'static, Result<T, E>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        move || {
            let instrument = self.clone();
            let fut = op();
            async move { instrument.call_async(fut).await }.boxed()
        }
    }

    fn start(&self) -> Recording<'_> {
        Recording {
            instrument: self,
            started: Instant::now(),
            outcome: Outcome::Cancelled,
        }
    }

    fn record(&self, elapsed_ms: f64, outcome: Outcome) {
        match &self.target {
            Target::Request {
                endpoint,
                failure_status,
            } => {
                let status = match outcome {
                    Outcome::Succeeded => SUCCESS_STATUS,
                    Outcome::Failed => *failure_status,
                    Outcome::Cancelled => CANCELLED_STATUS,
                };
                self.registry.record_request(endpoint, elapsed_ms, status);
            }
            Target::Model { name } => {
                self.registry.record_model_inference(name, elapsed_ms);
            }
        }
    }
}

fn outcome_of<T, E>(result: &Result<T, E>) -> Outcome {
    if result.is_ok() {
        Outcome::Succeeded
    } else {
        Outcome::Failed
    }
}

/// Records on drop. The outcome starts as `Cancelled` and is overwritten
/// once the operation returns; a drop during unwinding is a failure.
struct Recording<'a> {
    instrument: &'a Instrument,
    started: Instant,
    outcome: Outcome,
}

impl Drop for Recording<'_> {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let outcome = if std::thread::panicking() {
            Outcome::Failed
        } else {
            self.outcome
        };

        let recorded = panic::catch_unwind(AssertUnwindSafe(|| {
            self.instrument.record(elapsed_ms, outcome)
        }));
        if recorded.is_err() {
            tracing::error!(observation = ?self.instrument.target, "metrics recording panicked");
        }
    }
}

/// Scope guard that logs how long an operation took. Nothing is recorded
/// in the registry.
#[must_use = "the duration is logged when the guard is dropped"]
pub struct OperationTimer {
    name: String,
    started: Instant,
}

pub fn track_operation(name: impl Into<String>) -> OperationTimer {
    OperationTimer {
        name: name.into(),
        started: Instant::now(),
    }
}

impl OperationTimer {
    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        tracing::info!(
            operation = %self.name,
            "{} completed in {:.2}ms",
            self.name,
            self.elapsed_ms()
        );
    }
}
