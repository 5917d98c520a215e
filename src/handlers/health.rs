use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub uptime_seconds: f64,
    pub timestamp: DateTime<Utc>,
}

// ─── GET / ───────────────────────────────────────────────────────

pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        status: "running",
    })
}

// ─── GET /health ─────────────────────────────────────────────────

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
    Json(Health {
        status: "healthy",
        uptime_seconds: state.metrics.uptime().as_secs_f64(),
        timestamp: Utc::now(),
    })
}
