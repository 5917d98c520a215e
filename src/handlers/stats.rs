use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::metrics::{EndpointStats, ModelStats, SystemSnapshot};
use crate::AppState;

use super::AppError;

// ─── Request / response types ────────────────────────────────────

/// `?name=<key>`. Keys contain spaces and slashes, so they travel as a
/// query parameter rather than a path segment.
#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    pub name: Option<String>,
}

impl KeyQuery {
    fn require(self) -> Result<String, AppError> {
        match self.name {
            Some(name) if !name.is_empty() => Ok(name),
            _ => Err(AppError::BadRequest("query parameter `name` is required".into())),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResetAck {
    pub reset: bool,
    pub last_reset: DateTime<Utc>,
}

// ─── GET /api/v1/metrics/endpoint ────────────────────────────────

pub async fn endpoint_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<KeyQuery>,
) -> Result<Json<EndpointStats>, AppError> {
    let name = query.require()?;
    Ok(Json(state.metrics.get_endpoint_stats(&name)))
}

// ─── GET /api/v1/metrics/model ───────────────────────────────────

pub async fn model_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<KeyQuery>,
) -> Result<Json<ModelStats>, AppError> {
    let name = query.require()?;
    Ok(Json(state.metrics.get_model_stats(&name)))
}

// ─── GET /api/v1/metrics/system ──────────────────────────────────

pub async fn system_metrics(State(state): State<Arc<AppState>>) -> Json<SystemSnapshot> {
    Json(state.metrics.get_system_metrics())
}

// ─── POST /api/v1/metrics/reset ──────────────────────────────────

pub async fn reset_metrics(State(state): State<Arc<AppState>>) -> Json<ResetAck> {
    state.metrics.reset();
    Json(ResetAck {
        reset: true,
        last_reset: state.metrics.last_reset(),
    })
}
