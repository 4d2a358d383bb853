//! Health check handler (§4.9 `GET /health`).

use axum::{extract::State, response::IntoResponse, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::state::AppState;

/// One subsystem's liveness (scheduler / hub / watcher).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckStatus {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            healthy: true,
            message: None,
        }
    }

    fn degraded(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: Some(message.into()),
        }
    }
}

/// `{ status, timestamp, version, checks{...} }` per §4.9.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<Utc>,
    pub version: String,
    pub checks: HashMap<String, CheckStatus>,
}

/// Liveness + per-subsystem health. Never returns a non-2xx status; the
/// `status` field communicates degradation so the listener itself never
/// flaps under a struggling subsystem.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = HashMap::new();

    let scheduler_metrics = state.scheduler().metrics();
    checks.insert("scheduler".to_string(), CheckStatus::ok());

    let connected = state.hub().connected_subscribers().await;
    checks.insert(
        "hub".to_string(),
        if state.hub().active_count() as usize == connected {
            CheckStatus::ok()
        } else {
            CheckStatus::degraded("active count drifted from registry snapshot")
        },
    );

    let (build_healthy, error_count) = state.orchestrator().last_build_status().await;
    checks.insert(
        "watcher".to_string(),
        if build_healthy {
            CheckStatus::ok()
        } else {
            CheckStatus::degraded(format!("{error_count} build error(s) since last success"))
        },
    );

    let status = if checks.values().all(|c| c.healthy) {
        "healthy"
    } else {
        "degraded"
    };

    tracing::trace!(total_builds = scheduler_metrics.total, "health check evaluated");

    Json(HealthResponse {
        status: status.to_string(),
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_status_ok_has_no_message() {
        let status = CheckStatus::ok();
        assert!(status.healthy);
        assert!(status.message.is_none());
    }

    #[test]
    fn check_status_degraded_carries_message() {
        let status = CheckStatus::degraded("boom");
        assert!(!status.healthy);
        assert_eq!(status.message.as_deref(), Some("boom"));
    }
}
