//! HTTP admin API surface (§4.9, C9): `/health`, `/api/build/*`, `/ws`.
//!
//! Route handlers for static/UI pages and the playground/editor surfaces
//! are external collaborators and are not built here; a consuming binary
//! merges its own `Router` with the one this module returns.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::core::{RateLimiter, Subscriber};
use crate::state::AppState;

/// Build the admin API router: `/health`, `/api/build/*`, `/ws`.
///
/// Every other method on these paths falls back to axum's default 405
/// behavior (a route is registered for the path but not that verb).
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(crate::health::health))
        .route("/api/build/status", get(build_status))
        .route("/api/build/metrics", get(build_metrics))
        .route("/api/build/errors", get(build_errors))
        .route(
            "/api/build/cache",
            get(build_cache_stats).delete(build_cache_clear),
        )
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

#[derive(Serialize)]
struct BuildStatusResponse {
    status: &'static str,
    totals: crate::core::BuildMetrics,
    error_count: usize,
}

async fn build_status(State(state): State<AppState>) -> impl IntoResponse {
    let (healthy, error_count) = state.orchestrator().last_build_status().await;
    Json(BuildStatusResponse {
        status: if healthy { "ok" } else { "degraded" },
        totals: state.orchestrator().build_metrics(),
        error_count,
    })
}

async fn build_metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler().metrics())
}

async fn build_errors(State(state): State<AppState>) -> impl IntoResponse {
    let errors = state.orchestrator().last_build_errors().await;
    Json(json!({ "errors": errors, "count": errors.len() }))
}

async fn build_cache_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler().cache_stats())
}

async fn build_cache_clear(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler().clear_cache())
}

/// `GET /ws`: validate origin, admit under the connect-attempt rate limit,
/// then upgrade and register a [`Subscriber`] with the hub (§6).
async fn ws_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers
        .get(axum::http::header::ORIGIN)
        .and_then(|v| v.to_str().ok());

    if !state.origin_validator().is_allowed(origin) {
        tracing::debug!(origin = ?origin, "websocket upgrade rejected: origin not allowed");
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    let identity = addr.ip().to_string();
    let decision = state.connect_rate_limiter().check(&identity).await;
    if !decision.allowed {
        tracing::debug!(identity = %identity, "websocket upgrade rejected: rate limit exceeded");
        let mut response = (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response();
        apply_rate_limit_headers(response.headers_mut(), &decision, state.config().rate_limit.requests_per_minute);
        return response;
    }

    let rate_limiter = state.connect_rate_limiter().clone();
    let ws_config = state.config().websocket.clone();
    let hub = state.hub().clone();
    let shutdown = state.shutdown_token().clone();

    let mut response = ws.on_upgrade(move |socket| {
        handle_socket(socket, identity, ws_config, rate_limiter, hub, shutdown)
    });
    apply_rate_limit_headers(response.headers_mut(), &decision, state.config().rate_limit.requests_per_minute);
    response
}

async fn handle_socket(
    socket: crate::websocket::WebSocket,
    identity: String,
    config: crate::websocket::WebSocketConfig,
    rate_limiter: Arc<RateLimiter>,
    hub: crate::core::BroadcastHub,
    shutdown: CancellationToken,
) {
    let subscriber = Subscriber::new(identity, config.send_queue_capacity, &shutdown);
    hub.register(subscriber.clone()).await;

    let task = subscriber.spawn_tasks(socket, config, rate_limiter);
    let _ = task.await;

    hub.unregister(subscriber.id).await;
}

fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &crate::core::rate_limiter::Decision, limit: u32) {
    if let Ok(v) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert("x-ratelimit-limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", v);
    }
    let reset_unix = chrono::Utc::now().timestamp() as u64 + decision.retry_after.as_secs().max(1);
    if let Ok(v) = HeaderValue::from_str(&reset_unix.to_string()) {
        headers.insert("x-ratelimit-reset", v);
    }
    if !decision.allowed {
        if let Ok(v) = HeaderValue::from_str(&decision.retry_after.as_secs().to_string()) {
            headers.insert(axum::http::header::RETRY_AFTER, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::scheduler::BuildOperation;
    use crate::core::{BroadcastHub, BuildScheduler, Orchestrator, OriginValidator, RateLimiter, DEFAULT_DROP_THRESHOLD};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::path::Path;
    use std::time::Duration;
    use tower::ServiceExt;

    struct NoopBuild;

    #[async_trait]
    impl BuildOperation for NoopBuild {
        async fn build(&self, _component: &str) -> Result<(), Vec<crate::core::BuildError>> {
            Ok(())
        }
    }

    struct EmptyClassifier;

    impl crate::core::ChangeClassifier for EmptyClassifier {
        fn classify(&self, _path: &Path) -> Option<String> {
            None
        }
        fn known_components(&self) -> Vec<String> {
            Vec::new()
        }
    }

    fn test_state() -> AppState {
        let shutdown = CancellationToken::new();
        let scheduler = BuildScheduler::new(1, Duration::from_secs(1), Arc::new(NoopBuild), shutdown.clone());
        let (hub, _join) = BroadcastHub::spawn(shutdown.clone(), DEFAULT_DROP_THRESHOLD);
        let orchestrator = Orchestrator::new(
            scheduler.clone(),
            hub.clone(),
            Arc::new(EmptyClassifier),
            shutdown.clone(),
            Duration::from_secs(1),
        );
        AppState::new(
            Arc::new(Config::default()),
            orchestrator,
            hub,
            scheduler,
            Arc::new(RateLimiter::new(true, 60, 6000, Duration::from_secs(1), 60)),
            Arc::new(OriginValidator::new(&[], true)),
            shutdown,
        )
    }

    #[tokio::test]
    async fn health_route_returns_200() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn build_status_route_returns_ok_status() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/api/build/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn wrong_method_on_known_path_is_405() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/build/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn cache_delete_route_returns_200() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/build/cache")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
