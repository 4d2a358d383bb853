//! HTTP server with graceful shutdown (§6, §9).

use axum::http::Method;
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    cors::{AllowOrigin, CorsLayer},
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::{
    config::Config,
    error::Result,
    middleware::{
        apply_security_headers, request_id_layer, request_id_propagation_layer, sensitive_headers_layer,
    },
};

/// Owns the listener and the graceful-shutdown signal wait; the `Router`
/// passed to [`Server::serve`] already carries the admin API and any
/// caller-merged routes with its state applied.
pub struct Server {
    config: Config,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the server with the given router, stopping only once `shutdown`
    /// resolves. Callers drive the listener's graceful shutdown from the
    /// same signal that will go on to tear down the rest of the core (the
    /// [`ShutdownCoordinator`](crate::shutdown::ShutdownCoordinator)'s
    /// `wait_for_signal()`), so that step, not a second independent
    /// Ctrl+C/SIGTERM handler, is what stops new connections (§4.10, §9).
    pub async fn serve(self, app: Router, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.service.port));

        tracing::info!("Starting {} on {}", self.config.service.name, addr);

        self.log_middleware_config();

        let body_limit = self.config.middleware.body_limit_mb * 1024 * 1024;
        let cors_layer = self.build_cors_layer();

        let mut app = apply_security_headers(app, &self.config.security_headers);

        app = app
            // CORS (outermost layer)
            .layer(cors_layer)
            // Compression - always enabled (minimal overhead)
            .layer(CompressionLayer::new())
            // Request timeout
            .layer(TimeoutLayer::with_status_code(
                http::StatusCode::REQUEST_TIMEOUT,
                Duration::from_secs(self.config.service.timeout_secs),
            ))
            // Request body size limit - configurable via config
            .layer(RequestBodyLimitLayer::new(body_limit))
            // Tracing (always enabled)
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().include_headers(true))
                    .on_response(DefaultOnResponse::new().include_headers(true)),
            )
            // Request tracking layers - always enabled for distributed tracing
            .layer(sensitive_headers_layer())
            .layer(request_id_propagation_layer())
            .layer(request_id_layer());

        if self.config.middleware.catch_panic {
            app = app.layer(CatchPanicLayer::new());
        }

        let listener = TcpListener::bind(&addr).await?;

        tracing::info!("Server listening on {}", addr);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        tracing::info!("Server shutdown complete, listener no longer accepting connections");

        Ok(())
    }

    /// Log middleware configuration for debugging
    fn log_middleware_config(&self) {
        tracing::info!("Middleware configuration:");
        tracing::info!(
            "  - Panic recovery: {}",
            self.config.middleware.catch_panic
        );
        tracing::info!("  - Request ID tracking: enabled");
        tracing::info!("  - Sensitive header masking: enabled");
        tracing::info!(
            "  - Request body limit: {} MB",
            self.config.middleware.body_limit_mb
        );
        tracing::info!("  - Compression: {}", self.config.middleware.compression);
        tracing::info!(
            "  - CORS: {}",
            if self.config.environment.is_development() {
                "development (mirrors request origin)"
            } else {
                "production (explicit allow-list)"
            }
        );
        tracing::info!(
            "  - Request timeout: {} seconds",
            self.config.service.timeout_secs
        );
        tracing::info!(
            "  - Security headers: {}",
            self.config.security_headers.enabled
        );
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// CORS per §6: production allows only the configured origin list;
    /// development mirrors whatever origin the browser sent so local tooling
    /// on arbitrary ports works without per-origin configuration. Either way
    /// credentials are allowed, so a bare wildcard is never used.
    fn build_cors_layer(&self) -> CorsLayer {
        let base = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([axum::http::header::CONTENT_TYPE])
            .allow_credentials(true);

        if self.config.environment.is_development() {
            base.allow_origin(AllowOrigin::mirror_request())
        } else {
            let origins: Vec<_> = self
                .config
                .allowed_origins
                .iter()
                .filter_map(|origin| axum::http::HeaderValue::from_str(origin).ok())
                .collect();
            base.allow_origin(AllowOrigin::list(origins))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_creation() {
        let config = Config::default();
        let server = Server::new(config.clone());
        assert_eq!(server.config().service.port, config.service.port);
    }

    #[test]
    fn cors_layer_builds_in_both_environments() {
        let mut config = Config::default();
        config.environment = crate::config::Environment::Development;
        let _ = Server::new(config.clone()).build_cors_layer();

        config.environment = crate::config::Environment::Production;
        config.allowed_origins = vec!["https://example.com".to_string()];
        let _ = Server::new(config).build_cors_layer();
    }
}
