//! Application state shared across HTTP handlers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::{BroadcastHub, BuildScheduler, Orchestrator, OriginValidator, RateLimiter};

/// Handles to every long-lived core component, shared across handlers and
/// the shutdown coordinator.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    orchestrator: Arc<Orchestrator>,
    hub: BroadcastHub,
    scheduler: Arc<BuildScheduler>,
    connect_rate_limiter: Arc<RateLimiter>,
    origin_validator: Arc<OriginValidator>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        orchestrator: Arc<Orchestrator>,
        hub: BroadcastHub,
        scheduler: Arc<BuildScheduler>,
        connect_rate_limiter: Arc<RateLimiter>,
        origin_validator: Arc<OriginValidator>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            orchestrator,
            hub,
            scheduler,
            connect_rate_limiter,
            origin_validator,
            shutdown,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn scheduler(&self) -> &Arc<BuildScheduler> {
        &self.scheduler
    }

    pub fn connect_rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.connect_rate_limiter
    }

    pub fn origin_validator(&self) -> &Arc<OriginValidator> {
        &self.origin_validator
    }

    /// Root cancellation token; a WebSocket connection's lifetime token is
    /// derived as a child of this one so shutdown cancels every subscriber.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}
