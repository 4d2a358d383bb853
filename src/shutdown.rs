//! Ordered, idempotent process teardown (§9, C10).
//!
//! Shutdown proceeds HTTP listener -> scheduler -> watcher -> hub -> rate
//! limiters. The HTTP listener itself is closed by `axum::serve`'s graceful
//! shutdown future (driven by [`ShutdownCoordinator::wait_for_signal`]); once
//! that future resolves and in-flight requests have drained, the caller
//! invokes [`ShutdownCoordinator::teardown`] for the remaining steps so nothing
//! downstream is stopped while the listener might still hand it work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::{BroadcastHub, FileWatcher, Orchestrator, RateLimiter};

/// Coordinates shutdown across every long-lived component.
///
/// Holds the root [`CancellationToken`]; every subsystem (scheduler workers,
/// the watcher's debounce loop, subscriber tasks, rate-limiter sweepers)
/// derives its own token from this one or observes it directly, so
/// triggering shutdown here unblocks all of them at once. The ordered
/// `teardown` calls on top make sure each component finishes draining before
/// the next is asked to stop.
pub struct ShutdownCoordinator {
    shutdown: CancellationToken,
    orchestrator: Arc<Orchestrator>,
    hub: BroadcastHub,
    rate_limiters: Vec<Arc<RateLimiter>>,
    watcher: Mutex<Option<Box<dyn FileWatcher>>>,
    step_timeout: Duration,
    triggered: AtomicBool,
    torn_down: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(
        shutdown: CancellationToken,
        orchestrator: Arc<Orchestrator>,
        hub: BroadcastHub,
        rate_limiters: Vec<Arc<RateLimiter>>,
        watcher: Option<Box<dyn FileWatcher>>,
        step_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            shutdown,
            orchestrator,
            hub,
            rate_limiters,
            watcher: Mutex::new(watcher),
            step_timeout,
            triggered: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        })
    }

    /// The token every subsystem was constructed with a child of (or
    /// observes directly). Pass clones of this to components built before
    /// the coordinator itself.
    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel the root token. Idempotent: later calls are no-ops.
    pub fn trigger(&self) {
        if self.triggered.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            self.shutdown.cancel();
        }
    }

    /// Resolves on Ctrl+C, SIGTERM (unix), or an explicit [`Self::trigger`]
    /// call from elsewhere, then triggers shutdown itself. Intended as the
    /// future passed to `axum::serve(..).with_graceful_shutdown(..)`.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
            _ = terminate => tracing::info!("received SIGTERM, shutting down"),
            _ = self.shutdown.cancelled() => tracing::debug!("shutdown triggered externally"),
        }

        self.trigger();
    }

    /// Stop the scheduler, watcher, hub, and rate limiters in that order,
    /// each under `step_timeout`. Call only after the HTTP listener has
    /// stopped accepting new connections and drained in-flight requests.
    /// Idempotent: a second call returns immediately.
    pub async fn teardown(&self) {
        if self.torn_down.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            tracing::debug!("teardown already ran, skipping");
            return;
        }

        self.trigger();

        tracing::info!("shutdown: stopping scheduler");
        if tokio::time::timeout(self.step_timeout, self.orchestrator.stop()).await.is_err() {
            tracing::warn!("shutdown: scheduler did not stop within deadline");
        }

        tracing::info!("shutdown: stopping file watcher");
        if let Some(mut watcher) = self.watcher.lock().await.take() {
            if tokio::time::timeout(self.step_timeout, watcher.stop()).await.is_err() {
                tracing::warn!("shutdown: watcher did not stop within deadline");
            }
        }

        tracing::info!("shutdown: closing broadcast hub");
        if tokio::time::timeout(self.step_timeout, self.hub.shutdown()).await.is_err() {
            tracing::warn!("shutdown: hub did not drain within deadline");
        }

        tracing::info!("shutdown: evicting rate limiter state");
        for limiter in &self.rate_limiters {
            limiter.evict_stale();
        }

        tracing::info!("shutdown: teardown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scheduler::BuildOperation;
    use crate::core::{BuildScheduler, ChangeClassifier, DEFAULT_DROP_THRESHOLD};
    use async_trait::async_trait;
    use std::path::Path;

    struct NoopBuild;

    #[async_trait]
    impl BuildOperation for NoopBuild {
        async fn build(&self, _component: &str) -> Result<(), Vec<crate::core::BuildError>> {
            Ok(())
        }
    }

    struct EmptyClassifier;

    impl ChangeClassifier for EmptyClassifier {
        fn classify(&self, _path: &Path) -> Option<String> {
            None
        }
        fn known_components(&self) -> Vec<String> {
            Vec::new()
        }
    }

    fn coordinator() -> Arc<ShutdownCoordinator> {
        let shutdown = CancellationToken::new();
        let scheduler = BuildScheduler::new(1, Duration::from_secs(1), Arc::new(NoopBuild), shutdown.clone());
        let (hub, _join) = BroadcastHub::spawn(shutdown.clone(), DEFAULT_DROP_THRESHOLD);
        let orchestrator = Orchestrator::new(
            scheduler,
            hub.clone(),
            Arc::new(EmptyClassifier),
            shutdown.clone(),
            Duration::from_secs(1),
        );
        ShutdownCoordinator::new(shutdown, orchestrator, hub, Vec::new(), None, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn trigger_cancels_the_token_once() {
        let coordinator = coordinator();
        assert!(!coordinator.token().is_cancelled());
        coordinator.trigger();
        assert!(coordinator.token().is_cancelled());
        coordinator.trigger();
        assert!(coordinator.token().is_cancelled());
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let coordinator = coordinator();
        coordinator.teardown().await;
        assert!(coordinator.token().is_cancelled());
        coordinator.teardown().await;
    }
}
