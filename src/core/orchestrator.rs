//! Orchestrator: wires watcher -> scanner -> scheduler -> hub, owns the
//! lifecycle context and the build-state snapshot (§4.8).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::core::hub::{BroadcastHub, DEFAULT_DROP_THRESHOLD};
use crate::core::scheduler::{BuildMetrics, BuildScheduler};
use crate::core::types::{BuildError, BuildRequest, BuildResult, EnvelopeKind, MessageEnvelope, Priority};
use crate::core::watcher::{FileEvent, FileEventKind, FileWatcher};

/// Classifies a changed path into a rebuild scope. The scanner/registry
/// that answers "which component does this template belong to" is an
/// external collaborator (out of scope per §1); this trait is its
/// interface at the orchestrator boundary.
pub trait ChangeClassifier: Send + Sync {
    /// `Some(component)` for a template-language file that maps to exactly
    /// one component; `None` for a general-language file that triggers a
    /// full rebuild of every known component.
    fn classify(&self, path: &Path) -> Option<String>;
    fn known_components(&self) -> Vec<String>;
}

/// Orchestrator-held mapping from component identity to its most recent
/// result, plus the latest error set (§3 BuildState).
#[derive(Default)]
struct BuildState {
    results: HashMap<String, BuildResult>,
    last_errors: Vec<BuildError>,
}

pub struct Orchestrator {
    scheduler: Arc<BuildScheduler>,
    hub: BroadcastHub,
    classifier: Arc<dyn ChangeClassifier>,
    state: Arc<RwLock<BuildState>>,
    shutdown: CancellationToken,
    scheduler_handles: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shutdown_deadline: Duration,
}

impl Orchestrator {
    pub fn new(
        scheduler: Arc<BuildScheduler>,
        hub: BroadcastHub,
        classifier: Arc<dyn ChangeClassifier>,
        shutdown: CancellationToken,
        shutdown_deadline: Duration,
    ) -> Arc<Self> {
        let state = Arc::new(RwLock::new(BuildState::default()));

        let orchestrator = Arc::new(Self {
            scheduler,
            hub,
            classifier,
            state,
            shutdown,
            scheduler_handles: std::sync::Mutex::new(Vec::new()),
            shutdown_deadline,
        });

        orchestrator.register_scheduler_callback();
        orchestrator
    }

    fn register_scheduler_callback(self: &Arc<Self>) {
        let state = self.state.clone();
        let hub = self.hub.clone();
        self.scheduler.add_callback(move |result: BuildResult| {
            let state = state.clone();
            let hub = hub.clone();
            tokio::spawn(async move {
                {
                    let mut guard = state.write().await;
                    if result.success {
                        guard.last_errors.clear();
                    } else {
                        guard.last_errors = result.errors.clone();
                    }
                    guard.results.insert(result.component.clone(), result.clone());
                }

                let envelope = if result.success {
                    MessageEnvelope::new(EnvelopeKind::BuildSuccess).with_target(result.component.clone())
                } else {
                    let summary = result
                        .errors
                        .first()
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| "build failed".to_string());
                    MessageEnvelope::new(EnvelopeKind::BuildError)
                        .with_target(result.component.clone())
                        .with_content(summary)
                };
                hub.publish(envelope).await;
            });
        });
    }

    /// Start the scheduler workers and perform the initial full scan.
    pub async fn start(self: &Arc<Self>) {
        let handles = self.scheduler.start();
        *self.scheduler_handles.lock().unwrap() = handles;

        for component in self.classifier.known_components() {
            self.scheduler
                .enqueue(BuildRequest::new(component, Priority::Normal, Vec::new()))
                .await;
        }
    }

    /// Register filters/handlers on the watcher and start it (§4.8).
    pub async fn attach_watcher(self: &Arc<Self>, watcher: &mut dyn FileWatcher) -> notify::Result<()> {
        let orchestrator = self.clone();
        watcher.add_handler(Arc::new(move |events: &[FileEvent]| {
            let orchestrator = orchestrator.clone();
            let events = events.to_vec();
            tokio::spawn(async move {
                orchestrator.on_change_batch(&events).await;
            });
        }));
        watcher.start(self.shutdown.clone()).await
    }

    /// Translate a batched change-event set into scheduler enqueues
    /// (§4.8): template-language files rebuild one component, general
    /// files trigger a full rebuild.
    async fn on_change_batch(&self, events: &[FileEvent]) {
        if events.is_empty() {
            return;
        }

        let mut full_rebuild = false;
        let mut targeted: Vec<String> = Vec::new();

        for event in events {
            if matches!(event.kind, FileEventKind::Remove) {
                continue;
            }
            match self.classifier.classify(&event.path) {
                Some(component) => targeted.push(component),
                None => full_rebuild = true,
            }
        }

        if full_rebuild {
            for component in self.classifier.known_components() {
                self.scheduler
                    .enqueue(BuildRequest::new(component, Priority::High, Vec::new()))
                    .await;
            }
        } else {
            for component in targeted {
                self.scheduler
                    .enqueue(BuildRequest::new(component, Priority::High, Vec::new()))
                    .await;
            }
        }

        let summary = events
            .first()
            .map(|e| e.path.display().to_string())
            .unwrap_or_default();
        self.hub
            .publish(MessageEnvelope::new(EnvelopeKind::FileChange).with_content(summary))
            .await;
    }

    /// Defensive copy of the most recent build error list.
    pub async fn last_build_errors(&self) -> Vec<BuildError> {
        self.state.read().await.last_errors.clone()
    }

    pub fn build_metrics(&self) -> BuildMetrics {
        self.scheduler.metrics()
    }

    pub async fn component_count(&self) -> usize {
        self.state.read().await.results.len().max(self.classifier.known_components().len())
    }

    pub async fn connected_subscribers(&self) -> usize {
        self.hub.connected_subscribers().await
    }

    pub async fn last_build_status(&self) -> (bool, usize) {
        let guard = self.state.read().await;
        let healthy = guard.last_errors.is_empty();
        (healthy, guard.last_errors.len())
    }

    /// Tear down the scheduler under this orchestrator's shutdown deadline
    /// (§4.10: scheduler is torn down before the watcher/hub).
    pub async fn stop(&self) {
        let handles = std::mem::take(&mut *self.scheduler_handles.lock().unwrap());
        self.scheduler.stop(handles, self.shutdown_deadline).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scheduler::BuildOperation;
    use async_trait::async_trait;

    struct NoopBuild;

    #[async_trait]
    impl BuildOperation for NoopBuild {
        async fn build(&self, _component: &str) -> Result<(), Vec<BuildError>> {
            Ok(())
        }
    }

    struct FixedClassifier {
        components: Vec<String>,
    }

    impl ChangeClassifier for FixedClassifier {
        fn classify(&self, path: &Path) -> Option<String> {
            if path.extension().map(|e| e == "tmpl").unwrap_or(false) {
                path.file_stem().map(|s| s.to_string_lossy().to_string())
            } else {
                None
            }
        }

        fn known_components(&self) -> Vec<String> {
            self.components.clone()
        }
    }

    fn build_orchestrator() -> Arc<Orchestrator> {
        let shutdown = CancellationToken::new();
        let scheduler = BuildScheduler::new(1, Duration::from_secs(1), Arc::new(NoopBuild), shutdown.clone());
        let (hub, _join) = BroadcastHub::spawn(shutdown.clone(), DEFAULT_DROP_THRESHOLD);
        let classifier = Arc::new(FixedClassifier {
            components: vec!["Card".to_string(), "Button".to_string()],
        });
        Orchestrator::new(scheduler, hub, classifier, shutdown, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn initial_start_enqueues_all_known_components() {
        let orchestrator = build_orchestrator();
        orchestrator.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(orchestrator.build_metrics().total, 2);
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn template_change_triggers_targeted_rebuild() {
        let orchestrator = build_orchestrator();
        orchestrator.start().await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        orchestrator
            .on_change_batch(&[FileEvent {
                path: "Card.tmpl".into(),
                kind: FileEventKind::Write,
            }])
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(orchestrator.component_count().await, 2);
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn general_file_change_triggers_full_rebuild() {
        let orchestrator = build_orchestrator();
        orchestrator.start().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let before = orchestrator.build_metrics().total;

        orchestrator
            .on_change_batch(&[FileEvent {
                path: "lib.rs".into(),
                kind: FileEventKind::Write,
            }])
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(orchestrator.build_metrics().total >= before + 2);
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn last_build_errors_clears_on_success() {
        let orchestrator = build_orchestrator();
        orchestrator.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(orchestrator.last_build_errors().await.is_empty());
        orchestrator.stop().await;
    }
}
