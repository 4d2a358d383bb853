//! FileWatcher contract and its `notify`-backed default adapter (§4.7).

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Normalized change-event kind (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Create,
    Write,
    Remove,
    Rename,
}

#[derive(Debug, Clone)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
}

pub type PathFilter = Arc<dyn Fn(&Path) -> bool + Send + Sync>;
pub type BatchHandler = Arc<dyn Fn(&[FileEvent]) + Send + Sync>;

/// The watcher interface the orchestrator consumes; the concrete scanning
/// implementation is an external collaborator, specified only at this
/// boundary (§4.7).
#[async_trait]
pub trait FileWatcher: Send + Sync {
    /// Stackable path predicates; all must pass for an event to be
    /// delivered.
    fn add_filter(&mut self, predicate: PathFilter);
    /// Receives coalesced batches of change events.
    fn add_handler(&mut self, handler: BatchHandler);
    /// Watch a directory subtree recursively.
    fn add_recursive(&mut self, path: PathBuf) -> notify::Result<()>;
    async fn start(&mut self, shutdown: CancellationToken) -> notify::Result<()>;
    async fn stop(&mut self);
}

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(300);

/// Default adapter backed by the `notify` crate, debouncing raw filesystem
/// events into batches on a fixed window.
pub struct NotifyFileWatcher {
    filters: Vec<PathFilter>,
    handlers: Vec<BatchHandler>,
    watched_paths: Vec<PathBuf>,
    inner: Option<RecommendedWatcher>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Default for NotifyFileWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyFileWatcher {
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
            handlers: Vec::new(),
            watched_paths: Vec::new(),
            inner: None,
            task: None,
        }
    }

    fn passes_filters(&self, path: &Path) -> bool {
        self.filters.iter().all(|f| f(path))
    }

    fn normalize(event: Event) -> Vec<FileEvent> {
        let kind = match event.kind {
            EventKind::Create(_) => FileEventKind::Create,
            EventKind::Modify(notify::event::ModifyKind::Name(_)) => FileEventKind::Rename,
            EventKind::Modify(_) => FileEventKind::Write,
            EventKind::Remove(_) => FileEventKind::Remove,
            _ => return Vec::new(),
        };
        event.paths.into_iter().map(|path| FileEvent { path, kind }).collect()
    }
}

#[async_trait]
impl FileWatcher for NotifyFileWatcher {
    fn add_filter(&mut self, predicate: PathFilter) {
        self.filters.push(predicate);
    }

    fn add_handler(&mut self, handler: BatchHandler) {
        self.handlers.push(handler);
    }

    fn add_recursive(&mut self, path: PathBuf) -> notify::Result<()> {
        self.watched_paths.push(path);
        Ok(())
    }

    async fn start(&mut self, shutdown: CancellationToken) -> notify::Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                if let Ok(event) = result {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        )?;

        for path in &self.watched_paths {
            watcher.watch(path, RecursiveMode::Recursive)?;
        }
        self.inner = Some(watcher);

        let filters = self.filters.clone();
        let handlers = self.handlers.clone();
        let batch = Arc::new(Mutex::new(Vec::<FileEvent>::new()));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DEBOUNCE_WINDOW);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        for normalized in NotifyFileWatcher::normalize_static(event) {
                            if filters.iter().all(|f| f(&normalized.path)) {
                                batch.lock().unwrap().push(normalized);
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        let drained: Vec<FileEvent> = {
                            let mut guard = batch.lock().unwrap();
                            std::mem::take(&mut *guard)
                        };
                        if !drained.is_empty() {
                            for handler in &handlers {
                                handler(&drained);
                            }
                        }
                    }
                }
            }
        });

        self.task = Some(task);
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.inner = None;
    }
}

impl NotifyFileWatcher {
    fn normalize_static(event: Event) -> Vec<FileEvent> {
        Self::normalize(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_rejects_non_matching_paths() {
        let mut watcher = NotifyFileWatcher::new();
        watcher.add_filter(Arc::new(|p: &Path| {
            p.extension().map(|e| e == "tmpl").unwrap_or(false)
        }));
        assert!(!watcher.passes_filters(Path::new("foo.rs")));
        assert!(watcher.passes_filters(Path::new("foo.tmpl")));
    }

    #[test]
    fn all_filters_must_pass() {
        let mut watcher = NotifyFileWatcher::new();
        watcher.add_filter(Arc::new(|_: &Path| true));
        watcher.add_filter(Arc::new(|_: &Path| false));
        assert!(!watcher.passes_filters(Path::new("anything")));
    }

    #[test]
    fn normalizes_create_event() {
        let event = Event {
            kind: EventKind::Create(notify::event::CreateKind::File),
            paths: vec![PathBuf::from("a.tmpl")],
            attrs: Default::default(),
        };
        let normalized = NotifyFileWatcher::normalize(event);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].kind, FileEventKind::Create);
    }
}
