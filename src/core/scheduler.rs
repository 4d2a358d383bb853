//! BuildScheduler: worker pool, deduplication, priority, and a
//! content-addressed cache (§4.6).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::core::types::{BuildError, BuildRequest, BuildResult, Priority};

/// The external build operation (scanner/renderer) -- the scheduler only
/// calls through this trait and never owns the rendering pipeline itself.
#[async_trait]
pub trait BuildOperation: Send + Sync {
    async fn build(&self, component: &str) -> Result<(), Vec<BuildError>>;
}

struct CachedEntry {
    result: BuildResult,
}

/// Snapshot of scheduler counters (§4.6 getMetrics, plus the BuildMetrics
/// supplement: cache hit/miss split and average duration).
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BuildMetrics {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub avg_duration_ms: u64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

type Callback = Arc<dyn Fn(BuildResult) + Send + Sync>;

struct Queues {
    priority: VecDeque<BuildRequest>,
    normal: VecDeque<BuildRequest>,
}

/// Transforms a stream of per-component build requests into a stream of
/// [`BuildResult`]s via `W` worker tasks.
///
/// Callback dispatch is decoupled from the worker hot path: workers push
/// finished results onto an unbounded channel and a single dedicated
/// dispatcher task drains it and invokes callbacks, so a slow callback never
/// stalls a build worker (§4.6).
pub struct BuildScheduler {
    workers: usize,
    build_timeout: Duration,
    operation: Arc<dyn BuildOperation>,
    queues: Arc<Mutex<Queues>>,
    queued: DashMap<String, ()>,
    in_flight: DashMap<String, ()>,
    re_request: DashMap<String, Priority>,
    cache: DashMap<String, CachedEntry>,
    callbacks: std::sync::Mutex<Vec<Callback>>,
    dispatch_tx: mpsc::UnboundedSender<BuildResult>,
    dispatch_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<BuildResult>>>,
    notify: Arc<Notify>,
    shutdown: CancellationToken,
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    duration_sum_ms: AtomicU64,
}

impl BuildScheduler {
    pub fn new(
        workers: usize,
        build_timeout: Duration,
        operation: Arc<dyn BuildOperation>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            workers: workers.max(1),
            build_timeout,
            operation,
            queues: Arc::new(Mutex::new(Queues {
                priority: VecDeque::new(),
                normal: VecDeque::new(),
            })),
            queued: DashMap::new(),
            in_flight: DashMap::new(),
            re_request: DashMap::new(),
            cache: DashMap::new(),
            callbacks: std::sync::Mutex::new(Vec::new()),
            dispatch_tx,
            dispatch_rx: std::sync::Mutex::new(Some(dispatch_rx)),
            notify: Arc::new(Notify::new()),
            shutdown,
            total: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            duration_sum_ms: AtomicU64::new(0),
        })
    }

    /// §4.6 enqueue: in-flight requests are marked for re-request rather
    /// than duplicated; already-queued requests are a no-op.
    pub async fn enqueue(&self, request: BuildRequest) {
        if self.in_flight.contains_key(&request.component) {
            self.re_request.insert(request.component, request.priority);
            return;
        }
        if self.queued.contains_key(&request.component) {
            return;
        }
        self.queued.insert(request.component.clone(), ());

        let mut queues = self.queues.lock().await;
        match request.priority {
            Priority::High => queues.priority.push_back(request),
            Priority::Normal => queues.normal.push_back(request),
        }
        drop(queues);
        self.notify.notify_one();
    }

    /// Registers synchronously: by the time this returns, the callback is
    /// live for any result dispatched afterwards. A caller that registers
    /// then immediately enqueues cannot race the dispatcher.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: Fn(BuildResult) + Send + Sync + 'static,
    {
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(callback));
    }

    pub fn metrics(&self) -> BuildMetrics {
        let total = self.total.load(Ordering::Relaxed);
        let avg = if total == 0 {
            0
        } else {
            self.duration_sum_ms.load(Ordering::Relaxed) / total
        };
        BuildMetrics {
            total,
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            avg_duration_ms: avg,
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            entries: self.cache.len(),
            hits: self.cache_hits.load(Ordering::Relaxed),
            misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }

    /// Clears the cache and resets hit/miss counters, returning the
    /// pre-clear snapshot (SPEC_FULL.md `/api/build/cache` DELETE
    /// supplement).
    pub fn clear_cache(&self) -> CacheStats {
        let snapshot = self.cache_stats();
        self.cache.clear();
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        snapshot
    }

    fn cache_key(component: &str, fingerprint: &[u8]) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(component.as_bytes());
        hasher.update(fingerprint);
        hasher.finalize().to_hex().to_string()
    }

    /// Launch `W` worker tasks plus the dedicated callback dispatcher
    /// (§4.6 start).
    pub fn start(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles: Vec<_> = (0..self.workers)
            .map(|worker_id| {
                let scheduler = self.clone();
                tokio::spawn(scheduler.worker_loop(worker_id))
            })
            .collect();

        let rx = self
            .dispatch_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(rx) = rx {
            let scheduler = self.clone();
            handles.push(tokio::spawn(scheduler.dispatch_loop(rx)));
        }

        handles
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        loop {
            let request = self.dequeue().await;
            let request = match request {
                Some(request) => request,
                None => {
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    continue;
                }
            };

            self.queued.remove(&request.component);
            self.in_flight.insert(request.component.clone(), ());

            let result = self.run_one(&request).await;
            let _ = self.dispatch_tx.send(result);

            self.in_flight.remove(&request.component);
            if let Some((_, priority)) = self.re_request.remove(&request.component) {
                let requeued = BuildRequest::new(request.component.clone(), priority, request.inputs_fingerprint.clone());
                self.enqueue(requeued).await;
            }

            tracing::trace!(worker_id, component = %request.component, "build cycle complete");
        }
    }

    async fn dequeue(&self) -> Option<BuildRequest> {
        loop {
            {
                let mut queues = self.queues.lock().await;
                if let Some(request) = queues.priority.pop_front() {
                    return Some(request);
                }
                if let Some(request) = queues.normal.pop_front() {
                    return Some(request);
                }
            }

            tokio::select! {
                _ = self.notify.notified() => continue,
                _ = self.shutdown.cancelled() => return None,
            }
        }
    }

    async fn run_one(&self, request: &BuildRequest) -> BuildResult {
        self.total.fetch_add(1, Ordering::Relaxed);
        let key = Self::cache_key(&request.component, &request.inputs_fingerprint);

        if let Some(entry) = self.cache.get(&key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            self.succeeded.fetch_add(1, Ordering::Relaxed);
            let mut result = entry.result.clone();
            result.cache_hit = true;
            result.produced_at = chrono::Utc::now();
            return result;
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.build_timeout, self.operation.build(&request.component)).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        self.duration_sum_ms.fetch_add(duration_ms, Ordering::Relaxed);

        let result = match outcome {
            Ok(Ok(())) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                BuildResult {
                    component: request.component.clone(),
                    success: true,
                    errors: Vec::new(),
                    duration_ms,
                    cache_hit: false,
                    produced_at: chrono::Utc::now(),
                }
            }
            Ok(Err(errors)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                BuildResult {
                    component: request.component.clone(),
                    success: false,
                    errors,
                    duration_ms,
                    cache_hit: false,
                    produced_at: chrono::Utc::now(),
                }
            }
            Err(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                BuildResult {
                    component: request.component.clone(),
                    success: false,
                    errors: vec![BuildError {
                        file: request.component.clone(),
                        line: 0,
                        column: 0,
                        message: "timeout".to_string(),
                    }],
                    duration_ms,
                    cache_hit: false,
                    produced_at: chrono::Utc::now(),
                }
            }
        };

        if result.success {
            self.cache.insert(key, CachedEntry { result: result.clone() });
        }

        result
    }

    fn dispatch(&self, result: BuildResult) {
        let callbacks = self
            .callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for callback in callbacks.iter() {
            callback(result.clone());
        }
    }

    /// Drains dispatched results and invokes callbacks, off the worker hot
    /// path. Keeps draining after shutdown is signalled so results already
    /// in the channel are not silently lost.
    async fn dispatch_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<BuildResult>) {
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(result) => self.dispatch(result),
                    None => break,
                },
                _ = self.shutdown.cancelled() => {
                    while let Ok(result) = rx.try_recv() {
                        self.dispatch(result);
                    }
                    break;
                }
            }
        }
    }

    /// Signal workers to stop, wait for completion, and flush callbacks
    /// (§4.6 stop / §4.10 ordered shutdown).
    pub async fn stop(&self, handles: Vec<tokio::task::JoinHandle<()>>, deadline: Duration) {
        self.shutdown.cancel();
        self.notify.notify_waiters();
        let _ = tokio::time::timeout(deadline, futures::future::join_all(handles)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct AlwaysSucceeds;

    #[async_trait]
    impl BuildOperation for AlwaysSucceeds {
        async fn build(&self, _component: &str) -> Result<(), Vec<BuildError>> {
            Ok(())
        }
    }

    struct CountingBuilds(Arc<AtomicUsize>);

    #[async_trait]
    impl BuildOperation for CountingBuilds {
        async fn build(&self, _component: &str) -> Result<(), Vec<BuildError>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn enqueue_and_build_reports_success() {
        let scheduler = BuildScheduler::new(
            2,
            Duration::from_secs(1),
            Arc::new(AlwaysSucceeds),
            CancellationToken::new(),
        );
        let results = Arc::new(Mutex::new(Vec::new()));
        let results_clone = results.clone();
        scheduler.add_callback(move |result| {
            let results = results_clone.clone();
            tokio::spawn(async move {
                results.lock().await.push(result);
            });
        });
        let handles = scheduler.start();

        scheduler
            .enqueue(BuildRequest::new("Card", Priority::Normal, vec![1, 2, 3]))
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.metrics().total, 1);
        assert_eq!(scheduler.metrics().succeeded, 1);

        scheduler.stop(handles, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn concurrent_enqueues_for_same_component_dedup_to_one_inflight_build() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = BuildScheduler::new(
            1,
            Duration::from_secs(1),
            Arc::new(CountingBuilds(counter.clone())),
            CancellationToken::new(),
        );
        let handles = scheduler.start();

        for _ in 0..100 {
            scheduler
                .enqueue(BuildRequest::new("Card", Priority::Normal, vec![]))
                .await;
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        // At most one in-flight build plus at most one re-requested follow-up.
        assert!(counter.load(Ordering::SeqCst) <= 2);

        scheduler.stop(handles, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn cache_hit_on_second_identical_request() {
        let scheduler = BuildScheduler::new(
            1,
            Duration::from_secs(1),
            Arc::new(AlwaysSucceeds),
            CancellationToken::new(),
        );
        let handles = scheduler.start();

        scheduler
            .enqueue(BuildRequest::new("Card", Priority::Normal, vec![9]))
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        scheduler
            .enqueue(BuildRequest::new("Card", Priority::Normal, vec![9]))
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(scheduler.metrics().cache_hits, 1);
        scheduler.stop(handles, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn clear_cache_returns_pre_clear_snapshot() {
        let scheduler = BuildScheduler::new(
            1,
            Duration::from_secs(1),
            Arc::new(AlwaysSucceeds),
            CancellationToken::new(),
        );
        let handles = scheduler.start();
        scheduler
            .enqueue(BuildRequest::new("Card", Priority::Normal, vec![1]))
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let snapshot = scheduler.clear_cache();
        assert_eq!(snapshot.entries, 1);
        assert_eq!(scheduler.cache_stats().entries, 0);

        scheduler.stop(handles, Duration::from_secs(1)).await;
    }
}
