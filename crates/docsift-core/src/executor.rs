//! Bounded worker pool over a shared task queue.
//!
//! Each phase pushes its tasks onto an `async_channel` queue and spawns a
//! fixed number of workers that claim tasks one at a time until the queue is
//! drained. A claimed task is never handed back: whatever happens to it ends
//! in exactly one [`TaskResult`]. The phase deadline cancels a child
//! [`CancellationToken`]; workers stop claiming, in-flight calls are dropped,
//! and every task without a result is filled with [`TaskOutcome::Timeout`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::cache::TieredCache;
use crate::credentials::CredentialPool;
use crate::inference::InferenceBackend;
use crate::partition::{CostClass, PartitionTask, TaskId, TaskRange};
use crate::rate_limit::{BackoffConfig, ErrorKind, RateLimiters, backoff_delay, classify_error};
use crate::source::{FsSourceStore, SourceStore};
use crate::{JobId, ProgressEvent};

/// Retry, timeout and budget settings for the worker pool.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Calls per task before giving up with an error marker.
    pub max_attempts: u32,
    /// Wall-clock ceiling for one task, retries included.
    pub task_timeout: Duration,
    pub large_deadline: Duration,
    pub medium_deadline: Duration,
    pub small_deadline: Duration,
    /// Characters one job may accumulate before its remaining tasks are skipped.
    pub max_job_chars: usize,
    /// Characters the whole run may accumulate. Gates the medium and small
    /// phases; `None` never skips a phase.
    pub total_char_budget: Option<usize>,
    pub backoff: BackoffConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            task_timeout: Duration::from_secs(120),
            large_deadline: Duration::from_secs(300),
            medium_deadline: Duration::from_secs(180),
            small_deadline: Duration::from_secs(120),
            max_job_chars: 300_000,
            total_char_budget: None,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn phase_deadline(&self, class: CostClass) -> Duration {
        match class {
            CostClass::Large => self.large_deadline,
            CostClass::Medium => self.medium_deadline,
            CostClass::Small => self.small_deadline,
        }
    }
}

/// What one task produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success(String),
    /// The task or its phase ran out of time.
    Timeout,
    /// Retries exhausted, permanent failure, or cancellation.
    Error(String),
    /// Skipped because a character budget was already spent.
    Truncated,
}

/// [`TaskOutcome`] without its payload, for progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    Timeout,
    Error,
    Truncated,
}

impl TaskOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            TaskOutcome::Success(_) => OutcomeKind::Success,
            TaskOutcome::Timeout => OutcomeKind::Timeout,
            TaskOutcome::Error(_) => OutcomeKind::Error,
            TaskOutcome::Truncated => OutcomeKind::Truncated,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success(_))
    }
}

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub id: TaskId,
    /// Start page, or 0 for a whole-document task.
    pub position: u32,
    pub range: TaskRange,
    pub outcome: TaskOutcome,
    pub completed_at: Instant,
}

impl TaskResult {
    fn new(id: TaskId, range: TaskRange, outcome: TaskOutcome) -> Self {
        Self {
            id,
            position: range.position(),
            range,
            outcome,
            completed_at: Instant::now(),
        }
    }
}

/// One scheduling round: tasks of similar cost sharing a worker pool.
#[derive(Debug, Clone)]
pub struct Phase {
    pub class: CostClass,
    pub tasks: Vec<PartitionTask>,
    pub workers: usize,
    pub deadline: Duration,
}

type ProgressFn = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Runs partition tasks against the inference backend.
///
/// Cloning is cheap; all clones share the pool, cache and budget counters.
#[derive(Clone)]
pub struct Executor {
    backend: Arc<dyn InferenceBackend>,
    pool: Arc<CredentialPool>,
    limiters: Arc<RateLimiters>,
    cache: Option<Arc<TieredCache>>,
    store: Arc<dyn SourceStore>,
    config: Arc<ExecutorConfig>,
    prompt: Arc<str>,
    progress: ProgressFn,
    job_chars: Arc<DashMap<JobId, usize>>,
    total_chars: Arc<AtomicUsize>,
}

impl Executor {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        pool: Arc<CredentialPool>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            backend,
            pool,
            limiters: Arc::new(RateLimiters::disabled()),
            cache: None,
            store: Arc::new(FsSourceStore),
            config: Arc::new(config),
            prompt: Arc::from(crate::DEFAULT_PROMPT),
            progress: Arc::new(|_: ProgressEvent| {}),
            job_chars: Arc::new(DashMap::new()),
            total_chars: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_limiters(mut self, limiters: Arc<RateLimiters>) -> Self {
        self.limiters = limiters;
        self
    }

    pub fn with_cache(mut self, cache: Option<Arc<TieredCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SourceStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.prompt = Arc::from(prompt);
        self
    }

    /// Called inline on worker tasks, so it must not block. The engine
    /// passes a channel sender.
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = progress;
        self
    }

    /// Characters accumulated so far by `job`.
    pub fn job_chars(&self, job: &JobId) -> usize {
        self.job_chars.get(job).map(|c| *c).unwrap_or(0)
    }

    /// Characters accumulated so far by the whole run.
    pub fn total_chars(&self) -> usize {
        self.total_chars.load(Ordering::Relaxed)
    }

    /// Run phases in order, skipping those the character budget rules out.
    ///
    /// Returns exactly one result per task across all phases.
    pub async fn run_phased(
        &self,
        phases: Vec<Phase>,
        cancel: &CancellationToken,
    ) -> HashMap<TaskId, TaskResult> {
        let mut all = HashMap::new();
        for phase in phases {
            if phase.tasks.is_empty() {
                continue;
            }
            let count = phase.tasks.len();

            if let Some(reason) = self.skip_reason(phase.class) {
                tracing::info!(class = ?phase.class, tasks = count, reason = %reason, "phase skipped");
                (self.progress)(ProgressEvent::PhaseSkipped {
                    class: phase.class,
                    tasks: count,
                    reason: reason.clone(),
                });
                for task in phase.tasks {
                    all.insert(
                        task.id.clone(),
                        TaskResult::new(task.id, task.range, TaskOutcome::Truncated),
                    );
                }
                continue;
            }

            tracing::info!(
                class = ?phase.class,
                tasks = count,
                workers = phase.workers,
                deadline_secs = phase.deadline.as_secs(),
                "phase started"
            );
            (self.progress)(ProgressEvent::PhaseStarted {
                class: phase.class,
                tasks: count,
                workers: phase.workers,
            });

            let start = Instant::now();
            let results = self
                .run_partitions(phase.tasks, phase.workers, phase.deadline, cancel)
                .await;
            let timed_out = results
                .values()
                .filter(|r| r.outcome == TaskOutcome::Timeout)
                .count();
            let elapsed = start.elapsed();

            tracing::info!(
                class = ?phase.class,
                completed = results.len() - timed_out,
                timed_out,
                elapsed_ms = elapsed.as_millis() as u64,
                "phase finished"
            );
            (self.progress)(ProgressEvent::PhaseFinished {
                class: phase.class,
                completed: results.len() - timed_out,
                timed_out,
                elapsed,
            });
            all.extend(results);
        }
        all
    }

    /// Medium work runs only below 80% of the run budget, small below 90%.
    fn skip_reason(&self, class: CostClass) -> Option<String> {
        let budget = self.config.total_char_budget?;
        let ratio = match class {
            CostClass::Large => return None,
            CostClass::Medium => 0.8,
            CostClass::Small => 0.9,
        };
        let used = self.total_chars();
        if used as f64 >= budget as f64 * ratio {
            Some(format!(
                "{used} of {budget} characters used (limit {:.0}%)",
                ratio * 100.0
            ))
        } else {
            None
        }
    }

    /// Run `tasks` on `workers` workers, giving up on whatever is left after `deadline`.
    pub async fn run_partitions(
        &self,
        tasks: Vec<PartitionTask>,
        workers: usize,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> HashMap<TaskId, TaskResult> {
        let expected: Vec<(TaskId, TaskRange)> =
            tasks.iter().map(|t| (t.id.clone(), t.range)).collect();

        let (tx, rx) = async_channel::unbounded::<PartitionTask>();
        for task in tasks {
            // Unbounded and we hold a receiver, so this can't fail.
            let _ = tx.try_send(task);
        }
        drop(tx);

        let phase = cancel.child_token();
        let mut handles = Vec::with_capacity(workers.max(1));
        for worker in 0..workers.max(1) {
            let rx = rx.clone();
            let exec = self.clone();
            let phase = phase.clone();
            handles.push(tokio::spawn(async move {
                let mut done = Vec::new();
                while let Ok(task) = rx.recv().await {
                    if phase.is_cancelled() {
                        break;
                    }
                    let id = task.id.clone();
                    tokio::select! {
                        biased;
                        _ = phase.cancelled() => {
                            tracing::debug!(worker, task = %id, "in-flight task dropped");
                            break;
                        }
                        result = exec.run_task(task) => done.push(result),
                    }
                }
                done
            }));
        }
        drop(rx);

        let mut join = std::pin::pin!(async move {
            let mut done = Vec::new();
            for handle in handles {
                match handle.await {
                    Ok(results) => done.extend(results),
                    Err(e) => tracing::warn!(error = %e, "extraction worker failed"),
                }
            }
            done
        });
        let done = tokio::select! {
            done = &mut join => done,
            _ = tokio::time::sleep(deadline) => {
                tracing::warn!(deadline_secs = deadline.as_secs(), "phase deadline reached, cancelling remaining tasks");
                phase.cancel();
                join.await
            }
        };

        let mut results: HashMap<TaskId, TaskResult> =
            done.into_iter().map(|r| (r.id.clone(), r)).collect();

        let cancelled = cancel.is_cancelled();
        for (id, range) in expected {
            if results.contains_key(&id) {
                continue;
            }
            let outcome = if cancelled {
                TaskOutcome::Error("cancelled".to_string())
            } else {
                TaskOutcome::Timeout
            };
            (self.progress)(ProgressEvent::TaskCompleted {
                task: id.clone(),
                range,
                outcome: outcome.kind(),
                cached: false,
                elapsed: Duration::ZERO,
            });
            results.insert(id.clone(), TaskResult::new(id, range, outcome));
        }
        results
    }

    /// Process one claimed task to a result. Never fails.
    async fn run_task(&self, task: PartitionTask) -> TaskResult {
        let start = Instant::now();
        (self.progress)(ProgressEvent::TaskStarted {
            task: task.id.clone(),
            range: task.range,
        });

        let (outcome, cached) = if self.job_chars(&task.id.job) >= self.config.max_job_chars {
            tracing::debug!(task = %task.id, "job character budget reached, skipping");
            (TaskOutcome::Truncated, false)
        } else {
            match tokio::time::timeout(self.config.task_timeout, self.process(&task)).await {
                Ok(r) => r,
                Err(_) => {
                    tracing::warn!(task = %task.id, range = %task.range, "task timed out");
                    (TaskOutcome::Timeout, false)
                }
            }
        };

        if let TaskOutcome::Success(ref text) = outcome {
            let n = text.chars().count();
            *self.job_chars.entry(task.id.job.clone()).or_insert(0) += n;
            self.total_chars.fetch_add(n, Ordering::Relaxed);
        }

        let elapsed = start.elapsed();
        tracing::debug!(
            task = %task.id,
            range = %task.range,
            outcome = ?outcome.kind(),
            cached,
            elapsed_ms = elapsed.as_millis() as u64,
            "task finished"
        );
        (self.progress)(ProgressEvent::TaskCompleted {
            task: task.id.clone(),
            range: task.range,
            outcome: outcome.kind(),
            cached,
            elapsed,
        });
        TaskResult::new(task.id, task.range, outcome)
    }

    /// Cache lookup, payload load, inference call, cache store.
    async fn process(&self, task: &PartitionTask) -> (TaskOutcome, bool) {
        let prefix = task.range.cache_prefix();

        if let Some(cache) = self.cache.clone() {
            let store = Arc::clone(&self.store);
            let source = task.source.clone();
            let prefix = prefix.clone();
            let hit = tokio::task::spawn_blocking(move || cache.get_from(&*store, &source, &prefix))
                .await
                .ok()
                .flatten();
            if let Some(text) = hit {
                return (TaskOutcome::Success(text), true);
            }
        }

        let payload = match self.load_payload(&task.source, task.range).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(task = %task.id, error = %e, "payload error");
                return (TaskOutcome::Error(format!("payload error: {e}")), false);
            }
        };

        match self.call_with_retry(&task.id, &payload).await {
            Ok(text) => {
                if let Some(cache) = self.cache.clone() {
                    let store = Arc::clone(&self.store);
                    let source = task.source.clone();
                    let content = text.clone();
                    let stored = tokio::task::spawn_blocking(move || {
                        cache.set_from(&*store, &source, &prefix, &content)
                    })
                    .await;
                    match stored {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::warn!(task = %task.id, error = %e, "failed to cache result"),
                        Err(e) => tracing::warn!(task = %task.id, error = %e, "cache write task failed"),
                    }
                }
                (TaskOutcome::Success(text), false)
            }
            Err(msg) => (TaskOutcome::Error(msg), false),
        }
    }

    async fn load_payload(&self, source: &Path, range: TaskRange) -> Result<Vec<u8>, String> {
        let store = Arc::clone(&self.store);
        let path = source.to_path_buf();
        tokio::task::spawn_blocking(move || match range {
            TaskRange::Whole => store.read(&path),
            TaskRange::Pages { start, end } => store.read_pages(&path, start, end),
        })
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())
    }

    /// Call the backend through the credential pool, retrying per [`ErrorKind`].
    async fn call_with_retry(&self, task: &TaskId, payload: &[u8]) -> Result<String, String> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::from("no attempt made");

        for attempt in 0..max_attempts {
            let Some(handle) = self.pool.acquire() else {
                return Err("no API credentials configured".to_string());
            };
            if let Some(limiter) = self.limiters.get(handle.id) {
                limiter.acquire().await;
            }

            let start = Instant::now();
            let err = match self.backend.extract(&handle.key, payload, &self.prompt).await {
                Ok(text) => {
                    self.pool.report_success(handle.id, start.elapsed());
                    return Ok(text);
                }
                Err(e) => e,
            };

            let kind = classify_error(&err);
            last_error = err.to_string();
            if kind == ErrorKind::Permanent {
                tracing::debug!(task = %task, error = %last_error, "permanent failure, not retrying");
                return Err(last_error);
            }

            if self.pool.report_failure(handle.id, &last_error) {
                (self.progress)(ProgressEvent::CredentialBlacklisted {
                    credential: handle.id,
                });
            }
            if kind == ErrorKind::RateLimited
                && let Some(limiter) = self.limiters.get(handle.id)
            {
                limiter.on_rate_limited();
            }

            if attempt + 1 >= max_attempts {
                break;
            }
            let backoff = backoff_delay(kind, attempt, err.retry_after(), &self.config.backoff);
            tracing::debug!(
                task = %task,
                credential = handle.id,
                attempt = attempt + 1,
                kind = ?kind,
                backoff_ms = backoff.as_millis() as u64,
                error = %last_error,
                "retrying"
            );
            (self.progress)(ProgressEvent::Retry {
                task: task.clone(),
                credential: handle.id,
                attempt,
                kind,
                backoff,
            });
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }
        }

        tracing::warn!(task = %task, attempts = max_attempts, error = %last_error, "giving up");
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::mock::{MockBackend, MockResponse};
    use crate::source::SourceMeta;
    use docsift_pdf::PdfError;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Serves every path from one in-memory PDF.
    struct StaticStore(Vec<u8>);

    impl SourceStore for StaticStore {
        fn metadata(&self, _path: &Path) -> Result<SourceMeta, PdfError> {
            Ok(SourceMeta {
                size: self.0.len() as u64,
                mtime_ms: 0,
            })
        }

        fn read(&self, _path: &Path) -> Result<Vec<u8>, PdfError> {
            Ok(self.0.clone())
        }
    }

    fn executor(backend: MockBackend, keys: &[&str], config: ExecutorConfig) -> Executor {
        let pdf = docsift_pdf::fixture::document_with_pages(12).unwrap();
        Executor::new(
            Arc::new(backend),
            Arc::new(CredentialPool::new(keys, 3)),
            config,
        )
        .with_store(Arc::new(StaticStore(pdf)))
    }

    fn task(job: &str, ordinal: usize, range: TaskRange) -> PartitionTask {
        PartitionTask {
            id: TaskId {
                job: JobId(job.into()),
                ordinal,
            },
            source: PathBuf::from(format!("/docs/{job}.pdf")),
            range,
            class: CostClass::Small,
        }
    }

    fn range_tasks(job: &str, ranges: &[(u32, u32)]) -> Vec<PartitionTask> {
        ranges
            .iter()
            .enumerate()
            .map(|(i, &(start, end))| task(job, i, TaskRange::Pages { start, end }))
            .collect()
    }

    fn text(s: &str) -> MockResponse {
        MockResponse::Text(s.to_string())
    }

    #[tokio::test]
    async fn every_task_gets_one_result() {
        let exec = executor(MockBackend::new(MockResponse::PageCount), &["k1", "k2"], ExecutorConfig::default());
        let tasks = range_tasks("doc", &[(1, 3), (4, 6), (7, 9), (10, 12)]);
        let results = exec
            .run_partitions(tasks, 3, Duration::from_secs(60), &CancellationToken::new())
            .await;
        assert_eq!(results.len(), 4);
        for r in results.values() {
            assert_eq!(r.outcome, TaskOutcome::Success("pages 3".into()));
        }
    }

    #[tokio::test]
    async fn cache_keys_come_from_the_source_store() {
        // The store serves a path that doesn't exist on disk.
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(
            TieredCache::open(dir.path(), None, crate::CacheConfig::default()).unwrap(),
        );
        let backend = Arc::new(MockBackend::new(MockResponse::PageCount));
        let pdf = docsift_pdf::fixture::document_with_pages(3).unwrap();
        let exec = Executor::new(
            backend.clone(),
            Arc::new(CredentialPool::new(&["k1"], 3)),
            ExecutorConfig::default(),
        )
        .with_store(Arc::new(StaticStore(pdf)))
        .with_cache(Some(Arc::clone(&cache)));

        let first = exec.run_task(task("virtual", 0, TaskRange::Whole)).await;
        let second = exec.run_task(task("virtual", 0, TaskRange::Whole)).await;

        assert_eq!(first.outcome, TaskOutcome::Success("pages 3".into()));
        assert_eq!(second.outcome, first.outcome);
        assert_eq!(backend.call_count(), 1);
        assert_eq!(cache.stats().memory_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn phase_deadline_fills_timeouts() {
        let backend = MockBackend::new(text("slow")).with_delay(Duration::from_secs(30));
        let exec = executor(backend, &["k1"], ExecutorConfig::default());
        let tasks = range_tasks("doc", &[(1, 2), (3, 4), (5, 6), (7, 8), (9, 10)]);
        // Two workers, 45s: the first two finish at 30s, the next two are cut off.
        let results = exec
            .run_partitions(tasks, 2, Duration::from_secs(45), &CancellationToken::new())
            .await;
        assert_eq!(results.len(), 5);
        let ok = results.values().filter(|r| r.outcome.is_success()).count();
        let timeouts = results
            .values()
            .filter(|r| r.outcome == TaskOutcome::Timeout)
            .count();
        assert_eq!(ok, 2);
        assert_eq!(timeouts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn task_timeout_is_independent() {
        let backend = MockBackend::new(text("slow")).with_delay(Duration::from_secs(200));
        let config = ExecutorConfig {
            task_timeout: Duration::from_secs(10),
            ..ExecutorConfig::default()
        };
        let exec = executor(backend, &["k1"], config);
        let results = exec
            .run_partitions(
                vec![task("doc", 0, TaskRange::Whole)],
                1,
                Duration::from_secs(300),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(results.values().next().unwrap().outcome, TaskOutcome::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_retries_then_succeeds() {
        let backend = MockBackend::with_sequence(
            vec![MockResponse::RateLimited { retry_after: None }],
            text("done"),
        );
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let exec = executor(backend, &["k1", "k2"], ExecutorConfig::default()).with_progress(
            Arc::new(move |e: ProgressEvent| sink.lock().unwrap().push(e)),
        );
        let results = exec
            .run_partitions(
                vec![task("doc", 0, TaskRange::Whole)],
                1,
                Duration::from_secs(300),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(
            results.values().next().unwrap().outcome,
            TaskOutcome::Success("done".into())
        );
        let events = events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            ProgressEvent::Retry {
                kind: ErrorKind::RateLimited,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn invalid_credential_rotates_immediately() {
        let backend = MockBackend::new(text("ok")).with_key_override("bad", MockResponse::InvalidCredential);
        let exec = executor(backend, &["bad", "good"], ExecutorConfig::default());
        let start = Instant::now();
        let results = exec
            .run_partitions(
                vec![task("doc", 0, TaskRange::Whole)],
                1,
                Duration::from_secs(60),
                &CancellationToken::new(),
            )
            .await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(
            results.values().next().unwrap().outcome,
            TaskOutcome::Success("ok".into())
        );
        assert_eq!(exec.pool.status().credentials[0].failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_ceiling_yields_error_marker() {
        let backend = MockBackend::new(MockResponse::Error("connection reset".into()));
        let exec = executor(backend, &["k1"], ExecutorConfig::default());
        let results = exec
            .run_partitions(
                vec![task("doc", 0, TaskRange::Whole)],
                1,
                Duration::from_secs(300),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(
            results.values().next().unwrap().outcome,
            TaskOutcome::Error("connection reset".into())
        );
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let backend = Arc::new(MockBackend::new(MockResponse::Error("invalid pdf structure".into())));
        let exec = Executor::new(
            backend.clone(),
            Arc::new(CredentialPool::new(&["k1"], 3)),
            ExecutorConfig::default(),
        )
        .with_store(Arc::new(StaticStore(b"%PDF-1.5".to_vec())));
        let results = exec
            .run_partitions(
                vec![task("doc", 0, TaskRange::Whole)],
                1,
                Duration::from_secs(60),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(
            results.values().next().unwrap().outcome,
            TaskOutcome::Error(_)
        ));
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn payload_errors_become_error_markers() {
        let exec = executor(MockBackend::new(text("x")), &["k1"], ExecutorConfig::default());
        // Page 20 doesn't exist in the 12-page fixture.
        let results = exec
            .run_partitions(
                vec![task("doc", 0, TaskRange::Pages { start: 19, end: 20 })],
                1,
                Duration::from_secs(60),
                &CancellationToken::new(),
            )
            .await;
        match &results.values().next().unwrap().outcome {
            TaskOutcome::Error(msg) => assert!(msg.starts_with("payload error")),
            other => panic!("expected payload error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn job_budget_truncates_remaining_tasks() {
        let backend = Arc::new(MockBackend::new(text(&"x".repeat(100))));
        let config = ExecutorConfig {
            max_job_chars: 150,
            ..ExecutorConfig::default()
        };
        let exec = Executor::new(
            backend.clone(),
            Arc::new(CredentialPool::new(&["k1"], 3)),
            config,
        )
        .with_store(Arc::new(StaticStore(
            docsift_pdf::fixture::document_with_pages(8).unwrap(),
        )));
        // One worker processes tasks strictly in order.
        let tasks = range_tasks("doc", &[(1, 2), (3, 4), (5, 6), (7, 8)]);
        let results = exec
            .run_partitions(tasks, 1, Duration::from_secs(60), &CancellationToken::new())
            .await;
        let truncated = results
            .values()
            .filter(|r| r.outcome == TaskOutcome::Truncated)
            .count();
        assert_eq!(truncated, 2);
        assert_eq!(backend.call_count(), 2);
        assert_eq!(exec.job_chars(&JobId("doc".into())), 200);
    }

    #[tokio::test]
    async fn cancellation_marks_unfinished_tasks() {
        let exec = executor(MockBackend::new(text("x")), &["k1"], ExecutorConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let results = exec
            .run_partitions(
                range_tasks("doc", &[(1, 2), (3, 4)]),
                2,
                Duration::from_secs(60),
                &cancel,
            )
            .await;
        assert_eq!(results.len(), 2);
        for r in results.values() {
            assert_eq!(r.outcome, TaskOutcome::Error("cancelled".into()));
        }
    }

    #[tokio::test]
    async fn phased_budget_skips_later_phases() {
        let config = ExecutorConfig {
            total_char_budget: Some(100),
            ..ExecutorConfig::default()
        };
        let exec = executor(MockBackend::new(text(&"y".repeat(95))), &["k1"], config);
        let mut large = task("big", 0, TaskRange::Whole);
        large.class = CostClass::Large;
        let mut medium = task("mid", 0, TaskRange::Whole);
        medium.class = CostClass::Medium;
        let small = task("tiny", 0, TaskRange::Whole);
        let phase = |class, t: PartitionTask| Phase {
            class,
            tasks: vec![t],
            workers: 1,
            deadline: Duration::from_secs(60),
        };

        let results = exec
            .run_phased(
                vec![
                    phase(CostClass::Large, large.clone()),
                    phase(CostClass::Medium, medium.clone()),
                    phase(CostClass::Small, small.clone()),
                ],
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(results.len(), 3);
        assert!(results[&large.id].outcome.is_success());
        // 95 is past both the 80% and 90% marks
        assert_eq!(results[&medium.id].outcome, TaskOutcome::Truncated);
        assert_eq!(results[&small.id].outcome, TaskOutcome::Truncated);
    }

    #[tokio::test]
    async fn workers_share_the_queue() {
        let backend = Arc::new(MockBackend::new(text("z")));
        let exec = Executor::new(
            backend.clone(),
            Arc::new(CredentialPool::new(&["k1", "k2", "k3"], 3)),
            ExecutorConfig::default(),
        )
        .with_store(Arc::new(StaticStore(
            docsift_pdf::fixture::document_with_pages(12).unwrap(),
        )));
        let tasks = range_tasks(
            "doc",
            &[(1, 2), (3, 4), (5, 6), (7, 8), (9, 10), (11, 12)],
        );
        let results = exec
            .run_partitions(tasks, 6, Duration::from_secs(60), &CancellationToken::new())
            .await;
        assert_eq!(results.len(), 6);
        assert_eq!(backend.call_count(), 6);
        // Round-robin spreads calls over all three credentials.
        let mut keys = backend.keys_seen();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 3);
    }
}
