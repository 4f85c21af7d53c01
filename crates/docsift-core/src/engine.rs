//! Job driver: validate, partition, execute in phases, assemble.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::assemble::{self, AssembledDocument};
use crate::cache::{CacheStats, TieredCache};
use crate::credentials::{CredentialPool, PoolStatus};
use crate::executor::{Executor, Phase, TaskResult};
use crate::heartbeat::Heartbeat;
use crate::inference::InferenceBackend;
use crate::job::JobState;
use crate::partition::{self, CostClass, PartitionTask};
use crate::rate_limit::RateLimiters;
use crate::source::{FsSourceStore, SourceStore};
use crate::{Config, JobId, JobSpec, ProgressEvent};

/// Everything a run produced.
#[derive(Debug)]
pub struct ExtractionReport {
    /// One entry per submitted job id.
    pub documents: BTreeMap<JobId, AssembledDocument>,
    pub pool: PoolStatus,
    pub cache: Option<CacheStats>,
    pub elapsed: Duration,
}

impl ExtractionReport {
    pub fn count(&self, state: JobState) -> usize {
        self.documents.values().filter(|d| d.state == state).count()
    }
}

type ProgressFn = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// A job that passed validation and has been split into tasks.
struct PlannedJob {
    pages: Option<u32>,
    tasks: Vec<PartitionTask>,
}

/// Owns the credential pool, limiters and cache for a series of runs.
pub struct Engine {
    config: Config,
    backend: Arc<dyn InferenceBackend>,
    pool: Arc<CredentialPool>,
    limiters: Arc<RateLimiters>,
    cache: Option<Arc<TieredCache>>,
    store: Arc<dyn SourceStore>,
}

impl Engine {
    pub fn new(config: Config, backend: Arc<dyn InferenceBackend>) -> Self {
        let pool = Arc::new(CredentialPool::new(
            &config.api_keys,
            config.blacklist_threshold,
        ));
        let limiters = Arc::new(RateLimiters::new(
            config.api_keys.len(),
            config.requests_per_second,
        ));
        let cache = crate::build_cache(&config.cache);
        Self {
            config,
            backend,
            pool,
            limiters,
            cache,
            store: Arc::new(FsSourceStore),
        }
    }

    /// Replace the cache built from configuration.
    pub fn with_cache(mut self, cache: Option<Arc<TieredCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SourceStore>) -> Self {
        self.store = store;
        self
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    pub fn cache(&self) -> Option<&Arc<TieredCache>> {
        self.cache.as_ref()
    }

    /// Extract every job. Each submitted job id gets exactly one document.
    pub async fn run(
        &self,
        jobs: Vec<JobSpec>,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> ExtractionReport {
        let started = Instant::now();
        let (progress, forwarder) = dispatch(progress);
        let mut states: HashMap<JobId, JobState> = HashMap::new();
        let mut documents: BTreeMap<JobId, AssembledDocument> = BTreeMap::new();

        if self.pool.is_empty() {
            tracing::warn!("no API credentials configured, every uncached task will fail");
        }

        // Submitted. Repeated job ids keep their first submission.
        let mut unique: Vec<JobSpec> = Vec::with_capacity(jobs.len());
        for job in jobs {
            if states.contains_key(&job.id) {
                tracing::warn!(job = %job.id, "duplicate job id ignored");
                continue;
            }
            states.insert(job.id.clone(), JobState::Submitted);
            progress(ProgressEvent::JobState {
                job: job.id.clone(),
                state: JobState::Submitted,
            });
            unique.push(job);
        }

        // Jobs naming an already-submitted source share its document.
        let mut primary_for: HashMap<PathBuf, JobId> = HashMap::new();
        let mut aliases: Vec<(JobId, JobId)> = Vec::new();
        let mut valid: Vec<JobSpec> = Vec::with_capacity(unique.len());
        for mut job in unique {
            if let Some(primary) = primary_for.get(&job.source) {
                tracing::debug!(job = %job.id, primary = %primary, "same source as an earlier job");
                aliases.push((job.id, primary.clone()));
                continue;
            }
            primary_for.insert(job.source.clone(), job.id.clone());

            match self.validate(&job.source).await {
                Ok(size) => {
                    if job.size_hint == 0 {
                        job.size_hint = size;
                    }
                    valid.push(job);
                }
                Err(reason) => {
                    tracing::warn!(job = %job.id, source = %job.source.display(), error = %reason, "payload rejected");
                    advance(&mut states, &job.id, JobState::Failed, &progress);
                    documents.insert(job.id.clone(), AssembledDocument::failed(job.id, reason));
                }
            }
        }

        // Partitioning, in phase order.
        let classes = partition::classify(&valid, &self.config.partition);
        let resources = self.pool.len();
        let mut planned: Vec<(JobId, PlannedJob)> = Vec::with_capacity(classes.len());
        let mut phases: Vec<Phase> = Vec::new();
        for class in CostClass::ALL {
            let mut tasks = Vec::new();
            let mut range_workers = 0usize;
            for job in classes.get(class) {
                advance(&mut states, &job.id, JobState::Partitioning, &progress);
                let pages = self.page_count(&job.source).await;
                let ranges = partition::plan_page_ranges(pages, resources, &self.config.partition);
                if ranges.len() > 1 {
                    range_workers = range_workers.max(partition::range_worker_count(
                        ranges.len(),
                        resources,
                        &self.config.partition,
                    ));
                }
                let job_tasks = partition::tasks_for_job(job, class, &ranges);
                tracing::info!(
                    job = %job.id,
                    class = ?class,
                    pages = ?pages,
                    tasks = job_tasks.len(),
                    "job planned"
                );
                progress(ProgressEvent::Planned {
                    job: job.id.clone(),
                    pages,
                    tasks: job_tasks.len(),
                });
                tasks.extend(job_tasks.iter().cloned());
                planned.push((
                    job.id.clone(),
                    PlannedJob {
                        pages,
                        tasks: job_tasks,
                    },
                ));
            }
            if tasks.is_empty() {
                continue;
            }
            // A split document gets its full range fan-out even in a narrow phase.
            let workers = partition::phase_worker_count(
                class,
                tasks.len(),
                resources,
                &self.config.partition,
            )
            .max(range_workers)
            .min(tasks.len());
            phases.push(Phase {
                class,
                workers,
                deadline: self.config.executor.phase_deadline(class),
                tasks,
            });
        }

        // Executing.
        let heartbeats: Vec<Heartbeat> = planned
            .iter()
            .map(|(job, _)| {
                advance(&mut states, job, JobState::Executing, &progress);
                Heartbeat::start(
                    job.clone(),
                    self.config.heartbeat_interval,
                    Arc::clone(&progress),
                )
            })
            .collect();

        let executor = Executor::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.pool),
            self.config.executor.clone(),
        )
        .with_limiters(Arc::clone(&self.limiters))
        .with_cache(self.cache.clone())
        .with_store(Arc::clone(&self.store))
        .with_prompt(&self.config.prompt)
        .with_progress(Arc::clone(&progress));
        let mut results = executor.run_phased(phases, &cancel).await;
        drop(heartbeats);
        drop(executor);

        // Assembling.
        for (job, plan) in planned {
            advance(&mut states, &job, JobState::Assembling, &progress);
            let job_results: Vec<TaskResult> = plan
                .tasks
                .iter()
                .filter_map(|t| results.remove(&t.id))
                .collect();
            let doc = assemble::assemble(&job, plan.pages, job_results, &self.config.assembly);
            advance(&mut states, &job, doc.state, &progress);
            tracing::info!(
                job = %job,
                state = ?doc.state,
                chars = doc.content.chars().count(),
                gaps = doc.gaps.len(),
                failed = doc.failed.len(),
                "job finished"
            );
            documents.insert(job, doc);
        }

        for (alias, primary) in aliases {
            if let Some(doc) = documents.get(&primary) {
                let mut copy = doc.clone();
                copy.job = alias.clone();
                states.insert(alias.clone(), copy.state);
                progress(ProgressEvent::JobState {
                    job: alias.clone(),
                    state: copy.state,
                });
                documents.insert(alias, copy);
            }
        }

        // Every event reaches the caller before the report does.
        drop(progress);
        if let Err(e) = forwarder.await {
            tracing::warn!(error = %e, "progress forwarder failed");
        }

        let report = ExtractionReport {
            documents,
            pool: self.pool.status(),
            cache: self.cache.as_ref().map(|c| c.stats()),
            elapsed: started.elapsed(),
        };
        tracing::info!(
            jobs = report.documents.len(),
            complete = report.count(JobState::Complete),
            partial = report.count(JobState::PartiallyComplete),
            failed = report.count(JobState::Failed),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "extraction run finished"
        );
        report
    }

    async fn validate(&self, source: &std::path::Path) -> Result<u64, String> {
        let store = Arc::clone(&self.store);
        let path = source.to_path_buf();
        tokio::task::spawn_blocking(move || store.validate(&path))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())
    }

    /// `None` when the document can't be parsed; it is then sent whole.
    async fn page_count(&self, source: &std::path::Path) -> Option<u32> {
        let store = Arc::clone(&self.store);
        let path = source.to_path_buf();
        match tokio::task::spawn_blocking(move || store.page_count(&path)).await {
            Ok(Ok(n)) => Some(n),
            Ok(Err(e)) => {
                tracing::warn!(source = %source.display(), error = %e, "page count unavailable, sending whole document");
                None
            }
            Err(e) => {
                tracing::warn!(source = %source.display(), error = %e, "page count task failed");
                None
            }
        }
    }
}

/// Hand events to `sink` on a dedicated task so workers never wait on it.
///
/// The returned handle finishes once every clone of the returned callback
/// has been dropped and the queue is drained.
fn dispatch(sink: ProgressFn) -> (ProgressFn, JoinHandle<()>) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ProgressEvent>();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            sink(event);
        }
    });
    let emit: ProgressFn = Arc::new(move |event: ProgressEvent| {
        // The forwarder only stops after every sender is gone.
        let _ = tx.send(event);
    });
    (emit, forwarder)
}

/// Move `job` to `next`, reporting the new state. Illegal moves are logged and ignored.
fn advance(
    states: &mut HashMap<JobId, JobState>,
    job: &JobId,
    next: JobState,
    progress: &ProgressFn,
) {
    let Some(state) = states.get_mut(job) else {
        return;
    };
    match state.advance(next) {
        Ok(()) => progress(ProgressEvent::JobState {
            job: job.clone(),
            state: next,
        }),
        Err(e) => tracing::warn!(job = %job, error = %e, "ignored job state change"),
    }
}
