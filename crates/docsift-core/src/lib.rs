use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod assemble;
pub mod cache;
pub mod config_file;
pub mod credentials;
pub mod engine;
pub mod executor;
pub mod heartbeat;
pub mod inference;
pub mod job;
pub mod partition;
pub mod rate_limit;
pub mod source;
pub mod timeline;
pub mod violations;

// Re-export for convenience
pub use assemble::{AssembledDocument, AssemblyConfig};
pub use cache::{CacheConfig, CacheError, CacheStats, TieredCache};
pub use credentials::{CredentialHandle, CredentialPool, PoolStatus};
pub use engine::{Engine, ExtractionReport};
pub use executor::{ExecutorConfig, TaskOutcome, TaskResult};
pub use inference::{InferenceBackend, gemini::GeminiBackend};
pub use job::JobState;
pub use partition::{CostClass, PartitionConfig, PartitionTask, TaskId, TaskRange};
pub use rate_limit::{ErrorKind, InferenceError, classify_error};
pub use violations::{Priority, Verdict, Violation};

/// Identifier the caller picks for one extraction job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

/// One document the caller wants extracted.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: JobId,
    pub source: PathBuf,
    /// Estimated payload size in bytes, used for cost classification.
    pub size_hint: u64,
}

impl JobSpec {
    /// Build a job for `path`, reading its size from the filesystem (0 if unreadable).
    pub fn from_path(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let source = path.into();
        let size_hint = std::fs::metadata(&source).map(|m| m.len()).unwrap_or(0);
        Self {
            id: JobId(id.into()),
            source,
            size_hint,
        }
    }
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid job state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: JobState, to: JobState },
    #[error("configuration error: {0}")]
    Config(String),
}

/// Progress events emitted while an extraction run is in flight.
///
/// The `Display` impl renders each event as a one-line status string, so a
/// sink that only wants text can simply call `to_string()`.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    JobState {
        job: JobId,
        state: JobState,
    },
    Planned {
        job: JobId,
        pages: Option<u32>,
        tasks: usize,
    },
    PhaseStarted {
        class: CostClass,
        tasks: usize,
        workers: usize,
    },
    PhaseFinished {
        class: CostClass,
        completed: usize,
        timed_out: usize,
        elapsed: Duration,
    },
    PhaseSkipped {
        class: CostClass,
        tasks: usize,
        reason: String,
    },
    TaskStarted {
        task: TaskId,
        range: TaskRange,
    },
    TaskCompleted {
        task: TaskId,
        range: TaskRange,
        outcome: executor::OutcomeKind,
        cached: bool,
        elapsed: Duration,
    },
    Retry {
        task: TaskId,
        credential: usize,
        attempt: u32,
        kind: ErrorKind,
        backoff: Duration,
    },
    CredentialBlacklisted {
        credential: usize,
    },
    Heartbeat {
        job: JobId,
        elapsed: Duration,
    },
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressEvent::JobState { job, state } => write!(f, "{job}: {state:?}"),
            ProgressEvent::Planned { job, pages, tasks } => match pages {
                Some(p) => write!(f, "{job}: {p} pages in {tasks} task(s)"),
                None => write!(f, "{job}: page count unknown, {tasks} task(s)"),
            },
            ProgressEvent::PhaseStarted {
                class,
                tasks,
                workers,
            } => write!(
                f,
                "{class:?} phase: {tasks} task(s) on {workers} worker(s)"
            ),
            ProgressEvent::PhaseFinished {
                class,
                completed,
                timed_out,
                elapsed,
            } => write!(
                f,
                "{class:?} phase done in {:.1}s: {completed} completed, {timed_out} timed out",
                elapsed.as_secs_f64()
            ),
            ProgressEvent::PhaseSkipped {
                class,
                tasks,
                reason,
            } => write!(f, "{class:?} phase skipped ({tasks} task(s)): {reason}"),
            ProgressEvent::TaskStarted { task, range } => write!(f, "{task} {range}: started"),
            ProgressEvent::TaskCompleted {
                task,
                range,
                outcome,
                cached,
                elapsed,
            } => write!(
                f,
                "{task} {range}: {outcome:?}{} in {:.1}s",
                if *cached { " (cached)" } else { "" },
                elapsed.as_secs_f64()
            ),
            ProgressEvent::Retry {
                task,
                credential,
                attempt,
                kind,
                backoff,
            } => write!(
                f,
                "{task}: {kind:?} on credential #{credential}, attempt {}, retrying in {:.1}s",
                attempt + 1,
                backoff.as_secs_f64()
            ),
            ProgressEvent::CredentialBlacklisted { credential } => {
                write!(f, "credential #{credential} blacklisted")
            }
            ProgressEvent::Heartbeat { job, elapsed } => write!(
                f,
                "{job}: still processing ({}s elapsed)",
                elapsed.as_secs()
            ),
        }
    }
}

/// Default instruction sent with every payload.
pub const DEFAULT_PROMPT: &str = "Extract all text content from this PDF document. \
Preserve the reading order, headings, tables and paragraph breaks. \
Return plain text only.";

/// Default inference model.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Configuration for an extraction run.
#[derive(Clone)]
pub struct Config {
    /// Interchangeable API credentials; each becomes one pool slot.
    pub api_keys: Vec<String>,
    pub model: String,
    pub prompt: String,
    /// Per-credential request rate ceiling. `None` disables the governor.
    pub requests_per_second: Option<u32>,
    /// Consecutive errors before a credential is taken out of rotation.
    pub blacklist_threshold: u32,
    pub heartbeat_interval: Duration,
    pub cache: CacheConfig,
    pub partition: PartitionConfig,
    pub executor: ExecutorConfig,
    pub assembly: AssemblyConfig,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field(
                "api_keys",
                &self.api_keys.iter().map(|_| "***").collect::<Vec<_>>(),
            )
            .field("model", &self.model)
            .field("prompt_len", &self.prompt.len())
            .field("requests_per_second", &self.requests_per_second)
            .field("blacklist_threshold", &self.blacklist_threshold)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("cache", &self.cache)
            .field("partition", &self.partition)
            .field("executor", &self.executor)
            .field("assembly", &self.assembly)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_keys: vec![],
            model: DEFAULT_MODEL.to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
            requests_per_second: Some(2),
            blacklist_threshold: credentials::DEFAULT_BLACKLIST_THRESHOLD,
            heartbeat_interval: Duration::from_secs(30),
            cache: CacheConfig::default(),
            partition: PartitionConfig::default(),
            executor: ExecutorConfig::default(),
            assembly: AssemblyConfig::default(),
        }
    }
}

/// Build a [`TieredCache`] from configuration.
///
/// Returns `None` when caching is disabled or no cache directory is set. A
/// remote tier that fails to open is dropped with a warning and the cache
/// continues with memory and disk only.
pub fn build_cache(config: &CacheConfig) -> Option<Arc<TieredCache>> {
    if !config.enabled {
        return None;
    }
    let dir = config.dir.as_ref()?;

    let remote: Option<Arc<dyn cache::RemoteTier>> = match config.remote_path.as_deref() {
        Some(path) => {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match cache::SqliteRemoteTier::open(path) {
                Ok(tier) => {
                    tracing::info!(path = %path.display(), "opened remote cache tier");
                    Some(Arc::new(tier))
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to open remote cache tier, continuing without it");
                    None
                }
            }
        }
        None => None,
    };

    match TieredCache::open(dir, remote, config.clone()) {
        Ok(cache) => {
            tracing::info!(dir = %dir.display(), "opened extraction cache");
            Some(Arc::new(cache))
        }
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to open cache, running uncached");
            None
        }
    }
}


/// Extract every job's document through the inference service.
///
/// Builds an [`Engine`] from `config` (credential pool, rate limiters and
/// cache) and runs it. Every submitted job id gets an entry in the report,
/// even when its payload is invalid or every part of it failed.
pub async fn extract_documents(
    jobs: Vec<JobSpec>,
    config: Config,
    backend: Arc<dyn InferenceBackend>,
    progress: impl Fn(ProgressEvent) + Send + Sync + 'static,
    cancel: CancellationToken,
) -> ExtractionReport {
    Engine::new(config, backend)
        .run(jobs, Arc::new(progress), cancel)
        .await
}
