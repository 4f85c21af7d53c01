use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Config, CoreError};

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub api: Option<ApiConfig>,
    pub cache: Option<CacheSection>,
    pub partition: Option<PartitionSection>,
    pub executor: Option<ExecutorSection>,
    pub assembly: Option<AssemblySection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiConfig {
    pub api_keys: Option<Vec<String>>,
    pub model: Option<String>,
    pub prompt: Option<String>,
    pub requests_per_second: Option<u32>,
    pub blacklist_threshold: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSection {
    pub enabled: Option<bool>,
    pub dir: Option<String>,
    pub remote_path: Option<String>,
    pub max_age_hours: Option<u64>,
    pub max_memory_items: Option<usize>,
    pub max_disk_mb: Option<u64>,
    pub disk_target_ratio: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionSection {
    pub large_bytes: Option<u64>,
    pub medium_bytes: Option<u64>,
    pub split_threshold: Option<u32>,
    pub min_chunk_pages: Option<u32>,
    pub max_chunk_pages: Option<u32>,
    pub max_in_flight: Option<usize>,
    pub large_workers: Option<usize>,
    pub medium_workers: Option<usize>,
    pub small_workers: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorSection {
    pub max_attempts: Option<u32>,
    pub task_timeout_secs: Option<u64>,
    pub large_deadline_secs: Option<u64>,
    pub medium_deadline_secs: Option<u64>,
    pub small_deadline_secs: Option<u64>,
    pub max_job_chars: Option<usize>,
    pub total_char_budget: Option<usize>,
    pub heartbeat_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssemblySection {
    pub max_chars: Option<usize>,
    pub head_chars: Option<usize>,
    pub tail_chars: Option<usize>,
}

/// Platform config directory path: `<config_dir>/docsift/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("docsift").join("config.toml"))
}

/// Load config by cascading CWD `.docsift.toml` over platform config.
/// CWD values override platform values.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p));
    let cwd = load_from_path(Path::new(".docsift.toml"));

    match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    }
}

/// Load a config from a specific path. Returns `None` if the file doesn't
/// exist or can't be parsed.
pub fn load_from_path(path: &Path) -> Option<ConfigFile> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unparseable config file");
            None
        }
    }
}

/// Field from `overlay` if set there, else from `base`.
fn pick<S, T>(overlay: &Option<S>, base: &Option<S>, field: impl Fn(&S) -> Option<T>) -> Option<T> {
    overlay
        .as_ref()
        .and_then(&field)
        .or_else(|| base.as_ref().and_then(&field))
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    let (b, o) = (&base, &overlay);
    ConfigFile {
        api: Some(ApiConfig {
            api_keys: pick(&o.api, &b.api, |a| a.api_keys.clone()),
            model: pick(&o.api, &b.api, |a| a.model.clone()),
            prompt: pick(&o.api, &b.api, |a| a.prompt.clone()),
            requests_per_second: pick(&o.api, &b.api, |a| a.requests_per_second),
            blacklist_threshold: pick(&o.api, &b.api, |a| a.blacklist_threshold),
        }),
        cache: Some(CacheSection {
            enabled: pick(&o.cache, &b.cache, |c| c.enabled),
            dir: pick(&o.cache, &b.cache, |c| c.dir.clone()),
            remote_path: pick(&o.cache, &b.cache, |c| c.remote_path.clone()),
            max_age_hours: pick(&o.cache, &b.cache, |c| c.max_age_hours),
            max_memory_items: pick(&o.cache, &b.cache, |c| c.max_memory_items),
            max_disk_mb: pick(&o.cache, &b.cache, |c| c.max_disk_mb),
            disk_target_ratio: pick(&o.cache, &b.cache, |c| c.disk_target_ratio),
        }),
        partition: Some(PartitionSection {
            large_bytes: pick(&o.partition, &b.partition, |p| p.large_bytes),
            medium_bytes: pick(&o.partition, &b.partition, |p| p.medium_bytes),
            split_threshold: pick(&o.partition, &b.partition, |p| p.split_threshold),
            min_chunk_pages: pick(&o.partition, &b.partition, |p| p.min_chunk_pages),
            max_chunk_pages: pick(&o.partition, &b.partition, |p| p.max_chunk_pages),
            max_in_flight: pick(&o.partition, &b.partition, |p| p.max_in_flight),
            large_workers: pick(&o.partition, &b.partition, |p| p.large_workers),
            medium_workers: pick(&o.partition, &b.partition, |p| p.medium_workers),
            small_workers: pick(&o.partition, &b.partition, |p| p.small_workers),
        }),
        executor: Some(ExecutorSection {
            max_attempts: pick(&o.executor, &b.executor, |e| e.max_attempts),
            task_timeout_secs: pick(&o.executor, &b.executor, |e| e.task_timeout_secs),
            large_deadline_secs: pick(&o.executor, &b.executor, |e| e.large_deadline_secs),
            medium_deadline_secs: pick(&o.executor, &b.executor, |e| e.medium_deadline_secs),
            small_deadline_secs: pick(&o.executor, &b.executor, |e| e.small_deadline_secs),
            max_job_chars: pick(&o.executor, &b.executor, |e| e.max_job_chars),
            total_char_budget: pick(&o.executor, &b.executor, |e| e.total_char_budget),
            heartbeat_secs: pick(&o.executor, &b.executor, |e| e.heartbeat_secs),
        }),
        assembly: Some(AssemblySection {
            max_chars: pick(&o.assembly, &b.assembly, |a| a.max_chars),
            head_chars: pick(&o.assembly, &b.assembly, |a| a.head_chars),
            tail_chars: pick(&o.assembly, &b.assembly, |a| a.tail_chars),
        }),
    }
}

/// Save the config to the platform config directory.
pub fn save_config(config: &ConfigFile) -> Result<PathBuf, CoreError> {
    let path = config_path()
        .ok_or_else(|| CoreError::Config("could not determine config directory".to_string()))?;
    save_to_path(config, &path)?;
    Ok(path)
}

pub fn save_to_path(config: &ConfigFile, path: &Path) -> Result<(), CoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CoreError::Config(format!("failed to create config directory: {e}")))?;
    }
    let content = toml::to_string_pretty(config)
        .map_err(|e| CoreError::Config(format!("failed to serialize config: {e}")))?;
    std::fs::write(path, content)
        .map_err(|e| CoreError::Config(format!("failed to write config: {e}")))?;
    Ok(())
}

impl ConfigFile {
    /// Overwrite every field of `config` that this file sets.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(api) = &self.api {
            if let Some(keys) = &api.api_keys {
                config.api_keys = keys.clone();
            }
            if let Some(model) = &api.model {
                config.model = model.clone();
            }
            if let Some(prompt) = &api.prompt {
                config.prompt = prompt.clone();
            }
            if let Some(rps) = api.requests_per_second {
                config.requests_per_second = (rps > 0).then_some(rps);
            }
            if let Some(n) = api.blacklist_threshold {
                config.blacklist_threshold = n;
            }
        }

        if let Some(c) = &self.cache {
            let cache = &mut config.cache;
            if let Some(v) = c.enabled {
                cache.enabled = v;
            }
            if let Some(v) = &c.dir {
                cache.dir = Some(PathBuf::from(v));
            }
            if let Some(v) = &c.remote_path {
                cache.remote_path = Some(PathBuf::from(v));
            }
            if let Some(v) = c.max_age_hours {
                cache.max_age = Duration::from_secs(v.saturating_mul(3600));
            }
            if let Some(v) = c.max_memory_items {
                cache.max_memory_items = v;
            }
            if let Some(v) = c.max_disk_mb {
                cache.max_disk_bytes = v.saturating_mul(1024 * 1024);
            }
            if let Some(v) = c.disk_target_ratio {
                cache.disk_target_ratio = v.clamp(0.0, 1.0);
            }
        }

        if let Some(p) = &self.partition {
            let part = &mut config.partition;
            if let Some(v) = p.large_bytes {
                part.large_bytes = v;
            }
            if let Some(v) = p.medium_bytes {
                part.medium_bytes = v;
            }
            if let Some(v) = p.split_threshold {
                part.split_threshold = v;
            }
            if let Some(v) = p.min_chunk_pages {
                part.min_chunk_pages = v.max(1);
            }
            if let Some(v) = p.max_chunk_pages {
                part.max_chunk_pages = v.max(1);
            }
            if let Some(v) = p.max_in_flight {
                part.max_in_flight = v.max(1);
            }
            if let Some(v) = p.large_workers {
                part.large_workers = v.max(1);
            }
            if let Some(v) = p.medium_workers {
                part.medium_workers = v.max(1);
            }
            if let Some(v) = p.small_workers {
                part.small_workers = v.max(1);
            }
        }

        if let Some(e) = &self.executor {
            let exec = &mut config.executor;
            if let Some(v) = e.max_attempts {
                exec.max_attempts = v.max(1);
            }
            if let Some(v) = e.task_timeout_secs {
                exec.task_timeout = Duration::from_secs(v);
            }
            if let Some(v) = e.large_deadline_secs {
                exec.large_deadline = Duration::from_secs(v);
            }
            if let Some(v) = e.medium_deadline_secs {
                exec.medium_deadline = Duration::from_secs(v);
            }
            if let Some(v) = e.small_deadline_secs {
                exec.small_deadline = Duration::from_secs(v);
            }
            if let Some(v) = e.max_job_chars {
                exec.max_job_chars = v;
            }
            if let Some(v) = e.total_char_budget {
                exec.total_char_budget = Some(v);
            }
            if let Some(v) = e.heartbeat_secs {
                config.heartbeat_interval = Duration::from_secs(v.max(1));
            }
        }

        if let Some(a) = &self.assembly {
            if let Some(v) = a.max_chars {
                config.assembly.max_chars = v;
            }
            if let Some(v) = a.head_chars {
                config.assembly.head_chars = v;
            }
            if let Some(v) = a.tail_chars {
                config.assembly.tail_chars = v;
            }
        }
    }
}
