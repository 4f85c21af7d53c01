use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use docsift_core::config_file::{self, ConfigFile};
use docsift_core::{CacheConfig, Config, Engine, GeminiBackend, JobSpec, ProgressEvent};
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

mod output;

use output::ColorMode;

/// Docsift - extract text from PDFs through a pool of inference credentials
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract the text of one or more PDFs
    Extract {
        /// PDF files to extract
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// API key (repeat for several credentials)
        #[arg(long = "api-key")]
        api_keys: Vec<String>,

        /// Inference model name
        #[arg(long)]
        model: Option<String>,

        /// File holding the extraction prompt
        #[arg(long)]
        prompt_file: Option<PathBuf>,

        /// Disk cache directory
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// SQLite file shared between machines as the remote cache tier
        #[arg(long)]
        remote_cache: Option<PathBuf>,

        /// Disable the result cache
        #[arg(long)]
        no_cache: bool,

        /// Write one .txt per document plus summary.json into this directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Disable colored output
        #[arg(long)]
        no_color: bool,
    },

    /// Inspect or clear the result cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,

        /// Disk cache directory
        #[arg(long, global = true)]
        cache_dir: Option<PathBuf>,

        /// SQLite remote cache tier
        #[arg(long, global = true)]
        remote_cache: Option<PathBuf>,
    },

    /// Show the configured credentials (masked)
    PoolStatus {
        #[arg(long = "api-key")]
        api_keys: Vec<String>,
    },

    /// Parse a rule-check report and list its violations
    Violations {
        /// Text file holding the model's rule-by-rule answer
        file: PathBuf,

        /// Also list compliant and undecided rules
        #[arg(long)]
        all: bool,

        /// Disable colored output
        #[arg(long)]
        no_color: bool,
    },
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum CacheAction {
    /// Print hit/miss counters and disk usage
    Stats,
    /// Delete every cached result
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_file.as_deref())?;

    let file_config = config_file::load_config();

    match cli.command {
        Command::Extract {
            files,
            api_keys,
            model,
            prompt_file,
            cache_dir,
            remote_cache,
            no_cache,
            output,
            no_color,
        } => {
            let mut config = Config::default();
            file_config.apply_to(&mut config);
            config.api_keys = resolve_api_keys(api_keys, &file_config);
            if let Some(model) = model.or_else(|| env_var("DOCSIFT_MODEL")) {
                config.model = model;
            }
            if let Some(path) = prompt_file {
                config.prompt = std::fs::read_to_string(&path).map_err(|e| {
                    anyhow::anyhow!("failed to read prompt file {}: {e}", path.display())
                })?;
            }
            apply_cache_flags(&mut config.cache, cache_dir, remote_cache);
            if no_cache {
                config.cache.enabled = false;
            }
            extract(files, config, output, ColorMode(!no_color)).await
        }
        Command::Cache {
            action,
            cache_dir,
            remote_cache,
        } => {
            let mut config = Config::default();
            file_config.apply_to(&mut config);
            apply_cache_flags(&mut config.cache, cache_dir, remote_cache);
            cache_command(action, &config.cache)
        }
        Command::PoolStatus { api_keys } => {
            let keys = resolve_api_keys(api_keys, &file_config);
            let pool = docsift_core::CredentialPool::new(
                &keys,
                docsift_core::credentials::DEFAULT_BLACKLIST_THRESHOLD,
            );
            let mut out = std::io::stdout();
            output::print_pool_status(&mut out, &pool.status())?;
            Ok(())
        }
        Command::Violations {
            file,
            all,
            no_color,
        } => {
            let text = std::fs::read_to_string(&file)
                .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", file.display()))?;
            let found = if all {
                docsift_core::violations::parse_violations(&text)
            } else {
                docsift_core::violations::violations_only(&text)
            };
            let mut out = std::io::stdout();
            output::print_violations(&mut out, &found, ColorMode(!no_color))?;
            Ok(())
        }
    }
}

/// stderr logging filtered by `RUST_LOG` (default `docsift=info`), plus an
/// optional non-blocking file layer. The returned guard flushes the file on drop.
fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("docsift=info"));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("invalid log file path: {}", path.display()))?;
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .init();
    Ok(guard)
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Keys from flags, else `DOCSIFT_API_KEYS` (comma-separated), else
/// `GEMINI_API_KEY`, else the config file.
fn resolve_api_keys(flags: Vec<String>, file: &ConfigFile) -> Vec<String> {
    let from_file = file.api.as_ref().and_then(|a| a.api_keys.clone());
    pick_keys(
        flags,
        env_var("DOCSIFT_API_KEYS"),
        env_var("GEMINI_API_KEY"),
        from_file,
    )
}

fn pick_keys(
    flags: Vec<String>,
    list: Option<String>,
    single: Option<String>,
    file: Option<Vec<String>>,
) -> Vec<String> {
    let clean = |keys: Vec<String>| -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(keys.len());
        for key in keys.into_iter().map(|k| k.trim().to_string()) {
            if !key.is_empty() && !out.contains(&key) {
                out.push(key);
            }
        }
        out
    };

    if !flags.is_empty() {
        return clean(flags);
    }
    if let Some(list) = list {
        return clean(list.split(',').map(str::to_string).collect());
    }
    if let Some(key) = single {
        return clean(vec![key]);
    }
    clean(file.unwrap_or_default())
}

fn apply_cache_flags(cache: &mut CacheConfig, dir: Option<PathBuf>, remote: Option<PathBuf>) {
    if let Some(dir) = dir.or_else(|| env_var("DOCSIFT_CACHE_DIR").map(PathBuf::from)) {
        cache.dir = Some(dir);
    }
    if let Some(remote) = remote {
        cache.remote_path = Some(remote);
    }
}

async fn extract(
    files: Vec<PathBuf>,
    config: Config,
    output_dir: Option<PathBuf>,
    color: ColorMode,
) -> anyhow::Result<()> {
    if config.api_keys.is_empty() {
        anyhow::bail!(
            "no API keys configured. Pass --api-key, or set DOCSIFT_API_KEYS or GEMINI_API_KEY"
        );
    }
    for file in &files {
        if !file.exists() {
            anyhow::bail!("File not found: {}", file.display());
        }
    }

    tracing::info!(config = ?config, files = files.len(), "starting extraction");

    let jobs: Vec<JobSpec> = job_names(&files)
        .into_iter()
        .zip(&files)
        .map(|(name, path)| JobSpec::from_path(name, path))
        .collect();

    let backend = Arc::new(GeminiBackend::new(
        config.model.clone(),
        config.executor.task_timeout,
    ));
    let engine = Engine::new(config, backend);

    let bar = output::task_bar();
    let progress = {
        let bar = bar.clone();
        move |event: ProgressEvent| output::on_progress(&bar, &event, color)
    };

    let cancel = CancellationToken::new();

    // Set up Ctrl+C handler
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling remaining tasks");
            cancel_clone.cancel();
        }
    });

    let report = engine.run(jobs, Arc::new(progress), cancel).await;
    bar.finish_and_clear();

    let mut out = std::io::stdout();
    match &output_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            for doc in report.documents.values() {
                std::fs::write(dir.join(format!("{}.txt", doc.job)), &doc.content)?;
            }
            let summary: Vec<serde_json::Value> = report
                .documents
                .values()
                .map(|d| {
                    serde_json::json!({
                        "job": d.job,
                        "state": d.state,
                        "chars": d.content.chars().count(),
                        "gaps": d.gaps,
                        "failed": d.failed,
                    })
                })
                .collect();
            std::fs::write(
                dir.join("summary.json"),
                serde_json::to_string_pretty(&summary)?,
            )?;
            writeln!(out, "Wrote {} document(s) to {}", summary.len(), dir.display())?;
        }
        None => {
            for doc in report.documents.values() {
                output::print_document(&mut out, doc, color)?;
            }
        }
    }
    output::print_run_summary(&mut out, &report, color)?;
    Ok(())
}

/// Job id for a file: its stem, or the whole path if it has none.
fn job_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// One distinct job id per file. Repeated stems get `-2`, `-3`, ... so files
/// with the same name in different directories each keep their own result.
fn job_names(files: &[PathBuf]) -> Vec<String> {
    let mut used = std::collections::HashSet::new();
    files
        .iter()
        .map(|path| {
            let stem = job_name(path);
            let mut name = stem.clone();
            let mut n = 2;
            while !used.insert(name.clone()) {
                name = format!("{stem}-{n}");
                n += 1;
            }
            name
        })
        .collect()
}

fn cache_command(action: CacheAction, config: &CacheConfig) -> anyhow::Result<()> {
    let config = CacheConfig {
        enabled: true,
        ..config.clone()
    };
    let cache = docsift_core::build_cache(&config)
        .ok_or_else(|| anyhow::anyhow!("no cache directory configured; pass --cache-dir"))?;
    let mut out = std::io::stdout();
    match action {
        CacheAction::Stats => output::print_cache_stats(&mut out, cache.dir(), &cache.stats())?,
        CacheAction::Clear => {
            cache.clear()?;
            writeln!(out, "Cleared cache at {}", cache.dir().display())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn flags_win_over_everything() {
        let got = pick_keys(
            keys(&["a", "b"]),
            Some("c,d".into()),
            Some("e".into()),
            Some(keys(&["f"])),
        );
        assert_eq!(got, keys(&["a", "b"]));
    }

    #[test]
    fn env_list_is_split_and_deduped() {
        let got = pick_keys(vec![], Some(" c, d ,c,,".into()), Some("e".into()), None);
        assert_eq!(got, keys(&["c", "d"]));
    }

    #[test]
    fn single_env_then_file() {
        assert_eq!(
            pick_keys(vec![], None, Some("e".into()), Some(keys(&["f"]))),
            keys(&["e"])
        );
        assert_eq!(pick_keys(vec![], None, None, Some(keys(&["f"]))), keys(&["f"]));
        assert!(pick_keys(vec![], None, None, None).is_empty());
    }

    #[test]
    fn job_name_uses_file_stem() {
        assert_eq!(job_name(Path::new("/tmp/report.final.pdf")), "report.final");
        assert_eq!(job_name(Path::new("scan.pdf")), "scan");
    }

    #[test]
    fn same_stem_in_different_directories_gets_distinct_ids() {
        let files: Vec<PathBuf> = ["a/report.pdf", "b/report.pdf", "report-2.pdf", "c/report.pdf"]
            .iter()
            .map(PathBuf::from)
            .collect();
        assert_eq!(
            job_names(&files),
            vec!["report", "report-2", "report-2-2", "report-3"]
        );
    }

    #[test]
    fn cli_parses_extract() {
        let cli = Cli::try_parse_from([
            "docsift",
            "extract",
            "a.pdf",
            "b.pdf",
            "--api-key",
            "k1",
            "--api-key",
            "k2",
            "--no-cache",
        ])
        .unwrap();
        match cli.command {
            Command::Extract {
                files,
                api_keys,
                no_cache,
                ..
            } => {
                assert_eq!(files.len(), 2);
                assert_eq!(api_keys, keys(&["k1", "k2"]));
                assert!(no_cache);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cache_dir_flag_sets_dir() {
        let mut cache = CacheConfig::default();
        apply_cache_flags(
            &mut cache,
            Some(PathBuf::from("/tmp/x")),
            Some(PathBuf::from("/tmp/r.db")),
        );
        assert_eq!(cache.dir, Some(PathBuf::from("/tmp/x")));
        assert_eq!(cache.remote_path, Some(PathBuf::from("/tmp/r.db")));
    }
}
