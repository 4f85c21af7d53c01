use std::io::Write;
use std::path::Path;
use std::time::Duration;

use docsift_core::credentials::PoolStatus;
use docsift_core::executor::OutcomeKind;
use docsift_core::{
    AssembledDocument, CacheStats, ExtractionReport, JobState, Priority, ProgressEvent, Violation,
};
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

/// Task counter on stderr. Its length grows as jobs are planned.
pub fn task_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    if let Ok(style) =
        ProgressStyle::with_template("{spinner:.cyan} [{bar:40.cyan/dim}] {pos}/{len} tasks {msg}")
    {
        bar.set_style(style.progress_chars("=> "));
    }
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

/// Feed one engine event to the progress bar.
pub fn on_progress(bar: &ProgressBar, event: &ProgressEvent, color: ColorMode) {
    match event {
        ProgressEvent::Planned { tasks, .. } => {
            bar.inc_length(*tasks as u64);
        }
        ProgressEvent::TaskCompleted { outcome, .. } => {
            bar.inc(1);
            match outcome {
                OutcomeKind::Success => {}
                OutcomeKind::Timeout | OutcomeKind::Error => {
                    println_above(bar, &event.to_string(), color, Tone::Bad)
                }
                OutcomeKind::Truncated => {
                    println_above(bar, &event.to_string(), color, Tone::Warn)
                }
            }
        }
        ProgressEvent::PhaseStarted { .. } => bar.set_message(event.to_string()),
        ProgressEvent::PhaseFinished { .. } | ProgressEvent::JobState { .. } => {
            println_above(bar, &event.to_string(), color, Tone::Dim)
        }
        ProgressEvent::PhaseSkipped { .. }
        | ProgressEvent::Retry { .. }
        | ProgressEvent::CredentialBlacklisted { .. } => {
            println_above(bar, &event.to_string(), color, Tone::Warn)
        }
        ProgressEvent::Heartbeat { .. } => bar.set_message(event.to_string()),
        ProgressEvent::TaskStarted { .. } => {}
    }
}

#[derive(Clone, Copy)]
enum Tone {
    Dim,
    Warn,
    Bad,
}

fn println_above(bar: &ProgressBar, line: &str, color: ColorMode, tone: Tone) {
    if !color.enabled() {
        bar.println(line);
        return;
    }
    let styled = match tone {
        Tone::Dim => line.dimmed().to_string(),
        Tone::Warn => line.yellow().to_string(),
        Tone::Bad => line.red().to_string(),
    };
    bar.println(styled);
}

fn state_label(state: JobState, color: ColorMode) -> String {
    let label = match state {
        JobState::Complete => "COMPLETE",
        JobState::PartiallyComplete => "PARTIAL",
        JobState::Failed => "FAILED",
        _ => "INCOMPLETE",
    };
    if !color.enabled() {
        return label.to_string();
    }
    match state {
        JobState::Complete => label.green().to_string(),
        JobState::PartiallyComplete => label.yellow().to_string(),
        _ => label.red().to_string(),
    }
}

/// Print one document's header and text.
pub fn print_document(
    w: &mut dyn Write,
    doc: &AssembledDocument,
    color: ColorMode,
) -> std::io::Result<()> {
    let header = format!("=== {} ===", doc.job);
    if color.enabled() {
        writeln!(w, "{} {}", header.bold(), state_label(doc.state, color))?;
    } else {
        writeln!(w, "{} {}", header, state_label(doc.state, color))?;
    }
    for (range, reason) in &doc.failed {
        writeln!(w, "  failed {range}: {reason}")?;
    }
    if !doc.gaps.is_empty() {
        let gaps: Vec<String> = doc.gaps.iter().map(|g| g.to_string()).collect();
        writeln!(w, "  missing {}", gaps.join(", "))?;
    }
    writeln!(w)?;
    writeln!(w, "{}", doc.content)?;
    writeln!(w)?;
    Ok(())
}

/// Counts by final state, credential health and cache effectiveness.
pub fn print_run_summary(
    w: &mut dyn Write,
    report: &ExtractionReport,
    color: ColorMode,
) -> std::io::Result<()> {
    let complete = report.count(JobState::Complete);
    let partial = report.count(JobState::PartiallyComplete);
    let failed = report.count(JobState::Failed);

    writeln!(w, "{}", "-".repeat(60))?;
    if color.enabled() {
        writeln!(
            w,
            "{} documents in {:.1}s: {} complete, {} partial, {} failed",
            report.documents.len(),
            report.elapsed.as_secs_f64(),
            complete.green(),
            partial.yellow(),
            failed.red()
        )?;
    } else {
        writeln!(
            w,
            "{} documents in {:.1}s: {complete} complete, {partial} partial, {failed} failed",
            report.documents.len(),
            report.elapsed.as_secs_f64(),
        )?;
    }
    writeln!(
        w,
        "Credentials: {}/{} available, {} blacklisted",
        report.pool.available, report.pool.total, report.pool.blacklisted
    )?;
    if let Some(stats) = &report.cache {
        writeln!(
            w,
            "Cache: {:.0}% hit rate ({} memory, {} remote, {} disk, {} misses)",
            stats.hit_rate() * 100.0,
            stats.memory_hits,
            stats.remote_hits,
            stats.disk_hits,
            stats.misses
        )?;
    }
    Ok(())
}

/// One line per credential, keys masked to their last four characters.
pub fn print_pool_status(w: &mut dyn Write, status: &PoolStatus) -> std::io::Result<()> {
    if status.total == 0 {
        writeln!(w, "No credentials configured.")?;
        return Ok(());
    }
    writeln!(w, "{} credential(s) configured", status.total)?;
    for cred in &status.credentials {
        writeln!(
            w,
            "  #{} {}{}",
            cred.id,
            cred.label,
            if cred.blacklisted { " (blacklisted)" } else { "" }
        )?;
    }
    Ok(())
}

pub fn print_cache_stats(w: &mut dyn Write, dir: &Path, stats: &CacheStats) -> std::io::Result<()> {
    writeln!(w, "Cache directory: {}", dir.display())?;
    writeln!(w, "  files cached:  {}", stats.files_cached)?;
    writeln!(w, "  disk usage:    {:.2} MB", stats.cache_size_mb())?;
    writeln!(w, "  memory items:  {}", stats.memory_items)?;
    writeln!(
        w,
        "  remote tier:   {}",
        if stats.has_remote { "yes" } else { "no" }
    )?;
    Ok(())
}

fn priority_label(priority: Priority, color: ColorMode) -> String {
    let label = format!("[{}]", priority.to_string().to_uppercase());
    if !color.enabled() {
        return label;
    }
    match priority {
        Priority::Critical => label.red().bold().to_string(),
        Priority::High => label.red().to_string(),
        Priority::Medium => label.yellow().to_string(),
        Priority::Low => label.dimmed().to_string(),
    }
}

pub fn print_violations(
    w: &mut dyn Write,
    found: &[Violation],
    color: ColorMode,
) -> std::io::Result<()> {
    if found.is_empty() {
        writeln!(w, "No violations found.")?;
        return Ok(());
    }
    for v in found {
        let rule = if v.rule_id.is_empty() {
            String::new()
        } else {
            format!("Rule {} ", v.rule_id)
        };
        writeln!(
            w,
            "{} {rule}{} ({:?})",
            priority_label(v.priority, color),
            v.title,
            v.verdict
        )?;
        writeln!(w, "    {}", v.reason)?;
    }
    writeln!(w)?;
    writeln!(w, "{} item(s)", found.len())?;
    Ok(())
}
