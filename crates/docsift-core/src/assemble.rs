//! Ordering, gap detection and size capping of partial results.

use serde::Serialize;

use crate::JobId;
use crate::executor::{TaskOutcome, TaskResult};
use crate::job::JobState;
use crate::partition::TaskRange;

pub const PAGE_SEPARATOR: &str = "\n\n--- page break ---\n\n";

/// Content of a job none of whose tasks produced text.
pub const ALL_FAILED_MARKER: &str = "[extraction failed: no part of this document could be extracted]";

#[derive(Debug, Clone)]
pub struct AssemblyConfig {
    /// Hard ceiling on assembled content, in characters.
    pub max_chars: usize,
    /// Characters kept from the start when truncating.
    pub head_chars: usize,
    /// Characters kept from the end when truncating.
    pub tail_chars: usize,
    pub separator: String,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            max_chars: 200_000,
            head_chars: 5_000,
            tail_chars: 5_000,
            separator: PAGE_SEPARATOR.to_string(),
        }
    }
}

/// Final per-job output.
#[derive(Debug, Clone, Serialize)]
pub struct AssembledDocument {
    pub job: JobId,
    pub content: String,
    /// Page ranges no task result covers.
    pub gaps: Vec<TaskRange>,
    /// Ranges whose task ran but produced no text, with the reason.
    pub failed: Vec<(TaskRange, String)>,
    pub state: JobState,
}

impl AssembledDocument {
    /// A document that never reached execution (bad payload, cancelled early).
    pub fn failed(job: JobId, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            content: format!("{ALL_FAILED_MARKER}\n{reason}"),
            job,
            gaps: Vec::new(),
            failed: vec![(TaskRange::Whole, reason)],
            state: JobState::Failed,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == JobState::Complete
    }
}

fn failure_reason(outcome: &TaskOutcome) -> String {
    match outcome {
        TaskOutcome::Success(_) => String::new(),
        TaskOutcome::Timeout => "timed out".to_string(),
        TaskOutcome::Error(msg) => msg.clone(),
        TaskOutcome::Truncated => "skipped: character budget reached".to_string(),
    }
}

/// Merge one job's task results into a single document.
///
/// Results may arrive in any order; they are sorted by start page. Failed
/// tasks leave an inline marker in place of their text, and pages covered by
/// no result at all are listed in a header line.
pub fn assemble(
    job: &JobId,
    total_pages: Option<u32>,
    mut results: Vec<TaskResult>,
    cfg: &AssemblyConfig,
) -> AssembledDocument {
    results.sort_by(|a, b| {
        a.position
            .cmp(&b.position)
            .then(a.id.ordinal.cmp(&b.id.ordinal))
    });

    let gaps = find_gaps(&results, total_pages);
    let mut failed = Vec::new();
    let mut parts = Vec::with_capacity(results.len());
    let mut succeeded = 0usize;

    for result in &results {
        if let TaskOutcome::Success(text) = &result.outcome {
            succeeded += 1;
            parts.push(text.clone());
        } else {
            let reason = failure_reason(&result.outcome);
            parts.push(format!("[{}: extraction failed: {reason}]", result.range));
            failed.push((result.range, reason));
        }
    }

    let state = if succeeded == 0 {
        JobState::Failed
    } else if failed.is_empty() && gaps.is_empty() {
        JobState::Complete
    } else {
        JobState::PartiallyComplete
    };

    let content = if succeeded == 0 {
        let mut marker = ALL_FAILED_MARKER.to_string();
        for (range, reason) in &failed {
            marker.push_str(&format!("\n{range}: {reason}"));
        }
        marker
    } else {
        let mut body = parts.join(&cfg.separator);
        if !gaps.is_empty() {
            let missing: Vec<String> = gaps.iter().map(|g| g.to_string()).collect();
            body = format!("[missing: {}]\n\n{body}", missing.join(", "));
        }
        body
    };

    let content = truncate_head_tail(&content, cfg.max_chars, cfg.head_chars, cfg.tail_chars);

    tracing::debug!(
        job = %job,
        parts = results.len(),
        succeeded,
        failed = failed.len(),
        gaps = gaps.len(),
        chars = content.chars().count(),
        "assembled document"
    );

    AssembledDocument {
        job: job.clone(),
        content,
        gaps,
        failed,
        state,
    }
}

/// Page ranges between 1 and `total_pages` that no result starts in.
fn find_gaps(sorted: &[TaskResult], total_pages: Option<u32>) -> Vec<TaskRange> {
    if sorted.iter().any(|r| r.range == TaskRange::Whole) {
        return Vec::new();
    }
    if sorted.is_empty() {
        return vec![match total_pages {
            Some(total) if total > 0 => TaskRange::Pages {
                start: 1,
                end: total,
            },
            _ => TaskRange::Whole,
        }];
    }

    let mut gaps = Vec::new();
    let mut expected = 1u32;
    for result in sorted {
        if let TaskRange::Pages { start, end } = result.range {
            if start > expected {
                gaps.push(TaskRange::Pages {
                    start: expected,
                    end: start - 1,
                });
            }
            expected = expected.max(end.saturating_add(1));
        }
    }
    if let Some(total) = total_pages
        && expected <= total
    {
        gaps.push(TaskRange::Pages {
            start: expected,
            end: total,
        });
    }
    gaps
}

/// Cap `text` at `max` characters, keeping its head and tail.
///
/// Longer text becomes `head + "\n\n[... omitted N characters ...]\n\n" + tail`.
/// If that still wouldn't fit in `max`, the text is cut to a plain prefix.
pub fn truncate_head_tail(text: &str, max: usize, head: usize, tail: usize) -> String {
    let total = text.chars().count();
    if total <= max {
        return text.to_string();
    }

    if head + tail < total {
        let omitted = total - head - tail;
        let marker = format!("\n\n[... omitted {omitted} characters ...]\n\n");
        if head + tail + marker.chars().count() <= max {
            let head_str: String = text.chars().take(head).collect();
            let tail_str: String = text.chars().skip(total - tail).collect();
            return format!("{head_str}{marker}{tail_str}");
        }
    }

    text.chars().take(max).collect()
}
