//! Cost classification and page-range planning.
//!
//! Jobs are bucketed by size into large/medium/small phases. Within a job,
//! documents longer than `split_threshold` pages are cut into contiguous
//! ranges so several credentials can work on them at once.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::{JobId, JobSpec};

/// Size bucket of a job. Phases run in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum CostClass {
    Large,
    Medium,
    Small,
}

impl CostClass {
    pub const ALL: [CostClass; 3] = [CostClass::Large, CostClass::Medium, CostClass::Small];
}

/// The part of a document one task covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRange {
    Whole,
    /// 1-based, inclusive on both ends.
    Pages { start: u32, end: u32 },
}

impl TaskRange {
    /// Ordering key for assembly: the start page, or 0 for a whole document.
    pub fn position(&self) -> u32 {
        match self {
            TaskRange::Whole => 0,
            TaskRange::Pages { start, .. } => *start,
        }
    }

    /// Cache key prefix for results of this range.
    pub fn cache_prefix(&self) -> String {
        match self {
            TaskRange::Whole => "content".to_string(),
            TaskRange::Pages { start, end } => format!("range_{start}_{end}"),
        }
    }

    pub fn page_len(&self) -> Option<u32> {
        match self {
            TaskRange::Whole => None,
            TaskRange::Pages { start, end } => Some(end + 1 - start),
        }
    }
}

impl fmt::Display for TaskRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskRange::Whole => f.write_str("whole document"),
            TaskRange::Pages { start, end } if start == end => write!(f, "page {start}"),
            TaskRange::Pages { start, end } => write!(f, "pages {start}-{end}"),
        }
    }
}

/// Identity of one partition task: its job plus its ordinal within the job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    pub job: JobId,
    pub ordinal: usize,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.job, self.ordinal)
    }
}

#[derive(Debug, Clone)]
pub struct PartitionTask {
    pub id: TaskId,
    pub source: PathBuf,
    pub range: TaskRange,
    pub class: CostClass,
}

/// Partitioning thresholds.
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// Jobs at or above this size are `Large`.
    pub large_bytes: u64,
    /// Jobs at or above this size (and below `large_bytes`) are `Medium`.
    pub medium_bytes: u64,
    /// Documents with more pages than this are split.
    pub split_threshold: u32,
    pub min_chunk_pages: u32,
    pub max_chunk_pages: u32,
    /// Upper bound on concurrently running ranges of one document.
    pub max_in_flight: usize,
    pub large_workers: usize,
    pub medium_workers: usize,
    pub small_workers: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            large_bytes: 5 * 1024 * 1024,
            medium_bytes: 1024 * 1024,
            split_threshold: 8,
            min_chunk_pages: 2,
            max_chunk_pages: 6,
            max_in_flight: 12,
            large_workers: 16,
            medium_workers: 12,
            small_workers: 8,
        }
    }
}

/// Jobs bucketed by cost, each bucket sorted by size descending.
#[derive(Debug, Clone, Default)]
pub struct CostClasses {
    pub large: Vec<JobSpec>,
    pub medium: Vec<JobSpec>,
    pub small: Vec<JobSpec>,
}

impl CostClasses {
    pub fn get(&self, class: CostClass) -> &[JobSpec] {
        match class {
            CostClass::Large => &self.large,
            CostClass::Medium => &self.medium,
            CostClass::Small => &self.small,
        }
    }

    pub fn len(&self) -> usize {
        self.large.len() + self.medium.len() + self.small.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every job with its class, in phase order.
    pub fn iter(&self) -> impl Iterator<Item = (CostClass, &JobSpec)> {
        CostClass::ALL
            .into_iter()
            .flat_map(move |class| self.get(class).iter().map(move |job| (class, job)))
    }
}

pub fn class_of(size: u64, cfg: &PartitionConfig) -> CostClass {
    if size >= cfg.large_bytes {
        CostClass::Large
    } else if size >= cfg.medium_bytes {
        CostClass::Medium
    } else {
        CostClass::Small
    }
}

/// Bucket jobs by size hint. Later jobs naming an already-seen source are dropped.
pub fn classify(jobs: &[JobSpec], cfg: &PartitionConfig) -> CostClasses {
    let mut seen = HashSet::new();
    let mut classes = CostClasses::default();
    for job in jobs {
        if !seen.insert(job.source.clone()) {
            tracing::debug!(job = %job.id, source = %job.source.display(), "duplicate source dropped");
            continue;
        }
        match class_of(job.size_hint, cfg) {
            CostClass::Large => classes.large.push(job.clone()),
            CostClass::Medium => classes.medium.push(job.clone()),
            CostClass::Small => classes.small.push(job.clone()),
        }
    }
    for bucket in [&mut classes.large, &mut classes.medium, &mut classes.small] {
        // Stable sort keeps submission order among equal sizes.
        bucket.sort_by(|a, b| b.size_hint.cmp(&a.size_hint));
    }
    classes
}

/// Split a `page_count`-page document into contiguous 1-based ranges.
///
/// Returns `[]` when the page count is unknown or zero, meaning "process the
/// whole document in one task". Short documents and single-credential pools
/// get one range spanning every page.
pub fn plan_page_ranges(
    page_count: Option<u32>,
    resource_count: usize,
    cfg: &PartitionConfig,
) -> Vec<(u32, u32)> {
    let pages = match page_count {
        Some(p) if p > 0 => p,
        _ => return Vec::new(),
    };
    if pages <= cfg.split_threshold || resource_count <= 1 {
        return vec![(1, pages)];
    }

    let target = (2 * resource_count).min(u32::MAX as usize) as u32;
    let lo = cfg.min_chunk_pages.max(1);
    let hi = cfg.max_chunk_pages.max(lo);
    let chunk = (pages / target).clamp(lo, hi);

    let ranges: Vec<(u32, u32)> = (0..pages.div_ceil(chunk))
        .map(|i| (i * chunk + 1, ((i + 1) * chunk).min(pages)))
        .collect();
    if covers(&ranges, pages) {
        return ranges;
    }

    tracing::warn!(pages, chunk, ranges = ranges.len(), "page ranges don't cover document, regenerating");
    let ranges = sequential_ranges(pages, chunk);
    if covers(&ranges, pages) {
        ranges
    } else {
        tracing::warn!(pages, "page range regeneration failed, processing whole document");
        Vec::new()
    }
}

fn sequential_ranges(pages: u32, chunk: u32) -> Vec<(u32, u32)> {
    let mut ranges = Vec::new();
    let mut start = 1;
    while start <= pages {
        let end = start.saturating_add(chunk - 1).min(pages);
        ranges.push((start, end));
        start = end + 1;
    }
    ranges
}

/// Contiguous from page 1, ends on `pages`, and sums to `pages`.
fn covers(ranges: &[(u32, u32)], pages: u32) -> bool {
    let mut next = 1;
    let mut total: u64 = 0;
    for &(start, end) in ranges {
        if start != next || end < start {
            return false;
        }
        total += u64::from(end - start + 1);
        next = end + 1;
    }
    total == u64::from(pages) && ranges.last().is_some_and(|r| r.1 == pages)
}

/// Expand a job into its tasks.
///
/// An empty plan, or a single range starting at page 1 (the planner's
/// no-split answer), yields one whole-document task so the original file is
/// sent unchanged.
pub fn tasks_for_job(job: &JobSpec, class: CostClass, ranges: &[(u32, u32)]) -> Vec<PartitionTask> {
    if matches!(ranges, [] | [(1, _)]) {
        return vec![PartitionTask {
            id: TaskId {
                job: job.id.clone(),
                ordinal: 0,
            },
            source: job.source.clone(),
            range: TaskRange::Whole,
            class,
        }];
    }
    ranges
        .iter()
        .enumerate()
        .map(|(ordinal, &(start, end))| PartitionTask {
            id: TaskId {
                job: job.id.clone(),
                ordinal,
            },
            source: job.source.clone(),
            range: TaskRange::Pages { start, end },
            class,
        })
        .collect()
}

/// Workers for the ranges of one document.
pub fn range_worker_count(ranges: usize, resources: usize, cfg: &PartitionConfig) -> usize {
    ranges
        .min(2 * resources)
        .min(cfg.max_in_flight)
        .max(1)
}

/// Workers for one cost phase.
pub fn phase_worker_count(
    class: CostClass,
    tasks: usize,
    resources: usize,
    cfg: &PartitionConfig,
) -> usize {
    let (per_resource, cap) = match class {
        CostClass::Large => (2 * resources, cfg.large_workers),
        CostClass::Medium => (2 * resources, cfg.medium_workers),
        CostClass::Small => (resources, cfg.small_workers),
    };
    tasks.min(per_resource).min(cap).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn job(id: &str, size: u64) -> JobSpec {
        JobSpec {
            id: JobId(id.into()),
            source: PathBuf::from(format!("/docs/{id}.pdf")),
            size_hint: size,
        }
    }

    fn total_pages(ranges: &[(u32, u32)]) -> u32 {
        ranges.iter().map(|(s, e)| e - s + 1).sum()
    }

    #[test]
    fn classify_buckets_and_sorts() {
        let cfg = PartitionConfig::default();
        let jobs = vec![
            job("a", 6 * MB),
            job("b", 512 * 1024),
            job("c", 2 * MB),
            job("d", 9 * MB),
            job("e", MB),
            job("f", 5 * MB - 1),
        ];
        let c = classify(&jobs, &cfg);
        let ids = |v: &[JobSpec]| v.iter().map(|j| j.id.0.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&c.large), vec!["d", "a"]);
        assert_eq!(ids(&c.medium), vec!["f", "c", "e"]);
        assert_eq!(ids(&c.small), vec!["b"]);
        assert_eq!(c.len(), 6);
    }

    #[test]
    fn classify_drops_duplicate_sources() {
        let cfg = PartitionConfig::default();
        let mut dup = job("b", 3 * MB);
        dup.source = PathBuf::from("/docs/a.pdf");
        let c = classify(&[job("a", 10), dup], &cfg);
        assert_eq!(c.len(), 1);
        assert_eq!(c.small[0].id.0, "a");
    }

    #[test]
    fn iter_is_phase_ordered() {
        let cfg = PartitionConfig::default();
        let c = classify(&[job("s", 1), job("l", 8 * MB), job("m", 2 * MB)], &cfg);
        let order: Vec<_> = c.iter().map(|(class, j)| (class, j.id.0.as_str())).collect();
        assert_eq!(
            order,
            vec![
                (CostClass::Large, "l"),
                (CostClass::Medium, "m"),
                (CostClass::Small, "s")
            ]
        );
    }

    #[test]
    fn unknown_or_empty_document_has_no_ranges() {
        let cfg = PartitionConfig::default();
        assert!(plan_page_ranges(None, 4, &cfg).is_empty());
        assert!(plan_page_ranges(Some(0), 4, &cfg).is_empty());
    }

    #[test]
    fn short_document_or_single_resource_is_one_range() {
        let cfg = PartitionConfig::default();
        assert_eq!(plan_page_ranges(Some(8), 5, &cfg), vec![(1, 8)]);
        assert_eq!(plan_page_ranges(Some(3), 1, &cfg), vec![(1, 3)]);
        assert_eq!(plan_page_ranges(Some(500), 1, &cfg), vec![(1, 500)]);
    }

    #[test]
    fn twenty_pages_three_resources() {
        let cfg = PartitionConfig::default();
        let ranges = plan_page_ranges(Some(20), 3, &cfg);
        // target 6, chunk = clamp(20 / 6, 2, 6) = 3
        assert_eq!(
            ranges,
            vec![(1, 3), (4, 6), (7, 9), (10, 12), (13, 15), (16, 18), (19, 20)]
        );
        assert_eq!(range_worker_count(ranges.len(), 3, &cfg), 6);
    }

    #[test]
    fn chunk_is_clamped() {
        let cfg = PartitionConfig::default();
        // 9 pages over 10 resources: 9 / 20 = 0, clamped up to 2
        let small = plan_page_ranges(Some(9), 10, &cfg);
        assert!(small.iter().all(|(s, e)| e - s + 1 <= 2));
        // 400 pages over 2 resources: 400 / 4 = 100, clamped down to 6
        let big = plan_page_ranges(Some(400), 2, &cfg);
        assert!(big.iter().all(|(s, e)| e - s + 1 <= 6));
        assert_eq!(big.len(), 67);
    }

    #[test]
    fn plans_always_cover_every_page() {
        let cfg = PartitionConfig::default();
        for pages in 1..=240u32 {
            for resources in 0..=12usize {
                let ranges = plan_page_ranges(Some(pages), resources, &cfg);
                assert_eq!(total_pages(&ranges), pages, "{pages} pages / {resources}");
                assert_eq!(ranges[0].0, 1);
                assert_eq!(ranges.last().unwrap().1, pages);
                for pair in ranges.windows(2) {
                    assert_eq!(pair[0].1 + 1, pair[1].0);
                }
            }
        }
    }

    #[test]
    fn sequential_walk_covers() {
        let ranges = sequential_ranges(11, 4);
        assert_eq!(ranges, vec![(1, 4), (5, 8), (9, 11)]);
        assert!(covers(&ranges, 11));
        assert!(!covers(&[(1, 4), (6, 11)], 11));
        assert!(!covers(&[(1, 4)], 11));
    }

    #[test]
    fn tasks_for_whole_and_split_jobs() {
        let j = job("doc", 10);
        let whole = tasks_for_job(&j, CostClass::Small, &[]);
        assert_eq!(whole.len(), 1);
        assert_eq!(whole[0].range, TaskRange::Whole);
        assert_eq!(whole[0].range.cache_prefix(), "content");

        let unsplit = tasks_for_job(&j, CostClass::Small, &[(1, 3)]);
        assert_eq!(unsplit.len(), 1);
        assert_eq!(unsplit[0].range, TaskRange::Whole);

        let split = tasks_for_job(&j, CostClass::Small, &[(1, 4), (5, 9)]);
        assert_eq!(split.len(), 2);
        assert_eq!(split[1].id.ordinal, 1);
        assert_eq!(split[1].range, TaskRange::Pages { start: 5, end: 9 });
        assert_eq!(split[1].range.cache_prefix(), "range_5_9");
        assert_eq!(split[1].range.position(), 5);
        assert_eq!(split[1].range.page_len(), Some(5));
    }

    #[test]
    fn worker_counts() {
        let cfg = PartitionConfig::default();
        assert_eq!(phase_worker_count(CostClass::Large, 40, 3, &cfg), 6);
        assert_eq!(phase_worker_count(CostClass::Large, 40, 20, &cfg), 16);
        assert_eq!(phase_worker_count(CostClass::Medium, 40, 20, &cfg), 12);
        assert_eq!(phase_worker_count(CostClass::Small, 40, 3, &cfg), 3);
        assert_eq!(phase_worker_count(CostClass::Small, 40, 20, &cfg), 8);
        assert_eq!(phase_worker_count(CostClass::Small, 2, 20, &cfg), 2);
        assert_eq!(phase_worker_count(CostClass::Small, 0, 0, &cfg), 1);
        assert_eq!(range_worker_count(30, 10, &cfg), 12);
        assert_eq!(range_worker_count(0, 0, &cfg), 1);
    }

    #[test]
    fn range_display() {
        assert_eq!(TaskRange::Whole.to_string(), "whole document");
        assert_eq!(TaskRange::Pages { start: 3, end: 3 }.to_string(), "page 3");
        assert_eq!(TaskRange::Pages { start: 1, end: 4 }.to_string(), "pages 1-4");
        let id = TaskId {
            job: JobId("report".into()),
            ordinal: 2,
        };
        assert_eq!(id.to_string(), "report#2");
    }
}
