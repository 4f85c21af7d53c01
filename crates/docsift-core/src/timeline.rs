//! Consistency checks over a work history.
//!
//! Overlapping positions, unexplained gaps and frequent moves are reported
//! as [`Violation`]s so they can be listed next to model-reported findings.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::violations::{Priority, Verdict, Violation};

/// Months of overlap tolerated between consecutive positions.
pub const OVERLAP_TOLERANCE_MONTHS: i32 = 1;
/// Gaps longer than this are medium priority; shorter ones above one month are low.
pub const LONG_GAP_MONTHS: i32 = 6;
/// More distinct locations than this is flagged.
pub const MAX_LOCATIONS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    fn months(self) -> i32 {
        self.year * 12 + self.month as i32 - 1
    }

    /// The current month, UTC.
    pub fn now() -> Self {
        let days = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() / 86_400)
            .unwrap_or(0) as i64;
        let (year, month) = civil_from_days(days);
        Self { year, month }
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

/// Year and month of a day count since 1970-01-01 (proleptic Gregorian).
fn civil_from_days(days: i64) -> (i32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year as i32, month as u32)
}

/// A parsed date in a work history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateMark {
    At(YearMonth),
    /// `至今` / `present`: the position is ongoing.
    Present,
}

static DATE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(\d{4})\s*年\s*(\d{1,2})\s*月",
        r"(\d{4})\.(\d{1,2})",
        r"(\d{4})-(\d{1,2})",
        r"(\d{4})/(\d{1,2})",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Parse `YYYY年M月`, `YYYY.M`, `YYYY-M`, `YYYY/M`, or `至今`/`present`.
pub fn parse_year_month(text: &str) -> Option<DateMark> {
    let text = text.trim();
    let lower = text.to_lowercase();
    if text.contains("至今") || lower.contains("present") {
        return Some(DateMark::Present);
    }
    DATE_PATTERNS.iter().find_map(|re| {
        let caps = re.captures(text)?;
        let year = caps[1].parse().ok()?;
        let month = caps[2].parse().ok()?;
        YearMonth::new(year, month).map(DateMark::At)
    })
}

/// One position in a work history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkEntry {
    pub organization: String,
    pub location: Option<String>,
    pub start: YearMonth,
    /// `None` while the position is ongoing.
    pub end: Option<YearMonth>,
}

impl WorkEntry {
    /// Build an entry from raw date strings. Returns `None` if the start
    /// date can't be read or is `至今`; an unreadable end is treated as ongoing.
    pub fn parse(organization: &str, start: &str, end: &str) -> Option<Self> {
        let DateMark::At(start) = parse_year_month(start)? else {
            return None;
        };
        let end = match parse_year_month(end) {
            Some(DateMark::At(ym)) => Some(ym),
            _ => None,
        };
        Some(Self {
            organization: organization.to_string(),
            location: None,
            start,
            end,
        })
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    fn end_months(&self, now: YearMonth) -> i32 {
        self.end.unwrap_or(now).months()
    }
}

fn finding(rule_id: &str, title: &str, priority: Priority, reason: String) -> Violation {
    Violation {
        rule_id: rule_id.to_string(),
        title: title.to_string(),
        priority,
        verdict: Verdict::Violated,
        reason,
    }
}

/// Check `entries` against the current month.
pub fn check_timeline(entries: &[WorkEntry]) -> Vec<Violation> {
    check_timeline_at(entries, YearMonth::now())
}

/// Check `entries`, treating ongoing positions as ending at `now`.
pub fn check_timeline_at(entries: &[WorkEntry], now: YearMonth) -> Vec<Violation> {
    let mut sorted: Vec<&WorkEntry> = entries.iter().collect();
    sorted.sort_by_key(|e| e.start);

    let mut findings = Vec::new();

    for (i, a) in sorted.iter().enumerate() {
        for b in &sorted[i + 1..] {
            // Inclusive months both positions cover.
            let shared = a.end_months(now).min(b.end_months(now))
                - a.start.months().max(b.start.months())
                + 1;
            if shared > OVERLAP_TOLERANCE_MONTHS {
                findings.push(finding(
                    "timeline-overlap",
                    "overlapping positions",
                    Priority::High,
                    format!(
                        "{} ({} to {}) overlaps {} ({} to {})",
                        a.organization,
                        a.start,
                        fmt_end(a.end),
                        b.organization,
                        b.start,
                        fmt_end(b.end),
                    ),
                ));
            }
        }
    }

    // Track the latest end so far so a long position doesn't produce false gaps.
    let mut latest: Option<(&WorkEntry, i32)> = None;
    for &entry in &sorted {
        if let Some((prev, prev_end)) = latest {
            let gap = entry.start.months() - prev_end - 1;
            if gap > 1 {
                let priority = if gap > LONG_GAP_MONTHS {
                    Priority::Medium
                } else {
                    Priority::Low
                };
                findings.push(finding(
                    "timeline-gap",
                    "employment gap",
                    priority,
                    format!(
                        "{gap} months between {} and {} ({})",
                        prev.organization, entry.organization, entry.start
                    ),
                ));
            }
        }
        let end = entry.end_months(now);
        if latest.is_none_or(|(_, e)| end > e) {
            latest = Some((entry, end));
        }
    }

    let locations: BTreeSet<&str> = sorted
        .iter()
        .filter_map(|e| e.location.as_deref())
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if locations.len() > MAX_LOCATIONS {
        let names: Vec<&str> = locations.iter().copied().collect();
        findings.push(finding(
            "location-changes",
            "frequent location changes",
            Priority::Low,
            format!("{} locations: {}", names.len(), names.join(", ")),
        ));
    }

    tracing::debug!(
        entries = entries.len(),
        findings = findings.len(),
        "timeline checked"
    );
    findings
}

fn fmt_end(end: Option<YearMonth>) -> String {
    end.map_or_else(|| "present".to_string(), |ym| ym.to_string())
}
