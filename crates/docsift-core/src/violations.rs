//! Rule-check verdicts parsed from model output.
//!
//! The cross-check prompt asks the model to answer rule by rule:
//!
//! ```text
//! 规则3: 【高】时间逻辑一致性
//! 判断: ❌违反
//! 理由: 2020年3月在A公司任职的同时，2020年2月已在B公司任职
//! ```
//!
//! [`parse_violations`] turns that text (or its English equivalent) into
//! [`Violation`] records. A record is closed by its reason line.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// Parse `极高`/`高`/`中`/`低` or the English names (case-insensitive).
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "极高" | "critical" => Some(Priority::Critical),
            "高" | "high" => Some(Priority::High),
            "中" | "medium" => Some(Priority::Medium),
            "低" | "low" => Some(Priority::Low),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Priority::Critical => "极高",
            Priority::High => "高",
            Priority::Medium => "中",
            Priority::Low => "低",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Violated,
    Compliant,
    Unknown,
}

impl Verdict {
    /// `违反`/`不符合` are checked before `符合`, which they contain.
    pub fn from_text(text: &str) -> Self {
        let lower = text.to_lowercase();
        if text.contains("违反")
            || text.contains("不符合")
            || text.contains('❌')
            || lower.contains("violat")
            || lower.contains("non-compliant")
        {
            Verdict::Violated
        } else if text.contains("符合") || text.contains('✅') || lower.contains("compliant") {
            Verdict::Compliant
        } else {
            Verdict::Unknown
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// Rule number as written by the model; empty if none was given.
    pub rule_id: String,
    pub title: String,
    pub priority: Priority,
    pub verdict: Verdict,
    pub reason: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rule_id.is_empty() {
            write!(f, "[{}] {}: {}", self.priority, self.title, self.reason)
        } else {
            write!(
                f,
                "[{}] rule {} {}: {}",
                self.priority, self.rule_id, self.title, self.reason
            )
        }
    }
}

static RULE_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:规则|rule)\s*(\d+)\s*[:：]\s*(.+)").unwrap());
static NUMBERED_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)\.\s*【(极高|高|中|低)】(.+)").unwrap());
static BRACKET_PRIORITY: Lazy<Regex> = Lazy::new(|| Regex::new(r"【(极高|高|中|低)】").unwrap());
static PRIORITY_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:优先级|priority)\s*[:：]\s*(极高|高|中|低|critical|high|medium|low)")
        .unwrap()
});
static VERDICT_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:判断|verdict)\s*[:：]\s*(.+)").unwrap());
static REASON_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:理由|reason)\s*[:：]\s*(.+)").unwrap());

/// Reasons that mean "couldn't tell" rather than a real finding.
const NON_FINDINGS: &[&str] = &["材料信息不足", "无法判断", "符合要求", "无明显问题", "暂无发现"];

#[derive(Default)]
struct Pending {
    rule_id: String,
    title: String,
    priority: Option<Priority>,
    verdict: Option<Verdict>,
}

/// Parse every rule verdict in `text`, compliant ones included.
///
/// Priorities default to medium; a record with no verdict line is `Unknown`.
pub fn parse_violations(text: &str) -> Vec<Violation> {
    let mut out = Vec::new();
    let mut cur = Pending::default();

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(caps) = NUMBERED_HEADER.captures(line) {
            cur = Pending {
                rule_id: caps[1].to_string(),
                priority: Priority::from_label(&caps[2]),
                title: caps[3]
                    .split([':', '：'])
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
                verdict: None,
            };
            continue;
        }
        if let Some(caps) = RULE_HEADER.captures(line) {
            let raw_title = caps[2].trim();
            let priority = BRACKET_PRIORITY
                .captures(raw_title)
                .and_then(|p| Priority::from_label(&p[1]));
            cur = Pending {
                rule_id: caps[1].to_string(),
                title: BRACKET_PRIORITY.replace_all(raw_title, "").trim().to_string(),
                priority,
                verdict: None,
            };
            continue;
        }
        if let Some(caps) = PRIORITY_LINE.captures(line) {
            cur.priority = Priority::from_label(&caps[1]);
            continue;
        }
        if let Some(caps) = BRACKET_PRIORITY.captures(line) {
            cur.priority = Priority::from_label(&caps[1]);
            continue;
        }
        if let Some(caps) = VERDICT_LINE.captures(line) {
            cur.verdict = Some(Verdict::from_text(&caps[1]));
            continue;
        }
        if let Some(caps) = REASON_LINE.captures(line) {
            let done = std::mem::take(&mut cur);
            out.push(Violation {
                rule_id: done.rule_id,
                title: if done.title.is_empty() {
                    "rule check".to_string()
                } else {
                    done.title
                },
                priority: done.priority.unwrap_or(Priority::Medium),
                verdict: done.verdict.unwrap_or(Verdict::Unknown),
                reason: caps[1].trim().to_string(),
            });
        }
    }
    out
}

/// Only the records that are real violations, highest priority first.
///
/// Violations whose reason amounts to "not enough information" are dropped.
pub fn violations_only(text: &str) -> Vec<Violation> {
    let mut found: Vec<Violation> = parse_violations(text)
        .into_iter()
        .filter(|v| v.verdict == Verdict::Violated)
        .filter(|v| !NON_FINDINGS.iter().any(|k| v.reason.contains(k)))
        .collect();
    found.sort_by_key(|v| v.priority);
    found
}
