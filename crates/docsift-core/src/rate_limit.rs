//! Error classification, retry backoff and per-credential rate limiting.
//!
//! Every inference failure is classified into an [`ErrorKind`] that decides
//! what happens next: back off with jitter, rotate immediately to another
//! credential, back off plainly, or give up. Each credential also owns an
//! adaptive governor that slows down after a 429 and recovers after a quiet
//! minute.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

/// Type alias for governor's direct rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Error returned by an inference backend.
#[derive(Debug, Clone)]
pub enum InferenceError {
    /// Server returned 429 or reported an exhausted quota.
    RateLimited { retry_after: Option<Duration> },
    /// The credential itself was rejected.
    InvalidCredential(String),
    /// The request was refused for its content (malformed or oversized payload).
    Rejected(String),
    /// Any other error, classified by its message.
    Other(String),
}

impl InferenceError {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            InferenceError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl std::fmt::Display for InferenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InferenceError::RateLimited {
                retry_after: Some(d),
            } => write!(f, "Rate limited (429), retry after {:.1}s", d.as_secs_f64()),
            InferenceError::RateLimited { retry_after: None } => write!(f, "Rate limited (429)"),
            InferenceError::InvalidCredential(msg) => write!(f, "Invalid API key: {}", msg),
            InferenceError::Rejected(msg) => write!(f, "Request rejected: {}", msg),
            InferenceError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for InferenceError {}

impl From<String> for InferenceError {
    fn from(s: String) -> Self {
        InferenceError::Other(s)
    }
}

/// What the retry loop should do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Back off exponentially with jitter, then retry.
    RateLimited,
    /// Retry at once on the next credential.
    InvalidCredential,
    /// Plain exponential backoff, then retry.
    Transient,
    /// Not worth retrying: the payload itself is the problem.
    Permanent,
}

const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "quota",
    "too many requests",
    "429",
    "resource_exhausted",
    "resource exhausted",
];

const INVALID_CREDENTIAL_MARKERS: &[&str] = &[
    "invalid api key",
    "api_key_invalid",
    "api key not valid",
    "api key expired",
    "permission_denied",
];

const PERMANENT_MARKERS: &[&str] = &[
    "file is too large",
    "invalid pdf",
    "not a pdf",
    "payload error",
    "unsupported mime",
    "document has no pages",
    "exceeds the limit",
    "payload size",
    "request entity too large",
    "invalid_argument",
];

pub fn classify_error(err: &InferenceError) -> ErrorKind {
    match err {
        InferenceError::RateLimited { .. } => ErrorKind::RateLimited,
        InferenceError::InvalidCredential(_) => ErrorKind::InvalidCredential,
        InferenceError::Rejected(_) => ErrorKind::Permanent,
        InferenceError::Other(msg) => classify_message(msg),
    }
}

/// Classify a free-form error description.
///
/// Rate-limit markers win over credential markers, which win over payload
/// markers; anything unrecognised is treated as transient.
pub fn classify_message(msg: &str) -> ErrorKind {
    let lower = msg.to_lowercase();
    if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorKind::RateLimited
    } else if INVALID_CREDENTIAL_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorKind::InvalidCredential
    } else if PERMANENT_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorKind::Permanent
    } else {
        ErrorKind::Transient
    }
}

/// Backoff policy knobs.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Upper bound for any single wait.
    pub max_delay: Duration,
    /// Rate-limit waits are scaled by `1 + U[0, jitter)`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_delay: Duration::from_secs(60),
            jitter: 0.5,
        }
    }
}

/// How long to wait before retry number `attempt + 1`.
///
/// `attempt` is zero-based. A server-provided Retry-After replaces the
/// computed rate-limit wait, still capped at `max_delay`.
pub fn backoff_delay(
    kind: ErrorKind,
    attempt: u32,
    retry_after: Option<Duration>,
    cfg: &BackoffConfig,
) -> Duration {
    let base = 2f64.powi(attempt.min(16) as i32);
    match kind {
        ErrorKind::RateLimited => {
            let computed = Duration::from_secs_f64(base * (1.0 + fastrand::f64() * cfg.jitter));
            retry_after.unwrap_or(computed).min(cfg.max_delay)
        }
        ErrorKind::Transient => Duration::from_secs_f64(base).min(cfg.max_delay),
        ErrorKind::InvalidCredential | ErrorKind::Permanent => Duration::ZERO,
    }
}

/// Parse a Retry-After header value (seconds or HTTP-date).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    // HTTP-date: use a conservative fixed wait rather than parsing it
    if value.contains(',') || value.contains("GMT") {
        return Some(Duration::from_secs(5));
    }
    None
}

fn quota_for(period: Duration) -> Quota {
    Quota::with_period(period).unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
}

/// Per-credential limiter with adaptive rate adjustment via ArcSwap.
///
/// On a rate-limit response the governor is atomically swapped for a slower
/// one. After 60s without another, the original rate is restored.
pub struct AdaptiveLimiter {
    limiter: ArcSwap<DirectLimiter>,
    base_period: Duration,
    /// Current slowdown factor (1 = normal, 2 = half rate, etc.).
    current_factor: AtomicU32,
    last_429: std::sync::Mutex<Option<Instant>>,
}

impl AdaptiveLimiter {
    pub fn new(period: Duration) -> Self {
        let limiter = Arc::new(DirectLimiter::direct(quota_for(period)));
        Self {
            limiter: ArcSwap::from(limiter),
            base_period: period,
            current_factor: AtomicU32::new(1),
            last_429: std::sync::Mutex::new(None),
        }
    }

    /// Create a limiter allowing `n` requests per second.
    pub fn per_second(n: u32) -> Self {
        let ms = 1000 / n.max(1) as u64;
        Self::new(Duration::from_millis(ms.max(1)))
    }

    /// Wait until the governor allows a request.
    pub async fn acquire(&self) {
        self.try_decay();
        let limiter = self.limiter.load();
        limiter.until_ready().await;
    }

    /// Double the slowdown factor (capped at 16x) and swap the governor.
    pub fn on_rate_limited(&self) {
        if let Ok(mut last) = self.last_429.lock() {
            *last = Some(Instant::now());
        }

        let _ = self
            .current_factor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                Some((f * 2).min(16))
            });

        let factor = self.current_factor.load(Ordering::SeqCst);
        if let Some(scaled) = self.base_period.checked_mul(factor) {
            self.limiter
                .store(Arc::new(DirectLimiter::direct(quota_for(scaled))));
        }
    }

    pub fn factor(&self) -> u32 {
        self.current_factor.load(Ordering::SeqCst)
    }

    fn try_decay(&self) {
        let should_restore = self
            .last_429
            .lock()
            .ok()
            .and_then(|last| last.map(|t| t.elapsed().as_secs() >= 60))
            .unwrap_or(false);

        if should_restore && self.current_factor.load(Ordering::SeqCst) > 1 {
            self.current_factor.store(1, Ordering::SeqCst);
            self.limiter
                .store(Arc::new(DirectLimiter::direct(quota_for(self.base_period))));
        }
    }
}

/// One limiter per credential, indexed by credential id.
pub struct RateLimiters {
    limiters: Vec<AdaptiveLimiter>,
}

impl RateLimiters {
    /// Build `count` limiters at `per_second` requests each; `None` disables limiting.
    pub fn new(count: usize, per_second: Option<u32>) -> Self {
        let limiters = match per_second {
            Some(rps) => (0..count).map(|_| AdaptiveLimiter::per_second(rps)).collect(),
            None => Vec::new(),
        };
        Self { limiters }
    }

    pub fn disabled() -> Self {
        Self {
            limiters: Vec::new(),
        }
    }

    pub fn get(&self, credential: usize) -> Option<&AdaptiveLimiter> {
        self.limiters.get(credential)
    }
}
