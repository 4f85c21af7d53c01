//! Rotating pool of interchangeable API credentials.
//!
//! Handles are issued round-robin. Each credential carries a consecutive-error
//! counter: reaching the threshold takes it out of rotation, and successes
//! count it back down until it rejoins. When every credential is out the
//! whole blacklist is reset, on the assumption that the outage is transient.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Consecutive errors before a credential leaves rotation.
pub const DEFAULT_BLACKLIST_THRESHOLD: u32 = 3;

/// How many recent latency samples each credential keeps.
const LATENCY_WINDOW: usize = 10;

/// One issued credential, valid for a single call attempt.
#[derive(Clone)]
pub struct CredentialHandle {
    pub id: usize,
    pub key: Arc<str>,
}

impl fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialHandle")
            .field("id", &self.id)
            .field("key", &"***")
            .finish()
    }
}

struct Credential {
    key: Arc<str>,
    consecutive_errors: u32,
    successes: u64,
    failures: u64,
    usage: u64,
    latencies: VecDeque<Duration>,
    blacklisted: bool,
}

impl Credential {
    fn new(key: &str) -> Self {
        Self {
            key: Arc::from(key),
            consecutive_errors: 0,
            successes: 0,
            failures: 0,
            usage: 0,
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
            blacklisted: false,
        }
    }

    fn avg_latency(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let total: Duration = self.latencies.iter().sum();
        Some(total / self.latencies.len() as u32)
    }

    fn success_rate(&self) -> f64 {
        let attempts = self.successes + self.failures;
        if attempts == 0 {
            0.0
        } else {
            self.successes as f64 / attempts as f64
        }
    }

    /// Throughput-style score: success rate per second of average latency.
    fn score(&self) -> f64 {
        let rate = self.success_rate();
        match self.avg_latency() {
            Some(avg) if avg.as_secs_f64() > 0.0 => rate / avg.as_secs_f64(),
            _ => rate,
        }
    }
}

struct PoolState {
    credentials: Vec<Credential>,
    cursor: usize,
}

/// Health snapshot of one credential.
#[derive(Debug, Clone)]
pub struct CredentialStatus {
    pub id: usize,
    /// Last four characters of the key, for telling credentials apart in logs.
    pub label: String,
    pub usage: u64,
    pub consecutive_errors: u32,
    pub successes: u64,
    pub failures: u64,
    pub avg_latency: Option<Duration>,
    pub success_rate: f64,
    pub blacklisted: bool,
}

/// Health snapshot of the whole pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStatus {
    pub total: usize,
    pub available: usize,
    pub blacklisted: usize,
    pub credentials: Vec<CredentialStatus>,
    /// Credential ids, best first. Informational only; rotation stays round-robin.
    pub ranking: Vec<usize>,
}

/// Thread-safe credential rotation with a self-healing blacklist.
///
/// All state sits behind one mutex; the pool is small and every call
/// that touches it is dwarfed by the network call it guards.
pub struct CredentialPool {
    state: Mutex<PoolState>,
    blacklist_threshold: u32,
}

impl CredentialPool {
    pub fn new<S: AsRef<str>>(keys: &[S], blacklist_threshold: u32) -> Self {
        Self {
            state: Mutex::new(PoolState {
                credentials: keys.iter().map(|k| Credential::new(k.as_ref())).collect(),
                cursor: 0,
            }),
            blacklist_threshold: blacklist_threshold.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Issue the next healthy credential in round-robin order.
    ///
    /// Returns `None` only if the pool holds no credentials at all.
    pub fn acquire(&self) -> Option<CredentialHandle> {
        let mut state = self.lock();
        let n = state.credentials.len();
        if n == 0 {
            return None;
        }

        if state.credentials.iter().all(|c| c.blacklisted) {
            tracing::warn!(total = n, "all credentials blacklisted, resetting blacklist");
            for cred in state.credentials.iter_mut() {
                cred.blacklisted = false;
                cred.consecutive_errors = 0;
            }
            state.cursor = 0;
        }

        for step in 0..n {
            let idx = (state.cursor + step) % n;
            if !state.credentials[idx].blacklisted {
                state.cursor = (idx + 1) % n;
                let cred = &mut state.credentials[idx];
                cred.usage += 1;
                return Some(CredentialHandle {
                    id: idx,
                    key: Arc::clone(&cred.key),
                });
            }
        }
        None
    }

    /// Record a successful call and its latency.
    pub fn report_success(&self, id: usize, latency: Duration) {
        let mut state = self.lock();
        let Some(cred) = state.credentials.get_mut(id) else {
            return;
        };
        cred.successes += 1;
        if cred.latencies.len() == LATENCY_WINDOW {
            cred.latencies.pop_front();
        }
        cred.latencies.push_back(latency);
        cred.consecutive_errors = cred.consecutive_errors.saturating_sub(1);
        if cred.blacklisted && cred.consecutive_errors == 0 {
            cred.blacklisted = false;
            tracing::info!(credential = id, "credential back in rotation");
        }
    }

    /// Record a failed call. Returns `true` if this failure blacklisted the credential.
    pub fn report_failure(&self, id: usize, error: &str) -> bool {
        let threshold = self.blacklist_threshold;
        let mut state = self.lock();
        let Some(cred) = state.credentials.get_mut(id) else {
            return false;
        };
        cred.failures += 1;
        cred.consecutive_errors += 1;
        tracing::debug!(
            credential = id,
            errors = cred.consecutive_errors,
            error,
            "credential call failed"
        );
        if !cred.blacklisted && cred.consecutive_errors >= threshold {
            cred.blacklisted = true;
            tracing::warn!(
                credential = id,
                errors = cred.consecutive_errors,
                "credential blacklisted"
            );
            return true;
        }
        false
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.lock();
        let credentials: Vec<CredentialStatus> = state
            .credentials
            .iter()
            .enumerate()
            .map(|(id, c)| CredentialStatus {
                id,
                label: key_label(&c.key),
                usage: c.usage,
                consecutive_errors: c.consecutive_errors,
                successes: c.successes,
                failures: c.failures,
                avg_latency: c.avg_latency(),
                success_rate: c.success_rate(),
                blacklisted: c.blacklisted,
            })
            .collect();

        let mut ranking: Vec<(usize, f64)> = state
            .credentials
            .iter()
            .enumerate()
            .map(|(id, c)| (id, c.score()))
            .collect();
        ranking.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let blacklisted = credentials.iter().filter(|c| c.blacklisted).count();
        PoolStatus {
            total: credentials.len(),
            available: credentials.len() - blacklisted,
            blacklisted,
            credentials,
            ranking: ranking.into_iter().map(|(id, _)| id).collect(),
        }
    }
}

impl fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status();
        f.debug_struct("CredentialPool")
            .field("total", &status.total)
            .field("available", &status.available)
            .field("blacklist_threshold", &self.blacklist_threshold)
            .finish()
    }
}

/// Mask a key down to its last four characters.
pub fn key_label(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("…{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> CredentialPool {
        let keys: Vec<String> = (0..n).map(|i| format!("key-number-{i}")).collect();
        CredentialPool::new(&keys, DEFAULT_BLACKLIST_THRESHOLD)
    }

    #[test]
    fn empty_pool_yields_nothing() {
        let pool = CredentialPool::new::<&str>(&[], 3);
        assert!(pool.acquire().is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn round_robin_order() {
        let pool = pool(3);
        let ids: Vec<usize> = (0..6).map(|_| pool.acquire().unwrap().id).collect();
        assert_eq!(ids, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn threshold_blacklists_and_skips() {
        let pool = pool(3);
        assert!(!pool.report_failure(1, "boom"));
        assert!(!pool.report_failure(1, "boom"));
        assert!(pool.report_failure(1, "boom"));
        // Further failures don't re-announce.
        assert!(!pool.report_failure(1, "boom"));

        let ids: Vec<usize> = (0..4).map(|_| pool.acquire().unwrap().id).collect();
        assert_eq!(ids, vec![0, 2, 0, 2]);

        let status = pool.status();
        assert_eq!(status.blacklisted, 1);
        assert_eq!(status.available, 2);
    }

    #[test]
    fn successes_heal_blacklisted_credential() {
        let pool = pool(2);
        for _ in 0..3 {
            pool.report_failure(0, "rate limit");
        }
        assert!(pool.status().credentials[0].blacklisted);

        pool.report_success(0, Duration::from_millis(100));
        let s = pool.status();
        assert_eq!(s.credentials[0].consecutive_errors, 2);
        assert!(s.credentials[0].blacklisted);

        pool.report_success(0, Duration::from_millis(100));
        pool.report_success(0, Duration::from_millis(100));
        let s = pool.status();
        assert_eq!(s.credentials[0].consecutive_errors, 0);
        assert!(!s.credentials[0].blacklisted);

        let ids: Vec<usize> = (0..2).map(|_| pool.acquire().unwrap().id).collect();
        assert!(ids.contains(&0));
    }

    #[test]
    fn all_blacklisted_resets() {
        let pool = pool(2);
        for id in 0..2 {
            for _ in 0..3 {
                pool.report_failure(id, "invalid api key");
            }
        }
        assert_eq!(pool.status().available, 0);

        let handle = pool.acquire().unwrap();
        assert_eq!(handle.id, 0);
        let s = pool.status();
        assert_eq!(s.available, 2);
        assert!(s.credentials.iter().all(|c| c.consecutive_errors == 0));
    }

    #[test]
    fn latency_window_keeps_last_ten() {
        let pool = pool(1);
        for ms in 1..=15u64 {
            pool.report_success(0, Duration::from_millis(ms * 100));
        }
        // Samples 6..=15 remain: mean 1050ms.
        let avg = pool.status().credentials[0].avg_latency.unwrap();
        assert_eq!(avg, Duration::from_millis(1050));
    }

    #[test]
    fn ranking_prefers_fast_reliable_credentials() {
        let pool = pool(3);
        pool.report_success(0, Duration::from_secs(4));
        pool.report_success(1, Duration::from_secs(1));
        pool.report_success(2, Duration::from_secs(1));
        pool.report_failure(2, "transient");

        let ranking = pool.status().ranking;
        assert_eq!(ranking, vec![1, 2, 0]);
    }

    #[test]
    fn usage_counts_acquisitions() {
        let pool = pool(2);
        for _ in 0..5 {
            pool.acquire();
        }
        let s = pool.status();
        assert_eq!(s.credentials[0].usage, 3);
        assert_eq!(s.credentials[1].usage, 2);
    }

    #[test]
    fn unknown_id_is_ignored() {
        let pool = pool(1);
        pool.report_success(7, Duration::from_secs(1));
        assert!(!pool.report_failure(7, "nope"));
    }

    #[test]
    fn labels_mask_keys() {
        assert_eq!(key_label("AIzaSyABCDEFwxyz"), "…wxyz");
        assert_eq!(key_label("abc"), "****");
        let handle = pool(1).acquire().unwrap();
        assert!(!format!("{handle:?}").contains("key-number"));
    }

    #[test]
    fn concurrent_acquire_and_report() {
        let pool = Arc::new(pool(4));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let h = pool.acquire().unwrap();
                        if i % 3 == 0 {
                            pool.report_failure(h.id, "transient");
                        } else {
                            pool.report_success(h.id, Duration::from_millis(10));
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let s = pool.status();
        let usage: u64 = s.credentials.iter().map(|c| c.usage).sum();
        assert_eq!(usage, 800);
        let outcomes: u64 = s.credentials.iter().map(|c| c.successes + c.failures).sum();
        assert_eq!(outcomes, 800);
    }
}
