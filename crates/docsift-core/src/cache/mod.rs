//! Three-tier cache for extraction results.
//!
//! **Memory** – `HashMap` behind a coarse mutex, LRU-evicted by item count.
//! **Remote** – optional shared tier ([`RemoteTier`]), best-effort.
//! **Disk** – one JSON file per entry, bounded by total bytes.
//!
//! Entries are keyed by `"{prefix}_{content hash}"` of the source file. On
//! [`get`](TieredCache::get) the tiers are tried fastest first and a hit is
//! promoted upward. Every hit is re-validated: an entry older than
//! `max_age`, or whose source file changed size or mtime, is deleted from the
//! tier that held it and treated as a miss.

mod disk;
pub mod fingerprint;
mod remote;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::source::{FsSourceStore, SourceMeta, SourceStore};
use disk::{DiskLoad, DiskTier};
pub use fingerprint::Fingerprint;
pub use remote::{MemoryRemoteTier, RemoteTier, SqliteRemoteTier};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("source error: {0}")]
    Source(#[from] docsift_pdf::PdfError),
    #[error("remote tier error: {0}")]
    Remote(String),
}

/// Cache tuning. All thresholds are policy defaults, not structural limits.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Disk tier directory. `None` means no cache is built.
    pub dir: Option<PathBuf>,
    /// SQLite file for the shared tier.
    pub remote_path: Option<PathBuf>,
    pub max_age: Duration,
    pub max_memory_items: usize,
    pub max_disk_bytes: u64,
    /// Disk eviction stops once usage is at or below this fraction of the cap.
    pub disk_target_ratio: f64,
    /// Files above this size are fingerprinted from head/tail windows.
    pub large_file_threshold: u64,
    pub window_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: dirs::cache_dir().map(|d| d.join("docsift")),
            remote_path: None,
            max_age: Duration::from_secs(24 * 60 * 60),
            max_memory_items: 100,
            max_disk_bytes: 1000 * 1024 * 1024,
            disk_target_ratio: 0.8,
            large_file_threshold: 10 * 1024 * 1024,
            window_bytes: 1024 * 1024,
        }
    }
}

/// One cached extraction result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub content: String,
    pub fingerprint: Fingerprint,
    pub created_at_ms: u64,
    pub access_count: u64,
    pub last_access_ms: u64,
}

impl CacheEntry {
    fn new(content: String, fingerprint: Fingerprint) -> Self {
        let now = now_ms();
        Self {
            content,
            fingerprint,
            created_at_ms: now,
            access_count: 0,
            last_access_ms: now,
        }
    }

    pub fn is_expired(&self, now_ms: u64, max_age: Duration) -> bool {
        let max_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        now_ms.saturating_sub(self.created_at_ms) > max_ms
    }

    fn is_valid(&self, meta: &SourceMeta, now_ms: u64, max_age: Duration) -> bool {
        !self.is_expired(now_ms, max_age) && self.fingerprint.matches(meta)
    }

    fn touch(&mut self) {
        self.access_count += 1;
        self.last_access_ms = now_ms();
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub memory_hits: u64,
    pub remote_hits: u64,
    pub disk_hits: u64,
    pub memory_items: usize,
    pub files_cached: u64,
    pub disk_bytes: u64,
    pub avg_lookup_ms: f64,
    pub has_remote: bool,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn cache_size_mb(&self) -> f64 {
        self.disk_bytes as f64 / (1024.0 * 1024.0)
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

struct MemorySlot {
    entry: CacheEntry,
    /// Monotonic access sequence; lowest is least recently used.
    seq: u64,
}

/// State guarded by the coarse cache lock: the memory map and disk usage.
struct Inner {
    memory: HashMap<String, MemorySlot>,
    next_seq: u64,
    disk_files: u64,
    disk_bytes: u64,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Evict the least recently used quarter (at least one) if at capacity.
    fn make_room(&mut self, cap: usize) {
        if cap == 0 || self.memory.len() < cap {
            return;
        }
        let evict = (self.memory.len() / 4).max(1);
        let mut by_age: Vec<(u64, String)> = self
            .memory
            .iter()
            .map(|(k, slot)| (slot.seq, k.clone()))
            .collect();
        by_age.sort_unstable();
        for (_, key) in by_age.into_iter().take(evict) {
            self.memory.remove(&key);
        }
        tracing::debug!(evicted = evict, remaining = self.memory.len(), "memory cache evicted");
    }

    fn insert_memory(&mut self, key: String, entry: CacheEntry, cap: usize) {
        if cap == 0 {
            return;
        }
        if !self.memory.contains_key(&key) {
            self.make_room(cap);
        }
        let seq = self.bump();
        self.memory.insert(key, MemorySlot { entry, seq });
    }
}

/// Thread-safe tiered cache for extraction results.
pub struct TieredCache {
    config: CacheConfig,
    inner: Mutex<Inner>,
    disk: DiskTier,
    remote: Option<Arc<dyn RemoteTier>>,
    hits: AtomicU64,
    misses: AtomicU64,
    memory_hits: AtomicU64,
    remote_hits: AtomicU64,
    disk_hits: AtomicU64,
    /// Running sum of lookup durations in microseconds (for computing average).
    total_lookup_us: AtomicU64,
    total_lookups: AtomicU64,
}

impl TieredCache {
    /// Open a cache rooted at `dir`.
    ///
    /// Expired and unreadable disk entries are swept on startup, as are
    /// expired remote entries.
    pub fn open(
        dir: &Path,
        remote: Option<Arc<dyn RemoteTier>>,
        config: CacheConfig,
    ) -> Result<Self, CacheError> {
        let disk = DiskTier::open(dir)?;
        let swept = disk.sweep_expired(config.max_age);
        if swept > 0 {
            tracing::info!(removed = swept, "removed expired disk cache entries");
        }
        if let Some(ref tier) = remote {
            match tier.evict_expired(config.max_age) {
                Ok(n) if n > 0 => tracing::info!(removed = n, tier = tier.name(), "removed expired remote cache entries"),
                Ok(_) => {}
                Err(e) => tracing::warn!(tier = tier.name(), error = %e, "remote cache sweep failed"),
            }
        }
        let (disk_files, disk_bytes) = disk.usage();
        Ok(Self {
            config,
            inner: Mutex::new(Inner {
                memory: HashMap::new(),
                next_seq: 0,
                disk_files,
                disk_bytes,
            }),
            disk,
            remote,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            memory_hits: AtomicU64::new(0),
            remote_hits: AtomicU64::new(0),
            disk_hits: AtomicU64::new(0),
            total_lookup_us: AtomicU64::new(0),
            total_lookups: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn key_for(
        &self,
        store: &dyn SourceStore,
        source: &Path,
        prefix: &str,
    ) -> Result<(String, Fingerprint), docsift_pdf::PdfError> {
        let fp = fingerprint::fingerprint(
            store,
            source,
            self.config.large_file_threshold,
            self.config.window_bytes,
        )?;
        Ok((format!("{}_{}", sanitize_prefix(prefix), fp.hash), fp))
    }

    /// Look up the cached result for the local file `source` under `prefix`.
    pub fn get(&self, source: &Path, prefix: &str) -> Option<String> {
        self.get_from(&FsSourceStore, source, prefix)
    }

    /// Like [`get`](Self::get), fingerprinting `source` through `store`.
    pub fn get_from(&self, store: &dyn SourceStore, source: &Path, prefix: &str) -> Option<String> {
        let start = Instant::now();
        let result = self.lookup(store, source, prefix);
        match result {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        let us = start.elapsed().as_micros() as u64;
        self.total_lookup_us.fetch_add(us, Ordering::Relaxed);
        self.total_lookups.fetch_add(1, Ordering::Relaxed);
        result
    }

    fn lookup(&self, store: &dyn SourceStore, source: &Path, prefix: &str) -> Option<String> {
        let Ok((key, fp)) = self.key_for(store, source, prefix) else {
            tracing::trace!(source = %source.display(), "cache miss: source unreadable");
            return None;
        };
        let meta = SourceMeta {
            size: fp.size,
            mtime_ms: fp.mtime_ms,
        };
        let max_age = self.config.max_age;
        let cap = self.config.max_memory_items;

        // Memory
        {
            let mut inner = self.lock();
            let seq = inner.bump();
            let now = now_ms();
            if let Some(slot) = inner.memory.get_mut(&key) {
                if slot.entry.is_valid(&meta, now, max_age) {
                    slot.entry.touch();
                    slot.seq = seq;
                    self.memory_hits.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(key, "cache memory hit");
                    return Some(slot.entry.content.clone());
                }
                inner.memory.remove(&key);
                tracing::trace!(key, "stale memory entry dropped");
            }
        }

        // Remote
        if let Some(ref tier) = self.remote {
            match tier.get(&key) {
                Ok(Some(mut entry)) => {
                    if entry.is_valid(&meta, now_ms(), max_age) {
                        entry.touch();
                        let content = entry.content.clone();
                        let mut inner = self.lock();
                        if inner.memory.len() < cap {
                            inner.insert_memory(key.clone(), entry, cap);
                        }
                        self.remote_hits.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!(key, tier = tier.name(), "cache remote hit");
                        return Some(content);
                    }
                    if let Err(e) = tier.delete(&key) {
                        tracing::warn!(key, error = %e, "failed to delete stale remote entry");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(key, tier = tier.name(), error = %e, "remote cache lookup failed");
                }
            }
        }

        // Disk
        let promoted = {
            let mut inner = self.lock();
            match self.disk.load(&key) {
                DiskLoad::Hit(mut entry) => {
                    if entry.is_valid(&meta, now_ms(), max_age) {
                        entry.touch();
                        inner.insert_memory(key.clone(), entry.clone(), cap);
                        self.disk_hits.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!(key, "cache disk hit");
                        Some(entry)
                    } else {
                        let freed = self.disk.remove(&key);
                        if freed > 0 {
                            inner.disk_files = inner.disk_files.saturating_sub(1);
                            inner.disk_bytes = inner.disk_bytes.saturating_sub(freed);
                        }
                        tracing::trace!(key, "stale disk entry dropped");
                        None
                    }
                }
                DiskLoad::Corrupt => {
                    let (files, bytes) = self.disk.usage();
                    inner.disk_files = files;
                    inner.disk_bytes = bytes;
                    None
                }
                DiskLoad::Missing => None,
            }
        };

        let entry = promoted?;
        if let Some(ref tier) = self.remote
            && let Err(e) = tier.set(&key, &entry)
        {
            tracing::warn!(key, tier = tier.name(), error = %e, "remote cache promotion failed");
        }
        Some(entry.content)
    }

    /// Store `content` for `source` under `prefix`.
    ///
    /// Memory and disk are always written; the remote write is best-effort and
    /// only logged on failure. Errors are returned only when the source can't
    /// be fingerprinted or the disk write fails.
    pub fn set(&self, source: &Path, prefix: &str, content: &str) -> Result<(), CacheError> {
        self.set_from(&FsSourceStore, source, prefix, content)
    }

    /// Like [`set`](Self::set), fingerprinting `source` through `store`.
    pub fn set_from(
        &self,
        store: &dyn SourceStore,
        source: &Path,
        prefix: &str,
        content: &str,
    ) -> Result<(), CacheError> {
        let (key, fp) = self.key_for(store, source, prefix)?;
        let entry = CacheEntry::new(content.to_string(), fp);
        let cap = self.config.max_memory_items;

        {
            let mut inner = self.lock();
            inner.insert_memory(key.clone(), entry.clone(), cap);

            let (written, replaced) = self.disk.store(&key, &entry)?;
            if replaced == 0 {
                inner.disk_files += 1;
            }
            inner.disk_bytes = inner.disk_bytes.saturating_sub(replaced) + written;

            if inner.disk_bytes > self.config.max_disk_bytes {
                let target =
                    (self.config.max_disk_bytes as f64 * self.config.disk_target_ratio) as u64;
                let (files, bytes) = self.disk.shrink_to(target);
                inner.disk_files = files;
                inner.disk_bytes = bytes;
            }
        }

        if let Some(ref tier) = self.remote
            && let Err(e) = tier.set(&key, &entry)
        {
            tracing::warn!(key, tier = tier.name(), error = %e, "remote cache write failed");
        }
        tracing::debug!(key, chars = content.chars().count(), "cached extraction result");
        Ok(())
    }

    /// Remove everything from every tier.
    pub fn clear(&self) -> Result<(), CacheError> {
        {
            let mut inner = self.lock();
            inner.memory.clear();
            self.disk.clear()?;
            inner.disk_files = 0;
            inner.disk_bytes = 0;
        }
        if let Some(ref tier) = self.remote
            && let Err(e) = tier.clear()
        {
            tracing::warn!(tier = tier.name(), error = %e, "failed to clear remote cache");
        }
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let lookups = self.total_lookups.load(Ordering::Relaxed);
        let avg_lookup_ms = if lookups == 0 {
            0.0
        } else {
            self.total_lookup_us.load(Ordering::Relaxed) as f64 / lookups as f64 / 1000.0
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            remote_hits: self.remote_hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            memory_items: inner.memory.len(),
            files_cached: inner.disk_files,
            disk_bytes: inner.disk_bytes,
            avg_lookup_ms,
            has_remote: self.remote.is_some(),
        }
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn dir(&self) -> &Path {
        self.disk.dir()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("TieredCache")
            .field("dir", &self.disk.dir())
            .field("memory_items", &stats.memory_items)
            .field("files_cached", &stats.files_cached)
            .field("hits", &stats.hits)
            .field("misses", &stats.misses)
            .field("remote", &self.remote.as_ref().map(|r| r.name().to_string()))
            .finish()
    }
}

/// Keep key prefixes filesystem-safe.
fn sanitize_prefix(prefix: &str) -> String {
    prefix
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_dir() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "docsift_test_cache_{}_{}",
            std::process::id(),
            id,
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn source(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn open(dir: &Path, config: CacheConfig) -> TieredCache {
        TieredCache::open(&dir.join("cache"), None, config).unwrap()
    }

    #[test]
    fn miss_then_round_trip() {
        let dir = temp_dir();
        let src = source(&dir, "a.pdf", b"%PDF-1.5 alpha");
        let cache = open(&dir, CacheConfig::default());

        assert!(cache.get(&src, "content").is_none());
        cache.set(&src, "content", "extracted alpha").unwrap();
        assert_eq!(cache.get(&src, "content").unwrap(), "extracted alpha");

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.files_cached, 1);
        assert!(stats.disk_bytes > 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn prefixes_are_separate_namespaces() {
        let dir = temp_dir();
        let src = source(&dir, "a.pdf", b"%PDF-1.5 alpha");
        let cache = open(&dir, CacheConfig::default());
        cache.set(&src, "range_1_4", "first").unwrap();
        cache.set(&src, "range_5_8", "second").unwrap();
        assert_eq!(cache.get(&src, "range_1_4").unwrap(), "first");
        assert_eq!(cache.get(&src, "range_5_8").unwrap(), "second");
        assert!(cache.get(&src, "content").is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn size_change_invalidates() {
        let dir = temp_dir();
        let src = source(&dir, "a.pdf", b"%PDF-1.5 alpha");
        let cache = open(&dir, CacheConfig::default());
        cache.set(&src, "content", "old text").unwrap();

        std::fs::write(&src, b"%PDF-1.5 alpha plus more bytes").unwrap();
        assert!(cache.get(&src, "content").is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn mtime_change_invalidates_and_deletes() {
        let dir = temp_dir();
        let src = source(&dir, "a.pdf", b"%PDF-1.5 alpha");
        let cache = open(&dir, CacheConfig::default());
        cache.set(&src, "content", "text").unwrap();

        // Same bytes, newer mtime: key matches but the fingerprint doesn't.
        let file = std::fs::File::options().write(true).open(&src).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();
        drop(file);

        assert!(cache.get(&src, "content").is_none());
        // The stale entry is gone from memory and disk.
        let stats = cache.stats();
        assert_eq!(stats.memory_items, 0);
        assert_eq!(stats.files_cached, 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn expired_entries_miss() {
        let dir = temp_dir();
        let src = source(&dir, "a.pdf", b"%PDF-1.5 alpha");
        let cache = open(
            &dir,
            CacheConfig {
                max_age: Duration::from_millis(1),
                ..CacheConfig::default()
            },
        );
        cache.set(&src, "content", "text").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get(&src, "content").is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_source_is_a_miss() {
        let dir = temp_dir();
        let cache = open(&dir, CacheConfig::default());
        assert!(cache.get(&dir.join("gone.pdf"), "content").is_none());
        assert!(cache.set(&dir.join("gone.pdf"), "content", "x").is_err());
        assert_eq!(cache.stats().misses, 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn disk_survives_restart_and_promotes() {
        let dir = temp_dir();
        let src = source(&dir, "a.pdf", b"%PDF-1.5 alpha");
        {
            let cache = open(&dir, CacheConfig::default());
            cache.set(&src, "content", "persisted").unwrap();
        }
        let cache = open(&dir, CacheConfig::default());
        assert_eq!(cache.stats().memory_items, 0);
        assert_eq!(cache.stats().files_cached, 1);

        assert_eq!(cache.get(&src, "content").unwrap(), "persisted");
        assert_eq!(cache.stats().disk_hits, 1);
        assert_eq!(cache.stats().memory_items, 1);

        assert_eq!(cache.get(&src, "content").unwrap(), "persisted");
        assert_eq!(cache.stats().memory_hits, 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_disk_file_is_deleted() {
        let dir = temp_dir();
        let src = source(&dir, "a.pdf", b"%PDF-1.5 alpha");
        let cache_dir = dir.join("cache");
        {
            let cache = open(&dir, CacheConfig::default());
            cache.set(&src, "content", "fine").unwrap();
        }
        // Corrupt the only cache file.
        let cache = open(&dir, CacheConfig::default());
        let (key, _) = cache.key_for(&FsSourceStore, &src, "content").unwrap();
        let path = cache.disk.path_for(&key);
        assert!(path.starts_with(&cache_dir));
        std::fs::write(&path, b"{ not json").unwrap();

        assert!(cache.get(&src, "content").is_none());
        assert!(!path.exists());
        assert_eq!(cache.stats().files_cached, 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn startup_sweeps_corrupt_and_expired() {
        let dir = temp_dir();
        let src = source(&dir, "a.pdf", b"%PDF-1.5 alpha");
        {
            let cache = open(&dir, CacheConfig::default());
            cache.set(&src, "content", "fine").unwrap();
            cache.set(&src, "other", "fine too").unwrap();
            let (key, _) = cache.key_for(&FsSourceStore, &src, "other").unwrap();
            std::fs::write(cache.disk.path_for(&key), b"garbage").unwrap();
        }
        let cache = open(&dir, CacheConfig::default());
        assert_eq!(cache.stats().files_cached, 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn memory_lru_evicts_oldest_quarter() {
        let dir = temp_dir();
        let cache = open(
            &dir,
            CacheConfig {
                max_memory_items: 8,
                ..CacheConfig::default()
            },
        );
        let sources: Vec<PathBuf> = (0..9)
            .map(|i| source(&dir, &format!("{i}.pdf"), format!("%PDF-1.5 {i}").as_bytes()))
            .collect();
        for src in &sources[..8] {
            cache.set(src, "content", "text").unwrap();
        }
        // Touch 0 and 1 so 2 and 3 become the oldest.
        cache.get(&sources[0], "content").unwrap();
        cache.get(&sources[1], "content").unwrap();

        cache.set(&sources[8], "content", "text").unwrap();
        // 8 - 2 evicted + 1 inserted
        assert_eq!(cache.stats().memory_items, 7);

        let before = cache.stats().memory_hits;
        cache.get(&sources[0], "content").unwrap();
        assert_eq!(cache.stats().memory_hits, before + 1);
        // 2 was evicted from memory but still on disk.
        cache.get(&sources[2], "content").unwrap();
        assert_eq!(cache.stats().disk_hits, 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn disk_quota_shrinks_to_target() {
        let dir = temp_dir();
        let cap = 4_000u64;
        let cache = open(
            &dir,
            CacheConfig {
                max_disk_bytes: cap,
                ..CacheConfig::default()
            },
        );
        let body = "x".repeat(600);
        for i in 0..10 {
            let src = source(&dir, &format!("{i}.pdf"), format!("%PDF-1.5 {i}").as_bytes());
            cache.set(&src, "content", &body).unwrap();
            assert!(cache.stats().disk_bytes <= cap);
        }
        let stats = cache.stats();
        assert!(stats.files_cached < 10);
        // Counters agree with what is actually on disk.
        assert_eq!(cache.disk.usage(), (stats.files_cached, stats.disk_bytes));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn remote_hit_promotes_to_memory() {
        let dir = temp_dir();
        let src = source(&dir, "a.pdf", b"%PDF-1.5 alpha");
        let remote = Arc::new(MemoryRemoteTier::new());

        let writer = TieredCache::open(
            &dir.join("cache_a"),
            Some(remote.clone() as Arc<dyn RemoteTier>),
            CacheConfig::default(),
        )
        .unwrap();
        writer.set(&src, "content", "shared").unwrap();
        assert_eq!(remote.len(), 1);

        // A second cache with its own disk dir sees the entry through the remote tier.
        let reader = TieredCache::open(
            &dir.join("cache_b"),
            Some(remote.clone() as Arc<dyn RemoteTier>),
            CacheConfig::default(),
        )
        .unwrap();
        assert_eq!(reader.get(&src, "content").unwrap(), "shared");
        let stats = reader.stats();
        assert_eq!(stats.remote_hits, 1);
        assert_eq!(stats.memory_items, 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn disk_hit_promotes_to_remote() {
        let dir = temp_dir();
        let src = source(&dir, "a.pdf", b"%PDF-1.5 alpha");
        {
            let cache = open(&dir, CacheConfig::default());
            cache.set(&src, "content", "local only").unwrap();
        }
        let remote = Arc::new(MemoryRemoteTier::new());
        let cache = TieredCache::open(
            &dir.join("cache"),
            Some(remote.clone() as Arc<dyn RemoteTier>),
            CacheConfig::default(),
        )
        .unwrap();
        assert_eq!(cache.get(&src, "content").unwrap(), "local only");
        assert_eq!(remote.len(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn remote_failures_are_not_fatal() {
        let dir = temp_dir();
        let src = source(&dir, "a.pdf", b"%PDF-1.5 alpha");
        let remote = Arc::new(MemoryRemoteTier::new());
        remote.set_failing(true);
        let cache = TieredCache::open(
            &dir.join("cache"),
            Some(remote.clone() as Arc<dyn RemoteTier>),
            CacheConfig::default(),
        )
        .unwrap();

        cache.set(&src, "content", "still cached").unwrap();
        assert_eq!(cache.get(&src, "content").unwrap(), "still cached");
        assert!(cache.clear().is_ok());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn clear_empties_all_tiers() {
        let dir = temp_dir();
        let src = source(&dir, "a.pdf", b"%PDF-1.5 alpha");
        let remote = Arc::new(MemoryRemoteTier::new());
        let cache = TieredCache::open(
            &dir.join("cache"),
            Some(remote.clone() as Arc<dyn RemoteTier>),
            CacheConfig::default(),
        )
        .unwrap();
        cache.set(&src, "content", "x").unwrap();
        cache.clear().unwrap();

        let stats = cache.stats();
        assert_eq!(stats.memory_items, 0);
        assert_eq!(stats.files_cached, 0);
        assert!(remote.is_empty());
        assert!(cache.get(&src, "content").is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn hit_rate_and_size() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            disk_bytes: 2 * 1024 * 1024,
            ..CacheStats::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < 1e-9);
        assert!((stats.cache_size_mb() - 2.0).abs() < 1e-9);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn concurrent_gets_and_sets() {
        let dir = temp_dir();
        let cache = Arc::new(open(&dir, CacheConfig::default()));
        let sources: Vec<PathBuf> = (0..4)
            .map(|i| source(&dir, &format!("{i}.pdf"), format!("%PDF-1.5 {i}").as_bytes()))
            .collect();
        let sources = Arc::new(sources);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                let sources = Arc::clone(&sources);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let src = &sources[(t + i) % 4];
                        if i % 2 == 0 {
                            cache.set(src, "content", "text").unwrap();
                        } else {
                            let _ = cache.get(src, "content");
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for src in sources.iter() {
            assert_eq!(cache.get(src, "content").unwrap(), "text");
        }
        assert_eq!(cache.stats().files_cached, 4);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
