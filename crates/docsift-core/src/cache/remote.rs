//! Remote (shared) cache tier.
//!
//! The tier sits between memory and disk. [`SqliteRemoteTier`] keeps entries
//! in a WAL-mode SQLite database that several processes can share;
//! [`MemoryRemoteTier`] is an in-process stand-in for tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, params};

use super::{CacheEntry, CacheError, now_ms};

/// A shared cache tier. Failures are reported, never fatal: the cache logs
/// them and carries on with the other tiers.
pub trait RemoteTier: Send + Sync {
    fn name(&self) -> &str;

    fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    fn set(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError>;

    fn delete(&self, key: &str) -> Result<(), CacheError>;

    fn clear(&self) -> Result<(), CacheError>;

    /// Drop entries older than `max_age`. Returns how many were removed.
    fn evict_expired(&self, _max_age: Duration) -> Result<usize, CacheError> {
        Ok(0)
    }
}

/// Open a SQLite connection with WAL mode and standard pragmas.
fn open_sqlite(path: &Path, read_only: bool) -> Result<Connection, rusqlite::Error> {
    let flags = if read_only {
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
    };
    let conn = Connection::open_with_flags(path, flags)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(conn)
}

/// Pool of read-only connections for concurrent lookups.
///
/// WAL mode lets readers proceed while the writer holds its lock. If the
/// pool is empty a new connection is opened.
struct ReadPool {
    pool: Mutex<Vec<Connection>>,
    path: PathBuf,
}

impl ReadPool {
    fn new(path: &Path) -> Self {
        Self {
            pool: Mutex::new(Vec::new()),
            path: path.to_path_buf(),
        }
    }

    fn acquire(&self) -> Result<Connection, rusqlite::Error> {
        if let Ok(mut pool) = self.pool.lock()
            && let Some(conn) = pool.pop()
        {
            return Ok(conn);
        }
        open_sqlite(&self.path, true)
    }

    fn release(&self, conn: Connection) {
        if let Ok(mut pool) = self.pool.lock() {
            pool.push(conn);
        }
    }
}

/// SQLite-backed shared tier. Writes go through a single connection behind
/// a mutex; reads use a [`ReadPool`].
pub struct SqliteRemoteTier {
    writer: Mutex<Connection>,
    readers: ReadPool,
}

impl SqliteRemoteTier {
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        let conn = open_sqlite(path, false)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS extraction_cache (
                 cache_key  TEXT PRIMARY KEY,
                 entry_json TEXT NOT NULL,
                 created_at INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_extraction_cache_created
                 ON extraction_cache (created_at);",
        )?;
        Ok(Self {
            writer: Mutex::new(conn),
            readers: ReadPool::new(path),
        })
    }

    fn writer(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.writer()
            .query_row("SELECT COUNT(*) FROM extraction_cache", [], |row| row.get(0))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RemoteTier for SqliteRemoteTier {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let conn = self.readers.acquire()?;
        let row: Result<String, rusqlite::Error> = conn
            .prepare_cached("SELECT entry_json FROM extraction_cache WHERE cache_key = ?1")
            .and_then(|mut stmt| stmt.query_row(params![key], |row| row.get(0)));
        self.readers.release(conn);

        match row {
            Ok(json) => match serde_json::from_str::<CacheEntry>(&json) {
                Ok(entry) => Ok(Some(entry)),
                Err(_) => {
                    // Corrupt row: drop it so it stops costing lookups.
                    let _ = self.delete(key);
                    Ok(None)
                }
            },
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        let json = serde_json::to_string(entry)?;
        self.writer().execute(
            "INSERT OR REPLACE INTO extraction_cache (cache_key, entry_json, created_at)
             VALUES (?1, ?2, ?3)",
            params![key, json, entry.created_at_ms],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.writer().execute(
            "DELETE FROM extraction_cache WHERE cache_key = ?1",
            params![key],
        )?;
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        let conn = self.writer();
        conn.execute("DELETE FROM extraction_cache", [])?;
        // Reclaim disk space; without VACUUM the deleted pages stay as free pages.
        let _ = conn.execute_batch("VACUUM");
        Ok(())
    }

    fn evict_expired(&self, max_age: Duration) -> Result<usize, CacheError> {
        let max_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        let cutoff = now_ms().saturating_sub(max_ms);
        let deleted = self.writer().execute(
            "DELETE FROM extraction_cache WHERE created_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }
}

/// In-process remote tier, handy as a test double.
#[derive(Default)]
pub struct MemoryRemoteTier {
    entries: Mutex<HashMap<String, CacheEntry>>,
    fail: std::sync::atomic::AtomicBool,
}

impl MemoryRemoteTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail, to exercise best-effort handling.
    pub fn set_failing(&self, failing: bool) {
        self.fail
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            Err(CacheError::Remote("remote tier unavailable".into()))
        } else {
            Ok(())
        }
    }
}

impl RemoteTier for MemoryRemoteTier {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        self.check()?;
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        self.check()?;
        self.lock().insert(key.to_string(), entry.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check()?;
        self.lock().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.check()?;
        self.lock().clear();
        Ok(())
    }

    fn evict_expired(&self, max_age: Duration) -> Result<usize, CacheError> {
        self.check()?;
        let now = now_ms();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now, max_age));
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fingerprint::Fingerprint;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_db_path() -> PathBuf {
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "docsift_remote_tier_test_{}_{}",
            std::process::id(),
            id
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("remote.db")
    }

    fn entry(content: &str, created_at_ms: u64) -> CacheEntry {
        CacheEntry {
            content: content.to_string(),
            fingerprint: Fingerprint {
                hash: "ab".repeat(32),
                size: 10,
                mtime_ms: 1,
            },
            created_at_ms,
            access_count: 0,
            last_access_ms: created_at_ms,
        }
    }

    #[test]
    fn sqlite_set_get_delete() {
        let path = temp_db_path();
        let tier = SqliteRemoteTier::open(&path).unwrap();
        assert!(tier.get("content_x").unwrap().is_none());

        tier.set("content_x", &entry("hello", now_ms())).unwrap();
        assert_eq!(tier.get("content_x").unwrap().unwrap().content, "hello");
        assert_eq!(tier.len(), 1);

        tier.delete("content_x").unwrap();
        assert!(tier.get("content_x").unwrap().is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sqlite_persists_across_reopen() {
        let path = temp_db_path();
        {
            let tier = SqliteRemoteTier::open(&path).unwrap();
            tier.set("k_1", &entry("persisted", now_ms())).unwrap();
        }
        let tier = SqliteRemoteTier::open(&path).unwrap();
        assert_eq!(tier.get("k_1").unwrap().unwrap().content, "persisted");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sqlite_evicts_expired() {
        let path = temp_db_path();
        let tier = SqliteRemoteTier::open(&path).unwrap();
        tier.set("old_1", &entry("old", now_ms() - 10_000)).unwrap();
        tier.set("new_1", &entry("new", now_ms())).unwrap();
        let removed = tier.evict_expired(Duration::from_secs(5)).unwrap();
        assert_eq!(removed, 1);
        assert!(tier.get("old_1").unwrap().is_none());
        assert!(tier.get("new_1").unwrap().is_some());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sqlite_corrupt_row_is_dropped() {
        let path = temp_db_path();
        let tier = SqliteRemoteTier::open(&path).unwrap();
        tier.writer()
            .execute(
                "INSERT INTO extraction_cache (cache_key, entry_json, created_at) VALUES ('bad_1', '{not json', 0)",
                [],
            )
            .unwrap();
        assert!(tier.get("bad_1").unwrap().is_none());
        assert!(tier.is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sqlite_clear() {
        let path = temp_db_path();
        let tier = SqliteRemoteTier::open(&path).unwrap();
        tier.set("a_1", &entry("a", now_ms())).unwrap();
        tier.set("b_1", &entry("b", now_ms())).unwrap();
        tier.clear().unwrap();
        assert!(tier.is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn memory_tier_failure_toggle() {
        let tier = MemoryRemoteTier::new();
        tier.set("k_1", &entry("v", now_ms())).unwrap();
        tier.set_failing(true);
        assert!(tier.get("k_1").is_err());
        tier.set_failing(false);
        assert!(tier.get("k_1").unwrap().is_some());
    }
}
