//! Disk tier: one JSON file per entry under a two-level directory.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use super::{CacheEntry, now_ms};

/// Result of reading one cache file.
pub(crate) enum DiskLoad {
    Hit(CacheEntry),
    Missing,
    /// File existed but failed to deserialize; it has already been removed.
    Corrupt,
}

pub(crate) struct DiskTier {
    dir: PathBuf,
}

impl DiskTier {
    pub(crate) fn open(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<first two hash chars>/<key>.cache`
    pub(crate) fn path_for(&self, key: &str) -> PathBuf {
        let hash = key.rsplit('_').next().unwrap_or(key);
        let shard: String = hash.chars().take(2).collect();
        self.dir.join(shard).join(format!("{key}.cache"))
    }

    pub(crate) fn load(&self, key: &str) -> DiskLoad {
        let path = self.path_for(key);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(_) => return DiskLoad::Missing,
        };
        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) => DiskLoad::Hit(entry),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "removing corrupt cache file");
                let _ = std::fs::remove_file(&path);
                DiskLoad::Corrupt
            }
        }
    }

    /// Write an entry. Returns `(new file size, size of the file it replaced)`.
    pub(crate) fn store(&self, key: &str, entry: &CacheEntry) -> std::io::Result<(u64, u64)> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let replaced = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let json = serde_json::to_vec(entry).map_err(std::io::Error::other)?;
        // Write then rename so readers never see a half-written file.
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &path)?;
        Ok((json.len() as u64, replaced))
    }

    /// Delete an entry's file. Returns the bytes freed.
    pub(crate) fn remove(&self, key: &str) -> u64 {
        let path = self.path_for(key);
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        match std::fs::remove_file(&path) {
            Ok(()) => size,
            Err(_) => 0,
        }
    }

    /// Every cache file with its size and modification time.
    fn files(&self) -> Vec<(PathBuf, u64, SystemTime)> {
        let mut out = Vec::new();
        let Ok(shards) = std::fs::read_dir(&self.dir) else {
            return out;
        };
        for shard in shards.flatten() {
            let Ok(entries) = std::fs::read_dir(shard.path()) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|e| e == "cache")
                    && let Ok(meta) = entry.metadata()
                {
                    let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    out.push((path, meta.len(), mtime));
                }
            }
        }
        out
    }

    /// `(file count, total bytes)`.
    pub(crate) fn usage(&self) -> (u64, u64) {
        let files = self.files();
        (files.len() as u64, files.iter().map(|f| f.1).sum())
    }

    /// Delete oldest-modified files until usage is at most `target` bytes.
    ///
    /// Returns the `(file count, total bytes)` left afterwards.
    pub(crate) fn shrink_to(&self, target: u64) -> (u64, u64) {
        let mut files = self.files();
        let mut total: u64 = files.iter().map(|f| f.1).sum();
        let mut count = files.len() as u64;
        files.sort_by_key(|f| f.2);

        let mut removed = 0usize;
        for (path, size, _) in files {
            if total <= target {
                break;
            }
            if std::fs::remove_file(&path).is_ok() {
                total = total.saturating_sub(size);
                count -= 1;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, bytes = total, target, "disk cache shrunk");
        }
        (count, total)
    }

    /// Remove expired and unreadable files. Returns how many were removed.
    pub(crate) fn sweep_expired(&self, max_age: Duration) -> usize {
        let now = now_ms();
        let mut removed = 0;
        for (path, _, _) in self.files() {
            let keep = std::fs::read(&path)
                .ok()
                .and_then(|b| serde_json::from_slice::<CacheEntry>(&b).ok())
                .is_some_and(|e| !e.is_expired(now, max_age));
            if !keep && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    pub(crate) fn clear(&self) -> std::io::Result<()> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)?;
        }
        std::fs::create_dir_all(&self.dir)
    }
}
