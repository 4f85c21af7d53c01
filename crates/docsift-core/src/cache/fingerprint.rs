use std::path::Path;

use docsift_pdf::PdfError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::source::{SourceMeta, SourceStore};

/// Content identity of a source file plus the metadata used to detect changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub hash: String,
    pub size: u64,
    pub mtime_ms: u64,
}

impl Fingerprint {
    /// Whether the file described by `meta` is still the one this fingerprint was taken of.
    pub fn matches(&self, meta: &SourceMeta) -> bool {
        self.size == meta.size && self.mtime_ms == meta.mtime_ms
    }
}

/// Fingerprint `path` as seen through `store`.
///
/// Files up to `large_threshold` bytes are hashed in full. Larger files hash
/// only the first and last `window` bytes plus `"{path}_{size}_{mtime}"`,
/// which stays sensitive to edits without reading the whole file.
pub fn fingerprint(
    store: &dyn SourceStore,
    path: &Path,
    large_threshold: u64,
    window: u64,
) -> Result<Fingerprint, PdfError> {
    let meta = store.metadata(path)?;
    let mut hasher = Sha256::new();

    if meta.size > large_threshold {
        let len = window.min(meta.size);
        hasher.update(store.read_range(path, 0, len)?);
        hasher.update(store.read_range(path, meta.size - len, len)?);
        hasher.update(format!("{}_{}_{}", path.display(), meta.size, meta.mtime_ms).as_bytes());
    } else {
        hasher.update(store.read(path)?);
    }

    Ok(Fingerprint {
        hash: format!("{:x}", hasher.finalize()),
        size: meta.size,
        mtime_ms: meta.mtime_ms,
    })
}
