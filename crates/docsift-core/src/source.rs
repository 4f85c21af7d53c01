use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::UNIX_EPOCH;

use docsift_pdf::PdfError;

/// Size and modification time of a source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceMeta {
    pub size: u64,
    /// Milliseconds since the Unix epoch (0 if the platform can't tell).
    pub mtime_ms: u64,
}

/// Read-only access to source documents.
///
/// The default methods go through [`docsift_pdf`]; implementors only need
/// byte access and metadata.
pub trait SourceStore: Send + Sync {
    fn metadata(&self, path: &Path) -> Result<SourceMeta, PdfError>;

    fn read(&self, path: &Path) -> Result<Vec<u8>, PdfError>;

    /// Up to `len` bytes starting at `offset`.
    fn read_range(&self, path: &Path, offset: u64, len: u64) -> Result<Vec<u8>, PdfError> {
        let data = self.read(path)?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let end = start.saturating_add(usize::try_from(len).unwrap_or(usize::MAX)).min(data.len());
        Ok(data[start..end].to_vec())
    }

    /// Reject payloads the service would refuse anyway. Returns the size.
    fn validate(&self, path: &Path) -> Result<u64, PdfError> {
        let data = self.read(path)?;
        docsift_pdf::validate_bytes(&data)?;
        Ok(data.len() as u64)
    }

    fn page_count(&self, path: &Path) -> Result<u32, PdfError> {
        docsift_pdf::page_count(&self.read(path)?)
    }

    /// A standalone PDF holding pages `start..=end` (1-based).
    fn read_pages(&self, path: &Path, start: u32, end: u32) -> Result<Vec<u8>, PdfError> {
        docsift_pdf::slice_pages(&self.read(path)?, start, end)
    }
}

/// Local filesystem source store.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSourceStore;

impl SourceStore for FsSourceStore {
    fn metadata(&self, path: &Path) -> Result<SourceMeta, PdfError> {
        Ok(file_meta(path)?)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, PdfError> {
        Ok(std::fs::read(path)?)
    }

    fn read_range(&self, path: &Path, offset: u64, len: u64) -> Result<Vec<u8>, PdfError> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        file.take(len).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn validate(&self, path: &Path) -> Result<u64, PdfError> {
        docsift_pdf::validate_payload(path)
    }
}

/// Stat a file into a [`SourceMeta`].
pub fn file_meta(path: &Path) -> std::io::Result<SourceMeta> {
    let meta = std::fs::metadata(path)?;
    let mtime_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    Ok(SourceMeta {
        size: meta.len(),
        mtime_ms,
    })
}
