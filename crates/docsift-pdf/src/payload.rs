use std::io::Read;
use std::path::Path;

use crate::PdfError;

/// Largest payload the inference service accepts in one request.
pub const MAX_PAYLOAD_BYTES: u64 = 100 * 1024 * 1024;

/// Every PDF starts with this marker.
pub const PDF_MAGIC: &[u8] = b"%PDF-";

/// Check that `path` points at something worth sending to the service.
///
/// Returns the file size on success. Only the first few bytes are read, so
/// this is cheap to call before any heavier work.
pub fn validate_payload(path: &Path) -> Result<u64, PdfError> {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PdfError::NotFound(path.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    let size = meta.len();
    if size == 0 {
        return Err(PdfError::Empty(path.display().to_string()));
    }
    if size > MAX_PAYLOAD_BYTES {
        return Err(PdfError::TooLarge {
            size,
            limit: MAX_PAYLOAD_BYTES,
        });
    }

    let mut header = [0u8; 5];
    let mut file = std::fs::File::open(path)?;
    let read = file.read(&mut header)?;
    if &header[..read] != PDF_MAGIC {
        return Err(PdfError::NotPdf);
    }
    Ok(size)
}

/// Same checks as [`validate_payload`] for an in-memory buffer.
pub fn validate_bytes(data: &[u8]) -> Result<(), PdfError> {
    if data.is_empty() {
        return Err(PdfError::Empty("<buffer>".into()));
    }
    if data.len() as u64 > MAX_PAYLOAD_BYTES {
        return Err(PdfError::TooLarge {
            size: data.len() as u64,
            limit: MAX_PAYLOAD_BYTES,
        });
    }
    if !data.starts_with(PDF_MAGIC) {
        return Err(PdfError::NotPdf);
    }
    Ok(())
}
