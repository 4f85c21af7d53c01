use lopdf::Document;

use crate::PdfError;

/// Number of pages in a PDF buffer.
pub fn page_count(data: &[u8]) -> Result<u32, PdfError> {
    let doc = Document::load_mem(data)?;
    Ok(doc.get_pages().len() as u32)
}

/// Build a standalone PDF holding pages `start..=end` (1-based) of `data`.
///
/// Pages outside the range are deleted and unreferenced objects pruned, so
/// the slice is usually much smaller than the source.
pub fn slice_pages(data: &[u8], start: u32, end: u32) -> Result<Vec<u8>, PdfError> {
    let mut doc = Document::load_mem(data)?;
    let total = doc.get_pages().len() as u32;
    if start == 0 || start > end || end > total {
        return Err(PdfError::InvalidRange { start, end, total });
    }

    let drop: Vec<u32> = (1..=total).filter(|p| *p < start || *p > end).collect();
    if !drop.is_empty() {
        doc.delete_pages(&drop);
        doc.prune_objects();
    }

    let mut out = Vec::new();
    doc.save_to(&mut out)?;
    tracing::trace!(start, end, total, bytes = out.len(), "sliced page range");
    Ok(out)
}
