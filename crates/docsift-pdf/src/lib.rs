//! PDF payload access for the extraction engine.
//!
//! Everything here is synchronous and operates on byte buffers or paths:
//! validating that a file is a plausible PDF payload, counting its pages,
//! and cutting a contiguous page range out into a standalone sub-document
//! that can be sent to the inference service on its own.

use thiserror::Error;

#[cfg(any(test, feature = "fixture"))]
pub mod fixture;
pub mod pages;
pub mod payload;

pub use pages::{page_count, slice_pages};
pub use payload::{MAX_PAYLOAD_BYTES, PDF_MAGIC, validate_bytes, validate_payload};

#[derive(Error, Debug)]
pub enum PdfError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("file is empty: {0}")]
    Empty(String),
    #[error("file is too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },
    #[error("not a PDF: missing %PDF- header")]
    NotPdf,
    #[error("invalid page range {start}-{end} for a {total}-page document")]
    InvalidRange { start: u32, end: u32, total: u32 },
    #[error("failed to parse PDF: {0}")]
    Parse(#[from] lopdf::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
