//! Inference backend trait and implementations for the text-extraction service.

pub mod gemini;
pub mod mock;

use std::future::Future;
use std::pin::Pin;

use crate::rate_limit::InferenceError;

/// A hosted model that turns a PDF payload plus an instruction into text.
pub trait InferenceBackend: Send + Sync {
    /// Short name for logs (e.g., "gemini").
    fn name(&self) -> &str;

    /// Send `payload` (a complete PDF, possibly a page-range slice) with
    /// `prompt`, authenticating with `key`.
    fn extract<'a>(
        &'a self,
        key: &'a str,
        payload: &'a [u8],
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, InferenceError>> + Send + 'a>>;
}
