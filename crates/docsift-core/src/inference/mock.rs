//! Mock inference backend for testing.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::InferenceBackend;
use crate::rate_limit::InferenceError;

/// A configurable mock response for [`MockBackend`].
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Return this text verbatim.
    Text(String),
    /// Return `"pages N"` where N is the page count of the payload, so
    /// assembled output shows which slice each call received.
    PageCount,
    RateLimited { retry_after: Option<Duration> },
    InvalidCredential,
    Error(String),
}

/// A hand-rolled mock implementing [`InferenceBackend`] for tests.
///
/// Supports:
/// - A fixed response (used for every call), **or**
/// - A sequence of responses (one per call, repeating the fallback when exhausted).
/// - Per-key overrides, to make a single credential misbehave.
/// - Optional per-call latency.
/// - Call counting and a log of which keys and payloads were used.
pub struct MockBackend {
    responses: Mutex<Vec<MockResponse>>,
    fallback: MockResponse,
    key_overrides: Vec<(String, MockResponse)>,
    delay: Option<Duration>,
    call_count: AtomicUsize,
    keys_seen: Mutex<Vec<String>>,
    payloads_seen: Mutex<Vec<Vec<u8>>>,
}

impl MockBackend {
    /// Create a mock that always returns `response`.
    pub fn new(response: MockResponse) -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            fallback: response,
            key_overrides: Vec::new(),
            delay: None,
            call_count: AtomicUsize::new(0),
            keys_seen: Mutex::new(Vec::new()),
            payloads_seen: Mutex::new(Vec::new()),
        }
    }

    /// Return `responses` in order, then `fallback` forever.
    pub fn with_sequence(mut responses: Vec<MockResponse>, fallback: MockResponse) -> Self {
        // Reverse so we can pop() from the front cheaply.
        responses.reverse();
        Self {
            responses: Mutex::new(responses),
            ..Self::new(fallback)
        }
    }

    /// Always answer `response` when called with `key`.
    pub fn with_key_override(mut self, key: &str, response: MockResponse) -> Self {
        self.key_overrides.push((key.to_string(), response));
        self
    }

    /// Set simulated network latency per call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Keys used, in call order.
    pub fn keys_seen(&self) -> Vec<String> {
        self.keys_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Payload bytes received, in call order.
    pub fn payloads_seen(&self) -> Vec<Vec<u8>> {
        self.payloads_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn next_response(&self, key: &str) -> MockResponse {
        if let Some((_, resp)) = self.key_overrides.iter().find(|(k, _)| k == key) {
            return resp.clone();
        }
        let mut seq = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        seq.pop().unwrap_or_else(|| self.fallback.clone())
    }
}

impl InferenceBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn extract<'a>(
        &'a self,
        key: &'a str,
        payload: &'a [u8],
        _prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, InferenceError>> + Send + 'a>> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.keys_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(key.to_string());
        self.payloads_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload.to_vec());
        let response = self.next_response(key);
        let delay = self.delay;

        Box::pin(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }

            match response {
                MockResponse::Text(text) => Ok(text),
                MockResponse::PageCount => docsift_pdf::page_count(payload)
                    .map(|n| format!("pages {n}"))
                    .map_err(|e| InferenceError::Other(format!("invalid pdf: {e}"))),
                MockResponse::RateLimited { retry_after } => {
                    Err(InferenceError::RateLimited { retry_after })
                }
                MockResponse::InvalidCredential => Err(InferenceError::InvalidCredential(
                    "API key not valid".into(),
                )),
                MockResponse::Error(msg) => Err(InferenceError::Other(msg)),
            }
        })
    }
}
