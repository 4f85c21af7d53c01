use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;

use super::InferenceBackend;
use crate::rate_limit::{InferenceError, parse_retry_after};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Google Gemini `generateContent` over REST, with the PDF sent inline.
pub struct GeminiBackend {
    client: reqwest::Client,
    model: String,
    base_url: String,
    timeout: Duration,
}

impl GeminiBackend {
    pub fn new(model: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout,
        }
    }

    /// Point at a different endpoint (proxies, test servers).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

/// Request body: one user turn carrying the PDF and the instruction.
pub fn request_body(payload: &[u8], prompt: &str) -> serde_json::Value {
    serde_json::json!({
        "contents": [{
            "role": "user",
            "parts": [
                {
                    "inline_data": {
                        "mime_type": "application/pdf",
                        "data": BASE64_STANDARD.encode(payload),
                    }
                },
                { "text": prompt }
            ]
        }]
    })
}

/// Concatenate the text parts of the first candidate.
pub fn response_text(data: &serde_json::Value) -> Result<String, InferenceError> {
    let candidate = data["candidates"]
        .as_array()
        .and_then(|c| c.first())
        .ok_or_else(|| {
            let reason = data["promptFeedback"]["blockReason"]
                .as_str()
                .unwrap_or("no candidates");
            InferenceError::Other(format!("empty response: {reason}"))
        })?;

    let text: String = candidate["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    if text.is_empty()
        && let Some(reason) = candidate["finishReason"].as_str()
        && reason != "STOP"
    {
        return Err(InferenceError::Other(format!(
            "generation stopped: {reason}"
        )));
    }
    Ok(text)
}

/// Map a non-success HTTP status (and its body) to an [`InferenceError`].
pub fn error_from_status(
    status: u16,
    retry_after: Option<Duration>,
    body: &str,
) -> InferenceError {
    if status == 429 {
        return InferenceError::RateLimited { retry_after };
    }
    let lower = body.to_lowercase();
    if matches!(status, 400 | 401 | 403)
        && (lower.contains("api key") || lower.contains("api_key") || status == 401)
    {
        return InferenceError::InvalidCredential(format!("HTTP {status}"));
    }
    let snippet: String = body.chars().take(200).collect();
    if matches!(status, 400 | 413) {
        // Resending the same bytes can't help, whichever key is used.
        return InferenceError::Rejected(format!("HTTP {status}: {snippet}"));
    }
    InferenceError::Other(format!("HTTP {status}: {snippet}"))
}

/// Check a response for 429 and extract Retry-After if present.
pub fn check_rate_limit_response(resp: &reqwest::Response) -> Result<(), InferenceError> {
    if resp.status().as_u16() == 429 {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        Err(InferenceError::RateLimited { retry_after })
    } else {
        Ok(())
    }
}

impl InferenceBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    fn extract<'a>(
        &'a self,
        key: &'a str,
        payload: &'a [u8],
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, InferenceError>> + Send + 'a>> {
        Box::pin(async move {
            let resp = self
                .client
                .post(self.endpoint())
                .header("x-goog-api-key", key)
                .timeout(self.timeout)
                .json(&request_body(payload, prompt))
                .send()
                .await
                .map_err(|e| InferenceError::Other(e.to_string()))?;

            check_rate_limit_response(&resp)?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(error_from_status(status.as_u16(), None, &body));
            }

            let data: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| InferenceError::Other(e.to_string()))?;
            response_text(&data)
        })
    }
}
