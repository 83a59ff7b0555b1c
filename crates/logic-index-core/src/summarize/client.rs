//! The summarization capability and its Gemini implementation.
//!
//! # Configuration (environment variables)
//!
//! - `GEMINI_API_KEY`: required for [`GeminiSummarizer::from_env`]
//! - `GEMINI_MODEL`: model name (default: `gemini-3-flash-preview`)
//! - `GEMINI_BASE_URL`: API root override (default: the public v1beta endpoint)

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::IndexerConfig;
use crate::errors::{IndexError, IndexResult};
use crate::models::{ComplexityHint, ComplexityMarkers, SymbolKind};
use crate::summarize::batching::{build_prompt, END_MARKER};

pub const DEFAULT_MODEL: &str = "gemini-3-flash-preview";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const TEMPERATURE: f64 = 0.2;
const OUTPUT_TOKENS_PER_SYMBOL: usize = 160;
const OUTPUT_TOKENS_OVERHEAD: usize = 64;

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*```[A-Za-z]*\s*$").unwrap());

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// One symbol to describe. `id` is the position inside its batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SummaryRequest {
    pub id: usize,
    pub file_path: String,
    pub qualified_name: String,
    pub kind: SymbolKind,
    pub signature: String,
    pub source: String,
    pub hint: ComplexityHint,
    pub markers: ComplexityMarkers,
}

/// One description as returned by the service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryItem {
    pub id: usize,
    pub summary: String,
    pub source: Option<String>,
    pub sink: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchResponse {
    Complete(Vec<SummaryItem>),
    /// The reply stopped early (length limit or missing terminator).
    Truncated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FatalKind {
    Authentication,
    RateLimited,
}

impl std::fmt::Display for FatalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalKind::Authentication => write!(f, "authentication failed"),
            FatalKind::RateLimited => write!(f, "rate limit or quota exceeded"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// Timeouts, connection failures, 5xx. Worth retrying.
    #[error("transient service failure: {0}")]
    Transient(String),

    /// Credentials or quota. Retrying cannot help and must not be attempted.
    #[error("fatal service failure ({kind}): {message}")]
    Fatal { kind: FatalKind, message: String },

    /// The reply arrived but does not follow the expected shape.
    #[error("malformed reply: {0}")]
    Malformed(String),

    /// Any other client error for this particular request.
    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
}

/// An external capability that turns source slices into short descriptions.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, batch: &[SummaryRequest]) -> Result<BatchResponse, ServiceError>;

    fn model_name(&self) -> &str {
        "unknown"
    }
}

impl<T: Summarizer + ?Sized> Summarizer for &T {
    fn summarize(&self, batch: &[SummaryRequest]) -> Result<BatchResponse, ServiceError> {
        (**self).summarize(batch)
    }

    fn model_name(&self) -> &str {
        (**self).model_name()
    }
}

impl<T: Summarizer + ?Sized> Summarizer for Box<T> {
    fn summarize(&self, batch: &[SummaryRequest]) -> Result<BatchResponse, ServiceError> {
        (**self).summarize(batch)
    }

    fn model_name(&self) -> &str {
        (**self).model_name()
    }
}

// ---------------------------------------------------------------------------
// Reply parsing
// ---------------------------------------------------------------------------

/// Map a non-success HTTP status to a service error.
pub fn classify_status(status: u16, body: &str) -> ServiceError {
    let message = body.chars().take(200).collect::<String>();
    match status {
        401 | 403 => ServiceError::Fatal {
            kind: FatalKind::Authentication,
            message,
        },
        429 => ServiceError::Fatal {
            kind: FatalKind::RateLimited,
            message,
        },
        408 | 500..=599 => ServiceError::Transient(format!("HTTP {status}: {message}")),
        _ => ServiceError::Rejected { status, message },
    }
}

fn optional_tag(value: Option<&Value>) -> Option<String> {
    let tag = value?.as_str()?.trim();
    match tag.to_lowercase().as_str() {
        "" | "none" | "null" | "n/a" => None,
        _ => Some(tag.to_string()),
    }
}

fn item_id(value: Option<&Value>) -> Option<usize> {
    match value? {
        Value::Number(n) => n.as_u64().map(|v| v as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse the text of a batch reply.
///
/// The reply must end with [`END_MARKER`]; without it the reply is treated
/// as truncated. Before the marker it must hold a JSON array of objects with
/// `id` and `summary`, and optional `source` / `sink` tags. Code fences are
/// tolerated.
pub fn parse_batch_reply(text: &str) -> Result<BatchResponse, ServiceError> {
    let Some(end) = text.rfind(END_MARKER) else {
        return Ok(BatchResponse::Truncated);
    };
    let body = CODE_FENCE.replace_all(&text[..end], "");
    let (start, stop) = match (body.find('['), body.rfind(']')) {
        (Some(start), Some(stop)) if start < stop => (start, stop),
        _ => return Err(ServiceError::Malformed("no JSON array in reply".to_string())),
    };
    let parsed: Value = serde_json::from_str(&body[start..=stop])
        .map_err(|e| ServiceError::Malformed(format!("invalid JSON: {e}")))?;
    let Value::Array(entries) = parsed else {
        return Err(ServiceError::Malformed("reply is not an array".to_string()));
    };

    let mut items = Vec::with_capacity(entries.len());
    for entry in &entries {
        let id = item_id(entry.get("id"))
            .ok_or_else(|| ServiceError::Malformed("entry without a numeric id".to_string()))?;
        let summary = entry
            .get("summary")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ServiceError::Malformed(format!("entry {id} has no summary")))?;
        items.push(SummaryItem {
            id,
            summary: summary.to_string(),
            source: optional_tag(entry.get("source")),
            sink: optional_tag(entry.get("sink")),
        });
    }
    Ok(BatchResponse::Complete(items))
}

/// Extract the reply text from a `generateContent` response body.
pub fn parse_generate_response(body: &Value) -> Result<BatchResponse, ServiceError> {
    let candidate = body
        .get("candidates")
        .and_then(|c| c.get(0))
        .ok_or_else(|| ServiceError::Malformed("response has no candidates".to_string()))?;
    if candidate.get("finishReason").and_then(Value::as_str) == Some("MAX_TOKENS") {
        return Ok(BatchResponse::Truncated);
    }
    let parts = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .ok_or_else(|| ServiceError::Malformed("candidate has no content parts".to_string()))?;
    let text: String = parts
        .iter()
        .filter(|p| p.get("thought").and_then(Value::as_bool) != Some(true))
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    parse_batch_reply(&text)
}

// ---------------------------------------------------------------------------
// Gemini
// ---------------------------------------------------------------------------

pub struct GeminiSummarizer {
    client: reqwest::blocking::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiSummarizer {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> IndexResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IndexError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into(),
        })
    }

    /// Create a summarizer from `GEMINI_*` environment variables.
    pub fn from_env(config: &IndexerConfig) -> IndexResult<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| IndexError::Config("GEMINI_API_KEY is not set".to_string()))?;
        let model = std::env::var("GEMINI_MODEL")
            .ok()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let base_url = std::env::var("GEMINI_BASE_URL")
            .ok()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self::new(api_key, model, base_url, config.request_timeout())
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }

    fn request_body(&self, batch: &[SummaryRequest]) -> Value {
        let hint = batch
            .iter()
            .map(|r| r.hint)
            .max()
            .unwrap_or(ComplexityHint::Minimal);
        let thinking_level = match hint {
            ComplexityHint::Minimal => "minimal",
            ComplexityHint::Elevated => "low",
        };
        json!({
            "contents": [{
                "parts": [{"text": build_prompt(batch)}]
            }],
            "generationConfig": {
                "temperature": TEMPERATURE,
                "maxOutputTokens": OUTPUT_TOKENS_OVERHEAD + OUTPUT_TOKENS_PER_SYMBOL * batch.len(),
                "thinkingConfig": {"thinkingLevel": thinking_level}
            }
        })
    }
}

impl Summarizer for GeminiSummarizer {
    fn summarize(&self, batch: &[SummaryRequest]) -> Result<BatchResponse, ServiceError> {
        debug!("requesting {} summaries from {}", batch.len(), self.model);
        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&self.request_body(batch))
            .send()
            .map_err(|e| ServiceError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(classify_status(status.as_u16(), &text));
        }
        let body: Value = response
            .json()
            .map_err(|e| ServiceError::Malformed(format!("response is not JSON: {e}")))?;
        parse_generate_response(&body)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: usize, hint: ComplexityHint) -> SummaryRequest {
        SummaryRequest {
            id,
            file_path: "a.py".into(),
            qualified_name: format!("f{id}"),
            kind: SymbolKind::Callable,
            signature: format!("f{id}()"),
            source: format!("def f{id}():\n    return {id}\n"),
            hint,
            markers: ComplexityMarkers::default(),
        }
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(401, ""),
            ServiceError::Fatal {
                kind: FatalKind::Authentication,
                ..
            }
        ));
        assert!(matches!(
            classify_status(403, ""),
            ServiceError::Fatal {
                kind: FatalKind::Authentication,
                ..
            }
        ));
        assert!(matches!(
            classify_status(429, ""),
            ServiceError::Fatal {
                kind: FatalKind::RateLimited,
                ..
            }
        ));
        assert!(matches!(classify_status(503, ""), ServiceError::Transient(_)));
        assert!(matches!(classify_status(408, ""), ServiceError::Transient(_)));
        assert!(matches!(
            classify_status(400, "bad"),
            ServiceError::Rejected { status: 400, .. }
        ));
    }

    #[test]
    fn parses_fenced_reply() {
        let text = "```json\n[{\"id\": 0, \"summary\": \"Adds one.\", \"source\": \"args\", \"sink\": \"none\"},\n {\"id\": \"1\", \"summary\": \"Reads config.\"}]\n```\nEND_OF_SUMMARIES";
        let reply = parse_batch_reply(text).unwrap();
        let BatchResponse::Complete(items) = reply else {
            panic!("expected complete reply");
        };
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].source.as_deref(), Some("args"));
        assert_eq!(items[0].sink, None);
        assert_eq!(items[1].id, 1);
    }

    #[test]
    fn missing_terminator_is_truncation() {
        let text = "[{\"id\": 0, \"summary\": \"Adds one.\"}, {\"id\": 1, \"summ";
        assert_eq!(parse_batch_reply(text).unwrap(), BatchResponse::Truncated);
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            parse_batch_reply("I cannot help with that.\nEND_OF_SUMMARIES"),
            Err(ServiceError::Malformed(_))
        ));
        assert!(matches!(
            parse_batch_reply("[{\"id\": 0}]\nEND_OF_SUMMARIES"),
            Err(ServiceError::Malformed(_))
        ));
    }

    #[test]
    fn generate_response_length_stop_is_truncation() {
        let body = json!({
            "candidates": [{
                "finishReason": "MAX_TOKENS",
                "content": {"parts": [{"text": "[{\"id\": 0"}]}
            }]
        });
        assert_eq!(parse_generate_response(&body).unwrap(), BatchResponse::Truncated);
    }

    #[test]
    fn generate_response_skips_thought_parts() {
        let body = json!({
            "candidates": [{
                "finishReason": "STOP",
                "content": {"parts": [
                    {"text": "thinking about [brackets]", "thought": true},
                    {"text": "[{\"id\": 0, \"summary\": \"Adds one.\"}]\nEND_OF_SUMMARIES"}
                ]}
            }]
        });
        let reply = parse_generate_response(&body).unwrap();
        assert_eq!(
            reply,
            BatchResponse::Complete(vec![SummaryItem {
                id: 0,
                summary: "Adds one.".into(),
                source: None,
                sink: None,
            }])
        );
    }

    #[test]
    fn request_body_uses_highest_hint() {
        let summarizer =
            GeminiSummarizer::new("k", "m", "http://localhost/", Duration::from_secs(1)).unwrap();
        assert_eq!(summarizer.endpoint(), "http://localhost/models/m:generateContent");
        let body = summarizer.request_body(&[
            request(0, ComplexityHint::Minimal),
            request(1, ComplexityHint::Elevated),
        ]);
        assert_eq!(
            body["generationConfig"]["thinkingConfig"]["thinkingLevel"],
            "low"
        );
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 64 + 160 * 2);
        let prompt = body["contents"][0]["parts"][0]["text"].as_str().unwrap();
        assert!(prompt.contains("f1()"));
    }
}
