pub mod anthropic;
pub mod gemini;
pub mod openai;
pub(crate) mod sse;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use reqwest::header::HeaderMap;

use crate::error::AiError;
use crate::types::{
    ChatRequest, ChatResponse, ModelInfo, ProviderId, RateLimitStatus, StreamChunk,
};

/// Lazy, finite, non-restartable sequence of stream chunks. Dropping the
/// stream releases the underlying connection.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, AiError>> + Send>>;

/// Uniform contract every vendor adapter implements.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    fn default_model(&self) -> &str;

    /// Validate the credential with a cheap vendor call and best-effort
    /// populate the model catalog. Model discovery failing is not an
    /// initialization failure; a rejected credential is.
    async fn initialize(&self) -> Result<(), AiError>;

    /// Single-shot chat completion.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, AiError>;

    /// Streaming chat completion. The returned stream yields content
    /// deltas in vendor order and ends with exactly one `done` chunk
    /// carrying usage.
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChunkStream, AiError>;

    /// Cheap availability probe. Never fails; errors map to `false`.
    async fn health_check(&self) -> bool;

    /// Current model catalog (discovered at init, or the static fallback).
    fn models(&self) -> Vec<ModelInfo>;

    /// Last-known rate-limit snapshot, refreshed from response headers.
    fn rate_limit_status(&self) -> RateLimitStatus;
}

/// Mutable adapter-internal state behind the read accessors.
pub(crate) struct AdapterState {
    pub models: Vec<ModelInfo>,
    pub rate_limit: RateLimitStatus,
}

impl AdapterState {
    pub fn new(models: Vec<ModelInfo>, declared_limit: u32) -> Self {
        Self {
            models,
            rate_limit: RateLimitStatus::full(declared_limit),
        }
    }
}

/// Keep only models on the configured allow-list; an empty list allows all.
/// A list that matches nothing keeps the full catalog rather than leaving
/// the adapter without models.
pub(crate) fn filter_models(models: Vec<ModelInfo>, allowed: &[String]) -> Vec<ModelInfo> {
    if allowed.is_empty() {
        return models;
    }
    let filtered: Vec<ModelInfo> = models
        .iter()
        .filter(|m| allowed.iter().any(|a| a == &m.id))
        .cloned()
        .collect();
    if filtered.is_empty() {
        models
    } else {
        filtered
    }
}

/// Map a vendor response to our error taxonomy, or pass it through.
/// Consumes the body on failure to capture the vendor's message.
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs);
    let message = response.text().await.unwrap_or_default();
    Err(AiError::from_status(status.as_u16(), message, retry_after))
}

/// Parse vendor rate-limit headers into a snapshot. Header names differ
/// per vendor; absent or malformed headers yield `None` and the previous
/// snapshot stands.
pub(crate) fn rate_limit_from_headers(
    headers: &HeaderMap,
    remaining_key: &str,
    limit_key: &str,
    reset_key: &str,
    declared_limit: u32,
) -> Option<RateLimitStatus> {
    let header_u32 = |key: &str| {
        headers
            .get(key)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
    };

    let remaining = header_u32(remaining_key)?;
    let limit = header_u32(limit_key).unwrap_or(declared_limit);
    let reset_at = headers
        .get(reset_key)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_reset)
        .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(60));

    Some(RateLimitStatus {
        remaining,
        limit,
        reset_at,
    })
}

/// Reset headers come as RFC 3339 timestamps (Anthropic) or whole-second
/// offsets (some OpenAI-compatible gateways).
fn parse_reset(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    value
        .parse::<i64>()
        .ok()
        .map(|secs| Utc::now() + chrono::Duration::seconds(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                HeaderName::from_static(k),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_rate_limit_headers_parsed() {
        let map = headers(&[
            ("anthropic-ratelimit-requests-remaining", "42"),
            ("anthropic-ratelimit-requests-limit", "100"),
            (
                "anthropic-ratelimit-requests-reset",
                "2030-01-01T00:00:00Z",
            ),
        ]);
        let status = rate_limit_from_headers(
            &map,
            "anthropic-ratelimit-requests-remaining",
            "anthropic-ratelimit-requests-limit",
            "anthropic-ratelimit-requests-reset",
            60,
        )
        .unwrap();
        assert_eq!(status.remaining, 42);
        assert_eq!(status.limit, 100);
    }

    #[test]
    fn test_rate_limit_headers_absent() {
        let map = HeaderMap::new();
        assert!(rate_limit_from_headers(
            &map,
            "x-ratelimit-remaining-requests",
            "x-ratelimit-limit-requests",
            "x-ratelimit-reset-requests",
            60,
        )
        .is_none());
    }

    #[test]
    fn test_rate_limit_limit_falls_back_to_declared() {
        let map = headers(&[("x-ratelimit-remaining-requests", "0")]);
        let status = rate_limit_from_headers(
            &map,
            "x-ratelimit-remaining-requests",
            "x-ratelimit-limit-requests",
            "x-ratelimit-reset-requests",
            60,
        )
        .unwrap();
        assert_eq!(status.remaining, 0);
        assert_eq!(status.limit, 60);
        assert!(status.is_exhausted());
    }
}
