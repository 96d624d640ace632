use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AiError;

/// The closed set of supported AI vendors. Used as the map key everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    OpenAi,
    Anthropic,
    Gemini,
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderId::OpenAi => write!(f, "openai"),
            ProviderId::Anthropic => write!(f, "anthropic"),
            ProviderId::Gemini => write!(f, "gemini"),
        }
    }
}

impl std::str::FromStr for ProviderId {
    type Err = AiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(ProviderId::OpenAi),
            "anthropic" => Ok(ProviderId::Anthropic),
            "gemini" | "google" => Ok(ProviderId::Gemini),
            other => Err(AiError::UnsupportedProvider(other.to_string())),
        }
    }
}

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Provider-agnostic chat request.
///
/// `model` is an optional pin; when unset each adapter uses its default.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub stream: bool,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            model: None,
            temperature: 0.7,
            max_tokens: 1024,
            stream: false,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Empty message lists are rejected before any network call.
    pub fn validate(&self) -> Result<(), AiError> {
        if self.messages.is_empty() {
            return Err(AiError::EmptyRequest);
        }
        Ok(())
    }
}

/// Token usage information.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Build usage from whatever the vendor exposed, summing the total
    /// when it is omitted.
    pub fn new(prompt_tokens: u32, completion_tokens: u32, total_tokens: Option<u32>) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: total_tokens.unwrap_or(prompt_tokens + completion_tokens),
        }
    }
}

/// Provider-agnostic chat response.
#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub id: String,
    pub content: String,
    pub role: Role,
    pub provider: ProviderId,
    pub model: String,
    pub usage: TokenUsage,
    pub created_at: DateTime<Utc>,
}

/// One incremental delta from a streaming response.
///
/// A stream is a finite sequence terminated by exactly one chunk with
/// `done == true`; usage is only present on that terminal chunk.
#[derive(Debug, Clone, Serialize)]
pub struct StreamChunk {
    pub id: String,
    pub delta: String,
    pub provider: ProviderId,
    pub model: String,
    pub done: bool,
    pub usage: Option<TokenUsage>,
}

/// Declared capabilities of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    pub max_context_tokens: u32,
    pub max_output_tokens: u32,
    pub streaming: bool,
    pub function_calling: bool,
    pub images: bool,
    pub documents: bool,
    pub input_cost_per_1k: f64,
    pub output_cost_per_1k: f64,
}

/// A model exposed by one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    pub provider: ProviderId,
    pub capabilities: ModelCapabilities,
}

/// Conjunction of capability requirements, evaluated against a provider's
/// model catalog (a provider matches when at least one model satisfies
/// all requested capabilities).
#[derive(Debug, Clone, Default)]
pub struct CapabilityFilter {
    pub streaming: bool,
    pub function_calling: bool,
    pub images: bool,
    pub documents: bool,
    pub min_context_tokens: Option<u32>,
}

impl CapabilityFilter {
    pub fn matches(&self, caps: &ModelCapabilities) -> bool {
        if self.streaming && !caps.streaming {
            return false;
        }
        if self.function_calling && !caps.function_calling {
            return false;
        }
        if self.images && !caps.images {
            return false;
        }
        if self.documents && !caps.documents {
            return false;
        }
        if let Some(min) = self.min_context_tokens {
            if caps.max_context_tokens < min {
                return false;
            }
        }
        true
    }
}

/// Last-known rate-limit snapshot for one provider.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub remaining: u32,
    pub limit: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitStatus {
    /// Fresh snapshot with the full declared quota remaining.
    pub fn full(limit: u32) -> Self {
        Self {
            remaining: limit,
            limit,
            reset_at: Utc::now(),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0 && self.reset_at > Utc::now()
    }
}
