use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use std::sync::RwLock;
use tracing::{debug, warn};

use crate::config::ProviderSettings;
use crate::error::AiError;
use crate::types::{
    ChatRequest, ChatResponse, ModelCapabilities, ModelInfo, ProviderId, RateLimitStatus, Role,
    StreamChunk, TokenUsage,
};
use crate::util::http;

use super::sse::SseLines;
use super::{
    check_status, filter_models, rate_limit_from_headers, AdapterState, ChatProvider, ChunkStream,
};

const REMAINING_HEADER: &str = "x-ratelimit-remaining-requests";
const LIMIT_HEADER: &str = "x-ratelimit-limit-requests";
const RESET_HEADER: &str = "x-ratelimit-reset-requests";

/// OpenAI chat-completions adapter.
pub struct OpenAiAdapter {
    settings: ProviderSettings,
    api_base: String,
    default_model: String,
    state: RwLock<AdapterState>,
}

impl OpenAiAdapter {
    pub fn new(settings: ProviderSettings) -> Self {
        let api_base = settings
            .api_base
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
            .trim_end_matches('/')
            .to_string();
        let default_model = settings
            .models
            .first()
            .cloned()
            .unwrap_or_else(|| "gpt-4o".to_string());
        let state = RwLock::new(AdapterState::new(
            filter_models(fallback_models(), &settings.models),
            settings.rate_limit,
        ));
        Self {
            settings,
            api_base,
            default_model,
            state,
        }
    }

    /// Strip the "openai/" routing prefix callers may carry over.
    fn normalize_model(&self, model: &str) -> String {
        model.strip_prefix("openai/").unwrap_or(model).to_string()
    }

    fn resolve_model(&self, request: &ChatRequest) -> String {
        match &request.model {
            Some(model) => self.normalize_model(model),
            None => self.default_model.clone(),
        }
    }

    fn build_body(&self, request: &ChatRequest, model: &str, stream: bool) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();

        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if stream {
            body["stream"] = json!(true);
            // Ask for the terminal usage event.
            body["stream_options"] = json!({"include_usage": true});
        }
        body
    }

    fn update_rate_limit(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(status) = rate_limit_from_headers(
            headers,
            REMAINING_HEADER,
            LIMIT_HEADER,
            RESET_HEADER,
            self.settings.rate_limit,
        ) {
            self.state_write().rate_limit = status;
        }
    }

    fn state_read(&self) -> std::sync::RwLockReadGuard<'_, AdapterState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn state_write(&self) -> std::sync::RwLockWriteGuard<'_, AdapterState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn parse_response(&self, data: &serde_json::Value, model: &str) -> Result<ChatResponse, AiError> {
        let choice = data
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| AiError::Parse("No choices in response".to_string()))?;

        let content = choice
            .pointer("/message/content")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let id = data
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("resp-{}", uuid::Uuid::new_v4()));

        Ok(ChatResponse {
            id,
            content,
            role: Role::Assistant,
            provider: ProviderId::OpenAi,
            model: data
                .get("model")
                .and_then(|v| v.as_str())
                .unwrap_or(model)
                .to_string(),
            usage: parse_usage(data.get("usage")),
            created_at: chrono::Utc::now(),
        })
    }

    fn parse_model_list(&self, data: &serde_json::Value) -> Option<Vec<ModelInfo>> {
        let entries = data.get("data")?.as_array()?;
        let discovered: Vec<ModelInfo> = entries
            .iter()
            .filter_map(|m| m.get("id").and_then(|v| v.as_str()))
            // The listing includes embeddings, TTS, etc.; keep chat models.
            .filter(|id| {
                id.starts_with("gpt-") || id.starts_with("o1") || id.starts_with("o3")
            })
            .map(|id| ModelInfo {
                id: id.to_string(),
                display_name: id.to_string(),
                provider: ProviderId::OpenAi,
                capabilities: capabilities_for(id),
            })
            .collect();
        Some(filter_models(discovered, &self.settings.models))
    }
}

#[async_trait]
impl ChatProvider for OpenAiAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::OpenAi
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn initialize(&self) -> Result<(), AiError> {
        if self.settings.api_key.trim().is_empty() {
            return Err(AiError::Authentication("API key is empty".to_string()));
        }

        let url = format!("{}/models", self.api_base);
        let response = http::client()
            .get(&url)
            .bearer_auth(&self.settings.api_key)
            .timeout(self.settings.timeout())
            .send()
            .await?;
        self.update_rate_limit(response.headers());
        let response = check_status(response).await?;

        // Model discovery is best-effort: a credential that passed the
        // call above never fails initialization over catalog parsing.
        match response.json::<serde_json::Value>().await {
            Ok(data) => {
                if let Some(models) = self.parse_model_list(&data) {
                    if !models.is_empty() {
                        self.state_write().models = models;
                    }
                }
            }
            Err(e) => warn!("OpenAI model discovery failed, keeping fallback catalog: {}", e),
        }
        Ok(())
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, AiError> {
        request.validate()?;
        let model = self.resolve_model(request);
        let url = format!("{}/chat/completions", self.api_base);
        let body = self.build_body(request, &model, false);

        debug!("OpenAI request to {} with model {}", url, model);

        let response = http::client()
            .post(&url)
            .bearer_auth(&self.settings.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .timeout(self.settings.timeout())
            .send()
            .await?;
        self.update_rate_limit(response.headers());
        let response = check_status(response).await?;

        let data: serde_json::Value = response.json().await?;
        self.parse_response(&data, &model)
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChunkStream, AiError> {
        request.validate()?;
        let model = self.resolve_model(request);
        let url = format!("{}/chat/completions", self.api_base);
        let body = self.build_body(request, &model, true);

        debug!("OpenAI stream request to {} with model {}", url, model);

        let response = http::client()
            .post(&url)
            .bearer_auth(&self.settings.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .timeout(self.settings.timeout())
            .send()
            .await?;
        self.update_rate_limit(response.headers());
        let response = check_status(response).await?;

        let stream = try_stream! {
            let mut body = response.bytes_stream();
            let mut framer = SseLines::new();
            let mut stream_id = format!("resp-{}", uuid::Uuid::new_v4());
            let mut usage = TokenUsage::default();
            let mut done = false;

            while let Some(chunk) = body.next().await {
                if done {
                    break;
                }
                let chunk = chunk
                    .map_err(|e| AiError::Network(format!("stream read error: {}", e)))?;
                for data in framer.push(&chunk) {
                    if done {
                        break;
                    }
                    if data == "[DONE]" {
                        yield StreamChunk {
                            id: stream_id.clone(),
                            delta: String::new(),
                            provider: ProviderId::OpenAi,
                            model: model.clone(),
                            done: true,
                            usage: Some(usage.clone()),
                        };
                        done = true;
                        continue;
                    }

                    let event: serde_json::Value = serde_json::from_str(&data)
                        .map_err(|e| AiError::Parse(format!("bad stream event: {}", e)))?;
                    if let Some(id) = event.get("id").and_then(|v| v.as_str()) {
                        stream_id = id.to_string();
                    }
                    if let Some(u) = event.get("usage").filter(|u| !u.is_null()) {
                        usage = parse_usage(Some(u));
                    }
                    if let Some(delta) = event
                        .pointer("/choices/0/delta/content")
                        .and_then(|v| v.as_str())
                    {
                        if !delta.is_empty() {
                            yield StreamChunk {
                                id: stream_id.clone(),
                                delta: delta.to_string(),
                                provider: ProviderId::OpenAi,
                                model: model.clone(),
                                done: false,
                                usage: None,
                            };
                        }
                    }
                }
            }

            if !done {
                Err(AiError::Network(
                    "stream ended without completion marker".to_string(),
                ))?;
            }
        };

        Ok(Box::pin(stream))
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/models", self.api_base);
        match http::client()
            .get(&url)
            .bearer_auth(&self.settings.api_key)
            .timeout(self.settings.timeout())
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    fn models(&self) -> Vec<ModelInfo> {
        self.state_read().models.clone()
    }

    fn rate_limit_status(&self) -> RateLimitStatus {
        self.state_read().rate_limit.clone()
    }
}

fn parse_usage(usage: Option<&serde_json::Value>) -> TokenUsage {
    let Some(u) = usage else {
        return TokenUsage::default();
    };
    TokenUsage::new(
        u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        u.get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
        u.get("total_tokens").and_then(|v| v.as_u64()).map(|v| v as u32),
    )
}

fn capabilities_for(id: &str) -> ModelCapabilities {
    match id {
        "gpt-4o" => ModelCapabilities {
            max_context_tokens: 128_000,
            max_output_tokens: 16_384,
            streaming: true,
            function_calling: true,
            images: true,
            documents: false,
            input_cost_per_1k: 0.0025,
            output_cost_per_1k: 0.01,
        },
        "gpt-4o-mini" => ModelCapabilities {
            max_context_tokens: 128_000,
            max_output_tokens: 16_384,
            streaming: true,
            function_calling: true,
            images: true,
            documents: false,
            input_cost_per_1k: 0.00015,
            output_cost_per_1k: 0.0006,
        },
        "gpt-4.1" => ModelCapabilities {
            max_context_tokens: 1_047_576,
            max_output_tokens: 32_768,
            streaming: true,
            function_calling: true,
            images: true,
            documents: false,
            input_cost_per_1k: 0.002,
            output_cost_per_1k: 0.008,
        },
        // Unknown chat model from discovery: assume the baseline.
        _ => ModelCapabilities {
            max_context_tokens: 128_000,
            max_output_tokens: 4_096,
            streaming: true,
            function_calling: true,
            images: false,
            documents: false,
            input_cost_per_1k: 0.001,
            output_cost_per_1k: 0.002,
        },
    }
}

/// Minimum catalog used when model discovery is unavailable.
fn fallback_models() -> Vec<ModelInfo> {
    ["gpt-4o", "gpt-4o-mini", "gpt-4.1"]
        .into_iter()
        .map(|id| ModelInfo {
            id: id.to_string(),
            display_name: id.to_string(),
            provider: ProviderId::OpenAi,
            capabilities: capabilities_for(id),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;

    fn adapter() -> OpenAiAdapter {
        OpenAiAdapter::new(ProviderSettings::new(ProviderId::OpenAi, "sk-test"))
    }

    #[test]
    fn test_parse_response() {
        let data = serde_json::json!({
            "id": "chatcmpl-123",
            "model": "gpt-4o-2024-08-06",
            "choices": [{"message": {"role": "assistant", "content": "Hello!"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16}
        });
        let resp = adapter().parse_response(&data, "gpt-4o").unwrap();
        assert_eq!(resp.id, "chatcmpl-123");
        assert_eq!(resp.content, "Hello!");
        assert_eq!(resp.provider, ProviderId::OpenAi);
        assert_eq!(resp.model, "gpt-4o-2024-08-06");
        assert_eq!(resp.usage.total_tokens, 16);
    }

    #[test]
    fn test_parse_response_without_choices_fails() {
        let data = serde_json::json!({"error": {"message": "oops"}});
        assert!(matches!(
            adapter().parse_response(&data, "gpt-4o"),
            Err(AiError::Parse(_))
        ));
    }

    #[test]
    fn test_normalize_model_strips_prefix() {
        let a = adapter();
        assert_eq!(a.normalize_model("openai/gpt-4o"), "gpt-4o");
        assert_eq!(a.normalize_model("gpt-4o-mini"), "gpt-4o-mini");
    }

    #[test]
    fn test_build_body_stream_requests_usage() {
        let a = adapter();
        let req = ChatRequest::new(vec![ChatMessage::user("hi")]);
        let body = a.build_body(&req, "gpt-4o", true);
        assert_eq!(body["stream"], serde_json::json!(true));
        assert_eq!(
            body["stream_options"],
            serde_json::json!({"include_usage": true})
        );

        let body = a.build_body(&req, "gpt-4o", false);
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn test_allow_list_filters_catalog() {
        let mut settings = ProviderSettings::new(ProviderId::OpenAi, "sk-test");
        settings.models = vec!["gpt-4o-mini".to_string()];
        let a = OpenAiAdapter::new(settings);
        let models = a.models();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "gpt-4o-mini");
        assert_eq!(a.default_model(), "gpt-4o-mini");
    }
}
