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

const API_VERSION: &str = "2023-06-01";
const REMAINING_HEADER: &str = "anthropic-ratelimit-requests-remaining";
const LIMIT_HEADER: &str = "anthropic-ratelimit-requests-limit";
const RESET_HEADER: &str = "anthropic-ratelimit-requests-reset";

/// Anthropic Messages API adapter.
pub struct AnthropicAdapter {
    settings: ProviderSettings,
    api_base: String,
    default_model: String,
    state: RwLock<AdapterState>,
}

impl AnthropicAdapter {
    pub fn new(settings: ProviderSettings) -> Self {
        let api_base = settings
            .api_base
            .clone()
            .unwrap_or_else(|| "https://api.anthropic.com".to_string())
            .trim_end_matches('/')
            .to_string();
        let default_model = settings
            .models
            .first()
            .cloned()
            .unwrap_or_else(|| "claude-sonnet-4-5-20250929".to_string());
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

    fn normalize_model(&self, model: &str) -> String {
        model
            .strip_prefix("anthropic/")
            .unwrap_or(model)
            .to_string()
    }

    fn resolve_model(&self, request: &ChatRequest) -> String {
        match &request.model {
            Some(model) => self.normalize_model(model),
            None => self.default_model.clone(),
        }
    }

    /// Anthropic expects the system prompt as a separate top-level field.
    fn convert_messages(&self, request: &ChatRequest) -> (Option<String>, Vec<serde_json::Value>) {
        let mut system_prompt = None;
        let mut converted = Vec::new();

        for msg in &request.messages {
            match msg.role {
                Role::System => {
                    system_prompt = Some(msg.content.clone());
                }
                Role::User => converted.push(json!({"role": "user", "content": msg.content})),
                Role::Assistant => {
                    converted.push(json!({"role": "assistant", "content": msg.content}))
                }
            }
        }

        (system_prompt, converted)
    }

    fn build_body(&self, request: &ChatRequest, model: &str, stream: bool) -> serde_json::Value {
        let (system_prompt, messages) = self.convert_messages(request);

        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if let Some(system) = system_prompt {
            body["system"] = json!(system);
        }
        if stream {
            body["stream"] = json!(true);
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
        let blocks = data
            .get("content")
            .and_then(|v| v.as_array())
            .ok_or_else(|| AiError::Parse("No content in response".to_string()))?;

        let mut content = String::new();
        for block in blocks {
            if block.get("type").and_then(|v| v.as_str()) == Some("text") {
                if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                    content.push_str(text);
                }
            }
        }

        let usage = data
            .get("usage")
            .map(|u| {
                TokenUsage::new(
                    u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                    u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                    // Anthropic does not report a total.
                    None,
                )
            })
            .unwrap_or_default();

        Ok(ChatResponse {
            id: data
                .get("id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("msg-{}", uuid::Uuid::new_v4())),
            content,
            role: Role::Assistant,
            provider: ProviderId::Anthropic,
            model: data
                .get("model")
                .and_then(|v| v.as_str())
                .unwrap_or(model)
                .to_string(),
            usage,
            created_at: chrono::Utc::now(),
        })
    }

    fn parse_model_list(&self, data: &serde_json::Value) -> Option<Vec<ModelInfo>> {
        let entries = data.get("data")?.as_array()?;
        let discovered: Vec<ModelInfo> = entries
            .iter()
            .filter_map(|m| {
                let id = m.get("id").and_then(|v| v.as_str())?;
                let display_name = m
                    .get("display_name")
                    .and_then(|v| v.as_str())
                    .unwrap_or(id);
                Some(ModelInfo {
                    id: id.to_string(),
                    display_name: display_name.to_string(),
                    provider: ProviderId::Anthropic,
                    capabilities: capabilities_for(id),
                })
            })
            .collect();
        Some(filter_models(discovered, &self.settings.models))
    }
}

#[async_trait]
impl ChatProvider for AnthropicAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Anthropic
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn initialize(&self) -> Result<(), AiError> {
        if self.settings.api_key.trim().is_empty() {
            return Err(AiError::Authentication("API key is empty".to_string()));
        }

        let url = format!("{}/v1/models", self.api_base);
        let response = http::client()
            .get(&url)
            .header("x-api-key", &self.settings.api_key)
            .header("anthropic-version", API_VERSION)
            .timeout(self.settings.timeout())
            .send()
            .await?;
        self.update_rate_limit(response.headers());
        let response = check_status(response).await?;

        match response.json::<serde_json::Value>().await {
            Ok(data) => {
                if let Some(models) = self.parse_model_list(&data) {
                    if !models.is_empty() {
                        self.state_write().models = models;
                    }
                }
            }
            Err(e) => warn!(
                "Anthropic model discovery failed, keeping fallback catalog: {}",
                e
            ),
        }
        Ok(())
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, AiError> {
        request.validate()?;
        let model = self.resolve_model(request);
        let url = format!("{}/v1/messages", self.api_base);
        let body = self.build_body(request, &model, false);

        debug!("Anthropic request to {} with model {}", url, model);

        let response = http::client()
            .post(&url)
            .header("x-api-key", &self.settings.api_key)
            .header("anthropic-version", API_VERSION)
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
        let url = format!("{}/v1/messages", self.api_base);
        let body = self.build_body(request, &model, true);

        debug!("Anthropic stream request to {} with model {}", url, model);

        let response = http::client()
            .post(&url)
            .header("x-api-key", &self.settings.api_key)
            .header("anthropic-version", API_VERSION)
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
            let mut stream_id = format!("msg-{}", uuid::Uuid::new_v4());
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
                    let event: serde_json::Value = serde_json::from_str(&data)
                        .map_err(|e| AiError::Parse(format!("bad stream event: {}", e)))?;

                    match event.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                        "message_start" => {
                            if let Some(id) = event.pointer("/message/id").and_then(|v| v.as_str()) {
                                stream_id = id.to_string();
                            }
                            if let Some(u) = event.pointer("/message/usage") {
                                usage.prompt_tokens = u
                                    .get("input_tokens")
                                    .and_then(|v| v.as_u64())
                                    .unwrap_or(0) as u32;
                            }
                        }
                        "content_block_delta" => {
                            if event.pointer("/delta/type").and_then(|v| v.as_str())
                                == Some("text_delta")
                            {
                                if let Some(text) =
                                    event.pointer("/delta/text").and_then(|v| v.as_str())
                                {
                                    if !text.is_empty() {
                                        yield StreamChunk {
                                            id: stream_id.clone(),
                                            delta: text.to_string(),
                                            provider: ProviderId::Anthropic,
                                            model: model.clone(),
                                            done: false,
                                            usage: None,
                                        };
                                    }
                                }
                            }
                        }
                        "message_delta" => {
                            if let Some(u) = event.get("usage") {
                                usage.completion_tokens = u
                                    .get("output_tokens")
                                    .and_then(|v| v.as_u64())
                                    .unwrap_or(0) as u32;
                                usage.total_tokens =
                                    usage.prompt_tokens + usage.completion_tokens;
                            }
                        }
                        "message_stop" => {
                            yield StreamChunk {
                                id: stream_id.clone(),
                                delta: String::new(),
                                provider: ProviderId::Anthropic,
                                model: model.clone(),
                                done: true,
                                usage: Some(usage.clone()),
                            };
                            done = true;
                        }
                        _ => {}
                    }
                }
            }

            if !done {
                Err(AiError::Network(
                    "stream ended without message_stop".to_string(),
                ))?;
            }
        };

        Ok(Box::pin(stream))
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/v1/models", self.api_base);
        match http::client()
            .get(&url)
            .header("x-api-key", &self.settings.api_key)
            .header("anthropic-version", API_VERSION)
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

fn capabilities_for(id: &str) -> ModelCapabilities {
    // All current Claude models stream, call tools and read images/PDFs;
    // only pricing and output ceilings differ.
    let (max_output_tokens, input_cost_per_1k, output_cost_per_1k) = if id.contains("opus") {
        (32_000, 0.015, 0.075)
    } else if id.contains("haiku") {
        (8_192, 0.0008, 0.004)
    } else {
        (64_000, 0.003, 0.015)
    };
    ModelCapabilities {
        max_context_tokens: 200_000,
        max_output_tokens,
        streaming: true,
        function_calling: true,
        images: true,
        documents: true,
        input_cost_per_1k,
        output_cost_per_1k,
    }
}

/// Minimum catalog used when model discovery is unavailable.
fn fallback_models() -> Vec<ModelInfo> {
    [
        ("claude-sonnet-4-5-20250929", "Claude Sonnet 4.5"),
        ("claude-opus-4-1-20250805", "Claude Opus 4.1"),
        ("claude-3-5-haiku-20241022", "Claude Haiku 3.5"),
    ]
    .into_iter()
    .map(|(id, name)| ModelInfo {
        id: id.to_string(),
        display_name: name.to_string(),
        provider: ProviderId::Anthropic,
        capabilities: capabilities_for(id),
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;

    fn adapter() -> AnthropicAdapter {
        AnthropicAdapter::new(ProviderSettings::new(ProviderId::Anthropic, "sk-ant-test"))
    }

    #[test]
    fn test_system_prompt_lifted_out_of_messages() {
        let a = adapter();
        let req = ChatRequest::new(vec![
            ChatMessage::system("You are a reading assistant."),
            ChatMessage::user("Recommend a novel"),
        ]);
        let (system, messages) = a.convert_messages(&req);
        assert_eq!(system.as_deref(), Some("You are a reading assistant."));
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }

    #[test]
    fn test_parse_response_concatenates_text_blocks() {
        let data = serde_json::json!({
            "id": "msg_01",
            "model": "claude-sonnet-4-5-20250929",
            "content": [
                {"type": "text", "text": "Try "},
                {"type": "text", "text": "Piranesi."}
            ],
            "usage": {"input_tokens": 20, "output_tokens": 6}
        });
        let resp = adapter()
            .parse_response(&data, "claude-sonnet-4-5-20250929")
            .unwrap();
        assert_eq!(resp.content, "Try Piranesi.");
        assert_eq!(resp.usage.prompt_tokens, 20);
        assert_eq!(resp.usage.completion_tokens, 6);
        // Total summed from the parts Anthropic exposes.
        assert_eq!(resp.usage.total_tokens, 26);
    }

    #[test]
    fn test_parse_response_without_content_fails() {
        let data = serde_json::json!({"type": "error"});
        assert!(matches!(
            adapter().parse_response(&data, "claude-sonnet-4-5-20250929"),
            Err(AiError::Parse(_))
        ));
    }

    #[test]
    fn test_fallback_catalog_reads_documents() {
        let models = adapter().models();
        assert!(!models.is_empty());
        assert!(models.iter().all(|m| m.capabilities.documents));
    }
}
