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
use super::{check_status, filter_models, AdapterState, ChatProvider, ChunkStream};

/// Google Gemini adapter.
pub struct GeminiAdapter {
    settings: ProviderSettings,
    api_base: String,
    default_model: String,
    state: RwLock<AdapterState>,
}

impl GeminiAdapter {
    pub fn new(settings: ProviderSettings) -> Self {
        let api_base = settings
            .api_base
            .clone()
            .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string())
            .trim_end_matches('/')
            .to_string();
        let default_model = settings
            .models
            .first()
            .cloned()
            .unwrap_or_else(|| "gemini-2.0-flash".to_string());
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
            .strip_prefix("gemini/")
            .or_else(|| model.strip_prefix("models/"))
            .unwrap_or(model)
            .to_string()
    }

    fn resolve_model(&self, request: &ChatRequest) -> String {
        match &request.model {
            Some(model) => self.normalize_model(model),
            None => self.default_model.clone(),
        }
    }

    /// Gemini wants `contents` with user/model roles and the system prompt
    /// as a separate `systemInstruction`.
    fn convert_messages(
        &self,
        request: &ChatRequest,
    ) -> (Option<serde_json::Value>, Vec<serde_json::Value>) {
        let mut system_instruction = None;
        let mut contents = Vec::new();

        for msg in &request.messages {
            match msg.role {
                Role::System => {
                    system_instruction = Some(json!({"parts": [{"text": msg.content}]}));
                }
                Role::User => {
                    contents.push(json!({"role": "user", "parts": [{"text": msg.content}]}));
                }
                Role::Assistant => {
                    contents.push(json!({"role": "model", "parts": [{"text": msg.content}]}));
                }
            }
        }

        (system_instruction, contents)
    }

    fn build_body(&self, request: &ChatRequest) -> serde_json::Value {
        let (system_instruction, contents) = self.convert_messages(request);

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": request.max_tokens,
                "temperature": request.temperature,
            },
        });
        if let Some(system) = system_instruction {
            body["systemInstruction"] = system;
        }
        body
    }

    fn state_read(&self) -> std::sync::RwLockReadGuard<'_, AdapterState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn state_write(&self) -> std::sync::RwLockWriteGuard<'_, AdapterState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn parse_response(&self, data: &serde_json::Value, model: &str) -> Result<ChatResponse, AiError> {
        let candidate = data
            .get("candidates")
            .and_then(|v| v.get(0))
            .ok_or_else(|| AiError::Parse("No candidates in response".to_string()))?;

        let parts = candidate
            .pointer("/content/parts")
            .and_then(|v| v.as_array())
            .ok_or_else(|| AiError::Parse("No parts in response".to_string()))?;

        let mut content = String::new();
        for part in parts {
            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                content.push_str(text);
            }
        }

        Ok(ChatResponse {
            id: format!("gen-{}", uuid::Uuid::new_v4()),
            content,
            role: Role::Assistant,
            provider: ProviderId::Gemini,
            model: model.to_string(),
            usage: parse_usage(data.get("usageMetadata")),
            created_at: chrono::Utc::now(),
        })
    }

    fn parse_model_list(&self, data: &serde_json::Value) -> Option<Vec<ModelInfo>> {
        let entries = data.get("models")?.as_array()?;
        let discovered: Vec<ModelInfo> = entries
            .iter()
            .filter_map(|m| {
                let name = m.get("name").and_then(|v| v.as_str())?;
                let id = name.strip_prefix("models/").unwrap_or(name);
                if !id.starts_with("gemini") {
                    return None;
                }
                let display_name = m.get("displayName").and_then(|v| v.as_str()).unwrap_or(id);
                Some(ModelInfo {
                    id: id.to_string(),
                    display_name: display_name.to_string(),
                    provider: ProviderId::Gemini,
                    capabilities: capabilities_for(id),
                })
            })
            .collect();
        Some(filter_models(discovered, &self.settings.models))
    }
}

#[async_trait]
impl ChatProvider for GeminiAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Gemini
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn initialize(&self) -> Result<(), AiError> {
        if self.settings.api_key.trim().is_empty() {
            return Err(AiError::Authentication("API key is empty".to_string()));
        }

        let url = format!("{}/models?key={}", self.api_base, self.settings.api_key);
        let response = http::client()
            .get(&url)
            .timeout(self.settings.timeout())
            .send()
            .await?;
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
                "Gemini model discovery failed, keeping fallback catalog: {}",
                e
            ),
        }
        Ok(())
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, AiError> {
        request.validate()?;
        let model = self.resolve_model(request);
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.api_base, model, self.settings.api_key
        );
        let body = self.build_body(request);

        debug!("Gemini request with model {}", model);

        let response = http::client()
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .timeout(self.settings.timeout())
            .send()
            .await?;
        let response = check_status(response).await?;

        let data: serde_json::Value = response.json().await?;
        self.parse_response(&data, &model)
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChunkStream, AiError> {
        request.validate()?;
        let model = self.resolve_model(request);
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.api_base, model, self.settings.api_key
        );
        let body = self.build_body(request);

        debug!("Gemini stream request with model {}", model);

        let response = http::client()
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .timeout(self.settings.timeout())
            .send()
            .await?;
        let response = check_status(response).await?;

        let stream = try_stream! {
            let mut body = response.bytes_stream();
            let mut framer = SseLines::new();
            let stream_id = format!("gen-{}", uuid::Uuid::new_v4());
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

                    if let Some(u) = event.get("usageMetadata") {
                        usage = parse_usage(Some(u));
                    }

                    let candidate = event.get("candidates").and_then(|v| v.get(0));
                    let Some(candidate) = candidate else {
                        continue;
                    };

                    if let Some(parts) =
                        candidate.pointer("/content/parts").and_then(|v| v.as_array())
                    {
                        let mut delta = String::new();
                        for part in parts {
                            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                                delta.push_str(text);
                            }
                        }
                        if !delta.is_empty() {
                            yield StreamChunk {
                                id: stream_id.clone(),
                                delta,
                                provider: ProviderId::Gemini,
                                model: model.clone(),
                                done: false,
                                usage: None,
                            };
                        }
                    }

                    // The final event carries a finishReason.
                    if candidate.get("finishReason").and_then(|v| v.as_str()).is_some() {
                        yield StreamChunk {
                            id: stream_id.clone(),
                            delta: String::new(),
                            provider: ProviderId::Gemini,
                            model: model.clone(),
                            done: true,
                            usage: Some(usage.clone()),
                        };
                        done = true;
                    }
                }
            }

            if !done {
                Err(AiError::Network(
                    "stream ended without finish reason".to_string(),
                ))?;
            }
        };

        Ok(Box::pin(stream))
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/models?key={}", self.api_base, self.settings.api_key);
        match http::client()
            .get(&url)
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
        // Gemini exposes no rate-limit headers; the declared snapshot is
        // only adjusted by the orchestrator on 429 outcomes.
        self.state_read().rate_limit.clone()
    }
}

fn parse_usage(usage: Option<&serde_json::Value>) -> TokenUsage {
    let Some(u) = usage else {
        return TokenUsage::default();
    };
    TokenUsage::new(
        u.get("promptTokenCount").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        u.get("candidatesTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
        u.get("totalTokenCount").and_then(|v| v.as_u64()).map(|v| v as u32),
    )
}

fn capabilities_for(id: &str) -> ModelCapabilities {
    let (max_context_tokens, input_cost_per_1k, output_cost_per_1k) = if id.contains("1.5-pro") {
        (2_097_152, 0.00125, 0.005)
    } else {
        (1_048_576, 0.0001, 0.0004)
    };
    ModelCapabilities {
        max_context_tokens,
        max_output_tokens: 8_192,
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
        ("gemini-2.0-flash", "Gemini 2.0 Flash"),
        ("gemini-1.5-pro", "Gemini 1.5 Pro"),
    ]
    .into_iter()
    .map(|(id, name)| ModelInfo {
        id: id.to_string(),
        display_name: name.to_string(),
        provider: ProviderId::Gemini,
        capabilities: capabilities_for(id),
    })
    .collect()
}
