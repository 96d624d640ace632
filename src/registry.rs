use std::str::FromStr;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::ProviderSettings;
use crate::error::AiError;
use crate::provider::anthropic::AnthropicAdapter;
use crate::provider::gemini::GeminiAdapter;
use crate::provider::openai::OpenAiAdapter;
use crate::provider::ChatProvider;
use crate::types::{CapabilityFilter, ProviderId};

/// The closed set of identities this registry can construct.
pub fn supported_providers() -> Vec<ProviderId> {
    vec![ProviderId::OpenAi, ProviderId::Anthropic, ProviderId::Gemini]
}

/// Build the adapter for one provider. Uninitialized: the credential has
/// not been validated yet.
pub fn create_adapter(settings: ProviderSettings) -> Arc<dyn ChatProvider> {
    match settings.provider {
        ProviderId::OpenAi => Arc::new(OpenAiAdapter::new(settings)),
        ProviderId::Anthropic => Arc::new(AnthropicAdapter::new(settings)),
        ProviderId::Gemini => Arc::new(GeminiAdapter::new(settings)),
    }
}

/// Build the adapter for a provider named outside the typed config
/// surface. Unknown names fail with a typed error so callers can tell
/// "unknown provider" apart from runtime failures.
pub fn create_adapter_by_name(
    name: &str,
    settings: ProviderSettings,
) -> Result<Arc<dyn ChatProvider>, AiError> {
    let provider = ProviderId::from_str(name)?;
    let settings = ProviderSettings { provider, ..settings };
    Ok(create_adapter(settings))
}

/// Construct and initialize adapters for every enabled config entry.
///
/// One provider failing to initialize (bad credential, unreachable
/// endpoint) is logged and skipped; it never aborts the rest. The
/// settings ride along so the caller keeps priority/weight metadata.
pub async fn create_adapters(
    configs: Vec<ProviderSettings>,
) -> Vec<(ProviderSettings, Arc<dyn ChatProvider>)> {
    let mut adapters = Vec::new();

    for settings in configs {
        if !settings.enabled {
            info!("provider {} disabled, skipping", settings.provider);
            continue;
        }
        let adapter = create_adapter(settings.clone());
        match adapter.initialize().await {
            Ok(()) => {
                info!(
                    "provider {} initialized with {} model(s)",
                    settings.provider,
                    adapter.models().len()
                );
                adapters.push((settings, adapter));
            }
            Err(e) => {
                warn!(
                    "provider {} failed to initialize, excluding it: {}",
                    settings.provider, e
                );
            }
        }
    }

    adapters
}

/// Identities whose catalog has at least one model satisfying every
/// requested capability.
pub fn providers_with_capabilities(
    adapters: &[Arc<dyn ChatProvider>],
    filter: &CapabilityFilter,
) -> Vec<ProviderId> {
    adapters
        .iter()
        .filter(|a| a.models().iter().any(|m| filter.matches(&m.capabilities)))
        .map(|a| a.id())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(provider: ProviderId) -> ProviderSettings {
        ProviderSettings::new(provider, "test-key")
    }

    #[test]
    fn test_create_adapter_identity_matches() {
        for provider in supported_providers() {
            let adapter = create_adapter(settings(provider));
            assert_eq!(adapter.id(), provider);
        }
    }

    #[test]
    fn test_create_adapter_by_name() {
        let adapter =
            create_adapter_by_name("anthropic", settings(ProviderId::OpenAi)).unwrap();
        assert_eq!(adapter.id(), ProviderId::Anthropic);

        assert!(matches!(
            create_adapter_by_name("cohere", settings(ProviderId::OpenAi)),
            Err(AiError::UnsupportedProvider(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_providers_skipped() {
        let mut enabled = settings(ProviderId::OpenAi);
        enabled.enabled = false;
        let adapters = create_adapters(vec![enabled]).await;
        assert!(adapters.is_empty());
    }

    #[tokio::test]
    async fn test_empty_credential_excluded_without_aborting() {
        // The empty-key entry fails initialization before any network
        // call; with no other enabled entries the result is just empty.
        let mut bad = settings(ProviderId::Anthropic);
        bad.api_key = String::new();
        let adapters = create_adapters(vec![bad]).await;
        assert!(adapters.is_empty());
    }

    #[test]
    fn test_capability_filter_images_and_documents() {
        let adapters: Vec<Arc<dyn ChatProvider>> = supported_providers()
            .into_iter()
            .map(|p| create_adapter(settings(p)))
            .collect();

        // Every fallback catalog carries an image-capable model.
        let with_images =
            providers_with_capabilities(&adapters, &CapabilityFilter {
                images: true,
                ..Default::default()
            });
        assert_eq!(with_images.len(), 3);

        // Only Anthropic and Gemini models read documents.
        let with_documents =
            providers_with_capabilities(&adapters, &CapabilityFilter {
                documents: true,
                ..Default::default()
            });
        assert_eq!(
            with_documents,
            vec![ProviderId::Anthropic, ProviderId::Gemini]
        );

        // Context-window floor past OpenAI's gpt-4o but within reach of
        // gpt-4.1, Claude and Gemini.
        let big_context =
            providers_with_capabilities(&adapters, &CapabilityFilter {
                min_context_tokens: Some(200_000),
                ..Default::default()
            });
        assert_eq!(big_context.len(), 3);
    }
}
