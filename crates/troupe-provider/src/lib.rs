pub mod anthropic;
pub mod openai;
pub mod types;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::iter as stream_iter;

pub use anthropic::AnthropicProvider;
pub use openai::{custom, openai, OpenAiProvider};
pub use types::*;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse>;

    async fn stream(
        &self,
        _request: LlmRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        anyhow::bail!("streaming not supported by this provider")
    }

    /// Structured-output completion. The default implementation asks the
    /// chat endpoint for a bare JSON object and repairs the result; native
    /// structured endpoints may override.
    async fn parse(&self, request: StructuredRequest) -> Result<serde_json::Value> {
        let schema_text = serde_json::to_string_pretty(&request.schema)?;
        let instruction = format!(
            "Respond with a single JSON object conforming to this JSON schema. \
             Output only the JSON object, no prose and no code fences.\n\n{schema_text}"
        );
        let system = match request.system {
            Some(system) => Some(format!("{system}\n\n{instruction}")),
            None => Some(instruction),
        };
        let resp = self
            .chat(LlmRequest {
                model: request.model,
                system,
                messages: request.messages,
                max_tokens: request.max_tokens,
                temperature: None,
                tools: Vec::new(),
                tool_choice: None,
            })
            .await?;
        robust_json_value(&resp.text)
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================
// Provider Configuration
// ============================================================

/// Provider type identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Anthropic,
    OpenAI,
    /// Custom OpenAI-compatible endpoint
    Custom,
}

/// Configuration for a single provider instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider ID (e.g., "anthropic", "my-gateway")
    pub id: String,
    /// Provider type
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Custom base URL (optional, uses the provider default)
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ProviderConfig {
    pub fn new(id: impl Into<String>, provider_type: ProviderType) -> Self {
        Self {
            id: id.into(),
            provider_type,
            api_key: None,
            base_url: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }
}

/// Create a provider from configuration.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn LlmProvider>> {
    let provider: Arc<dyn LlmProvider> = match config.provider_type {
        ProviderType::Anthropic => {
            let key = config
                .api_key
                .as_ref()
                .ok_or_else(|| anyhow!("anthropic requires api_key"))?;
            let base_url = config
                .base_url
                .as_deref()
                .unwrap_or("https://api.anthropic.com");
            Arc::new(AnthropicProvider::new(key.clone(), base_url))
        }
        ProviderType::OpenAI => {
            let key = config
                .api_key
                .as_ref()
                .ok_or_else(|| anyhow!("openai requires api_key"))?;
            Arc::new(openai(key.clone()))
        }
        ProviderType::Custom => {
            let key = config
                .api_key
                .as_ref()
                .ok_or_else(|| anyhow!("custom provider requires api_key"))?;
            let base_url = config
                .base_url
                .as_ref()
                .ok_or_else(|| anyhow!("custom provider requires base_url"))?;
            Arc::new(custom(key.clone(), base_url.clone()))
        }
    };
    Ok(provider)
}

/// Register providers from a list of configurations.
pub fn register_from_configs(
    registry: &mut ProviderRegistry,
    configs: &[ProviderConfig],
) -> Result<()> {
    for config in configs {
        let provider = create_provider(config)?;
        registry.register(&config.id, provider);
        tracing::info!(
            "Registered provider: {} ({:?})",
            config.id,
            config.provider_type
        );
    }
    Ok(())
}

// ============================================================
// Provider Registry
// ============================================================

#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(id.into(), provider);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn LlmProvider>> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("provider not found: {id}"))
    }

    pub fn list(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }
}

/// Deterministic echo provider for tests and offline runs.
pub struct StubProvider;

#[async_trait]
impl LlmProvider for StubProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        let user_text = request
            .messages
            .last()
            .map(|m| m.text())
            .unwrap_or_default();
        let full_text = format!("[stub:{}] {}", request.model, user_text);
        Ok(LlmResponse {
            text: full_text.clone(),
            content: vec![ContentBlock::Text { text: full_text }],
            input_tokens: None,
            output_tokens: None,
            stop_reason: Some("end_turn".into()),
        })
    }

    async fn stream(
        &self,
        request: LlmRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        let user_text = request
            .messages
            .last()
            .map(|m| m.text())
            .unwrap_or_default();
        let full_text = format!("[stub:stream:{}] {}", request.model, user_text);
        let mut chunks: Vec<Result<StreamChunk>> = full_text
            .split_inclusive(' ')
            .map(|word| Ok(StreamChunk::delta(word)))
            .collect();

        chunks.push(Ok(StreamChunk {
            delta: String::new(),
            is_final: true,
            input_tokens: Some(10),
            output_tokens: Some(20),
            stop_reason: Some("end_turn".into()),
            content_blocks: vec![ContentBlock::Text { text: full_text }],
        }));

        Ok(Box::pin(stream_iter(chunks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[test]
    fn provider_registry_get_registered_succeeds() {
        let mut registry = ProviderRegistry::new();
        registry.register("anthropic", Arc::new(StubProvider));

        let provider = registry.get("anthropic").unwrap();
        assert!(Arc::strong_count(&provider) >= 1);
    }

    #[test]
    fn provider_registry_get_unknown_fails() {
        let registry = ProviderRegistry::new();
        let err = registry.get("missing").err().unwrap();
        assert!(err.to_string().contains("provider not found: missing"));
    }

    #[tokio::test]
    async fn stub_provider_stream_yields_chunks() {
        let provider = StubProvider;
        let req = LlmRequest::simple("test-model".into(), None, "hello world".into());
        let mut stream = provider.stream(req).await.unwrap();
        let mut collected = String::new();
        let mut got_final = false;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            if chunk.is_final {
                got_final = true;
                assert!(chunk.stop_reason.is_some());
            } else {
                collected.push_str(&chunk.delta);
            }
        }
        assert!(got_final);
        assert!(collected.contains("stub:stream"));
    }

    #[tokio::test]
    async fn stub_provider_chat_returns_expected_format() {
        let provider = StubProvider;
        let req = LlmRequest::simple("my-model".into(), None, "ping".into());
        let resp = provider.chat(req).await.unwrap();
        assert!(resp.text.contains("stub:my-model"));
        assert!(resp.text.contains("ping"));
        assert_eq!(resp.stop_reason.as_deref(), Some("end_turn"));
    }

    #[tokio::test]
    async fn default_parse_repairs_fenced_output() {
        struct FencedProvider;

        #[async_trait]
        impl LlmProvider for FencedProvider {
            async fn chat(&self, _request: LlmRequest) -> Result<LlmResponse> {
                let text = "```json\n{\"team_size\": 2}\n```".to_string();
                Ok(LlmResponse {
                    text: text.clone(),
                    content: vec![ContentBlock::Text { text }],
                    input_tokens: None,
                    output_tokens: None,
                    stop_reason: Some("end_turn".into()),
                })
            }
        }

        let value = FencedProvider
            .parse(StructuredRequest {
                model: "m".into(),
                schema: serde_json::json!({"type": "object"}),
                system: None,
                messages: vec![LlmMessage::user("extract")],
                max_tokens: 512,
            })
            .await
            .unwrap();
        assert_eq!(value["team_size"], 2);
    }

    #[tokio::test]
    async fn default_health_returns_ok() {
        let provider = StubProvider;
        assert!(provider.health().await.is_ok());
    }

    #[test]
    fn provider_config_serialize_deserialize() {
        let config = ProviderConfig::new("my-openai", ProviderType::OpenAI)
            .with_api_key("sk-test")
            .with_base_url("https://custom.example.com/v1");

        let json = serde_json::to_string(&config).unwrap();
        let parsed: ProviderConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.id, "my-openai");
        assert_eq!(parsed.provider_type, ProviderType::OpenAI);
        assert_eq!(parsed.api_key, Some("sk-test".to_string()));
        assert_eq!(
            parsed.base_url,
            Some("https://custom.example.com/v1".to_string())
        );
    }
}
