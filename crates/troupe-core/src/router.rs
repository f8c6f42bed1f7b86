use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures_core::Stream;
use troupe_provider::{
    LlmProvider, LlmRequest, LlmResponse, ProviderRegistry, StreamChunk, StructuredRequest,
};

/// Routes requests to a registered provider, walking a global fallback
/// chain when the primary fails. Per-agent `provider`/`model` fields pick
/// the primary; fallbacks are deployment-wide.
pub struct LlmRouter {
    registry: Arc<ProviderRegistry>,
    global_fallbacks: Vec<String>,
}

impl LlmRouter {
    pub fn new(registry: Arc<ProviderRegistry>, global_fallbacks: Vec<String>) -> Self {
        Self {
            registry,
            global_fallbacks,
        }
    }

    fn candidates(&self, primary: &str) -> Vec<String> {
        let mut out = vec![primary.to_string()];
        for fallback in &self.global_fallbacks {
            if fallback != primary {
                out.push(fallback.clone());
            }
        }
        out
    }

    pub fn provider(&self, id: &str) -> Result<Arc<dyn LlmProvider>> {
        self.registry.get(id)
    }

    pub async fn chat(&self, provider_id: &str, request: LlmRequest) -> Result<LlmResponse> {
        let mut last_err: Option<anyhow::Error> = None;
        for candidate in self.candidates(provider_id) {
            let provider = match self.registry.get(&candidate) {
                Ok(p) => p,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            match provider.chat(request.clone()).await {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    tracing::warn!("provider {candidate} failed: {err}");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("no provider candidate available")))
    }

    /// Streaming goes to the primary only; a mid-stream fallback would
    /// replay partial output to the client.
    pub async fn stream(
        &self,
        provider_id: &str,
        request: LlmRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        self.registry.get(provider_id)?.stream(request).await
    }

    pub async fn parse(
        &self,
        provider_id: &str,
        request: StructuredRequest,
    ) -> Result<serde_json::Value> {
        let mut last_err: Option<anyhow::Error> = None;
        for candidate in self.candidates(provider_id) {
            let provider = match self.registry.get(&candidate) {
                Ok(p) => p,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            match provider.parse(request.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    tracing::warn!("provider {candidate} structured parse failed: {err}");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("no provider candidate available")))
    }
}
