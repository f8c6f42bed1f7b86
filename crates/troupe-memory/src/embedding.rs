use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub embeddings: Vec<Vec<f32>>,
    pub model: String,
    pub dimensions: usize,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingResult>;
    fn model_id(&self) -> &str;
    fn dimensions(&self) -> usize;
}

#[derive(Clone)]
pub struct OpenAiEmbeddingProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dimensions: usize,
    base_url: String,
}

impl OpenAiEmbeddingProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    pub fn with_model(api_key: String, model: String, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            dimensions,
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult {
                embeddings: Vec::new(),
                model: self.model.clone(),
                dimensions: self.dimensions,
            });
        }

        let endpoint = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let request = OpenAiEmbeddingRequest {
            model: self.model.clone(),
            input: texts.to_vec(),
            encoding_format: "float".to_string(),
        };

        let response = self
            .client
            .post(endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(CONTENT_TYPE, "application/json")
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        let parsed: OpenAiEmbeddingResponse = response.json().await?;
        let model = parsed.model.clone();
        let embeddings = extract_ordered_embeddings(parsed)?;

        if embeddings.len() != texts.len() {
            return Err(anyhow!(
                "embedding count mismatch: expected {}, got {}",
                texts.len(),
                embeddings.len()
            ));
        }

        if embeddings.iter().any(|item| item.len() != self.dimensions) {
            return Err(anyhow!(
                "embedding dimensions mismatch with configured dimensions {}",
                self.dimensions
            ));
        }

        Ok(EmbeddingResult {
            embeddings,
            model,
            dimensions: self.dimensions,
        })
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

// ---------------------------------------------------------------------------
// Stub Embedding Provider (fallback when no real provider available)
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct StubEmbeddingProvider {
    dims: usize,
}

impl StubEmbeddingProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn hash_to_unit_range(text: &str, index: usize) -> f32 {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(index.to_le_bytes());
        let hash = hasher.finalize();
        let value = u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]]);
        (value as f32 / u32::MAX as f32) * 2.0 - 1.0
    }
}

#[async_trait]
impl EmbeddingProvider for StubEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingResult> {
        let embeddings = texts
            .iter()
            .map(|text| {
                (0..self.dims)
                    .map(|index| Self::hash_to_unit_range(text, index))
                    .collect::<Vec<f32>>()
            })
            .collect::<Vec<Vec<f32>>>();

        Ok(EmbeddingResult {
            embeddings,
            model: "stub".to_string(),
            dimensions: self.dims,
        })
    }

    fn model_id(&self) -> &str {
        "stub"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

#[derive(Debug, Clone, Serialize)]
struct OpenAiEmbeddingRequest {
    model: String,
    input: Vec<String>,
    encoding_format: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
    model: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiEmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

fn extract_ordered_embeddings(response: OpenAiEmbeddingResponse) -> Result<Vec<Vec<f32>>> {
    let mut data = response.data;
    data.sort_by_key(|item| item.index);

    for (expected_index, item) in data.iter().enumerate() {
        if item.index != expected_index {
            return Err(anyhow!(
                "missing or duplicated embedding index: expected {}, got {}",
                expected_index,
                item.index
            ));
        }
    }

    Ok(data
        .into_iter()
        .map(|item| item.embedding)
        .collect::<Vec<Vec<f32>>>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_provider_returns_correct_dims() {
        let provider = StubEmbeddingProvider::new(8);
        let inputs = vec!["hello".to_string()];
        let result = provider.embed(&inputs).await.expect("stub embed");

        assert_eq!(result.embeddings.len(), 1);
        assert_eq!(result.embeddings[0].len(), 8);
        assert_eq!(result.dimensions, 8);
    }

    #[tokio::test]
    async fn stub_provider_deterministic() {
        let provider = StubEmbeddingProvider::new(6);
        let inputs = vec!["same input".to_string()];

        let first = provider.embed(&inputs).await.expect("first");
        let second = provider.embed(&inputs).await.expect("second");

        assert_eq!(first.embeddings, second.embeddings);
    }

    #[tokio::test]
    async fn stub_provider_batch() {
        let provider = StubEmbeddingProvider::new(4);
        let inputs = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let result = provider.embed(&inputs).await.expect("batch");

        assert_eq!(result.embeddings.len(), 3);
        assert_eq!(result.embeddings.iter().filter(|v| v.len() == 4).count(), 3);
    }

    #[test]
    fn openai_provider_default_model() {
        let provider = OpenAiEmbeddingProvider::new("k".to_string());
        assert_eq!(provider.model_id(), "text-embedding-3-small");
        assert_eq!(provider.dimensions(), 1536);
    }

    #[test]
    fn openai_provider_response_reordered() {
        let response = OpenAiEmbeddingResponse {
            data: vec![
                OpenAiEmbeddingData {
                    embedding: vec![0.9, 0.8],
                    index: 2,
                },
                OpenAiEmbeddingData {
                    embedding: vec![0.1, 0.2],
                    index: 0,
                },
                OpenAiEmbeddingData {
                    embedding: vec![0.5, 0.6],
                    index: 1,
                },
            ],
            model: "text-embedding-3-small".to_string(),
        };

        let ordered = extract_ordered_embeddings(response).expect("ordered embeddings");
        assert_eq!(ordered[0], vec![0.1, 0.2]);
        assert_eq!(ordered[1], vec![0.5, 0.6]);
        assert_eq!(ordered[2], vec![0.9, 0.8]);
    }

    #[test]
    fn openai_provider_response_gap_rejected() {
        let response = OpenAiEmbeddingResponse {
            data: vec![
                OpenAiEmbeddingData {
                    embedding: vec![0.1],
                    index: 0,
                },
                OpenAiEmbeddingData {
                    embedding: vec![0.2],
                    index: 2,
                },
            ],
            model: "text-embedding-3-small".to_string(),
        };
        assert!(extract_ordered_embeddings(response).is_err());
    }
}
