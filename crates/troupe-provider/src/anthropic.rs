use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_core::Stream;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::StreamExt;

use crate::{ContentBlock, LlmProvider, LlmRequest, LlmResponse, StreamChunk, ToolChoice};

#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderErrorKind {
    RateLimit,
    ServerError,
    Timeout,
    AuthError,
    InvalidRequest,
    Unknown,
}

impl ProviderErrorKind {
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        match status.as_u16() {
            429 => Self::RateLimit,
            401 | 403 => Self::AuthError,
            400 | 422 => Self::InvalidRequest,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimit | Self::ServerError | Self::Timeout)
    }
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub(crate) fn to_api_request(request: LlmRequest) -> ApiRequest {
        let tools: Vec<ApiToolDef> = request
            .tools
            .into_iter()
            .map(|t| ApiToolDef {
                name: t.name,
                description: t.description,
                input_schema: t.input_schema,
            })
            .collect();

        let tool_choice = request.tool_choice.map(|choice| match choice {
            ToolChoice::Auto => serde_json::json!({"type": "auto"}),
            ToolChoice::Any => serde_json::json!({"type": "any"}),
            ToolChoice::Tool { name } => serde_json::json!({"type": "tool", "name": name}),
        });

        ApiRequest {
            model: request.model,
            system: request.system,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            messages: request
                .messages
                .into_iter()
                .map(|m| {
                    let has_non_text = m
                        .content
                        .iter()
                        .any(|b| !matches!(b, ContentBlock::Text { .. }));
                    if has_non_text {
                        // Send as array for tool_use/tool_result messages
                        let blocks: Vec<serde_json::Value> = m
                            .content
                            .iter()
                            .map(|b| match b {
                                ContentBlock::Text { text } => {
                                    serde_json::json!({"type": "text", "text": text})
                                }
                                ContentBlock::ToolUse { id, name, input } => {
                                    serde_json::json!({"type": "tool_use", "id": id, "name": name, "input": input})
                                }
                                ContentBlock::ToolResult {
                                    tool_use_id,
                                    content,
                                    is_error,
                                } => {
                                    serde_json::json!({"type": "tool_result", "tool_use_id": tool_use_id, "content": content, "is_error": is_error})
                                }
                            })
                            .collect();
                        ApiMessage {
                            role: m.role,
                            content: serde_json::Value::Array(blocks),
                        }
                    } else {
                        let text = m.text();
                        ApiMessage {
                            role: m.role,
                            content: serde_json::Value::String(text),
                        }
                    }
                })
                .collect(),
            tools: if tools.is_empty() { None } else { Some(tools) },
            tool_choice,
            stream: false,
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/v1/messages", self.api_base);
        let payload = Self::to_api_request(request);

        let resp = match self
            .client
            .post(url)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .header("x-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(anyhow!(
                    "anthropic api error (timeout) [retryable]: request timed out after 60s"
                ));
            }
            Err(e) if e.is_connect() => {
                return Err(anyhow!("anthropic api error (connect) [retryable]: {e}"));
            }
            Err(e) => return Err(e.into()),
        };

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await?;
            let parsed = serde_json::from_str::<ApiError>(&text).ok();
            return Err(format_api_error(status, parsed));
        }

        let body: ApiResponse = resp.json().await?;
        let content_blocks: Vec<ContentBlock> = body
            .content
            .iter()
            .filter_map(|block| match block.block_type.as_str() {
                "text" => block
                    .text
                    .as_ref()
                    .map(|t| ContentBlock::Text { text: t.clone() }),
                "tool_use" => {
                    let id = block.id.as_ref()?.clone();
                    let name = block.name.as_ref()?.clone();
                    let input = block
                        .input
                        .clone()
                        .unwrap_or(serde_json::Value::Object(Default::default()));
                    Some(ContentBlock::ToolUse { id, name, input })
                }
                _ => None,
            })
            .collect();
        let text = body
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");

        Ok(LlmResponse {
            text,
            content: content_blocks,
            input_tokens: body.usage.as_ref().map(|u| u.input_tokens),
            output_tokens: body.usage.as_ref().map(|u| u.output_tokens),
            stop_reason: body.stop_reason,
        })
    }

    async fn stream(
        &self,
        request: LlmRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        let url = format!("{}/v1/messages", self.api_base);
        let mut payload = Self::to_api_request(request);
        payload.stream = true;

        let resp = match self
            .client
            .post(url)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .header("x-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(anyhow!(
                    "anthropic api error (timeout) [retryable]: request timed out after 60s"
                ));
            }
            Err(e) if e.is_connect() => {
                return Err(anyhow!("anthropic api error (connect) [retryable]: {e}"));
            }
            Err(e) => return Err(e.into()),
        };

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await?;
            let parsed = serde_json::from_str::<ApiError>(&text).ok();
            return Err(format_api_error(status, parsed));
        }

        let sse_stream = parse_sse_stream(resp.bytes_stream());
        Ok(Box::pin(sse_stream))
    }
}

/// Accumulates content blocks across streaming events so the final chunk
/// can carry the assembled message for tool dispatch.
#[derive(Default)]
struct BlockAssembler {
    blocks: Vec<PendingBlock>,
}

enum PendingBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input_json: String,
    },
}

impl BlockAssembler {
    fn start_block(&mut self, block: &serde_json::Value) {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("tool_use") => {
                let id = block
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let name = block
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                self.blocks.push(PendingBlock::ToolUse {
                    id,
                    name,
                    input_json: String::new(),
                });
            }
            _ => self.blocks.push(PendingBlock::Text(String::new())),
        }
    }

    fn push_text(&mut self, text: &str) {
        if let Some(PendingBlock::Text(buf)) = self.blocks.last_mut() {
            buf.push_str(text);
        }
    }

    fn push_input_json(&mut self, partial: &str) {
        if let Some(PendingBlock::ToolUse { input_json, .. }) = self.blocks.last_mut() {
            input_json.push_str(partial);
        }
    }

    fn finish(self) -> Vec<ContentBlock> {
        self.blocks
            .into_iter()
            .filter_map(|block| match block {
                PendingBlock::Text(text) => {
                    if text.is_empty() {
                        None
                    } else {
                        Some(ContentBlock::Text { text })
                    }
                }
                PendingBlock::ToolUse {
                    id,
                    name,
                    input_json,
                } => {
                    let input = serde_json::from_str(&input_json)
                        .unwrap_or(serde_json::Value::Object(Default::default()));
                    Some(ContentBlock::ToolUse { id, name, input })
                }
            })
            .collect()
    }
}

fn parse_sse_stream(
    byte_stream: impl Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>>
        + Send
        + 'static,
) -> impl Stream<Item = Result<StreamChunk>> + Send {
    async_stream::stream! {
        tokio::pin!(byte_stream);
        let mut buffer = String::new();
        let mut assembler = BlockAssembler::default();
        let mut stop_reason: Option<String> = None;
        let mut input_tokens: Option<u32> = None;
        let mut output_tokens: Option<u32> = None;

        while let Some(chunk_result) = byte_stream.next().await {
            match chunk_result {
                Ok(bytes) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));

                    while let Some(pos) = buffer.find("\n\n") {
                        let event_text = buffer[..pos].to_string();
                        buffer = buffer[pos + 2..].to_string();

                        for line in event_text.lines() {
                            let Some(data) = line.strip_prefix("data: ") else {
                                continue;
                            };

                            if data == "[DONE]" {
                                continue;
                            }

                            let event: serde_json::Value = match serde_json::from_str(data) {
                                Ok(event) => event,
                                Err(e) => {
                                    yield Err(anyhow!("invalid sse event payload: {e}"));
                                    return;
                                }
                            };

                            match event.get("type").and_then(|t| t.as_str()) {
                                Some("message_start") => {
                                    input_tokens = event
                                        .pointer("/message/usage/input_tokens")
                                        .and_then(|v| v.as_u64())
                                        .and_then(|v| u32::try_from(v).ok());
                                }
                                Some("content_block_start") => {
                                    if let Some(block) = event.get("content_block") {
                                        assembler.start_block(block);
                                    }
                                }
                                Some("content_block_delta") => {
                                    let Some(delta) = event.get("delta") else { continue };
                                    match delta.get("type").and_then(|t| t.as_str()) {
                                        Some("text_delta") => {
                                            if let Some(text) =
                                                delta.get("text").and_then(|t| t.as_str())
                                            {
                                                assembler.push_text(text);
                                                yield Ok(StreamChunk::delta(text));
                                            }
                                        }
                                        Some("input_json_delta") => {
                                            if let Some(partial) = delta
                                                .get("partial_json")
                                                .and_then(|t| t.as_str())
                                            {
                                                assembler.push_input_json(partial);
                                            }
                                        }
                                        _ => {}
                                    }
                                }
                                Some("message_delta") => {
                                    stop_reason = event
                                        .pointer("/delta/stop_reason")
                                        .and_then(|v| v.as_str())
                                        .map(str::to_string)
                                        .or(stop_reason.take());
                                    output_tokens = event
                                        .pointer("/usage/output_tokens")
                                        .and_then(|v| v.as_u64())
                                        .and_then(|v| u32::try_from(v).ok())
                                        .or(output_tokens.take());
                                }
                                _ => {}
                            }
                        }
                    }
                }
                Err(e) => {
                    yield Err(anyhow!("stream error: {e}"));
                    return;
                }
            }
        }

        yield Ok(StreamChunk {
            delta: String::new(),
            is_final: true,
            input_tokens,
            output_tokens,
            stop_reason,
            content_blocks: assembler.finish(),
        });
    }
}

fn format_api_error(status: StatusCode, parsed: Option<ApiError>) -> anyhow::Error {
    let kind = ProviderErrorKind::from_status(status);
    let retryable = if kind.is_retryable() {
        " [retryable]"
    } else {
        ""
    };
    if let Some(api_error) = parsed {
        let detail = api_error.error;
        anyhow!(
            "anthropic api error ({status}){retryable}: {} ({})",
            detail.message,
            detail.r#type
        )
    } else {
        anyhow!("anthropic api error ({status}){retryable}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ApiToolDef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiMessage {
    pub role: String,
    pub content: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiResponse {
    pub content: Vec<ApiContentBlock>,
    pub usage: Option<ApiUsage>,
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub input: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiError {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiErrorDetail {
    #[serde(rename = "type")]
    pub r#type: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LlmMessage, ToolDef};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tool_request(server_uri: &str) -> (AnthropicProvider, LlmRequest) {
        let provider = AnthropicProvider::new("test-key", server_uri);
        let request = LlmRequest {
            model: "claude-sonnet-4".into(),
            system: Some("be helpful".into()),
            messages: vec![LlmMessage::user("list docs")],
            max_tokens: 1024,
            temperature: None,
            tools: vec![ToolDef {
                name: "list_documents".into(),
                description: "List KB documents".into(),
                input_schema: serde_json::json!({"type": "object", "properties": {}}),
            }],
            tool_choice: Some(ToolChoice::Auto),
        };
        (provider, request)
    }

    #[tokio::test]
    async fn chat_parses_text_and_tool_use() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .and(body_partial_json(
                serde_json::json!({"tool_choice": {"type": "auto"}}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [
                    {"type": "text", "text": "Looking that up."},
                    {"type": "tool_use", "id": "tu_1", "name": "list_documents", "input": {}}
                ],
                "usage": {"input_tokens": 12, "output_tokens": 7},
                "stop_reason": "tool_use"
            })))
            .mount(&server)
            .await;

        let (provider, request) = tool_request(&server.uri());
        let resp = provider.chat(request).await.unwrap();

        assert_eq!(resp.text, "Looking that up.");
        assert_eq!(resp.stop_reason.as_deref(), Some("tool_use"));
        let uses = resp.tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].1, "list_documents");
        assert_eq!(resp.input_tokens, Some(12));
    }

    #[tokio::test]
    async fn chat_surfaces_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": {"type": "rate_limit_error", "message": "slow down"}
            })))
            .mount(&server)
            .await;

        let (provider, request) = tool_request(&server.uri());
        let err = provider.chat(request).await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("429"));
        assert!(text.contains("retryable"));
        assert!(text.contains("slow down"));
    }

    #[tokio::test]
    async fn stream_assembles_text_and_tool_use() {
        let body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":5}}}\n\n",
            "event: content_block_start\n",
            "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
            "data: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"tu_9\",\"name\":\"search_documents\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"query\\\":\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"\\\"cats\\\"}\"}}\n\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"},\"usage\":{\"output_tokens\":9}}\n\n",
        );

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let (provider, request) = tool_request(&server.uri());
        let mut stream = provider.stream(request).await.unwrap();

        let mut text = String::new();
        let mut final_chunk = None;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            if chunk.is_final {
                final_chunk = Some(chunk);
            } else {
                text.push_str(&chunk.delta);
            }
        }

        assert_eq!(text, "Hello");
        let final_chunk = final_chunk.expect("final chunk");
        assert_eq!(final_chunk.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(final_chunk.output_tokens, Some(9));
        let tool_use = final_chunk
            .content_blocks
            .iter()
            .find_map(|b| match b {
                ContentBlock::ToolUse { name, input, .. } => Some((name.clone(), input.clone())),
                _ => None,
            })
            .expect("assembled tool_use block");
        assert_eq!(tool_use.0, "search_documents");
        assert_eq!(tool_use.1["query"], "cats");
    }

    #[test]
    fn tool_choice_serialization() {
        let request = LlmRequest {
            model: "m".into(),
            system: None,
            messages: vec![LlmMessage::user("x")],
            max_tokens: 100,
            temperature: Some(0.2),
            tools: vec![],
            tool_choice: Some(ToolChoice::Tool {
                name: "submit_team".into(),
            }),
        };
        let api = AnthropicProvider::to_api_request(request);
        let value = serde_json::to_value(&api).unwrap();
        assert_eq!(value["tool_choice"]["type"], "tool");
        assert_eq!(value["tool_choice"]["name"], "submit_team");
        assert!((value["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
    }
}
