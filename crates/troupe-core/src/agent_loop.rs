//! Bounded ReAct loop driving one agent against a chat provider.
//!
//! Each turn issues one completion; tool-use blocks are executed
//! sequentially in emitted order and their results appended as a single
//! user message of `tool_result` blocks. A designated submission tool
//! short-circuits the loop with its input as the structured result.

use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use std::sync::Arc;

use troupe_provider::{ContentBlock, LlmMessage, LlmRequest, LlmResponse, ToolChoice};

use crate::error::{CoreError, CoreResult};
use crate::events::EventSink;
use crate::router::LlmRouter;
use crate::tool::ToolRegistry;

/// How a loop ended: free text, or the input of the submission tool.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopResult {
    Text(String),
    Submission(serde_json::Value),
}

impl LoopResult {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Submission(_) => None,
        }
    }

    pub fn as_submission(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Submission(value) => Some(value),
            Self::Text(_) => None,
        }
    }
}

/// Loop output. `result` is `None` when `max_turns` ran out without a
/// submission or final text; callers must treat that as an error.
#[derive(Debug)]
pub struct LoopOutcome {
    pub result: Option<LoopResult>,
    pub messages: Vec<LlmMessage>,
    pub turns_used: usize,
}

/// One loop invocation.
pub struct LoopSpec {
    pub agent_name: String,
    pub system_prompt: String,
    pub messages: Vec<LlmMessage>,
    pub tools: ToolRegistry,
    pub submission_tool: Option<String>,
    pub tool_choice: ToolChoice,
}

pub struct AgentRunner {
    router: Arc<LlmRouter>,
    provider_id: String,
    model: String,
    max_turns: usize,
    max_tokens: u32,
}

impl AgentRunner {
    pub fn new(
        router: Arc<LlmRouter>,
        provider_id: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            router,
            provider_id: provider_id.into(),
            model: model.into(),
            max_turns: 10,
            max_tokens: 4096,
        }
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn effective_system_prompt(&self, spec: &LoopSpec) -> String {
        if spec.tools.is_empty() {
            return spec.system_prompt.clone();
        }

        let names: Vec<String> = spec
            .tools
            .tool_defs()
            .into_iter()
            .map(|d| format!("`{}`", d.name))
            .collect();
        let mut prompt = format!(
            "{}\n\n## Tools\nYou can call these tools when they help: {}. \
             Tool results are returned to you before your next step.",
            spec.system_prompt,
            names.join(", ")
        );
        if let Some(submission) = &spec.submission_tool {
            prompt.push_str(&format!(
                "\nWhen your work is complete you must call the `{submission}` tool \
                 with your final result."
            ));
        }
        prompt
    }

    fn request(&self, spec: &LoopSpec, system: &str, messages: &[LlmMessage]) -> LlmRequest {
        LlmRequest {
            model: self.model.clone(),
            system: Some(system.to_string()),
            messages: messages.to_vec(),
            max_tokens: self.max_tokens,
            temperature: None,
            tools: spec.tools.tool_defs(),
            tool_choice: if spec.tools.is_empty() {
                None
            } else {
                Some(spec.tool_choice.clone())
            },
        }
    }

    /// Run the loop with whole-message completions.
    pub async fn run(
        &self,
        spec: LoopSpec,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> CoreResult<LoopOutcome> {
        let system = self.effective_system_prompt(&spec);
        let mut messages = spec.messages.clone();

        for turn in 0..self.max_turns {
            if cancel.is_cancelled() {
                return Err(CoreError::Canceled);
            }
            let request = self.request(&spec, &system, &messages);
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(CoreError::Canceled),
                resp = self.router.chat(&self.provider_id, request) => {
                    resp.map_err(CoreError::Provider)?
                }
            };

            match self
                .handle_turn(&spec, response, &mut messages, events, cancel)
                .await?
            {
                TurnVerdict::Done(result) => {
                    return Ok(LoopOutcome {
                        result: Some(result),
                        messages,
                        turns_used: turn + 1,
                    })
                }
                TurnVerdict::Continue => {}
            }
        }

        tracing::warn!(
            agent = %spec.agent_name,
            "agent loop exhausted {} turns without a result",
            self.max_turns
        );
        Ok(LoopOutcome {
            result: None,
            messages,
            turns_used: self.max_turns,
        })
    }

    /// Streaming variant: identical semantics, with every text delta
    /// forwarded through the event sink before tool dispatch.
    pub async fn run_streaming(
        &self,
        spec: LoopSpec,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> CoreResult<LoopOutcome> {
        let system = self.effective_system_prompt(&spec);
        let mut messages = spec.messages.clone();

        for turn in 0..self.max_turns {
            if cancel.is_cancelled() {
                return Err(CoreError::Canceled);
            }
            let request = self.request(&spec, &system, &messages);
            let mut stream = self
                .router
                .stream(&self.provider_id, request)
                .await
                .map_err(CoreError::Provider)?;

            let mut text = String::new();
            let mut final_blocks: Vec<ContentBlock> = Vec::new();
            let mut stop_reason = None;

            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => return Err(CoreError::Canceled),
                    chunk = stream.next() => chunk,
                };
                let Some(chunk) = chunk else { break };
                let chunk = chunk.map_err(CoreError::Provider)?;
                if !chunk.delta.is_empty() {
                    text.push_str(&chunk.delta);
                    events.stream_delta(&chunk.delta);
                }
                if chunk.is_final {
                    final_blocks = chunk.content_blocks;
                    stop_reason = chunk.stop_reason;
                    break;
                }
            }

            if final_blocks.is_empty() && !text.is_empty() {
                final_blocks.push(ContentBlock::Text { text: text.clone() });
            }
            let response = LlmResponse {
                text,
                content: final_blocks,
                input_tokens: None,
                output_tokens: None,
                stop_reason,
            };

            match self
                .handle_turn(&spec, response, &mut messages, events, cancel)
                .await?
            {
                TurnVerdict::Done(result) => {
                    return Ok(LoopOutcome {
                        result: Some(result),
                        messages,
                        turns_used: turn + 1,
                    })
                }
                TurnVerdict::Continue => {}
            }
        }

        tracing::warn!(
            agent = %spec.agent_name,
            "agent loop exhausted {} turns without a result",
            self.max_turns
        );
        Ok(LoopOutcome {
            result: None,
            messages,
            turns_used: self.max_turns,
        })
    }

    /// Shared per-turn logic: dispatch tool calls or decide the result.
    async fn handle_turn(
        &self,
        spec: &LoopSpec,
        response: LlmResponse,
        messages: &mut Vec<LlmMessage>,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> CoreResult<TurnVerdict> {
        let tool_uses = response.tool_uses();

        if tool_uses.is_empty() {
            if spec.tool_choice.is_strict() && spec.submission_tool.is_some() {
                // The model must end with a submission; push back.
                let submission = spec.submission_tool.as_deref().unwrap_or_default();
                messages.push(LlmMessage {
                    role: "assistant".into(),
                    content: response.content,
                });
                messages.push(LlmMessage::user(format!(
                    "You must call the `{submission}` tool now to submit your final result."
                )));
                return Ok(TurnVerdict::Continue);
            }
            return Ok(TurnVerdict::Done(LoopResult::Text(response.text)));
        }

        messages.push(LlmMessage {
            role: "assistant".into(),
            content: response.content.clone(),
        });

        let mut results: Vec<ContentBlock> = Vec::new();
        let mut submission_input: Option<serde_json::Value> = None;

        for (id, name, input) in tool_uses {
            if cancel.is_cancelled() {
                return Err(CoreError::Canceled);
            }

            if spec.submission_tool.as_deref() == Some(name.as_str()) {
                submission_input = Some(input);
                results.push(ContentBlock::ToolResult {
                    tool_use_id: id,
                    content: "Submission received.".into(),
                    is_error: false,
                });
                break;
            }

            events.thinking(&spec.agent_name, "tool_call", format!("Executing {name}"));
            let (content, is_error) = match spec.tools.execute(&name, input).await {
                Ok(output) => (output, false),
                Err(err) => (format!("Error executing {name}: {err}"), true),
            };
            results.push(ContentBlock::ToolResult {
                tool_use_id: id,
                content,
                is_error,
            });
        }

        messages.push(LlmMessage {
            role: "user".into(),
            content: results,
        });

        if let Some(input) = submission_input {
            return Ok(TurnVerdict::Done(LoopResult::Submission(input)));
        }
        Ok(TurnVerdict::Continue)
    }
}

enum TurnVerdict {
    Done(LoopResult),
    Continue,
}
