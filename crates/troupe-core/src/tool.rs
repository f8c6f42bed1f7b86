//! Tool execution framework for agent loops.
//!
//! Tools return plain strings suitable for a `tool_result` block. Errors
//! from `execute` are converted to error strings by the loop, so a failing
//! tool never aborts a turn.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use troupe_provider::ToolDef;

/// Longest output preview written to the log.
const LOG_PREVIEW_CHARS: usize = 800;

/// Trait for implementing tools that can be invoked by the LLM.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Return the tool definition (name, description, schema).
    fn definition(&self) -> ToolDef;

    /// Execute the tool with the given input.
    async fn execute(&self, input: serde_json::Value) -> Result<String>;
}

/// Registry of available tools.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolExecutor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn ToolExecutor>) {
        let name = tool.definition().name.clone();
        self.tools.insert(name, tool);
    }

    pub fn tool_defs(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Execute a tool by name, logging duration and output size.
    pub async fn execute(&self, name: &str, input: serde_json::Value) -> Result<String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| anyhow!("tool not found: {name}"))?;

        let started = Instant::now();
        let result = tool.execute(input).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(output) => {
                tracing::info!(
                    tool = name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    output_bytes = output.len(),
                    preview = %truncate_preview(output),
                    "tool executed"
                );
            }
            Err(err) => {
                tracing::warn!(
                    tool = name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "tool failed: {err}"
                );
            }
        }

        result
    }
}

fn truncate_preview(output: &str) -> String {
    if output.chars().count() <= LOG_PREVIEW_CHARS {
        output.to_string()
    } else {
        let truncated: String = output.chars().take(LOG_PREVIEW_CHARS).collect();
        format!("{truncated}…")
    }
}
