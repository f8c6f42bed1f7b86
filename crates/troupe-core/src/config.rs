use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A `provider/model` pair addressing one registered provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl ModelRef {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

fn default_activation_pattern() -> String {
    r"(?i)^dr\.?\s*sterling,?\s*this\s+is\s+([^.!?\n]*)".to_string()
}

fn default_coordinator_agent_id() -> String {
    "agent_dr_sterling".to_string()
}

fn default_coordinator_name() -> String {
    "Dr. Sterling".to_string()
}

fn default_coordinator_model() -> ModelRef {
    ModelRef::new("anthropic", "claude-sonnet-4-20250514")
}

fn default_lead_model() -> ModelRef {
    ModelRef::new("anthropic", "claude-sonnet-4-20250514")
}

fn default_specialist_model() -> ModelRef {
    ModelRef::new("anthropic", "claude-sonnet-4-20250514")
}

fn default_qa_model() -> ModelRef {
    ModelRef::new("anthropic", "claude-sonnet-4-20250514")
}

fn default_extractor_model() -> ModelRef {
    ModelRef::new("anthropic", "claude-3-5-haiku-20241022")
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_search_k() -> usize {
    5
}

fn default_search_max_k() -> usize {
    10
}

fn default_max_loop_turns() -> usize {
    10
}

fn default_file_team_size_cap() -> usize {
    5
}

fn default_file_analysis_max_chars() -> usize {
    50_000
}

fn default_extraction_max_chars() -> usize {
    100_000
}

fn default_extraction_grace_delay_ms() -> u64 {
    2_000
}

fn default_short_objective_chars() -> usize {
    50
}

fn default_max_tokens() -> u32 {
    4096
}

/// Core configuration, loadable from `troupe.yaml`. Every field has a
/// default so an empty file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Activation phrase routed to the coordinator, with the user name in
    /// the first capture group.
    #[serde(default = "default_activation_pattern")]
    pub activation_pattern: String,
    #[serde(default = "default_coordinator_agent_id")]
    pub coordinator_agent_id: String,
    #[serde(default = "default_coordinator_name")]
    pub coordinator_name: String,

    #[serde(default = "default_coordinator_model")]
    pub coordinator_model: ModelRef,
    #[serde(default = "default_lead_model")]
    pub lead_model: ModelRef,
    #[serde(default = "default_specialist_model")]
    pub specialist_model: ModelRef,
    #[serde(default = "default_qa_model")]
    pub qa_model: ModelRef,
    #[serde(default = "default_extractor_model")]
    pub extractor_model: ModelRef,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_search_k")]
    pub search_default_k: usize,
    #[serde(default = "default_search_max_k")]
    pub search_max_k: usize,
    #[serde(default = "default_max_loop_turns")]
    pub max_loop_turns: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Team size cap for file-triggered creation. Coordinator-designed
    /// teams are unbounded.
    #[serde(default = "default_file_team_size_cap")]
    pub file_team_size_cap: usize,
    #[serde(default = "default_file_analysis_max_chars")]
    pub file_analysis_max_chars: usize,
    #[serde(default = "default_extraction_max_chars")]
    pub extraction_max_chars: usize,
    /// Grace period before background extraction after a confirmation
    /// marker, letting message writes settle.
    #[serde(default = "default_extraction_grace_delay_ms")]
    pub extraction_grace_delay_ms: u64,
    /// User text shorter than this falls back to the stored team objective.
    #[serde(default = "default_short_objective_chars")]
    pub short_objective_chars: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("default config")
    }
}

impl CoreConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.activation_regex()?;
        Ok(config)
    }

    pub fn activation_regex(&self) -> Result<Regex> {
        Regex::new(&self.activation_pattern)
            .with_context(|| format!("invalid activation pattern: {}", self.activation_pattern))
    }
}
