pub mod events;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use events::*;

/// Team member tier. Serialized as the bare integer the rest of the
/// system (and persisted team specs) use: 3 = Lead, 4 = Specialist, 5 = QA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Tier {
    Lead,
    Specialist,
    Qa,
}

impl TryFrom<u8> for Tier {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            3 => Ok(Self::Lead),
            4 => Ok(Self::Specialist),
            5 => Ok(Self::Qa),
            other => Err(format!("invalid tier: {other}")),
        }
    }
}

impl From<Tier> for u8 {
    fn from(tier: Tier) -> u8 {
        match tier {
            Tier::Lead => 3,
            Tier::Specialist => 4,
            Tier::Qa => 5,
        }
    }
}

/// Behavioral-science sophistication level assigned to a team member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BehavioralLevel {
    #[serde(rename = "NONE")]
    #[default]
    None,
    #[serde(rename = "ENTRY-MODERATE")]
    EntryModerate,
    #[serde(rename = "MODERATE-EXPERT")]
    ModerateExpert,
    #[serde(rename = "EXPERT")]
    Expert,
}

/// A single member of a persisted team specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamAgent {
    pub agent_id: String,
    pub name: String,
    pub role: String,
    pub tier: Tier,
    #[serde(default)]
    pub expertise: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub behavioral_level: BehavioralLevel,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub responsibilities: String,
}

/// Conversation record as seen by the core. Owns at most one team
/// specification at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub team_agents: Vec<TeamAgent>,
    #[serde(default)]
    pub team_objective: Option<String>,
    #[serde(default)]
    pub team_file_id: Option<String>,
    #[serde(default)]
    pub host_agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            conversation_id: conversation_id.into(),
            title: None,
            team_agents: Vec::new(),
            team_objective: None,
            team_file_id: None,
            host_agent_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_team(&self) -> bool {
        !self.team_agents.is_empty()
    }
}

/// Text payload of a message content part. External stores persist either
/// a bare string or a `{value: "..."}` object; both deserialize here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextPayload {
    Plain(String),
    Nested { value: String },
}

impl TextPayload {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Plain(text) => text,
            Self::Nested { value } => value,
        }
    }
}

/// One ordered part of a message `content` array. Parts with an unknown
/// `type` are preserved but contribute no text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub part_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<TextPayload>,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            part_type: "text".into(),
            text: Some(TextPayload::Plain(text.into())),
        }
    }
}

/// Stored chat message. Carries text either as the scalar `text` field or
/// as ordered content parts; `extract_text` is the single place that
/// tolerance lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub parent_message_id: Option<String>,
    #[serde(default)]
    pub is_created_by_user: bool,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub content: Option<Vec<ContentPart>>,
    #[serde(default)]
    pub sender: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub unfinished: bool,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl Message {
    pub fn user(
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            conversation_id: conversation_id.into(),
            parent_message_id: None,
            is_created_by_user: true,
            text: Some(text.into()),
            content: None,
            sender: "User".into(),
            created_at: Utc::now(),
            unfinished: false,
            metadata: None,
        }
    }

    pub fn assistant(
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
        sender: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            conversation_id: conversation_id.into(),
            parent_message_id: None,
            is_created_by_user: false,
            text: Some(text.into()),
            content: None,
            sender: sender.into(),
            created_at: Utc::now(),
            unfinished: false,
            metadata: None,
        }
    }
}

/// Extract the display text of a message, tolerating every stored shape:
/// missing `text`, empty `content`, string parts, `{value}` parts.
pub fn extract_text(message: &Message) -> String {
    if let Some(parts) = &message.content {
        let collected: Vec<&str> = parts
            .iter()
            .filter(|part| part.part_type == "text")
            .filter_map(|part| part.text.as_ref())
            .map(TextPayload::as_str)
            .filter(|text| !text.is_empty())
            .collect();
        if !collected.is_empty() {
            return collected.join("\n");
        }
    }
    message.text.clone().unwrap_or_default()
}

/// Orchestration turn status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrchestrationStatus {
    #[serde(rename = "IN_PROGRESS")]
    InProgress,
    #[serde(rename = "PAUSED")]
    Paused,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
}

/// Per-specialist progress inside a persisted orchestration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SpecialistStatus {
    #[serde(rename = "PENDING")]
    #[default]
    Pending,
    #[serde(rename = "WORKING")]
    Working,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "PAUSED")]
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialistState {
    pub agent_name: String,
    #[serde(default)]
    pub status: SpecialistStatus,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub current_output: String,
    #[serde(default)]
    pub thinking: String,
    #[serde(default)]
    pub interrupt_question: Option<String>,
    #[serde(default)]
    pub agent_definition: Option<TeamAgent>,
}

impl SpecialistState {
    pub fn pending(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            status: SpecialistStatus::Pending,
            messages: Vec::new(),
            current_output: String::new(),
            thinking: String::new(),
            interrupt_question: None,
            agent_definition: None,
        }
    }
}

/// Persisted orchestration progress, keyed by
/// `(conversation_id, parent_message_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub conversation_id: String,
    pub parent_message_id: String,
    pub status: OrchestrationStatus,
    #[serde(default)]
    pub paused_message_id: Option<String>,
    #[serde(default)]
    pub lead_plan: Option<serde_json::Value>,
    #[serde(default)]
    pub specialist_states: Vec<SpecialistState>,
    #[serde(default)]
    pub shared_context: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrchestrationState {
    pub fn new(
        conversation_id: impl Into<String>,
        parent_message_id: impl Into<String>,
        status: OrchestrationStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            conversation_id: conversation_id.into(),
            parent_message_id: parent_message_id.into(),
            status,
            paused_message_id: None,
            lead_plan: None,
            specialist_states: Vec::new(),
            shared_context: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A chunked, embedded document in the knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub conversation_id: String,
    pub document_id: String,
    #[serde(default)]
    pub dedupe_key: Option<String>,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One embedded chunk belonging to a knowledge document. The vector set of
/// a document is replaced atomically on every re-embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeVector {
    pub document_id: String,
    pub conversation_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_serializes_as_integer() {
        let json = serde_json::to_string(&Tier::Lead).unwrap();
        assert_eq!(json, "3");
        let tier: Tier = serde_json::from_str("5").unwrap();
        assert_eq!(tier, Tier::Qa);
    }

    #[test]
    fn tier_rejects_unknown_value() {
        let err = serde_json::from_str::<Tier>("7").unwrap_err();
        assert!(err.to_string().contains("invalid tier"));
    }

    #[test]
    fn behavioral_level_round_trip() {
        let json = serde_json::to_string(&BehavioralLevel::ModerateExpert).unwrap();
        assert_eq!(json, "\"MODERATE-EXPERT\"");
        let level: BehavioralLevel = serde_json::from_str("\"ENTRY-MODERATE\"").unwrap();
        assert_eq!(level, BehavioralLevel::EntryModerate);
    }

    #[test]
    fn extract_text_scalar() {
        let msg = Message::user("c1", "m1", "hello");
        assert_eq!(extract_text(&msg), "hello");
    }

    #[test]
    fn extract_text_prefers_content_parts() {
        let mut msg = Message::assistant("c1", "m1", "Agent", "stale");
        msg.content = Some(vec![
            ContentPart::text("first"),
            ContentPart {
                part_type: "text".into(),
                text: Some(TextPayload::Nested {
                    value: "second".into(),
                }),
            },
        ]);
        assert_eq!(extract_text(&msg), "first\nsecond");
    }

    #[test]
    fn extract_text_empty_content_falls_back() {
        let mut msg = Message::assistant("c1", "m1", "Agent", "fallback");
        msg.content = Some(vec![]);
        assert_eq!(extract_text(&msg), "fallback");
    }

    #[test]
    fn extract_text_missing_everything() {
        let mut msg = Message::user("c1", "m1", "");
        msg.text = None;
        msg.content = None;
        assert_eq!(extract_text(&msg), "");
    }

    #[test]
    fn extract_text_skips_non_text_parts() {
        let mut msg = Message::assistant("c1", "m1", "Agent", "");
        msg.text = None;
        msg.content = Some(vec![
            ContentPart {
                part_type: "image".into(),
                text: None,
            },
            ContentPart::text("visible"),
        ]);
        assert_eq!(extract_text(&msg), "visible");
    }

    #[test]
    fn content_part_dual_shape_deserializes() {
        let plain: ContentPart =
            serde_json::from_str(r#"{"type":"text","text":"a"}"#).unwrap();
        assert_eq!(plain.text.unwrap().as_str(), "a");

        let nested: ContentPart =
            serde_json::from_str(r#"{"type":"text","text":{"value":"b"}}"#).unwrap();
        assert_eq!(nested.text.unwrap().as_str(), "b");
    }

    #[test]
    fn orchestration_status_wire_names() {
        let json = serde_json::to_string(&OrchestrationStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
        let status: OrchestrationStatus = serde_json::from_str("\"PAUSED\"").unwrap();
        assert_eq!(status, OrchestrationStatus::Paused);
    }

    #[test]
    fn conversation_has_team() {
        let mut convo = Conversation::new("c1");
        assert!(!convo.has_team());
        convo.team_agents.push(TeamAgent {
            agent_id: "a1".into(),
            name: "Lena Ortiz".into(),
            role: "Lead".into(),
            tier: Tier::Lead,
            expertise: String::new(),
            instructions: String::new(),
            behavioral_level: BehavioralLevel::None,
            provider: "anthropic".into(),
            model: "claude-sonnet-4".into(),
            responsibilities: String::new(),
        });
        assert!(convo.has_team());
    }
}
