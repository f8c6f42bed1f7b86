//! Wire contract for server-sent events.
//!
//! Every variant serializes to one JSON object emitted as a single
//! `text/event-stream` data frame. Streaming text events carry the full
//! accumulated text so far, not the delta.

use serde::{Deserialize, Serialize};

use crate::{Conversation, Message};

/// Progress event kinds forwarded from the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    OnThinking,
    OnAgentStart,
    OnAgentComplete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedEvent {
    pub created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    pub conversation_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub sync: bool,
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub event: ProgressKind,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Full accumulated text to date.
    pub text: String,
    pub index: usize,
    pub message_id: String,
    pub conversation_id: String,
}

impl TextEvent {
    pub fn accumulated(
        text: impl Into<String>,
        index: usize,
        message_id: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: "text",
            text: text.into(),
            index,
            message_id: message_id.into(),
            conversation_id: conversation_id.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalEvent {
    #[serde(rename = "final")]
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation: Option<Conversation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_message: Option<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_message: Option<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qa_waiting_for_approval: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_created: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl FinalEvent {
    pub fn ok() -> Self {
        Self {
            is_final: true,
            conversation: None,
            title: None,
            request_message: None,
            response_message: None,
            qa_waiting_for_approval: None,
            team_created: None,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let mut event = Self::ok();
        event.error = Some(ErrorBody {
            message: message.into(),
        });
        event
    }
}

/// Union of every event shape the server may stream.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SseEvent {
    Created(CreatedEvent),
    Sync(SyncEvent),
    Progress(ProgressEvent),
    Text(TextEvent),
    Final(FinalEvent),
}

impl SseEvent {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Final(_))
    }
}
