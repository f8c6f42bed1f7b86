use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::post,
    Json, Router,
};
use futures_core::Stream;
use serde::Deserialize;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use troupe_core::{ChatRequest, FileAttachment, SseEmitter};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    pub text: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub parent_message_id: Option<String>,
    #[serde(default, alias = "agent_id")]
    pub agent_id: Option<String>,
    /// Accepted for client compatibility; session routing is external.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub is_regenerate: bool,
    #[serde(default)]
    pub is_continued: bool,
    /// An edited user message replaces `text` for this turn.
    #[serde(default)]
    pub edited_content: Option<String>,
    #[serde(default)]
    pub response_message_id: Option<String>,
    #[serde(default)]
    pub files: Vec<FileBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileBody {
    pub file_id: String,
    pub filename: String,
    pub mime_type: String,
    /// Text content as produced by the (external) file parsing layer.
    #[serde(default)]
    pub content: String,
}

impl From<ChatBody> for ChatRequest {
    fn from(body: ChatBody) -> Self {
        ChatRequest {
            text: body.edited_content.unwrap_or(body.text),
            conversation_id: body.conversation_id,
            parent_message_id: body.parent_message_id,
            agent_id: body.agent_id,
            response_message_id: body.response_message_id,
            files: body
                .files
                .into_iter()
                .map(|f| FileAttachment {
                    file_id: f.file_id,
                    filename: f.filename,
                    mime_type: f.mime_type,
                    content: f.content,
                })
                .collect(),
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(chat_turn))
}

/// One user turn as an SSE stream. The stream ends after the final event;
/// dropping the response cancels the in-flight turn.
pub async fn chat_turn(
    State(state): State<AppState>,
    Json(body): Json<ChatBody>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let cancel = CancellationToken::new();
    let (emitter, rx) = SseEmitter::channel(cancel.clone());

    let dispatcher = state.dispatcher.clone();
    tokio::spawn(dispatcher.handle_turn(body.into(), emitter, cancel));

    let stream = UnboundedReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().data(data))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
