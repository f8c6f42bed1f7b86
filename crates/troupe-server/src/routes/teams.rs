use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use serde::Serialize;

use troupe_core::CoreError;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/chat", post(super::chat::chat_turn))
        .route("/{conversation_id}/parse", post(parse_team))
}

#[derive(Serialize)]
pub struct ParseResponse {
    pub created: bool,
    pub members: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Force team extraction from the conversation's current messages. The
/// approval-path escape hatch when the in-band marker was missed.
async fn parse_team(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> (StatusCode, Json<ParseResponse>) {
    match state.dispatcher.run_team_extraction(&conversation_id).await {
        Ok(members) => (
            StatusCode::OK,
            Json(ParseResponse {
                created: true,
                members,
                error: None,
            }),
        ),
        Err(err) => {
            let status = match &err {
                CoreError::Policy(_) => StatusCode::CONFLICT,
                CoreError::TeamExtractionFailed => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(ParseResponse {
                    created: false,
                    members: 0,
                    error: Some(err.to_string()),
                }),
            )
        }
    }
}
