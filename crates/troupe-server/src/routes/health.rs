use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct Health {
    pub status: &'static str,
    pub conversations: i64,
    pub documents: i64,
    pub paused_orchestrations: i64,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health))
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    let db = state.store.db();
    let (conversations, documents, paused) = tokio::task::spawn_blocking(move || {
        let conn = match db.lock() {
            Ok(conn) => conn,
            Err(_) => return (0, 0, 0),
        };
        let count = |sql: &str| -> i64 { conn.query_row(sql, [], |r| r.get(0)).unwrap_or(0) };
        (
            count("SELECT COUNT(*) FROM conversations"),
            count("SELECT COUNT(*) FROM kb_documents"),
            count("SELECT COUNT(*) FROM orchestration_states WHERE status = 'PAUSED'"),
        )
    })
    .await
    .unwrap_or((0, 0, 0));

    Json(Health {
        status: "ok",
        conversations,
        documents,
        paused_orchestrations: paused,
    })
}
