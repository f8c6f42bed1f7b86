//! HTTP surface smoke tests: health reporting and the chat SSE stream,
//! served over a real listener with stub providers.

use std::sync::Arc;

use troupe_core::{ChatDispatcher, CoreConfig, LlmRouter};
use troupe_memory::embedding::StubEmbeddingProvider;
use troupe_memory::{ConversationStore, MessageStore, Store};
use troupe_provider::{ProviderRegistry, StubProvider};
use troupe_server::state::AppState;

async fn spawn_server() -> (String, Arc<Store>) {
    let store = Arc::new(Store::open_in_memory().expect("open store"));

    let mut registry = ProviderRegistry::new();
    registry.register("anthropic", Arc::new(StubProvider));
    let router = Arc::new(LlmRouter::new(Arc::new(registry), vec![]));

    let dispatcher = ChatDispatcher::new(
        router,
        Arc::new(CoreConfig::default()),
        Arc::new(store.conversations()) as Arc<dyn ConversationStore>,
        Arc::new(store.messages()) as Arc<dyn MessageStore>,
        store.orchestration(),
        store.kb(),
        Arc::new(StubEmbeddingProvider::new(8)),
    )
    .expect("dispatcher");

    let state = AppState {
        dispatcher,
        store: Arc::clone(&store),
    };

    let app = troupe_server::create_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    (format!("http://{addr}"), store)
}

#[tokio::test]
async fn health_reports_counts() {
    let (base, _store) = spawn_server().await;

    let body: serde_json::Value = reqwest::get(format!("{base}/api/health"))
        .await
        .expect("request")
        .json()
        .await
        .expect("json");

    assert_eq!(body["status"], "ok");
    assert_eq!(body["conversations"], 0);
    assert_eq!(body["documents"], 0);
    assert_eq!(body["paused_orchestrations"], 0);
}

#[tokio::test]
async fn chat_streams_created_then_final() {
    let (base, store) = spawn_server().await;

    let response = reqwest::Client::new()
        .post(format!("{base}/api/chat"))
        .json(&serde_json::json!({
            "text": "hello there, please summarize our options",
            "conversationId": "c_http"
        }))
        .send()
        .await
        .expect("request");

    assert!(response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/event-stream"))
        .unwrap_or(false));

    let body = response.text().await.expect("body");
    let frames: Vec<serde_json::Value> = body
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter_map(|data| serde_json::from_str(data).ok())
        .collect();

    assert!(frames.iter().any(|f| f["created"] == true));
    let final_frame = frames
        .iter()
        .find(|f| f["final"] == true)
        .expect("final frame");
    assert!(final_frame["responseMessage"]["text"]
        .as_str()
        .expect("response text")
        .contains("stub"));

    // The turn persisted both sides of the exchange.
    let messages = store.messages().get("c_http").await.expect("messages");
    assert_eq!(messages.len(), 2);
    assert!(messages[0].is_created_by_user);
    assert!(!messages[1].is_created_by_user);
}

#[tokio::test]
async fn parse_route_rejects_empty_conversation() {
    let (base, store) = spawn_server().await;

    // An existing conversation with no team-related messages.
    store
        .conversations()
        .upsert(&troupe_schema::Conversation::new("c_parse"))
        .await
        .expect("seed conversation");

    let response = reqwest::Client::new()
        .post(format!("{base}/api/teams/c_parse/parse"))
        .send()
        .await
        .expect("request");

    // No members can be extracted from an empty conversation.
    assert_eq!(response.status(), 422);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["created"], false);
}
