use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;

use troupe_schema::{Conversation, ContentPart, Message, TeamAgent};

/// Conversation persistence as the core sees it. The storage backing the
/// real deployment is external; this trait is the full surface the core
/// depends on.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>>;
    async fn upsert(&self, conversation: &Conversation) -> Result<Conversation>;
    async fn delete(&self, conversation_id: &str) -> Result<bool>;
}

/// Message persistence as the core sees it. `get` returns messages in
/// ascending `created_at` order.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save(&self, message: &Message) -> Result<Message>;
    async fn get(&self, conversation_id: &str) -> Result<Vec<Message>>;
    async fn get_one(&self, message_id: &str) -> Result<Option<Message>>;
}

#[derive(Clone)]
pub struct SqliteConversationStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteConversationStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let db = Arc::clone(&self.db);
        let id = conversation_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            read_conversation(&conn, &id)
        })
        .await?
    }

    async fn upsert(&self, conversation: &Conversation) -> Result<Conversation> {
        let db = Arc::clone(&self.db);
        let mut row = conversation.clone();
        row.updated_at = Utc::now();
        let saved = row.clone();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let team_json = serde_json::to_string(&row.team_agents)?;
            conn.execute(
                "INSERT INTO conversations(
                    conversation_id, title, team_agents, team_objective,
                    team_file_id, host_agent_id, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(conversation_id) DO UPDATE SET
                    title = excluded.title,
                    team_agents = excluded.team_agents,
                    team_objective = excluded.team_objective,
                    team_file_id = excluded.team_file_id,
                    host_agent_id = excluded.host_agent_id,
                    updated_at = excluded.updated_at",
                params![
                    row.conversation_id,
                    row.title,
                    team_json,
                    row.team_objective,
                    row.team_file_id,
                    row.host_agent_id,
                    row.created_at.to_rfc3339(),
                    row.updated_at.to_rfc3339(),
                ],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(saved)
    }

    /// Conversation deletion also removes its messages and any
    /// orchestration state.
    async fn delete(&self, conversation_id: &str) -> Result<bool> {
        let db = Arc::clone(&self.db);
        let id = conversation_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "DELETE FROM orchestration_states WHERE conversation_id = ?1",
                params![id],
            )?;
            tx.execute("DELETE FROM messages WHERE conversation_id = ?1", params![id])?;
            let removed = tx.execute(
                "DELETE FROM conversations WHERE conversation_id = ?1",
                params![id],
            )?;
            tx.commit()?;
            Ok::<bool, anyhow::Error>(removed > 0)
        })
        .await?
    }
}

#[derive(Clone)]
pub struct SqliteMessageStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteMessageStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn save(&self, message: &Message) -> Result<Message> {
        let db = Arc::clone(&self.db);
        let row = message.clone();
        let saved = row.clone();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let content_json = row.content.as_ref().map(serde_json::to_string).transpose()?;
            let metadata_json = row.metadata.as_ref().map(serde_json::to_string).transpose()?;
            conn.execute(
                "INSERT INTO messages(
                    message_id, conversation_id, parent_message_id, is_created_by_user,
                    sender, text, content, metadata, unfinished, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(message_id) DO UPDATE SET
                    parent_message_id = excluded.parent_message_id,
                    is_created_by_user = excluded.is_created_by_user,
                    sender = excluded.sender,
                    text = excluded.text,
                    content = excluded.content,
                    metadata = excluded.metadata,
                    unfinished = excluded.unfinished",
                params![
                    row.message_id,
                    row.conversation_id,
                    row.parent_message_id,
                    row.is_created_by_user as i64,
                    row.sender,
                    row.text,
                    content_json,
                    metadata_json,
                    row.unfinished as i64,
                    row.created_at.to_rfc3339(),
                ],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(saved)
    }

    async fn get(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let db = Arc::clone(&self.db);
        let id = conversation_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(&format!(
                "{SELECT_MESSAGE} WHERE conversation_id = ?1 ORDER BY created_at, message_id"
            ))?;
            let rows = stmt.query_map(params![id], map_message_row)?;
            let mut messages = Vec::new();
            for row in rows {
                messages.push(decode_message(row?)?);
            }
            Ok::<Vec<Message>, anyhow::Error>(messages)
        })
        .await?
    }

    async fn get_one(&self, message_id: &str) -> Result<Option<Message>> {
        let db = Arc::clone(&self.db);
        let id = message_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let row = conn
                .query_row(
                    &format!("{SELECT_MESSAGE} WHERE message_id = ?1"),
                    params![id],
                    map_message_row,
                )
                .optional()?;
            row.map(decode_message).transpose()
        })
        .await?
    }
}

fn read_conversation(conn: &Connection, conversation_id: &str) -> Result<Option<Conversation>> {
    let row = conn
        .query_row(
            "SELECT conversation_id, title, team_agents, team_objective,
                    team_file_id, host_agent_id, created_at, updated_at
             FROM conversations WHERE conversation_id = ?1",
            params![conversation_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, Option<String>>(5)?,
                    r.get::<_, String>(6)?,
                    r.get::<_, String>(7)?,
                ))
            },
        )
        .optional()?;

    let Some((
        conversation_id,
        title,
        team_json,
        team_objective,
        team_file_id,
        host_agent_id,
        created_at,
        updated_at,
    )) = row
    else {
        return Ok(None);
    };

    let team_agents: Vec<TeamAgent> = serde_json::from_str(&team_json).unwrap_or_default();
    Ok(Some(Conversation {
        conversation_id,
        title,
        team_agents,
        team_objective,
        team_file_id,
        host_agent_id,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    }))
}

const SELECT_MESSAGE: &str = "SELECT message_id, conversation_id, parent_message_id,
        is_created_by_user, sender, text, content, metadata, unfinished, created_at
 FROM messages";

type MessageRow = (
    String,
    String,
    Option<String>,
    i64,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    i64,
    String,
);

fn map_message_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
        r.get(7)?,
        r.get(8)?,
        r.get(9)?,
    ))
}

fn decode_message(row: MessageRow) -> Result<Message> {
    let (
        message_id,
        conversation_id,
        parent_message_id,
        is_created_by_user,
        sender,
        text,
        content_json,
        metadata_json,
        unfinished,
        created_at,
    ) = row;

    let content: Option<Vec<ContentPart>> = content_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .unwrap_or_default();
    let metadata = metadata_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .unwrap_or_default();

    Ok(Message {
        message_id,
        conversation_id,
        parent_message_id,
        is_created_by_user: is_created_by_user != 0,
        text,
        content,
        sender,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        unfinished: unfinished != 0,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::run_migrations;
    use troupe_schema::{extract_text, BehavioralLevel, TextPayload, Tier};

    fn test_db() -> Arc<Mutex<Connection>> {
        let conn = Connection::open_in_memory().expect("open sqlite");
        run_migrations(&conn).expect("migrations");
        Arc::new(Mutex::new(conn))
    }

    fn lead(name: &str) -> TeamAgent {
        TeamAgent {
            agent_id: "a1".into(),
            name: name.into(),
            role: "Lead Strategist".into(),
            tier: Tier::Lead,
            expertise: "strategy".into(),
            instructions: "Lead the team".into(),
            behavioral_level: BehavioralLevel::Expert,
            provider: "anthropic".into(),
            model: "claude-sonnet-4".into(),
            responsibilities: "strategy".into(),
        }
    }

    #[tokio::test]
    async fn conversation_round_trip_with_team() -> Result<()> {
        let db = test_db();
        let store = SqliteConversationStore::new(db);

        let mut convo = Conversation::new("c1");
        convo.title = Some("Launch plan".into());
        convo.team_agents = vec![lead("Lena Ortiz")];
        convo.team_objective = Some("ship it".into());
        store.upsert(&convo).await?;

        let loaded = store.get("c1").await?.expect("conversation");
        assert_eq!(loaded.title.as_deref(), Some("Launch plan"));
        assert_eq!(loaded.team_agents.len(), 1);
        assert_eq!(loaded.team_agents[0].tier, Tier::Lead);
        assert_eq!(loaded.team_objective.as_deref(), Some("ship it"));
        Ok(())
    }

    #[tokio::test]
    async fn upsert_replaces_fields() -> Result<()> {
        let store = SqliteConversationStore::new(test_db());
        let mut convo = Conversation::new("c1");
        store.upsert(&convo).await?;

        convo.title = Some("renamed".into());
        store.upsert(&convo).await?;

        let loaded = store.get("c1").await?.expect("conversation");
        assert_eq!(loaded.title.as_deref(), Some("renamed"));
        Ok(())
    }

    #[tokio::test]
    async fn delete_cascades_messages_and_states() -> Result<()> {
        let db = test_db();
        let convos = SqliteConversationStore::new(Arc::clone(&db));
        let messages = SqliteMessageStore::new(Arc::clone(&db));
        let states = crate::orchestration::OrchestrationStateStore::new(Arc::clone(&db));

        convos.upsert(&Conversation::new("c1")).await?;
        messages.save(&Message::user("c1", "m1", "hi")).await?;
        states
            .save(&troupe_schema::OrchestrationState::new(
                "c1",
                "m1",
                troupe_schema::OrchestrationStatus::InProgress,
            ))
            .await?;

        assert!(convos.delete("c1").await?);
        assert!(messages.get("c1").await?.is_empty());
        assert!(states.get_latest("c1").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn messages_sorted_ascending() -> Result<()> {
        let store = SqliteMessageStore::new(test_db());
        let mut first = Message::user("c1", "m1", "one");
        first.created_at = chrono::Utc::now() - chrono::Duration::seconds(10);
        let second = Message::assistant("c1", "m2", "Agent", "two");

        store.save(&second).await?;
        store.save(&first).await?;

        let loaded = store.get("c1").await?;
        assert_eq!(loaded[0].message_id, "m1");
        assert_eq!(loaded[1].message_id, "m2");
        Ok(())
    }

    #[tokio::test]
    async fn message_content_parts_round_trip() -> Result<()> {
        let store = SqliteMessageStore::new(test_db());
        let mut msg = Message::assistant("c1", "m1", "Agent", "");
        msg.text = None;
        msg.content = Some(vec![ContentPart {
            part_type: "text".into(),
            text: Some(TextPayload::Nested {
                value: "nested body".into(),
            }),
        }]);
        msg.metadata = Some(serde_json::json!({"phase": "qa_gate_pending"}));
        store.save(&msg).await?;

        let loaded = store.get_one("m1").await?.expect("message");
        assert_eq!(extract_text(&loaded), "nested body");
        assert_eq!(loaded.metadata.unwrap()["phase"], "qa_gate_pending");
        Ok(())
    }

    #[tokio::test]
    async fn save_is_idempotent_per_message_id() -> Result<()> {
        let store = SqliteMessageStore::new(test_db());
        let mut msg = Message::user("c1", "m1", "draft");
        store.save(&msg).await?;
        msg.text = Some("edited".into());
        store.save(&msg).await?;

        let loaded = store.get("c1").await?;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].text.as_deref(), Some("edited"));
        Ok(())
    }
}
