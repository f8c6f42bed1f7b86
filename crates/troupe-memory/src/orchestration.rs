use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;

use troupe_schema::{OrchestrationState, OrchestrationStatus, SpecialistState};

/// Persisted orchestration progress, keyed by
/// `(conversation_id, parent_message_id)`. Paused states are additionally
/// addressable by the message id of the question awaiting a reply, which is
/// what makes branching resumes work.
#[derive(Clone)]
pub struct OrchestrationStateStore {
    db: Arc<Mutex<Connection>>,
}

impl OrchestrationStateStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// Upsert, bumping `updated_at`.
    pub async fn save(&self, state: &OrchestrationState) -> Result<OrchestrationState> {
        let db = Arc::clone(&self.db);
        let mut state = state.clone();
        state.updated_at = Utc::now();
        let row = state.clone();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let specialist_json = serde_json::to_string(&row.specialist_states)?;
            let lead_plan_json = row
                .lead_plan
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let status_json = serde_json::to_string(&row.status)?;
            let status_text = status_json.trim_matches('"').to_string();
            conn.execute(
                "INSERT INTO orchestration_states(
                    conversation_id, parent_message_id, status, paused_message_id,
                    lead_plan, specialist_states, shared_context, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(conversation_id, parent_message_id) DO UPDATE SET
                    status = excluded.status,
                    paused_message_id = excluded.paused_message_id,
                    lead_plan = excluded.lead_plan,
                    specialist_states = excluded.specialist_states,
                    shared_context = excluded.shared_context,
                    updated_at = excluded.updated_at",
                params![
                    row.conversation_id,
                    row.parent_message_id,
                    status_text,
                    row.paused_message_id,
                    lead_plan_json,
                    specialist_json,
                    row.shared_context,
                    row.created_at.to_rfc3339(),
                    row.updated_at.to_rfc3339(),
                ],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(state)
    }

    /// Most recent state for a conversation by `updated_at`. Ambiguous when
    /// several branches exist; used for diagnostics only.
    pub async fn get_latest(&self, conversation_id: &str) -> Result<Option<OrchestrationState>> {
        let db = Arc::clone(&self.db);
        let conversation = conversation_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let row = conn
                .query_row(
                    &format!("{SELECT_STATE} WHERE conversation_id = ?1 ORDER BY updated_at DESC LIMIT 1"),
                    params![conversation],
                    map_state_row,
                )
                .optional()?;
            row.map(decode_state).transpose()
        })
        .await?
    }

    /// The paused state whose question the given message replies to, if any.
    pub async fn find_paused(
        &self,
        conversation_id: &str,
        parent_message_id: &str,
    ) -> Result<Option<OrchestrationState>> {
        let db = Arc::clone(&self.db);
        let conversation = conversation_id.to_string();
        let paused_id = parent_message_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let row = conn
                .query_row(
                    &format!(
                        "{SELECT_STATE} WHERE conversation_id = ?1
                         AND status = 'PAUSED' AND paused_message_id = ?2"
                    ),
                    params![conversation, paused_id],
                    map_state_row,
                )
                .optional()?;
            row.map(decode_state).transpose()
        })
        .await?
    }

    /// Delete the state for one turn, or every state of the conversation
    /// when no parent is given. Returns the number of rows removed.
    pub async fn clear(
        &self,
        conversation_id: &str,
        parent_message_id: Option<&str>,
    ) -> Result<usize> {
        let db = Arc::clone(&self.db);
        let conversation = conversation_id.to_string();
        let parent = parent_message_id.map(str::to_string);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let removed = match parent {
                Some(parent) => conn.execute(
                    "DELETE FROM orchestration_states
                     WHERE conversation_id = ?1 AND parent_message_id = ?2",
                    params![conversation, parent],
                )?,
                None => conn.execute(
                    "DELETE FROM orchestration_states WHERE conversation_id = ?1",
                    params![conversation],
                )?,
            };
            Ok::<usize, anyhow::Error>(removed)
        })
        .await?
    }
}

const SELECT_STATE: &str = "SELECT conversation_id, parent_message_id, status, paused_message_id,
        lead_plan, specialist_states, shared_context, created_at, updated_at
 FROM orchestration_states";

type StateRow = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    String,
    String,
);

fn map_state_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StateRow> {
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
    ))
}

fn decode_state(row: StateRow) -> Result<OrchestrationState> {
    let (
        conversation_id,
        parent_message_id,
        status,
        paused_message_id,
        lead_plan,
        specialist_states,
        shared_context,
        created_at,
        updated_at,
    ) = row;

    let status: OrchestrationStatus = serde_json::from_str(&format!("\"{status}\""))
        .map_err(|e| anyhow!("invalid orchestration status {status}: {e}"))?;
    let specialist_states: Vec<SpecialistState> =
        serde_json::from_str(&specialist_states).unwrap_or_default();
    let lead_plan = lead_plan
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .unwrap_or_default();

    Ok(OrchestrationState {
        conversation_id,
        parent_message_id,
        status,
        paused_message_id,
        lead_plan,
        specialist_states,
        shared_context,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&chrono::Utc),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&chrono::Utc),
    })
}
