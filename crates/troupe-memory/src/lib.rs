pub mod chunker;
pub mod conversations;
pub mod embedding;
pub mod kb;
pub mod migrations;
pub mod orchestration;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use rusqlite::Connection;

pub use conversations::{
    ConversationStore, MessageStore, SqliteConversationStore, SqliteMessageStore,
};
pub use kb::{artifact_dedupe_key, stable_artifact_id, KbError, KbStore, SaveDocumentInput, SearchHit};
pub use orchestration::OrchestrationStateStore;

/// Handle to the SQLite database backing every store. One connection,
/// shared behind a mutex; blocking sections run on the blocking pool.
pub struct Store {
    db: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn db(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.db)
    }

    pub fn kb(&self) -> KbStore {
        KbStore::new(self.db())
    }

    pub fn orchestration(&self) -> OrchestrationStateStore {
        OrchestrationStateStore::new(self.db())
    }

    pub fn conversations(&self) -> SqliteConversationStore {
        SqliteConversationStore::new(self.db())
    }

    pub fn messages(&self) -> SqliteMessageStore {
        SqliteMessageStore::new(self.db())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_runs_migrations() {
        let store = Store::open_in_memory().expect("open");
        let db = store.db();
        let conn = db.lock().expect("lock");
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
                 ('conversations', 'messages', 'kb_documents', 'kb_vectors', 'orchestration_states')",
                [],
                |r| r.get(0),
            )
            .expect("count");
        assert_eq!(tables, 5);
    }

    #[test]
    fn open_on_disk_persists(){
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("troupe.db");
        let path = path.to_str().expect("utf8 path");
        {
            let _store = Store::open(path).expect("open");
        }
        let reopened = Store::open(path).expect("reopen");
        drop(reopened);
    }
}
