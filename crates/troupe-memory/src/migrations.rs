use anyhow::Result;
use rusqlite::Connection;
use std::collections::HashSet;

type Migration = (i64, &'static str);

fn migrations() -> Vec<Migration> {
    vec![
        (
            1,
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                conversation_id TEXT PRIMARY KEY,
                title TEXT,
                team_agents TEXT NOT NULL DEFAULT '[]',
                team_objective TEXT,
                team_file_id TEXT,
                host_agent_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                parent_message_id TEXT,
                is_created_by_user INTEGER NOT NULL DEFAULT 0,
                sender TEXT NOT NULL DEFAULT '',
                text TEXT,
                content TEXT,
                metadata TEXT,
                unfinished INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_convo_created
                ON messages(conversation_id, created_at);
            "#,
        ),
        (
            2,
            r#"
            CREATE TABLE IF NOT EXISTS kb_documents (
                document_id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                dedupe_key TEXT,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                message_id TEXT,
                created_by TEXT NOT NULL DEFAULT '',
                tags TEXT NOT NULL DEFAULT '[]',
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_kb_documents_convo
                ON kb_documents(conversation_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_kb_documents_dedupe
                ON kb_documents(conversation_id, dedupe_key)
                WHERE dedupe_key IS NOT NULL AND dedupe_key <> '';

            CREATE TABLE IF NOT EXISTS kb_vectors (
                document_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                vector TEXT NOT NULL DEFAULT '',
                metadata TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (document_id, chunk_index)
            );

            CREATE INDEX IF NOT EXISTS idx_kb_vectors_convo
                ON kb_vectors(conversation_id);
            "#,
        ),
        (
            3,
            r#"
            CREATE TABLE IF NOT EXISTS orchestration_states (
                conversation_id TEXT NOT NULL,
                parent_message_id TEXT NOT NULL,
                status TEXT NOT NULL,
                paused_message_id TEXT,
                lead_plan TEXT,
                specialist_states TEXT NOT NULL DEFAULT '[]',
                shared_context TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (conversation_id, parent_message_id)
            );

            CREATE INDEX IF NOT EXISTS idx_orchestration_paused
                ON orchestration_states(conversation_id, paused_message_id);
            "#,
        ),
    ]
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS __schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        "#,
    )?;

    let mut stmt = conn.prepare("SELECT version FROM __schema_version")?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    let mut applied = HashSet::new();
    for row in rows {
        applied.insert(row?);
    }

    for (version, sql) in migrations() {
        if applied.contains(&version) {
            continue;
        }

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO __schema_version(version, applied_at) VALUES (?1, datetime('now'))",
            [version],
        )?;
        tx.commit()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_cleanly() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='kb_documents'",
            [],
            |r| r.get(0),
        )?;
        assert_eq!(count, 1);
        Ok(())
    }

    #[test]
    fn migrations_are_idempotent() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        run_migrations(&conn)?;
        let applied: i64 =
            conn.query_row("SELECT COUNT(*) FROM __schema_version", [], |r| r.get(0))?;
        assert_eq!(applied, migrations().len() as i64);
        Ok(())
    }

    #[test]
    fn dedupe_index_rejects_duplicates() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        conn.execute(
            "INSERT INTO kb_documents(document_id, conversation_id, dedupe_key, title, content, created_at, updated_at)
             VALUES ('d1', 'c1', 'c1:artifact', 't', 'x', '2026-01-01', '2026-01-01')",
            [],
        )?;
        let dup = conn.execute(
            "INSERT INTO kb_documents(document_id, conversation_id, dedupe_key, title, content, created_at, updated_at)
             VALUES ('d2', 'c1', 'c1:artifact', 't', 'x', '2026-01-01', '2026-01-01')",
            [],
        );
        assert!(dup.is_err());
        Ok(())
    }

    #[test]
    fn empty_dedupe_keys_do_not_collide() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        for id in ["d1", "d2"] {
            conn.execute(
                "INSERT INTO kb_documents(document_id, conversation_id, dedupe_key, title, content, created_at, updated_at)
                 VALUES (?1, 'c1', '', 't', 'x', '2026-01-01', '2026-01-01')",
                [id],
            )?;
        }
        Ok(())
    }
}
