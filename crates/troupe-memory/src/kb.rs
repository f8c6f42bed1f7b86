use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;
use uuid::Uuid;

use troupe_schema::{KnowledgeDocument, KnowledgeVector};

use crate::chunker::{chunk_text, ChunkerConfig};
use crate::embedding::EmbeddingProvider;

/// Typed failure kinds for KB operations. Carried as the source inside the
/// anyhow chain so callers can downcast.
#[derive(Debug, thiserror::Error)]
pub enum KbError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("document not found: {0}")]
    NotFound(String),
}

/// Input to a KB save. `document_id` and `dedupe_key` select the upsert
/// filter; `only_update` refuses to insert a new document.
#[derive(Debug, Clone, Default)]
pub struct SaveDocumentInput {
    pub document_id: Option<String>,
    pub dedupe_key: Option<String>,
    pub title: String,
    pub content: String,
    pub message_id: Option<String>,
    pub created_by: String,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub only_update: bool,
}

/// One search hit: a chunk with its parent document and similarity score.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub document_id: String,
    pub title: String,
    pub text: String,
    pub score: f64,
    pub start_line: Option<i64>,
    pub end_line: Option<i64>,
}

/// Knowledge base over chunked, embedded documents, scoped per conversation.
#[derive(Clone)]
pub struct KbStore {
    db: Arc<Mutex<Connection>>,
    chunker: Arc<ChunkerConfig>,
}

impl KbStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self {
            db,
            chunker: Arc::new(ChunkerConfig::default()),
        }
    }

    pub fn with_chunker(db: Arc<Mutex<Connection>>, chunker: ChunkerConfig) -> Self {
        Self {
            db,
            chunker: Arc::new(chunker),
        }
    }

    /// Upsert a document, then synchronously re-embed its chunk set.
    ///
    /// The upsert filter is `(conversation_id, dedupe_key)` when the dedupe
    /// key is non-empty, otherwise `document_id`. Inserts generate
    /// `kb_<conversation>_<uuid>` when no id is given.
    pub async fn save(
        &self,
        conversation_id: &str,
        input: SaveDocumentInput,
        provider: &dyn EmbeddingProvider,
    ) -> Result<KnowledgeDocument> {
        if input.title.trim().is_empty() {
            return Err(KbError::InvalidInput("title must not be empty".into()).into());
        }
        if input.content.trim().is_empty() {
            return Err(KbError::InvalidInput("content must not be empty".into()).into());
        }

        let db = Arc::clone(&self.db);
        let conversation = conversation_id.to_string();
        let now = Utc::now();
        let document = task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;

            let dedupe_key = input
                .dedupe_key
                .as_deref()
                .filter(|k| !k.is_empty())
                .map(str::to_string);

            let existing_id: Option<String> = match &dedupe_key {
                Some(key) => conn
                    .query_row(
                        "SELECT document_id FROM kb_documents
                         WHERE conversation_id = ?1 AND dedupe_key = ?2",
                        params![conversation, key],
                        |r| r.get(0),
                    )
                    .optional()?,
                None => match &input.document_id {
                    Some(id) => conn
                        .query_row(
                            "SELECT document_id FROM kb_documents WHERE document_id = ?1",
                            params![id],
                            |r| r.get(0),
                        )
                        .optional()?,
                    None => None,
                },
            };

            let tags_json = serde_json::to_string(&input.tags)?;
            let metadata_json = serde_json::to_string(&input.metadata)?;

            let document_id = match existing_id {
                Some(id) => {
                    conn.execute(
                        "UPDATE kb_documents SET
                            title = ?1, content = ?2, message_id = ?3, created_by = ?4,
                            tags = ?5, metadata = ?6, dedupe_key = ?7, updated_at = ?8
                         WHERE document_id = ?9",
                        params![
                            input.title,
                            input.content,
                            input.message_id,
                            input.created_by,
                            tags_json,
                            metadata_json,
                            dedupe_key,
                            now.to_rfc3339(),
                            id
                        ],
                    )?;
                    id
                }
                None => {
                    if input.only_update {
                        return Err(KbError::NotFound(format!(
                            "no document matches {:?}/{:?} for update",
                            input.document_id, dedupe_key
                        ))
                        .into());
                    }
                    let id = input
                        .document_id
                        .clone()
                        .unwrap_or_else(|| format!("kb_{}_{}", conversation, Uuid::new_v4()));
                    conn.execute(
                        "INSERT INTO kb_documents(
                            document_id, conversation_id, dedupe_key, title, content,
                            message_id, created_by, tags, metadata, created_at, updated_at
                         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                        params![
                            id,
                            conversation,
                            dedupe_key,
                            input.title,
                            input.content,
                            input.message_id,
                            input.created_by,
                            tags_json,
                            metadata_json,
                            now.to_rfc3339(),
                            now.to_rfc3339()
                        ],
                    )?;
                    id
                }
            };

            read_document(&conn, &document_id)?
                .ok_or_else(|| anyhow!("document vanished during save: {document_id}"))
        })
        .await??;

        self.reembed(&document, provider).await?;

        self.get_one(&document.document_id)
            .await?
            .ok_or_else(|| anyhow!("document vanished after embed: {}", document.document_id))
    }

    /// Re-chunk and re-embed a document, atomically replacing its vector set.
    async fn reembed(
        &self,
        document: &KnowledgeDocument,
        provider: &dyn EmbeddingProvider,
    ) -> Result<()> {
        let chunks = chunk_text(&document.content, &self.chunker);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embedded = provider.embed(&texts).await?;
        if embedded.embeddings.len() != chunks.len() {
            return Err(anyhow!(
                "embedding count mismatch: expected {}, got {}",
                chunks.len(),
                embedded.embeddings.len()
            ));
        }

        let db = Arc::clone(&self.db);
        let document_id = document.document_id.clone();
        let conversation_id = document.conversation_id.clone();
        let rows: Vec<(usize, String, String, String)> = chunks
            .iter()
            .zip(embedded.embeddings.iter())
            .enumerate()
            .map(|(index, (chunk, vector))| {
                let metadata = serde_json::json!({
                    "start_line": chunk.start_line,
                    "end_line": chunk.end_line,
                    "hash": chunk.hash,
                });
                (
                    index,
                    chunk.text.clone(),
                    serde_json::to_string(vector).unwrap_or_else(|_| "[]".into()),
                    metadata.to_string(),
                )
            })
            .collect();

        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "DELETE FROM kb_vectors WHERE document_id = ?1",
                params![document_id],
            )?;
            for (index, text, vector, metadata) in rows {
                tx.execute(
                    "INSERT INTO kb_vectors(
                        document_id, conversation_id, chunk_index, text, vector, metadata
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        document_id,
                        conversation_id,
                        index as i64,
                        text,
                        vector,
                        metadata
                    ],
                )?;
            }
            tx.commit()?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;

        Ok(())
    }

    /// The stored vector set of one document, in chunk order.
    pub async fn vectors(&self, document_id: &str) -> Result<Vec<KnowledgeVector>> {
        let db = Arc::clone(&self.db);
        let id = document_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(
                "SELECT document_id, conversation_id, chunk_index, text, vector, metadata
                 FROM kb_vectors WHERE document_id = ?1 ORDER BY chunk_index",
            )?;
            let rows = stmt.query_map(params![id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (document_id, conversation_id, chunk_index, text, vector_json, metadata_json) =
                    row?;
                out.push(KnowledgeVector {
                    document_id,
                    conversation_id,
                    chunk_index: chunk_index as usize,
                    text,
                    vector: serde_json::from_str(&vector_json).unwrap_or_default(),
                    metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
                });
            }
            Ok::<Vec<KnowledgeVector>, anyhow::Error>(out)
        })
        .await?
    }

    pub async fn get(&self, conversation_id: &str) -> Result<Vec<KnowledgeDocument>> {
        let db = Arc::clone(&self.db);
        let conversation = conversation_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(
                "SELECT document_id FROM kb_documents
                 WHERE conversation_id = ?1 ORDER BY created_at, document_id",
            )?;
            let ids = stmt
                .query_map(params![conversation], |r| r.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let mut documents = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(doc) = read_document(&conn, &id)? {
                    documents.push(doc);
                }
            }
            Ok::<Vec<KnowledgeDocument>, anyhow::Error>(documents)
        })
        .await?
    }

    pub async fn get_one(&self, document_id: &str) -> Result<Option<KnowledgeDocument>> {
        let db = Arc::clone(&self.db);
        let id = document_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            read_document(&conn, &id)
        })
        .await?
    }

    /// Delete a document and its vector set. Returns whether it existed.
    pub async fn delete(&self, document_id: &str) -> Result<bool> {
        let db = Arc::clone(&self.db);
        let id = document_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let tx = conn.unchecked_transaction()?;
            tx.execute("DELETE FROM kb_vectors WHERE document_id = ?1", params![id])?;
            let removed = tx.execute("DELETE FROM kb_documents WHERE document_id = ?1", params![id])?;
            tx.commit()?;
            Ok::<bool, anyhow::Error>(removed > 0)
        })
        .await?
    }

    pub async fn clear(&self, conversation_id: &str) -> Result<usize> {
        let db = Arc::clone(&self.db);
        let conversation = conversation_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "DELETE FROM kb_vectors WHERE conversation_id = ?1",
                params![conversation],
            )?;
            let removed = tx.execute(
                "DELETE FROM kb_documents WHERE conversation_id = ?1",
                params![conversation],
            )?;
            tx.commit()?;
            Ok::<usize, anyhow::Error>(removed)
        })
        .await?
    }

    /// Join the whole corpus into a single prompt block. Used for context
    /// injection when no retrieval is needed.
    pub async fn format_context(
        &self,
        conversation_id: &str,
        query: Option<&str>,
    ) -> Result<String> {
        let documents = self.get(conversation_id).await?;
        if documents.is_empty() {
            return Ok(String::new());
        }

        let mut out = String::from("## Knowledge Base\n");
        if let Some(query) = query.map(str::trim).filter(|q| !q.is_empty()) {
            out.push_str(&format!("Relevant to: {query}\n"));
        }
        for doc in &documents {
            out.push_str(&format!(
                "\n### {} (ID: {})\n{}\n",
                doc.title, doc.document_id, doc.content
            ));
        }
        Ok(out)
    }

    /// Top-k chunks by cosine similarity, descending. `k` is clamped to
    /// `[1, 10]`. Chunks without a stored vector are skipped.
    pub async fn search(
        &self,
        conversation_id: &str,
        query: &str,
        k: usize,
        provider: &dyn EmbeddingProvider,
    ) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let k = k.clamp(1, 10);

        let embedded = provider.embed(&[query.to_string()]).await?;
        let query_vector = embedded
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("embedding provider returned empty query embedding"))?;

        let db = Arc::clone(&self.db);
        let conversation = conversation_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(
                "SELECT v.document_id, d.title, v.text, v.vector, v.metadata
                 FROM kb_vectors v
                 JOIN kb_documents d ON d.document_id = v.document_id
                 WHERE v.conversation_id = ?1",
            )?;
            let rows = stmt.query_map(params![conversation], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                ))
            })?;

            let mut hits = Vec::new();
            for row in rows {
                let (document_id, title, text, vector_json, metadata_json) = row?;
                if vector_json.trim().is_empty() {
                    continue;
                }
                let Ok(vector) = serde_json::from_str::<Vec<f32>>(&vector_json) else {
                    continue;
                };
                if vector.is_empty() {
                    continue;
                }
                let score = cosine_similarity(&query_vector, &vector) as f64;
                let metadata: serde_json::Value =
                    serde_json::from_str(&metadata_json).unwrap_or_default();
                hits.push(SearchHit {
                    document_id,
                    title,
                    text,
                    score,
                    start_line: metadata.get("start_line").and_then(|v| v.as_i64()),
                    end_line: metadata.get("end_line").and_then(|v| v.as_i64()),
                });
            }

            hits.sort_by(|a, b| b.score.total_cmp(&a.score));
            hits.truncate(k);
            Ok::<Vec<SearchHit>, anyhow::Error>(hits)
        })
        .await?
    }
}

fn read_document(conn: &Connection, document_id: &str) -> Result<Option<KnowledgeDocument>> {
    let row = conn
        .query_row(
            "SELECT document_id, conversation_id, dedupe_key, title, content,
                    message_id, created_by, tags, metadata, created_at, updated_at
             FROM kb_documents WHERE document_id = ?1",
            params![document_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, Option<String>>(5)?,
                    r.get::<_, String>(6)?,
                    r.get::<_, String>(7)?,
                    r.get::<_, String>(8)?,
                    r.get::<_, String>(9)?,
                    r.get::<_, String>(10)?,
                ))
            },
        )
        .optional()?;

    let Some((
        document_id,
        conversation_id,
        dedupe_key,
        title,
        content,
        message_id,
        created_by,
        tags_json,
        metadata_json,
        created_at,
        updated_at,
    )) = row
    else {
        return Ok(None);
    };

    Ok(Some(KnowledgeDocument {
        document_id,
        conversation_id,
        dedupe_key,
        title,
        content,
        message_id,
        created_by,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    }))
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .map_err(|e| anyhow!("invalid timestamp {raw}: {e}"))?
        .with_timezone(&Utc))
}

/// Cosine similarity; 0 when either vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Stable identifier for an artifact: explicit identifier, else normalized
/// title (lowercase, spaces to `_`, `[a-z0-9_-]` only, max 64 chars), else
/// a fixed fallback.
pub fn stable_artifact_id(identifier: Option<&str>, title: Option<&str>) -> String {
    if let Some(id) = identifier.map(str::trim).filter(|s| !s.is_empty()) {
        return id.to_string();
    }

    if let Some(title) = title {
        let normalized: String = title
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == ' ' { '_' } else { c })
            .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
            .take(64)
            .collect();
        if !normalized.is_empty() {
            return normalized;
        }
    }

    "default-artifact".to_string()
}

/// Dedupe key used to upsert KB documents referencing the same artifact
/// across versions.
pub fn artifact_dedupe_key(
    conversation_id: &str,
    identifier: Option<&str>,
    title: Option<&str>,
) -> String {
    format!(
        "{}:{}",
        conversation_id,
        stable_artifact_id(identifier, title)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::StubEmbeddingProvider;
    use crate::migrations::run_migrations;

    fn test_db() -> Arc<Mutex<Connection>> {
        let conn = Connection::open_in_memory().expect("open sqlite");
        run_migrations(&conn).expect("migrations");
        Arc::new(Mutex::new(conn))
    }

    fn doc_input(title: &str, content: &str) -> SaveDocumentInput {
        SaveDocumentInput {
            title: title.into(),
            content: content.into(),
            created_by: "test".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn save_generates_id_and_vectors() -> Result<()> {
        let db = test_db();
        let store = KbStore::new(Arc::clone(&db));
        let provider = StubEmbeddingProvider::new(8);

        let doc = store
            .save("c1", doc_input("Notes", "The cat sat on the mat"), &provider)
            .await?;

        assert!(doc.document_id.starts_with("kb_c1_"));
        let conn = db.lock().expect("lock");
        let vectors: i64 = conn.query_row(
            "SELECT COUNT(*) FROM kb_vectors WHERE document_id = ?1",
            params![doc.document_id],
            |r| r.get(0),
        )?;
        assert!(vectors >= 1);
        Ok(())
    }

    #[tokio::test]
    async fn save_empty_title_rejected() {
        let store = KbStore::new(test_db());
        let provider = StubEmbeddingProvider::new(8);
        let err = store
            .save("c1", doc_input("  ", "content"), &provider)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<KbError>().is_some());
    }

    #[tokio::test]
    async fn save_empty_content_rejected() {
        let store = KbStore::new(test_db());
        let provider = StubEmbeddingProvider::new(8);
        let err = store
            .save("c1", doc_input("title", ""), &provider)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KbError>(),
            Some(KbError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn dedupe_key_upserts_same_document() -> Result<()> {
        let store = KbStore::new(test_db());
        let provider = StubEmbeddingProvider::new(8);

        let mut input = doc_input("Plan", "version one");
        input.dedupe_key = Some("c1:plan".into());
        let first = store.save("c1", input, &provider).await?;

        let mut input = doc_input("Plan", "version two, longer");
        input.dedupe_key = Some("c1:plan".into());
        let second = store.save("c1", input, &provider).await?;

        assert_eq!(first.document_id, second.document_id);
        assert_eq!(second.content, "version two, longer");
        assert_eq!(store.get("c1").await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn save_updated_at_monotonic() -> Result<()> {
        let store = KbStore::new(test_db());
        let provider = StubEmbeddingProvider::new(8);

        let mut input = doc_input("Doc", "first");
        input.dedupe_key = Some("c1:doc".into());
        let first = store.save("c1", input, &provider).await?;

        let mut input = doc_input("Doc", "second");
        input.dedupe_key = Some("c1:doc".into());
        let second = store.save("c1", input, &provider).await?;

        assert!(second.updated_at >= first.updated_at);
        assert_eq!(first.created_at, second.created_at);
        Ok(())
    }

    #[tokio::test]
    async fn only_update_missing_fails() {
        let store = KbStore::new(test_db());
        let provider = StubEmbeddingProvider::new(8);
        let mut input = doc_input("Doc", "content");
        input.only_update = true;
        input.document_id = Some("kb_missing".into());
        let err = store.save("c1", input, &provider).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KbError>(),
            Some(KbError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn vectors_replaced_on_update() -> Result<()> {
        let db = test_db();
        let store = KbStore::new(Arc::clone(&db));
        let provider = StubEmbeddingProvider::new(8);

        let mut input = doc_input("Doc", "short");
        input.document_id = Some("kb_fixed".into());
        store.save("c1", input, &provider).await?;

        let mut input = doc_input("Doc", "a different body entirely");
        input.document_id = Some("kb_fixed".into());
        store.save("c1", input, &provider).await?;

        let conn = db.lock().expect("lock");
        let stale: i64 = conn.query_row(
            "SELECT COUNT(*) FROM kb_vectors WHERE document_id = 'kb_fixed' AND text = 'short'",
            [],
            |r| r.get(0),
        )?;
        assert_eq!(stale, 0);
        let fresh: i64 = conn.query_row(
            "SELECT COUNT(*) FROM kb_vectors WHERE document_id = 'kb_fixed'",
            [],
            |r| r.get(0),
        )?;
        assert!(fresh >= 1);
        Ok(())
    }

    #[tokio::test]
    async fn vectors_accessor_returns_chunks_in_order() -> Result<()> {
        let store = KbStore::new(test_db());
        let provider = StubEmbeddingProvider::new(8);
        let body = "first paragraph of the document\n\n".repeat(40);
        let doc = store.save("c1", doc_input("Big Doc", &body), &provider).await?;

        let vectors = store.vectors(&doc.document_id).await?;
        assert!(vectors.len() >= 2);
        for (index, vector) in vectors.iter().enumerate() {
            assert_eq!(vector.chunk_index, index);
            assert_eq!(vector.vector.len(), 8);
            assert_eq!(vector.conversation_id, "c1");
        }
        Ok(())
    }

    #[tokio::test]
    async fn delete_removes_document_and_vectors() -> Result<()> {
        let db = test_db();
        let store = KbStore::new(Arc::clone(&db));
        let provider = StubEmbeddingProvider::new(8);

        let doc = store.save("c1", doc_input("Doc", "body"), &provider).await?;
        assert!(store.delete(&doc.document_id).await?);
        assert!(store.get_one(&doc.document_id).await?.is_none());

        let conn = db.lock().expect("lock");
        let vectors: i64 = conn.query_row(
            "SELECT COUNT(*) FROM kb_vectors WHERE document_id = ?1",
            params![doc.document_id],
            |r| r.get(0),
        )?;
        assert_eq!(vectors, 0);
        Ok(())
    }

    #[tokio::test]
    async fn delete_missing_returns_false() -> Result<()> {
        let store = KbStore::new(test_db());
        assert!(!store.delete("kb_nope").await?);
        Ok(())
    }

    #[tokio::test]
    async fn clear_scopes_to_conversation() -> Result<()> {
        let store = KbStore::new(test_db());
        let provider = StubEmbeddingProvider::new(8);

        store.save("c1", doc_input("A", "alpha"), &provider).await?;
        store.save("c2", doc_input("B", "beta"), &provider).await?;

        store.clear("c1").await?;
        assert!(store.get("c1").await?.is_empty());
        assert_eq!(store.get("c2").await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn search_empty_kb_returns_empty() -> Result<()> {
        let store = KbStore::new(test_db());
        let provider = StubEmbeddingProvider::new(8);
        let hits = store.search("c1", "anything", 5, &provider).await?;
        assert!(hits.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn search_clamps_k() -> Result<()> {
        let store = KbStore::new(test_db());
        let provider = StubEmbeddingProvider::new(8);
        for i in 0..3 {
            store
                .save("c1", doc_input(&format!("Doc {i}"), &format!("body {i}")), &provider)
                .await?;
        }

        let hits = store.search("c1", "body", 50, &provider).await?;
        assert!(hits.len() <= 10);
        let hits = store.search("c1", "body", 0, &provider).await?;
        assert_eq!(hits.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn search_skips_rows_without_vectors() -> Result<()> {
        let db = test_db();
        let store = KbStore::new(Arc::clone(&db));
        let provider = StubEmbeddingProvider::new(8);

        store.save("c1", doc_input("Doc", "real body"), &provider).await?;
        {
            let conn = db.lock().expect("lock");
            conn.execute(
                "INSERT INTO kb_vectors(document_id, conversation_id, chunk_index, text, vector, metadata)
                 VALUES ('kb_broken', 'c1', 0, 'no vector here', '', '{}')",
                [],
            )?;
            conn.execute(
                "INSERT INTO kb_documents(document_id, conversation_id, title, content, created_by, created_at, updated_at)
                 VALUES ('kb_broken', 'c1', 'Broken', 'x', 't', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                [],
            )?;
        }

        let hits = store.search("c1", "body", 5, &provider).await?;
        assert!(hits.iter().all(|h| h.document_id != "kb_broken"));
        Ok(())
    }

    #[tokio::test]
    async fn format_context_joins_documents() -> Result<()> {
        let store = KbStore::new(test_db());
        let provider = StubEmbeddingProvider::new(8);
        store.save("c1", doc_input("Alpha", "first body"), &provider).await?;
        store.save("c1", doc_input("Beta", "second body"), &provider).await?;

        let context = store.format_context("c1", None).await?;
        assert!(context.contains("### Alpha"));
        assert!(context.contains("second body"));

        let empty = store.format_context("c9", None).await?;
        assert!(empty.is_empty());
        Ok(())
    }

    #[test]
    fn cosine_similarity_identical() {
        let a = vec![1.0_f32, 2.0, 3.0];
        let score = cosine_similarity(&a, &a);
        assert!((score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_orthogonal() {
        let a = vec![1.0_f32, 0.0];
        let b = vec![0.0_f32, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_zero_magnitude() {
        let a = vec![0.0_f32, 0.0];
        let b = vec![1.0_f32, 1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn stable_id_prefers_identifier() {
        assert_eq!(
            stable_artifact_id(Some("  report-v2  "), Some("Quarterly Report")),
            "report-v2"
        );
    }

    #[test]
    fn stable_id_normalizes_title() {
        assert_eq!(
            stable_artifact_id(None, Some("Quarterly Report (Q3)!")),
            "quarterly_report_q3"
        );
    }

    #[test]
    fn stable_id_caps_length() {
        let title = "x".repeat(200);
        assert_eq!(stable_artifact_id(None, Some(&title)).len(), 64);
    }

    #[test]
    fn stable_id_falls_back() {
        assert_eq!(stable_artifact_id(None, Some("!!!")), "default-artifact");
        assert_eq!(stable_artifact_id(None, None), "default-artifact");
    }

    #[test]
    fn dedupe_key_format() {
        assert_eq!(
            artifact_dedupe_key("c1", None, Some("My Doc")),
            "c1:my_doc"
        );
    }
}
