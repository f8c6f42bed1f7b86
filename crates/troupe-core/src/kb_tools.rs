//! Knowledge-base tool suite bound to one conversation.
//!
//! Three tools the agent loop can expose: `list_documents`,
//! `search_documents` and `read_knowledge_document`. Every tool returns a
//! plain string suitable for a `tool_result` block, including its error
//! cases.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use troupe_memory::embedding::EmbeddingProvider;
use troupe_memory::KbStore;
use troupe_provider::ToolDef;

use crate::tool::{ToolExecutor, ToolRegistry};

pub struct KbToolSuite {
    conversation_id: String,
    kb: KbStore,
    embedder: Arc<dyn EmbeddingProvider>,
    default_k: usize,
    max_k: usize,
}

impl KbToolSuite {
    pub fn new(
        conversation_id: impl Into<String>,
        kb: KbStore,
        embedder: Arc<dyn EmbeddingProvider>,
        default_k: usize,
        max_k: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            conversation_id: conversation_id.into(),
            kb,
            embedder,
            default_k,
            max_k,
        })
    }

    /// A registry containing the three KB tools.
    pub fn registry(self: &Arc<Self>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ListDocumentsTool(Arc::clone(self))));
        registry.register(Arc::new(SearchDocumentsTool(Arc::clone(self))));
        registry.register(Arc::new(ReadDocumentTool(Arc::clone(self))));
        registry
    }

    /// Dispatch by tool name. Unknown names come back as an error string
    /// rather than a hard failure.
    pub async fn dispatch(self: &Arc<Self>, name: &str, input: serde_json::Value) -> String {
        let result = match name {
            "list_documents" => self.list_documents().await,
            "search_documents" => self.search_documents(input).await,
            "read_knowledge_document" => self.read_document(input).await,
            other => return format!("Error: Unknown KB tool: {other}"),
        };
        result.unwrap_or_else(|err| format!("Error executing {name}: {err}"))
    }

    async fn list_documents(&self) -> Result<String> {
        let documents = self.kb.get(&self.conversation_id).await?;
        if documents.is_empty() {
            return Ok("No documents in the knowledge base yet.".to_string());
        }

        let lines: Vec<String> = documents
            .iter()
            .map(|doc| format!("- {} (ID: {})", doc.title, doc.document_id))
            .collect();
        Ok(lines.join("\n"))
    }

    async fn search_documents(&self, input: serde_json::Value) -> Result<String> {
        let Some(query) = input
            .get("query")
            .and_then(|q| q.as_str())
            .map(str::trim)
            .filter(|q| !q.is_empty())
        else {
            return Ok("Error: search_documents requires a 'query' string.".to_string());
        };

        let k = input
            .get("k")
            .and_then(|k| k.as_u64())
            .map(|k| k as usize)
            .unwrap_or(self.default_k)
            .clamp(1, self.max_k);

        let hits = self
            .kb
            .search(&self.conversation_id, query, k, self.embedder.as_ref())
            .await?;

        if hits.is_empty() {
            return Ok("No matching documents found.".to_string());
        }

        let mut out = String::new();
        for hit in hits {
            let range = match (hit.start_line, hit.end_line) {
                (Some(start), Some(end)) => format!(", lines {start}-{end}"),
                _ => String::new(),
            };
            out.push_str(&format!(
                "### {} (ID: {}{range}, score {:.3})\n{}\n\n",
                hit.title, hit.document_id, hit.score, hit.text
            ));
        }
        Ok(out.trim_end().to_string())
    }

    async fn read_document(&self, input: serde_json::Value) -> Result<String> {
        let Some(document_id) = input.get("document_id").and_then(|d| d.as_str()) else {
            return Ok("Error: read_knowledge_document requires a 'document_id'.".to_string());
        };

        let Some(document) = self.kb.get_one(document_id).await? else {
            return Ok(format!("Error: Document not found: {document_id}"));
        };

        if document.content.is_empty() {
            return Ok(format!("Error: Document {document_id} has no content."));
        }

        let lines: Vec<&str> = document.content.lines().collect();
        let total = lines.len();

        let start = input
            .get("start_line")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(1)
            .max(1);
        let end = input
            .get("end_line")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(total)
            .min(total);

        if start > total {
            return Ok(format!(
                "Error: start_line {start} exceeds document length ({total} lines)."
            ));
        }
        if end < start {
            return Ok(format!(
                "Error: end_line {end} is before start_line {start}."
            ));
        }

        // start and end are inclusive, 1-based
        let body = lines[start - 1..end].join("\n");
        Ok(format!(
            "# {} (ID: {}, lines {start}-{end} of {total})\n{body}",
            document.title, document.document_id
        ))
    }
}

struct ListDocumentsTool(Arc<KbToolSuite>);

#[async_trait]
impl ToolExecutor for ListDocumentsTool {
    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "list_documents".into(),
            description: "List every document in this conversation's knowledge base with its ID."
                .into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        }
    }

    async fn execute(&self, _input: serde_json::Value) -> Result<String> {
        self.0.list_documents().await
    }
}

struct SearchDocumentsTool(Arc<KbToolSuite>);

#[async_trait]
impl ToolExecutor for SearchDocumentsTool {
    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "search_documents".into(),
            description:
                "Semantic search over the knowledge base. Returns the top matching chunks."
                    .into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "What to search for"},
                    "k": {"type": "integer", "description": "Number of chunks to return (1-10)"}
                },
                "required": ["query"]
            }),
        }
    }

    async fn execute(&self, input: serde_json::Value) -> Result<String> {
        self.0.search_documents(input).await
    }
}

struct ReadDocumentTool(Arc<KbToolSuite>);

#[async_trait]
impl ToolExecutor for ReadDocumentTool {
    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "read_knowledge_document".into(),
            description:
                "Read a knowledge document in full or by inclusive 1-based line range.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "document_id": {"type": "string"},
                    "start_line": {"type": "integer", "description": "1-based inclusive"},
                    "end_line": {"type": "integer", "description": "1-based inclusive"}
                },
                "required": ["document_id"]
            }),
        }
    }

    async fn execute(&self, input: serde_json::Value) -> Result<String> {
        self.0.read_document(input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use rusqlite::Connection;
    use troupe_memory::embedding::StubEmbeddingProvider;
    use troupe_memory::migrations::run_migrations;
    use troupe_memory::SaveDocumentInput;

    fn suite() -> Arc<KbToolSuite> {
        let conn = Connection::open_in_memory().expect("open sqlite");
        run_migrations(&conn).expect("migrations");
        let kb = KbStore::new(Arc::new(Mutex::new(conn)));
        KbToolSuite::new("c1", kb, Arc::new(StubEmbeddingProvider::new(8)), 5, 10)
    }

    async fn seed(suite: &Arc<KbToolSuite>, title: &str, content: &str) -> String {
        let provider = StubEmbeddingProvider::new(8);
        let doc = suite
            .kb
            .save(
                "c1",
                SaveDocumentInput {
                    title: title.into(),
                    content: content.into(),
                    created_by: "test".into(),
                    ..Default::default()
                },
                &provider,
            )
            .await
            .expect("seed doc");
        doc.document_id
    }

    #[tokio::test]
    async fn list_documents_empty() {
        let suite = suite();
        let out = suite.dispatch("list_documents", serde_json::json!({})).await;
        assert!(out.starts_with("No documents"));
    }

    #[tokio::test]
    async fn list_documents_bullets() {
        let suite = suite();
        let id = seed(&suite, "Launch Plan", "plan body").await;
        let out = suite.dispatch("list_documents", serde_json::json!({})).await;
        assert!(out.contains(&format!("- Launch Plan (ID: {id})")));
    }

    #[tokio::test]
    async fn search_documents_requires_query() {
        let suite = suite();
        let out = suite
            .dispatch("search_documents", serde_json::json!({"k": 3}))
            .await;
        assert!(out.contains("requires a 'query'"));

        let out = suite
            .dispatch("search_documents", serde_json::json!({"query": "   "}))
            .await;
        assert!(out.contains("requires a 'query'"));
    }

    #[tokio::test]
    async fn search_documents_formats_hits() {
        let suite = suite();
        seed(&suite, "Notes", "searchable body text").await;
        let out = suite
            .dispatch(
                "search_documents",
                serde_json::json!({"query": "searchable body text"}),
            )
            .await;
        assert!(out.contains("### Notes"));
        assert!(out.contains("score"));
    }

    #[tokio::test]
    async fn read_document_not_found() {
        let suite = suite();
        let out = suite
            .dispatch(
                "read_knowledge_document",
                serde_json::json!({"document_id": "kb_missing"}),
            )
            .await;
        assert_eq!(out, "Error: Document not found: kb_missing");
    }

    #[tokio::test]
    async fn read_document_full() {
        let suite = suite();
        let id = seed(&suite, "Doc", "line one\nline two\nline three").await;
        let out = suite
            .dispatch(
                "read_knowledge_document",
                serde_json::json!({"document_id": id}),
            )
            .await;
        assert!(out.contains("lines 1-3 of 3"));
        assert!(out.contains("line two"));
    }

    #[tokio::test]
    async fn read_document_line_range() {
        let suite = suite();
        let id = seed(&suite, "Doc", "alpha\nbeta\ngamma\ndelta").await;
        let out = suite
            .dispatch(
                "read_knowledge_document",
                serde_json::json!({"document_id": id, "start_line": 2, "end_line": 3}),
            )
            .await;
        assert!(out.contains("beta\ngamma"));
        assert!(!out.contains("alpha"));
        assert!(!out.contains("delta"));
    }

    #[tokio::test]
    async fn read_document_start_past_end() {
        let suite = suite();
        let id = seed(&suite, "Doc", "only\ntwo").await;
        let out = suite
            .dispatch(
                "read_knowledge_document",
                serde_json::json!({"document_id": id, "start_line": 9}),
            )
            .await;
        assert_eq!(
            out,
            "Error: start_line 9 exceeds document length (2 lines)."
        );
    }

    #[tokio::test]
    async fn read_document_end_clamped() {
        let suite = suite();
        let id = seed(&suite, "Doc", "one\ntwo").await;
        let out = suite
            .dispatch(
                "read_knowledge_document",
                serde_json::json!({"document_id": id, "start_line": 1, "end_line": 50}),
            )
            .await;
        assert!(out.contains("lines 1-2 of 2"));
    }

    #[tokio::test]
    async fn unknown_tool_error_string() {
        let suite = suite();
        let out = suite.dispatch("write_documents", serde_json::json!({})).await;
        assert_eq!(out, "Error: Unknown KB tool: write_documents");
    }

    #[tokio::test]
    async fn registry_exposes_three_tools() {
        let suite = suite();
        let registry = suite.registry();
        assert_eq!(registry.len(), 3);
        assert!(registry.contains("list_documents"));
        assert!(registry.contains("search_documents"));
        assert!(registry.contains("read_knowledge_document"));
    }
}
