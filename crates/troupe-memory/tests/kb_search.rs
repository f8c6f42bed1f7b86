//! Semantic retrieval behavior of the KB store, exercised with a
//! deterministic term-vector embedding provider so similarity is
//! meaningful without a live embedding endpoint.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use rusqlite::Connection;

use troupe_memory::embedding::{EmbeddingProvider, EmbeddingResult};
use troupe_memory::migrations::run_migrations;
use troupe_memory::{KbStore, SaveDocumentInput};

/// Projects text onto a tiny fixed lexicon; synonyms share an axis. Enough
/// structure for cosine similarity to rank related text above unrelated.
struct TermVectorProvider;

const LEXICON: &[&[&str]] = &[
    &["cat", "feline", "kitten"],
    &["mat", "rug"],
    &["quantum", "chromodynamics", "physics"],
    &["market", "launch", "plan"],
];

#[async_trait]
impl EmbeddingProvider for TermVectorProvider {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingResult> {
        let embeddings = texts
            .iter()
            .map(|text| {
                let lowered = text.to_lowercase();
                LEXICON
                    .iter()
                    .map(|axis| {
                        axis.iter()
                            .map(|term| lowered.matches(term).count() as f32)
                            .sum()
                    })
                    .collect::<Vec<f32>>()
            })
            .collect();
        Ok(EmbeddingResult {
            embeddings,
            model: "term-vector".into(),
            dimensions: LEXICON.len(),
        })
    }

    fn model_id(&self) -> &str {
        "term-vector"
    }

    fn dimensions(&self) -> usize {
        LEXICON.len()
    }
}

fn test_store() -> KbStore {
    let conn = Connection::open_in_memory().expect("open sqlite");
    run_migrations(&conn).expect("migrations");
    KbStore::new(Arc::new(Mutex::new(conn)))
}

fn doc(title: &str, content: &str) -> SaveDocumentInput {
    SaveDocumentInput {
        title: title.into(),
        content: content.into(),
        created_by: "test".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn related_document_outranks_unrelated() -> Result<()> {
    let store = test_store();
    let provider = TermVectorProvider;

    store
        .save("c1", doc("A", "The cat sat on the mat"), &provider)
        .await?;
    store
        .save("c1", doc("B", "Quantum chromodynamics"), &provider)
        .await?;

    let hits = store.search("c1", "feline", 5, &provider).await?;
    assert!(!hits.is_empty());
    assert!(hits[0].text.contains("cat"));

    let cat_score = hits
        .iter()
        .find(|h| h.text.contains("cat"))
        .map(|h| h.score)
        .expect("cat hit");
    let physics_score = hits
        .iter()
        .find(|h| h.text.contains("Quantum"))
        .map(|h| h.score)
        .unwrap_or(0.0);
    assert!(cat_score > physics_score);
    Ok(())
}

#[tokio::test]
async fn results_ordered_by_score_descending() -> Result<()> {
    let store = test_store();
    let provider = TermVectorProvider;

    store
        .save("c1", doc("Cats", "cat cat cat feline"), &provider)
        .await?;
    store
        .save("c1", doc("Mixed", "cat on the rug near the market"), &provider)
        .await?;
    store
        .save("c1", doc("Physics", "physics of quantum fields"), &provider)
        .await?;

    let hits = store.search("c1", "kitten feline", 5, &provider).await?;
    for pair in hits.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    Ok(())
}

#[tokio::test]
async fn search_is_conversation_scoped() -> Result<()> {
    let store = test_store();
    let provider = TermVectorProvider;

    store
        .save("c1", doc("Cats", "a cat document"), &provider)
        .await?;
    store
        .save("c2", doc("Cats too", "another cat document"), &provider)
        .await?;

    let hits = store.search("c1", "cat", 5, &provider).await?;
    assert_eq!(hits.len(), 1);
    Ok(())
}

#[tokio::test]
async fn blank_query_returns_empty() -> Result<()> {
    let store = test_store();
    let provider = TermVectorProvider;
    store.save("c1", doc("Cats", "a cat document"), &provider).await?;

    let hits = store.search("c1", "   ", 5, &provider).await?;
    assert!(hits.is_empty());
    Ok(())
}
