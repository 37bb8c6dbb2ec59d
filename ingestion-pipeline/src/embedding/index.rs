use std::{cmp::Ordering, collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use common::{
    error::AppError,
    storage::db::{SurrealDbClient, DOCUMENT_EMBEDDING_TABLE},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use surrealdb::sql::Datetime as SurrealDatetime;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub metadata: Value,
}

/// Upsert-by-id vector storage with cosine top-k search.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn name(&self) -> &'static str;

    async fn upsert(&self, id: &str, vector: Vec<f32>, metadata: Value) -> Result<(), AppError>;

    /// Removes the vector stored under `id`. Unknown ids are not an error.
    async fn delete(&self, id: &str) -> Result<(), AppError>;

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, AppError>;
}

struct IndexedVector {
    vector: Vec<f32>,
    metadata: Value,
}

/// Process-local index with brute force search. Needs nothing external.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    entries: RwLock<HashMap<String, IndexedVector>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn upsert(&self, id: &str, vector: Vec<f32>, metadata: Value) -> Result<(), AppError> {
        self.entries
            .write()
            .await
            .insert(id.to_string(), IndexedVector { vector, metadata });
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), AppError> {
        self.entries.write().await.remove(id);
        Ok(())
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, AppError> {
        let entries = self.entries.read().await;
        let mut hits: Vec<SearchHit> = entries
            .iter()
            .map(|(id, entry)| SearchHit {
                id: id.clone(),
                score: cosine_similarity(query, &entry.vector),
                metadata: entry.metadata.clone(),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }
}

#[derive(Serialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
    metadata: Value,
    updated_at: SurrealDatetime,
}

/// Rows in the `document_embedding` table, scored by SurrealDB's cosine
/// similarity function.
pub struct SurrealVectorIndex {
    db: Arc<SurrealDbClient>,
}

impl SurrealVectorIndex {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl VectorIndex for SurrealVectorIndex {
    fn name(&self) -> &'static str {
        "surreal"
    }

    async fn upsert(&self, id: &str, vector: Vec<f32>, metadata: Value) -> Result<(), AppError> {
        let row = EmbeddingRow {
            embedding: vector,
            metadata,
            updated_at: SurrealDatetime::from(Utc::now()),
        };

        self.db
            .client
            .query("UPSERT type::thing($table, $id) CONTENT $row RETURN NONE;")
            .bind(("table", DOCUMENT_EMBEDDING_TABLE))
            .bind(("id", id.to_string()))
            .bind(("row", row))
            .await?
            .check()?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), AppError> {
        self.db
            .client
            .query("DELETE type::thing($table, $id);")
            .bind(("table", DOCUMENT_EMBEDDING_TABLE))
            .bind(("id", id.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, AppError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        const SEARCH_QUERY: &str = r#"
            SELECT
                record::id(id) AS id,
                metadata,
                vector::similarity::cosine(embedding, $query) AS score
            FROM type::table($table)
            ORDER BY score DESC
            LIMIT $k;
        "#;

        let mut response = self
            .db
            .client
            .query(SEARCH_QUERY)
            .bind(("table", DOCUMENT_EMBEDDING_TABLE))
            .bind(("query", query.to_vec()))
            .bind(("k", i64::try_from(k).unwrap_or(i64::MAX)))
            .await?;

        let hits: Vec<SearchHit> = response.take(0)?;
        Ok(hits)
    }
}

/// Cosine similarity; zero when either side has no magnitude or the
/// lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (dot, norm_a, norm_b) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(dot, na, nb), (x, y)| {
            (dot + x * y, na + x * x, nb + y * y)
        });

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    async fn seed(index: &dyn VectorIndex) {
        index
            .upsert("east", vec![1.0, 0.0, 0.0], json!({"collection": "BILLS"}))
            .await
            .expect("upsert east");
        index
            .upsert("north", vec![0.0, 1.0, 0.0], json!({"collection": "PLAW"}))
            .await
            .expect("upsert north");
        index
            .upsert("northeast", vec![0.7, 0.7, 0.0], json!({"collection": "CRPT"}))
            .await
            .expect("upsert northeast");
    }

    #[test]
    fn cosine_handles_degenerate_inputs() {
        assert!((cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn memory_index_ranks_by_cosine() {
        let index = InMemoryVectorIndex::new();
        seed(&index).await;

        let hits = index.search(&[1.0, 0.1, 0.0], 2).await.expect("search");
        let ids: Vec<&str> = hits.iter().map(|hit| hit.id.as_str()).collect();
        assert_eq!(ids, vec!["east", "northeast"]);
        assert_eq!(hits[0].metadata["collection"], "BILLS");
    }

    #[tokio::test]
    async fn memory_upsert_replaces_by_id() {
        let index = InMemoryVectorIndex::new();
        seed(&index).await;
        index
            .upsert("east", vec![0.0, 0.0, 1.0], json!({"collection": "FR"}))
            .await
            .expect("replace");

        assert_eq!(index.len().await, 3);
        let hits = index.search(&[0.0, 0.0, 1.0], 1).await.expect("search");
        assert_eq!(hits[0].id, "east");
        assert_eq!(hits[0].metadata["collection"], "FR");

        index.delete("east").await.expect("delete");
        index.delete("never-stored").await.expect("unknown id");
        assert_eq!(index.len().await, 2);
    }

    #[tokio::test]
    async fn surreal_index_matches_memory_contract() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb");
        db.ensure_initialized().await.expect("schema");
        let index = SurrealVectorIndex::new(Arc::new(db));
        seed(&index).await;
        index
            .upsert("north", vec![0.0, 1.0, 0.0], json!({"collection": "PLAW", "v": 2}))
            .await
            .expect("replace");

        let hits = index.search(&[0.1, 1.0, 0.0], 2).await.expect("search");
        let ids: Vec<&str> = hits.iter().map(|hit| hit.id.as_str()).collect();
        assert_eq!(ids, vec!["north", "northeast"]);
        assert_eq!(hits[0].metadata["v"], 2);
        assert!(hits[0].score > hits[1].score);

        assert!(index.search(&[1.0, 0.0, 0.0], 0).await.expect("empty").is_empty());

        index.delete("north").await.expect("delete");
        let hits = index.search(&[0.0, 1.0, 0.0], 3).await.expect("search");
        assert!(hits.iter().all(|hit| hit.id != "north"));
        assert_eq!(hits.len(), 2);
    }
}
