mod index;

pub use index::{cosine_similarity, InMemoryVectorIndex, SearchHit, SurrealVectorIndex, VectorIndex};

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{Arc, Mutex},
};

use common::{
    error::AppError,
    storage::db::SurrealDbClient,
    utils::{
        config::{AppConfig, VectorBackend},
        embedding::{Embedder, EmbeddingProvider},
    },
};
use lru::LruCache;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{debug, info, instrument};

use crate::utils::text::truncate_chars;

pub const EMBEDDING_CHAR_LIMIT: usize = 12_000;
const DEFAULT_CACHE_CAPACITY: usize = 1024;

type ContentHash = [u8; 32];

/// Embeds text through the configured provider and keeps vectors in a
/// [`VectorIndex`]. Identical text is only ever sent to the provider once
/// while it stays in the LRU cache; concurrent requests for the same text
/// wait for the first one instead of calling the provider again.
pub struct EmbeddingGenerator {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    cache: Mutex<LruCache<ContentHash, Vec<f32>>>,
    in_flight: Mutex<HashMap<ContentHash, Arc<AsyncMutex<()>>>>,
}

impl EmbeddingGenerator {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>) -> Self {
        Self::with_cache_capacity(embedder, index, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            embedder,
            index,
            cache: Mutex::new(LruCache::new(capacity)),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn from_config(config: &AppConfig, db: Arc<SurrealDbClient>) -> Result<Self, AppError> {
        let embedder = EmbeddingProvider::from_config(config).await?;
        let index: Arc<dyn VectorIndex> = match config.vector_backend {
            VectorBackend::Memory => Arc::new(InMemoryVectorIndex::new()),
            VectorBackend::Surreal => Arc::new(SurrealVectorIndex::new(db)),
        };
        info!(
            embedder = embedder.backend_label(),
            index = index.name(),
            "embedding generator ready"
        );

        Ok(Self::new(Arc::new(embedder), index))
    }

    pub fn dimension(&self) -> usize {
        self.embedder.dimension()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().map_or(0, |cache| cache.len())
    }

    #[instrument(level = "trace", skip_all, fields(chars = text.len()))]
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let input = truncate_chars(text, EMBEDDING_CHAR_LIMIT);
        let key: ContentHash = Sha256::digest(input.as_bytes()).into();

        if let Some(hit) = self.cached(&key) {
            debug!("embedding cache hit");
            return Ok(hit);
        }

        let gate = self.gate_for(key);
        let turn = gate.lock().await;
        let result = match self.cached(&key) {
            Some(hit) => {
                debug!("embedding computed by a concurrent caller");
                Ok(hit)
            }
            None => self.compute(input, key).await,
        };
        drop(turn);
        self.release_gate(&key, &gate);
        result
    }

    async fn compute(&self, input: &str, key: ContentHash) -> Result<Vec<f32>, AppError> {
        let retry_strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);
        let vector = Retry::spawn(retry_strategy, || self.embedder.embed(input))
            .await
            .map_err(|err| AppError::stage("embed", err))?;

        self.check_dimension(&vector)?;

        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, vector.clone());
        }
        Ok(vector)
    }

    fn gate_for(&self, key: ContentHash) -> Arc<AsyncMutex<()>> {
        match self.in_flight.lock() {
            Ok(mut in_flight) => Arc::clone(in_flight.entry(key).or_default()),
            Err(_) => Arc::new(AsyncMutex::new(())),
        }
    }

    fn release_gate(&self, key: &ContentHash, gate: &Arc<AsyncMutex<()>>) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            if in_flight.get(key).is_some_and(|current| Arc::ptr_eq(current, gate)) {
                in_flight.remove(key);
            }
        }
    }

    /// Upserts `vector` under `id`, replacing an earlier vector for that id.
    pub async fn store(&self, id: &str, vector: Vec<f32>, metadata: Value) -> Result<(), AppError> {
        self.check_dimension(&vector)?;
        self.index.upsert(id, vector, metadata).await
    }

    pub async fn remove(&self, id: &str) -> Result<(), AppError> {
        self.index.delete(id).await
    }

    pub async fn search(&self, query_text: &str, k: usize) -> Result<Vec<SearchHit>, AppError> {
        let query = self.embed(query_text).await?;
        self.index.search(&query, k).await
    }

    fn cached(&self, key: &ContentHash) -> Option<Vec<f32>> {
        self.cache.lock().ok()?.get(key).cloned()
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), AppError> {
        let expected = self.embedder.dimension();
        if vector.len() == expected {
            Ok(())
        } else {
            Err(AppError::stage(
                "embed",
                format!(
                    "{} returned {} dimensions, expected {expected}",
                    self.embedder.label(),
                    vector.len()
                ),
            ))
        }
    }
}
