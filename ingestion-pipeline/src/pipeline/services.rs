use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::extracted_document::{Entity, ExtractedDocument, Relationship},
    },
    utils::{config::AppConfig, rate_limiter::RateLimiter},
};
use serde_json::json;
use tracing::{debug, warn};

use crate::{
    downloader::{DocumentDownloader, DownloadedFile, DownloaderConfig},
    embedding::EmbeddingGenerator,
    entities::{EntityProcessor, LlmEntityBackend},
    extraction::TextExtractor,
    utils::cpu_pool::CpuPool,
};

/// The work behind each pipeline stage. The supervisor only sequences these
/// calls, so tests can swap any of them out.
#[async_trait]
pub trait PipelineServices: Send + Sync {
    async fn download(&self, package_id: &str, link: &str) -> Result<DownloadedFile, AppError>;

    async fn extract_text(&self, path: &Path) -> Result<String, AppError>;

    async fn find_entities(
        &self,
        text: &str,
    ) -> Result<(Vec<Entity>, Vec<Relationship>), AppError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError>;

    async fn persist(
        &self,
        document: ExtractedDocument,
        embedding: Vec<f32>,
    ) -> Result<ExtractedDocument, AppError>;
}

pub struct DefaultPipelineServices {
    db: Arc<SurrealDbClient>,
    downloader: DocumentDownloader,
    extractor: TextExtractor,
    entities: EntityProcessor,
    embeddings: Arc<EmbeddingGenerator>,
    pool: CpuPool,
}

impl DefaultPipelineServices {
    pub fn new(
        db: Arc<SurrealDbClient>,
        downloader: DocumentDownloader,
        extractor: TextExtractor,
        entities: EntityProcessor,
        embeddings: Arc<EmbeddingGenerator>,
        pool: CpuPool,
    ) -> Self {
        Self {
            db,
            downloader,
            extractor,
            entities,
            embeddings,
            pool,
        }
    }

    /// Wires every stage from configuration. The CPU pool is shared by text
    /// extraction and entity tagging.
    pub async fn from_config(config: &AppConfig, db: Arc<SurrealDbClient>) -> Result<Self, AppError> {
        let limiter = Arc::new(RateLimiter::new(config.requests_per_second));
        let downloader = DocumentDownloader::new(DownloaderConfig::from_app_config(config), limiter)?;
        let pool = CpuPool::new(config.cpu_concurrency);

        let mut entities = EntityProcessor::new(pool.clone());
        if let Some(model) = LlmEntityBackend::from_config(config)? {
            entities = entities.with_model(Arc::new(model));
        }

        let embeddings = EmbeddingGenerator::from_config(config, Arc::clone(&db)).await?;

        Ok(Self::new(
            db,
            downloader,
            TextExtractor::default(),
            entities,
            Arc::new(embeddings),
            pool,
        ))
    }

    pub fn embeddings(&self) -> &Arc<EmbeddingGenerator> {
        &self.embeddings
    }
}

#[async_trait]
impl PipelineServices for DefaultPipelineServices {
    async fn download(&self, package_id: &str, link: &str) -> Result<DownloadedFile, AppError> {
        self.downloader.download(package_id, link).await
    }

    async fn extract_text(&self, path: &Path) -> Result<String, AppError> {
        let extractor = self.extractor.clone();
        let path = path.to_path_buf();
        self.pool.run(move || extractor.extract(&path)).await
    }

    async fn find_entities(
        &self,
        text: &str,
    ) -> Result<(Vec<Entity>, Vec<Relationship>), AppError> {
        self.entities
            .analyze(text)
            .await
            .map_err(|err| stage_error("entities", err))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        self.embeddings.embed(text).await
    }

    async fn persist(
        &self,
        document: ExtractedDocument,
        embedding: Vec<f32>,
    ) -> Result<ExtractedDocument, AppError> {
        let metadata = json!({
            "package_id": document.package_id,
            "collection": document.collection,
            "entities": document.entities.len(),
        });
        let embedding_id = document.embedding_id.clone();
        self.embeddings
            .store(&embedding_id, embedding, metadata)
            .await
            .map_err(|err| stage_error("persist", err))?;

        // The vector goes first; a document that cannot be written takes its
        // vector with it.
        let stored = match document.persist(&self.db).await {
            Ok(stored) => stored,
            Err(err) => {
                if let Err(cleanup) = self.embeddings.remove(&embedding_id).await {
                    warn!(
                        embedding_id = %embedding_id,
                        error = %cleanup,
                        "failed to remove vector of unpersisted document"
                    );
                }
                return Err(stage_error("persist", err));
            }
        };
        debug!(package_id = %stored.package_id, "document persisted");
        Ok(stored)
    }
}

/// Keeps an existing stage label, otherwise tags the error with `stage`.
fn stage_error(stage: &'static str, err: AppError) -> AppError {
    match err {
        AppError::PipelineStage { .. } => err,
        other => AppError::stage(stage, other),
    }
}
