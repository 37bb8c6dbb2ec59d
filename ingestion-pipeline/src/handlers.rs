use std::sync::Arc;

use async_trait::async_trait;
use common::{error::AppError, storage::types::task::Task};
use serde::Deserialize;
use serde_json::{json, Value};
use task_worker::TaskHandler;
use tracing::instrument;

use crate::pipeline::IngestionSupervisor;

/// Runs one supervisor batch as a queued task.
pub struct IngestBatchHandler {
    supervisor: Arc<IngestionSupervisor>,
}

impl IngestBatchHandler {
    pub fn new(supervisor: Arc<IngestionSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl TaskHandler for IngestBatchHandler {
    #[instrument(skip_all, fields(task_id = %task.id))]
    async fn handle(&self, task: &Task) -> Result<Value, AppError> {
        let report = self.supervisor.run_batch().await?;
        Ok(serde_json::to_value(report)?)
    }
}

#[derive(Debug, Deserialize)]
struct DocumentPayload {
    package_id: String,
    download_link: String,
    collection: String,
}

/// Pushes a single package through the pipeline outside the download queue.
pub struct IngestDocumentHandler {
    supervisor: Arc<IngestionSupervisor>,
}

impl IngestDocumentHandler {
    pub fn new(supervisor: Arc<IngestionSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl TaskHandler for IngestDocumentHandler {
    #[instrument(skip_all, fields(task_id = %task.id))]
    async fn handle(&self, task: &Task) -> Result<Value, AppError> {
        let payload: DocumentPayload = serde_json::from_value(task.payload.clone())
            .map_err(|err| AppError::Validation(format!("invalid ingest_document payload: {err}")))?;
        if payload.package_id.trim().is_empty() || payload.download_link.trim().is_empty() {
            return Err(AppError::Validation(
                "ingest_document needs a package_id and a download_link".into(),
            ));
        }

        let stored = self
            .supervisor
            .process_document(&payload.package_id, &payload.download_link, &payload.collection)
            .await?;

        Ok(json!({
            "document_id": stored.id,
            "entities": stored.entities.len(),
            "relationships": stored.relationships.len(),
        }))
    }
}
