use std::time::Duration;

use common::utils::config::AppConfig;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Queue rows leased per batch.
    pub batch_size: usize,
    /// Documents processed at once within a batch.
    pub concurrency: usize,
    pub interval: Duration,
    pub lease_timeout: Duration,
    pub worker_id: String,
}

impl IngestionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            batch_size: config.ingest_batch_size,
            concurrency: config.download_concurrency.max(1),
            interval: config.ingest_interval(),
            lease_timeout: config.lease_timeout(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            concurrency: 4,
            interval: Duration::from_secs(60),
            lease_timeout: Duration::from_secs(600),
            worker_id: format!("ingest-{}", Uuid::new_v4()),
        }
    }
}
