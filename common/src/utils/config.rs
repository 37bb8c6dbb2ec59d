use std::{path::PathBuf, time::Duration};

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::AppError;

#[derive(Clone, Copy, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    OpenAI,
    FastEmbed,
    #[default]
    Hashed,
}

#[derive(Clone, Copy, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    Memory,
    #[default]
    Surreal,
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: String,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default)]
    pub embedding_backend: EmbeddingBackend,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: u32,
    #[serde(default)]
    pub vector_backend: VectorBackend,
    #[serde(default)]
    pub llm_entities: bool,
    #[serde(default = "default_entity_model")]
    pub entity_model: String,
    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: usize,
    #[serde(default = "default_cpu_concurrency")]
    pub cpu_concurrency: usize,
    #[serde(default = "default_download_max_retries")]
    pub download_max_retries: u32,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default)]
    pub document_api_key: Option<String>,
    #[serde(default = "default_ingest_batch_size")]
    pub ingest_batch_size: usize,
    #[serde(default = "default_ingest_interval_secs")]
    pub ingest_interval_secs: u64,
    #[serde(default = "default_worker_poll_interval_ms")]
    pub worker_poll_interval_ms: u64,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl AppConfig {
    pub fn scratch_path(&self) -> PathBuf {
        PathBuf::from(&self.scratch_dir)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn ingest_interval(&self) -> Duration {
        Duration::from_secs(self.ingest_interval_secs)
    }

    /// Rejects intervals and timeouts of zero. A zero tick interval panics in
    /// tokio and a zero poll interval turns every wait into a busy loop.
    pub fn validate(&self) -> Result<(), AppError> {
        let must_be_positive = [
            ("ingest_interval_secs", self.ingest_interval_secs),
            ("worker_poll_interval_ms", self.worker_poll_interval_ms),
            ("task_timeout_secs", self.task_timeout_secs),
            ("lease_timeout_secs", self.lease_timeout_secs),
        ];

        match must_be_positive.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(AppError::Config(format!("{name} must be greater than zero"))),
            None => Ok(()),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: "root".to_string(),
            surrealdb_password: "root".to_string(),
            surrealdb_namespace: "taskqueue".to_string(),
            surrealdb_database: "taskqueue".to_string(),
            scratch_dir: default_scratch_dir(),
            openai_api_key: None,
            openai_base_url: default_base_url(),
            embedding_backend: EmbeddingBackend::default(),
            embedding_model: None,
            embedding_dimension: default_embedding_dimension(),
            vector_backend: VectorBackend::default(),
            llm_entities: false,
            entity_model: default_entity_model(),
            download_concurrency: default_download_concurrency(),
            cpu_concurrency: default_cpu_concurrency(),
            download_max_retries: default_download_max_retries(),
            requests_per_second: default_requests_per_second(),
            document_api_key: None,
            ingest_batch_size: default_ingest_batch_size(),
            ingest_interval_secs: default_ingest_interval_secs(),
            worker_poll_interval_ms: default_worker_poll_interval_ms(),
            task_timeout_secs: default_task_timeout_secs(),
            lease_timeout_secs: default_lease_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

fn default_scratch_dir() -> String {
    "./data/scratch".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_dimension() -> u32 {
    384
}

fn default_entity_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_download_concurrency() -> usize {
    4
}

fn default_cpu_concurrency() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

fn default_download_max_retries() -> u32 {
    3
}

fn default_requests_per_second() -> f64 {
    1.0
}

fn default_ingest_batch_size() -> usize {
    10
}

fn default_ingest_interval_secs() -> u64 {
    60
}

fn default_worker_poll_interval_ms() -> u64 {
    1_000
}

fn default_task_timeout_secs() -> u64 {
    300
}

fn default_lease_timeout_secs() -> u64 {
    600
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

pub fn get_config() -> Result<AppConfig, AppError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    let config: AppConfig = config.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_optional_fields() {
        let config = Config::builder()
            .set_override("surrealdb_address", "mem://")
            .and_then(|b| b.set_override("surrealdb_username", "root"))
            .and_then(|b| b.set_override("surrealdb_password", "root"))
            .and_then(|b| b.set_override("surrealdb_namespace", "ns"))
            .and_then(|b| b.set_override("surrealdb_database", "db"))
            .and_then(|b| b.set_override("embedding_backend", "fastembed"))
            .expect("overrides")
            .build()
            .expect("build config");

        let parsed: AppConfig = config.try_deserialize().expect("deserialize");
        assert_eq!(parsed.embedding_backend, EmbeddingBackend::FastEmbed);
        assert_eq!(parsed.vector_backend, VectorBackend::Surreal);
        assert_eq!(parsed.download_concurrency, 4);
        assert_eq!(parsed.lease_timeout(), Duration::from_secs(600));
        assert!(parsed.openai_api_key.is_none());
        assert!(parsed.cpu_concurrency >= 1);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let idle_ingest = AppConfig {
            ingest_interval_secs: 0,
            ..AppConfig::default()
        };
        assert!(matches!(idle_ingest.validate(), Err(AppError::Config(msg)) if msg.contains("ingest_interval_secs")));

        let busy_poll = AppConfig {
            worker_poll_interval_ms: 0,
            ..AppConfig::default()
        };
        assert!(matches!(busy_poll.validate(), Err(AppError::Config(msg)) if msg.contains("worker_poll_interval_ms")));

        assert!(AppConfig::default().validate().is_ok());
    }
}
