use std::{str::FromStr, sync::Arc};

use anyhow::{anyhow, Context, Result};
use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, ModelTrait, TextEmbedding, TextInitOptions};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    error::AppError,
    utils::config::{AppConfig, EmbeddingBackend},
};

const DEFAULT_OPENAI_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Turns text into a fixed-length vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    fn label(&self) -> &'static str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError>;
}

#[derive(Clone)]
pub struct EmbeddingProvider {
    inner: EmbeddingInner,
}

#[derive(Clone)]
enum EmbeddingInner {
    OpenAI {
        client: Arc<Client<OpenAIConfig>>,
        model: String,
        dimensions: u32,
    },
    Hashed {
        dimension: usize,
    },
    FastEmbed {
        model: Arc<Mutex<TextEmbedding>>,
        dimension: usize,
    },
}

impl EmbeddingProvider {
    /// Builds the provider selected by `embedding_backend`.
    pub async fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let provider = match config.embedding_backend {
            EmbeddingBackend::Hashed => Self::new_hashed(config.embedding_dimension as usize),
            EmbeddingBackend::FastEmbed => {
                Self::new_fastembed(config.embedding_model.clone()).await?
            }
            EmbeddingBackend::OpenAI => {
                let api_key = config.openai_api_key.clone().ok_or_else(|| {
                    AppError::Config("openai_api_key is required for the openai embedding backend".into())
                })?;
                let client = Client::with_config(
                    OpenAIConfig::new()
                        .with_api_key(api_key)
                        .with_api_base(&config.openai_base_url),
                );
                Self::new_openai(
                    Arc::new(client),
                    config
                        .embedding_model
                        .clone()
                        .unwrap_or_else(|| DEFAULT_OPENAI_EMBEDDING_MODEL.to_string()),
                    config.embedding_dimension,
                )
            }
        };

        info!(
            backend = provider.backend_label(),
            dimension = provider.dimension(),
            "embedding provider ready"
        );
        Ok(provider)
    }

    pub fn backend_label(&self) -> &'static str {
        match self.inner {
            EmbeddingInner::Hashed { .. } => "hashed",
            EmbeddingInner::FastEmbed { .. } => "fastembed",
            EmbeddingInner::OpenAI { .. } => "openai",
        }
    }

    pub fn dimension(&self) -> usize {
        match &self.inner {
            EmbeddingInner::Hashed { dimension } | EmbeddingInner::FastEmbed { dimension, .. } => {
                *dimension
            }
            EmbeddingInner::OpenAI { dimensions, .. } => *dimensions as usize,
        }
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        match &self.inner {
            EmbeddingInner::Hashed { dimension } => Ok(hashed_embedding(text, *dimension)),
            EmbeddingInner::FastEmbed { model, .. } => {
                // Inference is CPU bound; keep it off the async workers.
                let model = Arc::clone(model);
                let input = text.to_owned();
                tokio::task::spawn_blocking(move || {
                    let mut guard = model.blocking_lock();
                    guard
                        .embed(vec![input], None)
                        .context("generating fastembed vector")?
                        .into_iter()
                        .next()
                        .ok_or_else(|| anyhow!("fastembed returned no embedding for input"))
                })
                .await
                .context("joining fastembed inference")?
            }
            EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            } => {
                let request = CreateEmbeddingRequestArgs::default()
                    .model(model.clone())
                    .input([text])
                    .dimensions(*dimensions)
                    .build()?;

                let response = client.embeddings().create(request).await?;

                let embedding = response
                    .data
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow!("No embedding data received from OpenAI API"))?
                    .embedding;

                debug!(dimensions = embedding.len(), "openai embedding received");
                Ok(embedding)
            }
        }
    }

    pub fn new_openai(client: Arc<Client<OpenAIConfig>>, model: String, dimensions: u32) -> Self {
        EmbeddingProvider {
            inner: EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            },
        }
    }

    pub async fn new_fastembed(model_override: Option<String>) -> Result<Self> {
        let model_name = if let Some(code) = model_override {
            EmbeddingModel::from_str(&code).map_err(|err| anyhow!(err))?
        } else {
            EmbeddingModel::default()
        };

        let options = TextInitOptions::new(model_name.clone()).with_show_download_progress(false);
        let model_code = model_name.to_string();

        let (model, dimension) = tokio::task::spawn_blocking(move || -> Result<_> {
            let model =
                TextEmbedding::try_new(options).context("initialising FastEmbed text model")?;
            let info = EmbeddingModel::get_model_info(&model_name)
                .ok_or_else(|| anyhow!("FastEmbed model metadata missing for {model_code}"))?;
            Ok((model, info.dim))
        })
        .await
        .context("joining FastEmbed initialisation task")??;

        Ok(EmbeddingProvider {
            inner: EmbeddingInner::FastEmbed {
                model: Arc::new(Mutex::new(model)),
                dimension,
            },
        })
    }

    pub fn new_hashed(dimension: usize) -> Self {
        EmbeddingProvider {
            inner: EmbeddingInner::Hashed {
                dimension: dimension.max(1),
            },
        }
    }
}

#[async_trait]
impl Embedder for EmbeddingProvider {
    fn dimension(&self) -> usize {
        EmbeddingProvider::dimension(self)
    }

    fn label(&self) -> &'static str {
        self.backend_label()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        self.embed_text(text).await.map_err(AppError::from)
    }
}

/// Signed feature hashing over lowercased words, L2 normalised. The sign
/// bit comes from the same hash, so colliding words tend to cancel instead of
/// piling up in one slot. Offline and stable across runs.
fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let dim = dimension.max(1);
    let mut vector = vec![0.0f32; dim];

    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
    {
        let hash = fnv1a(&word.to_lowercase());
        let slot = usize::try_from(hash % dim as u64).unwrap_or(0);
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        if let Some(value) = vector.get_mut(slot) {
            *value += sign;
        }
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|value| *value /= norm);
    }
    vector
}

/// 64-bit FNV-1a. `DefaultHasher` output may change between Rust releases,
/// which would silently invalidate stored vectors.
fn fnv1a(word: &str) -> u64 {
    word.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}
