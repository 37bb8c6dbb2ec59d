use std::sync::Arc;

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs, ResponseFormat,
        ResponseFormatJsonSchema,
    },
    Client,
};
use async_trait::async_trait;
use common::{
    error::AppError,
    storage::types::extracted_document::{Entity, EntityType},
    utils::config::AppConfig,
};
use serde::Deserialize;
use tracing::debug;

use super::EntityBackend;
use crate::utils::{
    llm_instructions::{get_entity_extraction_schema, ENTITY_EXTRACTION_SYSTEM_MESSAGE},
    text::truncate_chars,
};

pub const LLM_SOURCE: &str = "llm";
const LLM_INPUT_CHAR_LIMIT: usize = 12_000;

#[derive(Debug, Deserialize)]
pub(crate) struct LlmEntities {
    pub entities: Vec<LlmEntity>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LlmEntity {
    pub text: String,
    pub entity_type: EntityType,
    pub confidence: f32,
}

/// Higher precision annotations from an OpenAI compatible chat model.
pub struct LlmEntityBackend {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
}

impl LlmEntityBackend {
    pub fn new(client: Arc<Client<OpenAIConfig>>, model: String) -> Self {
        Self { client, model }
    }

    /// `None` unless `llm_entities` is switched on.
    pub fn from_config(config: &AppConfig) -> Result<Option<Self>, AppError> {
        if !config.llm_entities {
            return Ok(None);
        }

        let api_key = config.openai_api_key.clone().ok_or_else(|| {
            AppError::Config("llm_entities requires openai_api_key".into())
        })?;
        let client = Client::with_config(
            OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base(&config.openai_base_url),
        );

        Ok(Some(Self::new(Arc::new(client), config.entity_model.clone())))
    }

    fn build_request(&self, text: &str) -> Result<CreateChatCompletionRequest, AppError> {
        let response_format = ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: Some("Named entities found in a government document".into()),
                name: "entity_extraction".into(),
                schema: Some(get_entity_extraction_schema()),
                strict: Some(true),
            },
        };

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([
                ChatCompletionRequestSystemMessage::from(ENTITY_EXTRACTION_SYSTEM_MESSAGE).into(),
                ChatCompletionRequestUserMessage::from(
                    truncate_chars(text, LLM_INPUT_CHAR_LIMIT).to_string(),
                )
                .into(),
            ])
            .response_format(response_format)
            .build()?;

        Ok(request)
    }
}

#[async_trait]
impl EntityBackend for LlmEntityBackend {
    fn name(&self) -> &'static str {
        LLM_SOURCE
    }

    async fn extract(&self, text: &str) -> Result<Vec<Entity>, AppError> {
        let request = self.build_request(text)?;
        let response = self.client.chat().create(request).await?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_ref())
            .ok_or_else(|| AppError::Handler("entity model returned no content".into()))?;

        let parsed: LlmEntities = serde_json::from_str(content).map_err(|err| {
            AppError::Handler(format!("failed to parse entity model response: {err}"))
        })?;
        debug!(count = parsed.entities.len(), "entity model answered");

        Ok(locate(text, parsed.entities))
    }
}

/// Places model answers in the document. Every verbatim occurrence becomes an
/// entity; answers that do not appear in the text are dropped.
pub(crate) fn locate(text: &str, found: Vec<LlmEntity>) -> Vec<Entity> {
    let mut located = Vec::new();

    for candidate in found {
        let needle = candidate.text.trim();
        if needle.is_empty() {
            continue;
        }
        let confidence = candidate.confidence.clamp(0.0, 1.0);
        for (start, matched) in text.match_indices(needle) {
            located.push(Entity {
                text: matched.to_string(),
                entity_type: candidate.entity_type,
                span: start..start + matched.len(),
                confidence,
                source: LLM_SOURCE.to_string(),
            });
        }
    }

    located
}
