mod llm;
mod patterns;
mod relationships;

pub use llm::{LlmEntityBackend, LLM_SOURCE};
pub use patterns::{PatternTagger, PATTERN_SOURCE};
pub use relationships::{find_relationships, RELATIONSHIP_WINDOW};

use std::sync::Arc;

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::types::extracted_document::{Entity, Relationship},
};
use tracing::{debug, instrument, warn};

use crate::utils::cpu_pool::CpuPool;

/// An additional entity source run alongside the pattern tagger.
#[async_trait]
pub trait EntityBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn extract(&self, text: &str) -> Result<Vec<Entity>, AppError>;
}

pub struct EntityProcessor {
    tagger: PatternTagger,
    model: Option<Arc<dyn EntityBackend>>,
    pool: CpuPool,
    window: usize,
}

impl EntityProcessor {
    pub fn new(pool: CpuPool) -> Self {
        Self {
            tagger: PatternTagger,
            model: None,
            pool,
            window: RELATIONSHIP_WINDOW,
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: Arc<dyn EntityBackend>) -> Self {
        self.model = Some(model);
        self
    }

    /// Tags `text` with every backend and merges the annotations. A failing
    /// model backend is logged and the pattern results are kept.
    #[instrument(level = "trace", skip_all, fields(chars = text.len()))]
    pub async fn extract_entities(&self, text: &str) -> Result<Vec<Entity>, AppError> {
        let tagger = self.tagger;
        let owned = text.to_string();
        let mut entities = self.pool.run(move || Ok(tagger.tag(&owned))).await?;
        debug!(count = entities.len(), "pattern tagger finished");

        if let Some(model) = &self.model {
            match model.extract(text).await {
                Ok(found) => {
                    debug!(backend = model.name(), count = found.len(), "entity model finished");
                    entities.extend(found);
                }
                Err(err) => {
                    warn!(backend = model.name(), error = %err, "entity model failed, keeping pattern results");
                }
            }
        }

        Ok(merge_entities(entities))
    }

    pub fn find_relationships(&self, entities: &[Entity], text: &str) -> Vec<Relationship> {
        find_relationships(entities, text, self.window)
    }

    /// Entities plus the relationships between them.
    pub async fn analyze(&self, text: &str) -> Result<(Vec<Entity>, Vec<Relationship>), AppError> {
        let entities = self.extract_entities(text).await?;
        let relationships = self.find_relationships(&entities, text);
        Ok((entities, relationships))
    }
}

/// Collapses overlapping annotations of the same text. The higher confidence
/// annotation wins and the sources are joined with `+`.
pub fn merge_entities(mut entities: Vec<Entity>) -> Vec<Entity> {
    entities.sort_by(|a, b| {
        a.span
            .start
            .cmp(&b.span.start)
            .then_with(|| b.confidence.total_cmp(&a.confidence))
    });

    let mut merged: Vec<Entity> = Vec::with_capacity(entities.len());
    for entity in entities {
        let key = entity.normalized_text();
        let existing = merged
            .iter_mut()
            .find(|kept| kept.overlaps(&entity) && kept.normalized_text() == key);

        match existing {
            Some(kept) => {
                let sources = join_sources(&kept.source, &entity.source);
                if entity.confidence > kept.confidence {
                    *kept = entity;
                }
                kept.source = sources;
            }
            None => merged.push(entity),
        }
    }

    merged
}

fn join_sources(left: &str, right: &str) -> String {
    if left.split('+').any(|source| source == right) {
        left.to_string()
    } else {
        format!("{left}+{right}")
    }
}

#[cfg(test)]
mod tests {
    use common::storage::types::extracted_document::EntityType;

    use super::*;

    fn entity(text: &str, start: usize, entity_type: EntityType, confidence: f32, source: &str) -> Entity {
        Entity {
            text: text.to_string(),
            entity_type,
            span: start..start + text.len(),
            confidence,
            source: source.to_string(),
        }
    }

    struct FixedModel(Vec<Entity>);

    #[async_trait]
    impl EntityBackend for FixedModel {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn extract(&self, _text: &str) -> Result<Vec<Entity>, AppError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenModel;

    #[async_trait]
    impl EntityBackend for BrokenModel {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn extract(&self, _text: &str) -> Result<Vec<Entity>, AppError> {
            Err(AppError::Handler("model unavailable".into()))
        }
    }

    #[test]
    fn overlapping_same_text_keeps_higher_confidence() {
        let merged = merge_entities(vec![
            entity("Department of Energy", 10, EntityType::Org, 0.7, "pattern"),
            entity("department of  energy", 10, EntityType::Gpe, 0.95, "llm"),
            entity("Ohio", 40, EntityType::Gpe, 0.85, "pattern"),
        ]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].entity_type, EntityType::Gpe);
        assert!((merged[0].confidence - 0.95).abs() < f32::EPSILON);
        assert_eq!(merged[0].source, "llm+pattern");
        assert_eq!(merged[1].text, "Ohio");
    }

    #[test]
    fn same_text_in_different_places_is_kept_twice() {
        let merged = merge_entities(vec![
            entity("EPA", 0, EntityType::Org, 0.8, "pattern"),
            entity("EPA", 25, EntityType::Org, 0.8, "pattern"),
        ]);
        assert_eq!(merged.len(), 2);
    }

    #[tokio::test]
    async fn model_annotations_are_merged_with_patterns() {
        let text = "The EPA issued guidance.";
        let model = FixedModel(vec![entity("EPA", 4, EntityType::Org, 0.99, LLM_SOURCE)]);
        let processor = EntityProcessor::new(CpuPool::new(1)).with_model(Arc::new(model));

        let entities = processor.extract_entities(text).await.expect("entities");
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].source, "llm+pattern");
        assert!((entities[0].confidence - 0.99).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn failing_model_falls_back_to_patterns() {
        let processor = EntityProcessor::new(CpuPool::new(1)).with_model(Arc::new(BrokenModel));

        let (entities, relationships) = processor
            .analyze("Senator Jane Smith visited the Department of Energy.")
            .await
            .expect("analyze");
        assert_eq!(entities.len(), 2);
        assert_eq!(relationships.len(), 1);
        assert_eq!(relationships[0].relation_type, "affiliated_with");
    }
}
