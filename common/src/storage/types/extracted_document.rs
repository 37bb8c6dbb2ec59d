use std::{fmt, ops::Range};

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntityType {
    Person,
    Org,
    Gpe,
    Date,
    Money,
    Law,
    Bill,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "PERSON",
            EntityType::Org => "ORG",
            EntityType::Gpe => "GPE",
            EntityType::Date => "DATE",
            EntityType::Money => "MONEY",
            EntityType::Law => "LAW",
            EntityType::Bill => "BILL",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named entity located in the extracted text. `span` is a byte range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub text: String,
    pub entity_type: EntityType,
    pub span: Range<usize>,
    pub confidence: f32,
    pub source: String,
}

impl Entity {
    /// Case- and whitespace-insensitive key used when merging annotations.
    pub fn normalized_text(&self) -> String {
        self.text
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    pub fn overlaps(&self, other: &Entity) -> bool {
        self.span.start < other.span.end && other.span.start < self.span.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relationship {
    pub entity1: String,
    pub entity2: String,
    pub relation_type: String,
    pub distance: usize,
}

stored_object!(ExtractedDocument, "extracted_document", {
    package_id: String,
    collection: String,
    text: String,
    entities: Vec<Entity>,
    relationships: Vec<Relationship>,
    embedding_id: String
});

impl ExtractedDocument {
    pub fn new(
        package_id: &str,
        collection: &str,
        text: String,
        entities: Vec<Entity>,
        relationships: Vec<Relationship>,
        embedding_id: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: package_id.to_string(),
            package_id: package_id.to_string(),
            collection: collection.to_string(),
            text,
            entities,
            relationships,
            embedding_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Writes the document in a single statement, replacing any earlier run
    /// for the same package.
    pub async fn persist(self, db: &SurrealDbClient) -> Result<Self, AppError> {
        let stored = db.upsert_item(self).await?;
        stored.ok_or_else(|| AppError::InternalError("document upsert returned nothing".into()))
    }

    pub async fn get_by_package(
        db: &SurrealDbClient,
        package_id: &str,
    ) -> Result<Option<Self>, AppError> {
        Ok(db.get_item::<Self>(package_id).await?)
    }
}
