use crate::error::AppError;

use super::types::{
    download_queue_item::DownloadQueueItem, extracted_document::ExtractedDocument, task::Task,
    StoredObject,
};
use std::{ops::Deref, sync::Arc};
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Vector rows written by the surreal vector index backend.
pub const DOCUMENT_EMBEDDING_TABLE: &str = "document_embedding";

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
    claim_lock: Arc<Mutex<()>>,
}

impl SurrealDbClient {
    /// # Initialize a new database client
    ///
    /// # Arguments
    /// * `address` - any engine address understood by SurrealDB (`ws://`, `http://`, `mem://`)
    ///
    /// # Returns
    /// * `SurrealDbClient` initialized
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        // The embedded engine has no users to sign in as.
        if !address.starts_with("mem://") {
            db.signin(Root { username, password }).await?;
        }

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient::from_client(db))
    }

    fn from_client(client: Surreal<Any>) -> Self {
        Self {
            client,
            claim_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Serializes queue claims made through this client and its clones.
    /// SurrealDB does not report every write-write overlap between two
    /// `UPDATE ... WHERE` statements as a conflict, so claimers sharing a
    /// connection take turns; the guarded update still protects claimers
    /// in other processes.
    pub async fn claim_lock(&self) -> MutexGuard<'_, ()> {
        self.claim_lock.lock().await
    }

    /// Defines the tables and indexes the queue relies on. Idempotent.
    pub async fn ensure_initialized(&self) -> Result<(), AppError> {
        let statements = format!(
            "DEFINE TABLE IF NOT EXISTS {task} SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS idx_task_status ON TABLE {task} FIELDS status;
             DEFINE INDEX IF NOT EXISTS idx_task_type ON TABLE {task} FIELDS task_type;
             DEFINE INDEX IF NOT EXISTS idx_task_order ON TABLE {task} FIELDS priority, created_at;
             DEFINE TABLE IF NOT EXISTS {queue} SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS idx_queue_status ON TABLE {queue} FIELDS status;
             DEFINE INDEX IF NOT EXISTS idx_queue_package ON TABLE {queue} FIELDS package_id UNIQUE;
             DEFINE TABLE IF NOT EXISTS {document} SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS idx_document_package ON TABLE {document} FIELDS package_id UNIQUE;
             DEFINE TABLE IF NOT EXISTS {embedding} SCHEMALESS;",
            task = Task::table_name(),
            queue = DownloadQueueItem::table_name(),
            document = ExtractedDocument::table_name(),
            embedding = DOCUMENT_EMBEDDING_TABLE,
        );

        self.client.query(statements).await?.check()?;
        debug!("queue schema ensured");

        Ok(())
    }

    /// Creates `item` under its own id. Fails if the id is already taken.
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    /// Creates or replaces the record keyed by the item's id.
    pub async fn upsert_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .upsert((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient::from_client(db))
    }
}

#[cfg(test)]
mod tests {
    use crate::stored_object;

    use super::*;
    use uuid::Uuid;

    stored_object!(Probe, "probe", {
        label: String
    });

    fn probe(id: &str, label: &str) -> Probe {
        Probe {
            id: id.to_string(),
            label: label.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn schema_bootstrap_is_idempotent() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb");

        db.ensure_initialized().await.expect("first bootstrap");
        db.ensure_initialized().await.expect("second bootstrap");
    }

    #[tokio::test]
    async fn store_refuses_duplicates_but_upsert_replaces() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb");

        db.store_item(probe("p1", "first")).await.expect("store");
        assert!(db.store_item(probe("p1", "again")).await.is_err());

        db.upsert_item(probe("p1", "second")).await.expect("upsert");
        let fetched = db.get_item::<Probe>("p1").await.expect("get");
        assert_eq!(fetched.map(|p| p.label), Some("second".to_string()));

        assert!(db.get_item::<Probe>("missing").await.expect("get").is_none());
    }
}
