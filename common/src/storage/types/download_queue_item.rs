use std::time::Duration;

use chrono::Duration as ChronoDuration;
use surrealdb::sql::Datetime as SurrealDatetime;
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::{is_transaction_conflict, AppError},
    storage::db::SurrealDbClient,
    stored_object,
};

const CLAIM_CONFLICT_RETRIES: usize = 5;

const CANDIDATES_QUERY: &str = r#"
    SELECT VALUE record::id(id) FROM type::table($table)
    WHERE status = $pending
      AND (locked_at = NONE OR locked_at < $lease_cutoff)
    ORDER BY priority DESC, created_at ASC
    LIMIT $limit;
"#;

// Candidates are re-checked as they are written, so a row another
// claimer leased in between is left out of this batch.
const CLAIM_BATCH_QUERY: &str = r#"
    UPDATE type::table($table)
    SET locked_at = $now,
        locked_by = $worker_id,
        updated_at = $now
    WHERE record::id(id) IN $ids
      AND status = $pending
      AND (locked_at = NONE OR locked_at < $lease_cutoff)
    RETURN AFTER;
"#;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }
}

stored_object!(DownloadQueueItem, "govinfo_download_queue", {
    package_id: String,
    download_link: String,
    collection: String,
    status: QueueStatus,
    priority: i64,
    retry_count: u32,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(
        serialize_with = "crate::storage::types::serde_helpers::serialize_option_datetime",
        deserialize_with = "crate::storage::types::serde_helpers::deserialize_option_datetime",
        default
    )]
    locked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    locked_by: Option<String>,
    #[serde(
        serialize_with = "crate::storage::types::serde_helpers::serialize_option_datetime",
        deserialize_with = "crate::storage::types::serde_helpers::deserialize_option_datetime",
        default
    )]
    completed_at: Option<DateTime<Utc>>
});

#[derive(Debug, Clone, Serialize)]
struct FailedItem {
    id: String,
    error: String,
}

impl DownloadQueueItem {
    pub fn new(package_id: &str, download_link: &str, collection: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            package_id: package_id.to_string(),
            download_link: download_link.to_string(),
            collection: collection.to_string(),
            status: QueueStatus::Pending,
            priority: 0,
            retry_count: 0,
            error_message: None,
            locked_at: None,
            locked_by: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Adds the item to the queue. Normally done by the external scheduler.
    pub async fn enqueue(self, db: &SurrealDbClient) -> Result<Self, AppError> {
        db.store_item(self.clone()).await?;
        Ok(self)
    }

    /// Leases up to `limit` pending rows, highest priority and oldest first.
    /// Rows whose lease is younger than `lease_timeout` are skipped.
    pub async fn claim_batch(
        db: &SurrealDbClient,
        limit: usize,
        worker_id: &str,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Self>, AppError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let cutoff = now
            - ChronoDuration::from_std(lease_timeout).unwrap_or_else(|_| ChronoDuration::zero());
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let _turn = db.claim_lock().await;
        for attempt in 0..CLAIM_CONFLICT_RETRIES {
            let claimed = Self::try_claim_batch(db, limit, worker_id, cutoff, now).await;

            match claimed {
                Ok(mut items) => {
                    items.sort_by(|a, b| {
                        b.priority
                            .cmp(&a.priority)
                            .then_with(|| a.created_at.cmp(&b.created_at))
                    });
                    return Ok(items);
                }
                Err(err) if is_transaction_conflict(&err) => {
                    debug!(attempt, worker_id, "download queue claim collided, re-selecting");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(Vec::new())
    }

    async fn try_claim_batch(
        db: &SurrealDbClient,
        limit: i64,
        worker_id: &str,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Self>, surrealdb::Error> {
        let ids: Vec<String> = db
            .client
            .query(CANDIDATES_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("pending", QueueStatus::Pending.as_str()))
            .bind(("lease_cutoff", SurrealDatetime::from(cutoff)))
            .bind(("limit", limit))
            .await?
            .take(0)?;

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        db.client
            .query(CLAIM_BATCH_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("ids", ids))
            .bind(("pending", QueueStatus::Pending.as_str()))
            .bind(("lease_cutoff", SurrealDatetime::from(cutoff)))
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("worker_id", worker_id.to_string()))
            .await?
            .take(0)
    }

    /// Records the outcome of a processed batch in one transaction.
    pub async fn mark_finished(
        db: &SurrealDbClient,
        completed: &[String],
        failed: &[(String, String)],
    ) -> Result<(), AppError> {
        if completed.is_empty() && failed.is_empty() {
            return Ok(());
        }

        const MARK_FINISHED_QUERY: &str = r#"
            BEGIN TRANSACTION;

            FOR $id IN $completed {
                UPDATE type::thing($table, $id)
                SET status = $completed_status,
                    error_message = NONE,
                    locked_at = NONE,
                    locked_by = NONE,
                    completed_at = $now,
                    updated_at = $now;
            };

            FOR $failure IN $failed {
                UPDATE type::thing($table, $failure.id)
                SET status = $failed_status,
                    error_message = $failure.error,
                    retry_count += 1,
                    locked_at = NONE,
                    locked_by = NONE,
                    completed_at = $now,
                    updated_at = $now;
            };

            COMMIT TRANSACTION;
        "#;

        let failures: Vec<FailedItem> = failed
            .iter()
            .map(|(id, error)| FailedItem {
                id: id.clone(),
                error: error.clone(),
            })
            .collect();

        db.client
            .query(MARK_FINISHED_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("completed", completed.to_vec()))
            .bind(("failed", failures))
            .bind(("completed_status", QueueStatus::Completed.as_str()))
            .bind(("failed_status", QueueStatus::Failed.as_str()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .check()?;

        Ok(())
    }

    pub async fn list_by_status(
        db: &SurrealDbClient,
        status: QueueStatus,
    ) -> Result<Vec<Self>, AppError> {
        let items: Vec<Self> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE status = $status
                 ORDER BY priority DESC, created_at ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("status", status.as_str()))
            .await?
            .take(0)?;

        Ok(items)
    }
}
