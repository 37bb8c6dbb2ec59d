use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::Value;
use surrealdb::sql::Datetime as SurrealDatetime;
use tracing::{debug, info, warn};

use crate::{
    error::{is_transaction_conflict, AppError},
    storage::{
        db::SurrealDbClient,
        types::{
            task::{compute_next_state, NewTask, Task, TaskStatus, TaskTransition, TaskType},
            StoredObject,
        },
    },
};

/// How many times a claim re-selects after colliding with another claimer
/// before reporting an empty poll.
pub const CLAIM_CONFLICT_RETRIES: usize = 5;

/// Delay applied when a failed task is parked in `RETRY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(15 * 60),
        }
    }
}

impl RetryPolicy {
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// `base * 2^(claims - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

#[derive(Debug, Deserialize)]
struct StatusCount {
    status: TaskStatus,
    count: usize,
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(36_500))
}

fn map_conflict(err: surrealdb::Error) -> AppError {
    if is_transaction_conflict(&err) {
        AppError::LeaseConflict(err.to_string())
    } else {
        AppError::Database(err)
    }
}

/// Durable task queue. Every queue-state mutation goes through here.
#[derive(Clone)]
pub struct TaskStore {
    db: Arc<SurrealDbClient>,
    retry_policy: RetryPolicy,
}

impl TaskStore {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self {
            db,
            retry_policy: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn db(&self) -> &Arc<SurrealDbClient> {
        &self.db
    }

    pub async fn create(&self, new_task: NewTask) -> Result<Task, AppError> {
        let task = new_task.into_task(Utc::now())?;
        self.db.store_item(task.clone()).await?;
        debug!(task_id = %task.id, task_type = %task.task_type, "task enqueued");
        Ok(task)
    }

    /// Enqueues `new_task` as a child of `parent`.
    pub async fn spawn_child(&self, parent: &Task, mut new_task: NewTask) -> Result<Task, AppError> {
        new_task.parent_task_id = Some(parent.id.clone());
        self.create(new_task).await
    }

    pub async fn get(&self, id: &str) -> Result<Task, AppError> {
        self.db
            .get_item::<Task>(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {id}")))
    }

    pub async fn claim_next(
        &self,
        types: &[TaskType],
        worker_id: &str,
        lease_timeout: Duration,
    ) -> Result<Option<Task>, AppError> {
        self.claim_next_at(types, worker_id, lease_timeout, Utc::now())
            .await
    }

    /// Atomically leases the best eligible task as seen at `now`. An empty
    /// `types` slice matches every type.
    pub async fn claim_next_at(
        &self,
        types: &[TaskType],
        worker_id: &str,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, AppError> {
        debug_assert!(compute_next_state(TaskStatus::Pending, TaskTransition::Claim).is_ok());
        debug_assert!(compute_next_state(TaskStatus::Retry, TaskTransition::Claim).is_ok());

        let lease_cutoff = now - to_chrono(lease_timeout);

        let _turn = self.db.claim_lock().await;
        for attempt in 0..CLAIM_CONFLICT_RETRIES {
            match self.try_claim(types, worker_id, lease_cutoff, now).await {
                Ok(task) => return Ok(task),
                Err(AppError::LeaseConflict(reason)) => {
                    debug!(attempt, worker_id, %reason, "claim collided with another worker");
                }
                Err(err) => return Err(err),
            }
        }

        debug!(worker_id, "claim gave up after repeated conflicts");
        Ok(None)
    }

    async fn try_claim(
        &self,
        types: &[TaskType],
        worker_id: &str,
        lease_cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, AppError> {
        // A PROCESSING row only qualifies once its lease has lapsed; such a row
        // is re-claimed even with its budget spent so the next failure can
        // settle it as FAILED.
        const CANDIDATE_QUERY: &str = r#"
            SELECT * FROM type::table($table)
            WHERE status IN $claimable
              AND ($any_type OR task_type IN $types)
              AND (locked_at = NONE OR locked_at < $lease_cutoff)
              AND (
                    retry_count <= max_retries
                    OR max_retries = 0
                    OR status = $processing
              )
              AND (scheduled_for = NONE OR scheduled_for <= $now)
            ORDER BY priority DESC, created_at ASC
            LIMIT 1;
        "#;

        // The row is re-checked as it is written; another claimer that got
        // there first leaves nothing to update.
        const CLAIM_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $processing,
                locked_at = $now,
                locked_by = $worker_id,
                started_at = $now,
                retry_count = retry_count + 1,
                updated_at = $now
            WHERE status IN $claimable
              AND (locked_at = NONE OR locked_at < $lease_cutoff)
              AND retry_count = $seen_retry_count
            RETURN AFTER;
        "#;

        let claimable = vec![
            TaskStatus::Pending.as_str(),
            TaskStatus::Retry.as_str(),
            TaskStatus::Processing.as_str(),
        ];
        let type_tags: Vec<&'static str> = types.iter().map(TaskType::as_str).collect();

        let candidates: Vec<Task> = self
            .db
            .client
            .query(CANDIDATE_QUERY)
            .bind(("table", Task::table_name()))
            .bind(("claimable", claimable.clone()))
            .bind(("any_type", type_tags.is_empty()))
            .bind(("types", type_tags))
            .bind(("processing", TaskStatus::Processing.as_str()))
            .bind(("lease_cutoff", SurrealDatetime::from(lease_cutoff)))
            .bind(("now", SurrealDatetime::from(now)))
            .await
            .map_err(map_conflict)?
            .take(0)
            .map_err(map_conflict)?;

        let Some(candidate) = candidates.into_iter().next() else {
            return Ok(None);
        };

        let claimed: Vec<Task> = self
            .db
            .client
            .query(CLAIM_QUERY)
            .bind(("table", Task::table_name()))
            .bind(("id", candidate.id.clone()))
            .bind(("claimable", claimable))
            .bind(("processing", TaskStatus::Processing.as_str()))
            .bind(("lease_cutoff", SurrealDatetime::from(lease_cutoff)))
            .bind(("seen_retry_count", candidate.retry_count))
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("worker_id", worker_id.to_string()))
            .await
            .map_err(map_conflict)?
            .take(0)
            .map_err(map_conflict)?;

        let Some(task) = claimed.into_iter().next() else {
            return Err(AppError::LeaseConflict(format!(
                "task {} was claimed by another worker",
                candidate.id
            )));
        };

        debug!(
            task_id = %task.id,
            task_type = %task.task_type,
            attempt = task.retry_count,
            worker_id,
            "task claimed"
        );
        Ok(Some(task))
    }

    /// Loads `id` and checks that `worker_id` still holds its lease.
    async fn leased_by(&self, id: &str, worker_id: &str) -> Result<Task, AppError> {
        let current = self.get(id).await?;
        if current.status == TaskStatus::Processing
            && current.locked_by.as_deref() != Some(worker_id)
        {
            return Err(AppError::LeaseConflict(format!(
                "task {id} is leased by {}, not {worker_id}",
                current.locked_by.as_deref().unwrap_or("nobody")
            )));
        }
        Ok(current)
    }

    /// Marks a leased task `COMPLETED` and merges `result` into its metadata.
    /// Completing an already completed task returns it unchanged. Only the
    /// lease holder may complete a task.
    pub async fn complete(&self, id: &str, worker_id: &str, result: Value) -> Result<Task, AppError> {
        let current = self.leased_by(id, worker_id).await?;
        if current.status == TaskStatus::Completed {
            debug!(task_id = %id, "task already completed, ignoring");
            return Ok(current);
        }
        compute_next_state(current.status, TaskTransition::Complete)?;

        const COMPLETE_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $completed,
                metadata = $metadata,
                error_message = NONE,
                completed_at = $now,
                locked_at = NONE,
                locked_by = NONE,
                updated_at = $now
            WHERE status = $processing AND retry_count = $retry_count AND locked_by = $worker_id
            RETURN AFTER;
        "#;

        let now = Utc::now();
        let mut response = self
            .db
            .client
            .query(COMPLETE_QUERY)
            .bind(("table", Task::table_name()))
            .bind(("id", id.to_string()))
            .bind(("completed", TaskStatus::Completed.as_str()))
            .bind(("processing", TaskStatus::Processing.as_str()))
            .bind(("metadata", current.merged_metadata(result)))
            .bind(("retry_count", current.retry_count))
            .bind(("worker_id", worker_id.to_string()))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<Task> = response.take(0)?;
        match updated {
            Some(task) => Ok(task),
            None => self.settle_lost_update(id, TaskTransition::Complete).await,
        }
    }

    /// Reports a failed attempt by the lease holder. The task goes to `RETRY`
    /// while its budget allows another claim and to `FAILED` otherwise.
    pub async fn fail(&self, id: &str, worker_id: &str, error_message: &str) -> Result<Task, AppError> {
        self.record_failure(id, worker_id, error_message, false).await
    }

    /// Like [`TaskStore::fail`] but always ends in `FAILED`.
    pub async fn fail_permanently(
        &self,
        id: &str,
        worker_id: &str,
        error_message: &str,
    ) -> Result<Task, AppError> {
        self.record_failure(id, worker_id, error_message, true).await
    }

    async fn record_failure(
        &self,
        id: &str,
        worker_id: &str,
        error_message: &str,
        permanent: bool,
    ) -> Result<Task, AppError> {
        let current = self.leased_by(id, worker_id).await?;
        let transition = if !permanent && current.can_retry() {
            TaskTransition::Retry
        } else {
            TaskTransition::Fail
        };
        let next = compute_next_state(current.status, transition)?;

        let now = Utc::now();
        let scheduled_for = (next == TaskStatus::Retry).then(|| {
            SurrealDatetime::from(now + to_chrono(self.retry_policy.delay_for(current.retry_count)))
        });

        const FAIL_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $next,
                error_message = $error_message,
                scheduled_for = $scheduled_for,
                completed_at = $now,
                locked_at = NONE,
                locked_by = NONE,
                updated_at = $now
            WHERE status = $processing AND retry_count = $retry_count AND locked_by = $worker_id
            RETURN AFTER;
        "#;

        let mut response = self
            .db
            .client
            .query(FAIL_QUERY)
            .bind(("table", Task::table_name()))
            .bind(("id", id.to_string()))
            .bind(("next", next.as_str()))
            .bind(("error_message", error_message.to_string()))
            .bind(("scheduled_for", scheduled_for))
            .bind(("processing", TaskStatus::Processing.as_str()))
            .bind(("retry_count", current.retry_count))
            .bind(("worker_id", worker_id.to_string()))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<Task> = response.take(0)?;
        let Some(task) = updated else {
            return self.settle_lost_update(id, transition).await;
        };

        if task.status == TaskStatus::Failed {
            warn!(
                task_id = %task.id,
                task_type = %task.task_type,
                attempt = task.retry_count,
                error = %error_message,
                "task failed permanently"
            );
        } else {
            info!(
                task_id = %task.id,
                task_type = %task.task_type,
                attempt = task.retry_count,
                error = %error_message,
                "task scheduled for retry"
            );
        }

        Ok(task)
    }

    /// Moves a waiting or failed task back to `PENDING`, eligible after `delay`.
    /// A task revived from `FAILED` gets a fresh retry budget.
    pub async fn reschedule(&self, id: &str, delay: Duration) -> Result<Task, AppError> {
        let current = self.get(id).await?;
        compute_next_state(current.status, TaskTransition::Reschedule)?;

        let retry_count = if current.status == TaskStatus::Failed {
            0
        } else {
            current.retry_count
        };

        const RESCHEDULE_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $pending,
                scheduled_for = $scheduled_for,
                retry_count = $new_retry_count,
                completed_at = NONE,
                locked_at = NONE,
                locked_by = NONE,
                updated_at = $now
            WHERE status = $current AND retry_count = $retry_count
            RETURN AFTER;
        "#;

        let now = Utc::now();
        let mut response = self
            .db
            .client
            .query(RESCHEDULE_QUERY)
            .bind(("table", Task::table_name()))
            .bind(("id", id.to_string()))
            .bind(("pending", TaskStatus::Pending.as_str()))
            .bind(("current", current.status.as_str()))
            .bind(("retry_count", current.retry_count))
            .bind(("new_retry_count", retry_count))
            .bind(("scheduled_for", SurrealDatetime::from(now + to_chrono(delay))))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<Task> = response.take(0)?;
        match updated {
            Some(task) => Ok(task),
            None => self.settle_lost_update(id, TaskTransition::Reschedule).await,
        }
    }

    /// Hands a leased task back untouched: `PENDING`, lease cleared and the
    /// claim refunded.
    pub async fn release(&self, id: &str, worker_id: &str) -> Result<Task, AppError> {
        let current = self.leased_by(id, worker_id).await?;
        compute_next_state(current.status, TaskTransition::Release)?;

        const RELEASE_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $pending,
                retry_count = $new_retry_count,
                started_at = NONE,
                locked_at = NONE,
                locked_by = NONE,
                updated_at = $now
            WHERE status = $processing AND retry_count = $retry_count AND locked_by = $worker_id
            RETURN AFTER;
        "#;

        let mut response = self
            .db
            .client
            .query(RELEASE_QUERY)
            .bind(("table", Task::table_name()))
            .bind(("id", id.to_string()))
            .bind(("pending", TaskStatus::Pending.as_str()))
            .bind(("processing", TaskStatus::Processing.as_str()))
            .bind(("retry_count", current.retry_count))
            .bind(("worker_id", worker_id.to_string()))
            .bind(("new_retry_count", current.retry_count.saturating_sub(1)))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?;

        let updated: Option<Task> = response.take(0)?;
        match updated {
            Some(task) => Ok(task),
            None => self.settle_lost_update(id, TaskTransition::Release).await,
        }
    }

    /// A guarded update matched nothing: someone else moved the row first.
    async fn settle_lost_update(&self, id: &str, event: TaskTransition) -> Result<Task, AppError> {
        let latest = self.get(id).await?;
        if event == TaskTransition::Complete && latest.status == TaskStatus::Completed {
            return Ok(latest);
        }
        Err(AppError::InvalidTransition(format!(
            "task {id} changed concurrently (now {}, attempt {})",
            latest.status, latest.retry_count
        )))
    }

    /// Deletes `COMPLETED` and `FAILED` tasks finished more than `days` ago.
    pub async fn purge_older_than(&self, days: u32) -> Result<usize, AppError> {
        const PURGE_QUERY: &str = r#"
            DELETE type::table($table)
            WHERE status IN $terminal
              AND completed_at != NONE
              AND completed_at < $cutoff
            RETURN BEFORE;
        "#;

        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
        let mut response = self
            .db
            .client
            .query(PURGE_QUERY)
            .bind(("table", Task::table_name()))
            .bind((
                "terminal",
                vec![TaskStatus::Completed.as_str(), TaskStatus::Failed.as_str()],
            ))
            .bind(("cutoff", SurrealDatetime::from(cutoff)))
            .await?;

        let deleted: Vec<Task> = response.take(0)?;
        info!(deleted = deleted.len(), days, "purged finished tasks");
        Ok(deleted.len())
    }

    /// Tasks in queue order, optionally filtered by status.
    pub async fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>, AppError> {
        let tasks: Vec<Task> = self
            .db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE $any_status OR status = $status
                 ORDER BY priority DESC, created_at ASC
                 LIMIT $limit",
            )
            .bind(("table", Task::table_name()))
            .bind(("any_status", status.is_none()))
            .bind(("status", status.map_or("", |s| s.as_str())))
            .bind(("limit", i64::try_from(limit).unwrap_or(i64::MAX)))
            .await?
            .take(0)?;

        Ok(tasks)
    }

    pub async fn counts_by_status(&self) -> Result<HashMap<TaskStatus, usize>, AppError> {
        let rows: Vec<StatusCount> = self
            .db
            .query("SELECT status, count() AS count FROM type::table($table) GROUP BY status")
            .bind(("table", Task::table_name()))
            .await?
            .take(0)?;

        Ok(rows.into_iter().map(|row| (row.status, row.count)).collect())
    }

    /// Ids in `task.depends_on` that are not `COMPLETED` (missing ids included).
    /// Dependencies are advisory: the claim query ignores them.
    pub async fn unfinished_dependencies(&self, task: &Task) -> Result<Vec<String>, AppError> {
        let mut unfinished = Vec::new();
        for dependency in &task.depends_on {
            let done = self
                .db
                .get_item::<Task>(dependency)
                .await?
                .is_some_and(|t| t.status == TaskStatus::Completed);
            if !done {
                unfinished.push(dependency.clone());
            }
        }
        Ok(unfinished)
    }
}

#[cfg(test)]
mod tests;
