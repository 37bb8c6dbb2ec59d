use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{task_store::TaskStore, types::task::Task},
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::instrument;

use crate::registry::TaskHandler;

/// Always succeeds. Handy for smoke tests and liveness checks.
pub struct NoopHandler;

#[async_trait]
impl TaskHandler for NoopHandler {
    async fn handle(&self, _task: &Task) -> Result<Value, AppError> {
        Ok(json!({ "ok": true }))
    }
}

#[derive(Debug, Deserialize)]
struct PurgePayload {
    days: u32,
}

/// Deletes finished tasks older than `payload.days`.
pub struct PurgeTasksHandler {
    store: TaskStore,
}

impl PurgeTasksHandler {
    pub fn new(store: TaskStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TaskHandler for PurgeTasksHandler {
    #[instrument(skip_all, fields(task_id = %task.id))]
    async fn handle(&self, task: &Task) -> Result<Value, AppError> {
        let payload: PurgePayload = serde_json::from_value(task.payload.clone())
            .map_err(|err| AppError::Validation(format!("invalid purge payload: {err}")))?;

        let deleted = self.store.purge_older_than(payload.days).await?;
        Ok(json!({ "deleted": deleted }))
    }
}
