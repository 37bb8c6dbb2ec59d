use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::types::task::{Task, TaskType},
};
use serde_json::Value;

/// Executes one task type. The returned value is merged into the task's
/// metadata on success; an error fails the attempt.
///
/// A handler that overruns its timeout is aborted at its next await point;
/// one still running when the shutdown grace period ends is left behind.
/// Either way the task can be claimed again, so handlers must be safe to rerun.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<Value, AppError>;
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `task_type`, replacing any earlier one.
    pub fn register(&mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(task_type, handler);
        self
    }

    #[must_use]
    pub fn with(mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(task_type, handler);
        self
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).map(Arc::clone)
    }

    pub fn contains(&self, task_type: TaskType) -> bool {
        self.handlers.contains_key(&task_type)
    }

    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    /// Startup check that every requested type has a handler.
    pub fn ensure_registered(&self, requested: &[TaskType]) -> Result<(), AppError> {
        let missing: Vec<&str> = requested
            .iter()
            .filter(|t| !self.contains(**t))
            .map(TaskType::as_str)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(AppError::Config(format!(
                "no handler registered for task type(s): {}",
                missing.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::NoopHandler;

    #[test]
    fn lookup_and_validation() {
        let registry = HandlerRegistry::new().with(TaskType::Noop, Arc::new(NoopHandler));

        assert!(registry.get(TaskType::Noop).is_some());
        assert!(registry.get(TaskType::IngestBatch).is_none());
        assert_eq!(registry.task_types(), vec![TaskType::Noop]);

        assert!(registry.ensure_registered(&[TaskType::Noop]).is_ok());
        let err = registry
            .ensure_registered(&[TaskType::Noop, TaskType::PurgeTasks])
            .unwrap_err();
        assert!(matches!(err, AppError::Config(msg) if msg.contains("purge_tasks")));
    }
}
