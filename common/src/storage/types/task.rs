use std::{fmt, str::FromStr};

use serde_json::{Map, Value};
use state_machines::{core::GuardError, state_machine};
use uuid::Uuid;

use crate::{error::AppError, stored_object};

pub const DEFAULT_MAX_RETRIES: i64 = 3;

/// Closed set of work a worker knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Noop,
    IngestBatch,
    IngestDocument,
    PurgeTasks,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::Noop,
        TaskType::IngestBatch,
        TaskType::IngestDocument,
        TaskType::PurgeTasks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Noop => "noop",
            TaskType::IngestBatch => "ingest_batch",
            TaskType::IngestDocument => "ingest_document",
            TaskType::PurgeTasks => "purge_tasks",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| AppError::Validation(format!("unknown task type '{s}'")))
    }
}

/// Stored as its integer value so `ORDER BY priority DESC` ranks correctly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum TaskPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl From<TaskPriority> for i64 {
    fn from(priority: TaskPriority) -> Self {
        priority as i64
    }
}

impl TryFrom<i64> for TaskPriority {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TaskPriority::Low),
            1 => Ok(TaskPriority::Normal),
            2 => Ok(TaskPriority::High),
            3 => Ok(TaskPriority::Urgent),
            other => Err(format!("invalid task priority {other}")),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Retry,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Retry => "retry",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTransition {
    Claim,
    Complete,
    Retry,
    Fail,
    Reschedule,
    Release,
}

impl TaskTransition {
    fn as_str(&self) -> &'static str {
        match self {
            TaskTransition::Claim => "claim",
            TaskTransition::Complete => "complete",
            TaskTransition::Retry => "retry",
            TaskTransition::Fail => "fail",
            TaskTransition::Reschedule => "reschedule",
            TaskTransition::Release => "release",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: TaskLifecycleMachine,
        initial: Pending,
        states: [Pending, Processing, Completed, Failed, Retry],
        events {
            claim {
                transition: { from: Pending, to: Processing }
                transition: { from: Retry, to: Processing }
            }
            complete {
                transition: { from: Processing, to: Completed }
            }
            retry {
                transition: { from: Processing, to: Retry }
            }
            fail {
                transition: { from: Processing, to: Failed }
            }
            reschedule {
                transition: { from: Retry, to: Pending }
                transition: { from: Failed, to: Pending }
            }
            release {
                transition: { from: Processing, to: Pending }
            }
        }
    }

    pub(super) fn pending() -> TaskLifecycleMachine<(), Pending> {
        TaskLifecycleMachine::new(())
    }
}

fn invalid_transition(state: TaskStatus, event: TaskTransition) -> AppError {
    AppError::InvalidTransition(format!(
        "task cannot {} while {}",
        event.as_str(),
        state.as_str()
    ))
}

fn guard_failed(state: TaskStatus, event: TaskTransition, guard: &GuardError) -> AppError {
    AppError::InvalidTransition(format!(
        "task cannot {} while {}: {guard:?}",
        event.as_str(),
        state.as_str()
    ))
}

/// Walks the lifecycle machine to validate `event` from `state` and returns the
/// resulting status.
pub fn compute_next_state(state: TaskStatus, event: TaskTransition) -> Result<TaskStatus, AppError> {
    use lifecycle::pending;

    let err = |guard: GuardError| guard_failed(state, event, &guard);
    let processing = || pending().claim().map_err(|(_, g)| err(g));

    match (state, event) {
        (TaskStatus::Pending, TaskTransition::Claim) => processing().map(|_| TaskStatus::Processing),
        (TaskStatus::Retry, TaskTransition::Claim) => processing()?
            .retry()
            .map_err(|(_, g)| err(g))?
            .claim()
            .map(|_| TaskStatus::Processing)
            .map_err(|(_, g)| err(g)),
        (TaskStatus::Processing, TaskTransition::Complete) => processing()?
            .complete()
            .map(|_| TaskStatus::Completed)
            .map_err(|(_, g)| err(g)),
        (TaskStatus::Processing, TaskTransition::Retry) => processing()?
            .retry()
            .map(|_| TaskStatus::Retry)
            .map_err(|(_, g)| err(g)),
        (TaskStatus::Processing, TaskTransition::Fail) => processing()?
            .fail()
            .map(|_| TaskStatus::Failed)
            .map_err(|(_, g)| err(g)),
        (TaskStatus::Processing, TaskTransition::Release) => processing()?
            .release()
            .map(|_| TaskStatus::Pending)
            .map_err(|(_, g)| err(g)),
        // Pushing a waiting task further out keeps it pending.
        (TaskStatus::Pending, TaskTransition::Reschedule) => Ok(TaskStatus::Pending),
        (TaskStatus::Retry, TaskTransition::Reschedule) => processing()?
            .retry()
            .map_err(|(_, g)| err(g))?
            .reschedule()
            .map(|_| TaskStatus::Pending)
            .map_err(|(_, g)| err(g)),
        (TaskStatus::Failed, TaskTransition::Reschedule) => processing()?
            .fail()
            .map_err(|(_, g)| err(g))?
            .reschedule()
            .map(|_| TaskStatus::Pending)
            .map_err(|(_, g)| err(g)),
        _ => Err(invalid_transition(state, event)),
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

stored_object!(Task, "task", {
    task_type: TaskType,
    payload: Value,
    priority: TaskPriority,
    status: TaskStatus,
    retry_count: u32,
    max_retries: u32,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(
        serialize_with = "crate::storage::types::serde_helpers::serialize_option_datetime",
        deserialize_with = "crate::storage::types::serde_helpers::deserialize_option_datetime",
        default
    )]
    scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    parent_task_id: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default = "empty_object")]
    metadata: Value,
    #[serde(
        serialize_with = "crate::storage::types::serde_helpers::serialize_option_datetime",
        deserialize_with = "crate::storage::types::serde_helpers::deserialize_option_datetime",
        default
    )]
    started_at: Option<DateTime<Utc>>,
    #[serde(
        serialize_with = "crate::storage::types::serde_helpers::serialize_option_datetime",
        deserialize_with = "crate::storage::types::serde_helpers::deserialize_option_datetime",
        default
    )]
    completed_at: Option<DateTime<Utc>>,
    #[serde(
        serialize_with = "crate::storage::types::serde_helpers::serialize_option_datetime",
        deserialize_with = "crate::storage::types::serde_helpers::deserialize_option_datetime",
        default
    )]
    locked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    locked_by: Option<String>
});

impl Task {
    /// Whether another failure still leaves room for a re-attempt.
    pub fn can_retry(&self) -> bool {
        self.retry_count <= self.max_retries
    }

    /// Merges a handler result into `metadata`: object keys are copied over,
    /// anything else lands under `result`.
    pub fn merged_metadata(&self, result: Value) -> Value {
        let mut merged = match &self.metadata {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("previous".to_string(), other.clone());
                map
            }
        };

        match result {
            Value::Object(map) => merged.extend(map),
            Value::Null => {}
            other => {
                merged.insert("result".to_string(), other);
            }
        }

        Value::Object(merged)
    }
}

/// Input for [`crate::storage::task_store::TaskStore::create`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub task_type: TaskType,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "empty_object")]
    pub metadata: Value,
}

fn default_max_retries() -> i64 {
    DEFAULT_MAX_RETRIES
}

impl NewTask {
    pub fn new(task_type: TaskType, payload: Value) -> Self {
        Self {
            task_type,
            payload,
            priority: TaskPriority::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            scheduled_for: None,
            parent_task_id: None,
            depends_on: Vec::new(),
            metadata: empty_object(),
        }
    }

    /// Parses the type tag, rejecting anything outside [`TaskType`].
    pub fn from_tag(task_type: &str, payload: Value) -> Result<Self, AppError> {
        Ok(Self::new(task_type.parse()?, payload))
    }

    #[must_use]
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    #[must_use]
    pub fn depends_on(mut self, ids: Vec<String>) -> Self {
        self.depends_on = ids;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Validates the request and builds a fresh `PENDING` row stamped at `now`.
    pub fn into_task(self, now: DateTime<Utc>) -> Result<Task, AppError> {
        let max_retries = u32::try_from(self.max_retries).map_err(|_| {
            AppError::Validation(format!(
                "max_retries must be between 0 and {}, got {}",
                u32::MAX,
                self.max_retries
            ))
        })?;

        let metadata = match self.metadata {
            Value::Null => empty_object(),
            Value::Object(map) => Value::Object(map),
            other => {
                return Err(AppError::Validation(format!(
                    "task metadata must be an object, got {other}"
                )))
            }
        };

        Ok(Task {
            id: Uuid::new_v4().to_string(),
            task_type: self.task_type,
            payload: self.payload,
            priority: self.priority,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries,
            error_message: None,
            scheduled_for: self.scheduled_for,
            parent_task_id: self.parent_task_id,
            depends_on: self.depends_on,
            metadata,
            started_at: None,
            completed_at: None,
            locked_at: None,
            locked_by: None,
            created_at: now,
            updated_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_type_parses_known_tags_only() {
        assert_eq!("noop".parse::<TaskType>().ok(), Some(TaskType::Noop));
        assert_eq!(
            " ingest_document ".parse::<TaskType>().ok(),
            Some(TaskType::IngestDocument)
        );
        assert!(matches!(
            "send_email".parse::<TaskType>(),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn priority_orders_and_serializes_as_integer() {
        assert!(TaskPriority::Urgent > TaskPriority::High);
        assert!(TaskPriority::Normal > TaskPriority::Low);
        assert_eq!(serde_json::to_value(TaskPriority::High).unwrap(), json!(2));
        assert_eq!(
            serde_json::from_value::<TaskPriority>(json!(3)).unwrap(),
            TaskPriority::Urgent
        );
        assert!(serde_json::from_value::<TaskPriority>(json!(9)).is_err());
    }

    #[test]
    fn new_task_rejects_negative_retries() {
        let err = NewTask::new(TaskType::Noop, json!({}))
            .with_max_retries(-1)
            .into_task(Utc::now())
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn new_task_defaults() {
        let now = Utc::now();
        let task = NewTask::new(TaskType::Noop, json!({"a": 1}))
            .into_task(now)
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.priority, TaskPriority::Normal);
        assert_eq!(task.metadata, json!({}));
        assert_eq!(task.created_at, now);
        assert!(task.locked_at.is_none());
    }

    #[test]
    fn lifecycle_allows_only_listed_transitions() {
        use TaskStatus::*;
        use TaskTransition as T;

        assert_eq!(compute_next_state(Pending, T::Claim).unwrap(), Processing);
        assert_eq!(compute_next_state(Retry, T::Claim).unwrap(), Processing);
        assert_eq!(compute_next_state(Processing, T::Complete).unwrap(), Completed);
        assert_eq!(compute_next_state(Processing, T::Retry).unwrap(), Retry);
        assert_eq!(compute_next_state(Failed, T::Reschedule).unwrap(), Pending);
        assert_eq!(compute_next_state(Processing, T::Release).unwrap(), Pending);

        assert!(compute_next_state(Completed, T::Complete).is_err());
        assert!(compute_next_state(Completed, T::Reschedule).is_err());
        assert!(compute_next_state(Pending, T::Fail).is_err());
    }

    #[test]
    fn merged_metadata_keeps_existing_keys() {
        let task = NewTask::new(TaskType::Noop, Value::Null)
            .with_metadata(json!({"progress": 50}))
            .into_task(Utc::now())
            .unwrap();

        assert_eq!(
            task.merged_metadata(json!({"ok": true})),
            json!({"progress": 50, "ok": true})
        );
        assert_eq!(
            task.merged_metadata(json!(7)),
            json!({"progress": 50, "result": 7})
        );
    }
}
