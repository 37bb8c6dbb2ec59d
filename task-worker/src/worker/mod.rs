use std::{sync::Arc, time::Duration};

use common::{
    error::AppError,
    storage::{
        task_store::TaskStore,
        types::task::{Task, TaskType},
    },
    utils::config::AppConfig,
};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    sync::watch,
    task::JoinError,
    time::{sleep, timeout_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::registry::HandlerRegistry;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Types this worker claims. Empty means every registered type.
    pub task_types: Vec<TaskType>,
    pub poll_interval: Duration,
    pub task_timeout: Duration,
    pub lease_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// Ceiling for the store-error backoff.
    pub max_backoff: Duration,
    pub max_tasks: Option<usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            task_types: Vec::new(),
            poll_interval: Duration::from_secs(1),
            task_timeout: Duration::from_secs(300),
            lease_timeout: Duration::from_secs(600),
            shutdown_timeout: Duration::from_secs(30),
            max_backoff: Duration::from_secs(60),
            max_tasks: None,
        }
    }
}

impl WorkerConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            task_timeout: config.task_timeout(),
            lease_timeout: config.lease_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Claiming,
    Executing,
    Completing,
    Failing,
    Stopping,
    Stopped,
}

/// Totals for one `run`. `failed` includes the attempts in `timed_out`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
}

/// Remote control for a running [`Worker`].
#[derive(Clone)]
pub struct WorkerHandle {
    shutdown: CancellationToken,
    state: watch::Receiver<WorkerState>,
}

impl WorkerHandle {
    /// Asks the worker to stop after its in-flight task.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    /// Resolves once the worker reports `target`, or when the worker is gone.
    pub async fn wait_for(&self, target: WorkerState) {
        let mut rx = self.state.clone();
        let _ = rx.wait_for(|state| *state == target).await;
    }
}

enum Outcome {
    Finished(Result<Result<Value, AppError>, JoinError>),
    TimedOut,
    Abandoned,
}

/// Polls the task store, runs claimed tasks through their handlers and
/// reports the outcome back.
pub struct Worker {
    store: TaskStore,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    claim_types: Vec<TaskType>,
    shutdown: CancellationToken,
    state: watch::Sender<WorkerState>,
}

impl Worker {
    /// Fails with a configuration error if `config.task_types` names a type
    /// without a handler or the poll interval is zero.
    pub fn new(
        store: TaskStore,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Result<Self, AppError> {
        registry.ensure_registered(&config.task_types)?;
        if config.poll_interval.is_zero() {
            return Err(AppError::Config("worker poll interval must be greater than zero".into()));
        }

        let claim_types = if config.task_types.is_empty() {
            registry.task_types()
        } else {
            config.task_types.clone()
        };
        if claim_types.is_empty() {
            return Err(AppError::Config("worker has no task handlers registered".into()));
        }

        let (state, _) = watch::channel(WorkerState::Idle);

        Ok(Self {
            store,
            registry,
            config,
            claim_types,
            shutdown: CancellationToken::new(),
            state,
        })
    }

    /// Shares an externally owned shutdown token, e.g. one wired to signals.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shutdown: self.shutdown.clone(),
            state: self.state.subscribe(),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    /// Runs until stopped or until `max_tasks` tasks have been handled.
    #[instrument(skip_all, fields(worker_id = %self.config.worker_id))]
    pub async fn run(self) -> WorkerReport {
        let mut report = WorkerReport::default();
        let mut backoff = self.config.poll_interval;

        info!(
            task_types = ?self.claim_types,
            max_tasks = ?self.config.max_tasks,
            "worker started"
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if self
                .config
                .max_tasks
                .is_some_and(|max| report.claimed >= max)
            {
                info!(processed = report.claimed, "task limit reached");
                break;
            }

            self.set_state(WorkerState::Claiming);
            let claimed = self
                .store
                .claim_next(
                    &self.claim_types,
                    &self.config.worker_id,
                    self.config.lease_timeout,
                )
                .await;

            match claimed {
                Ok(Some(task)) => {
                    backoff = self.config.poll_interval;

                    if self.shutdown.is_cancelled() {
                        self.hand_back(&task).await;
                        break;
                    }

                    report.claimed += 1;
                    self.execute(task, &mut report).await;
                    self.set_state(WorkerState::Idle);
                }
                Ok(None) => {
                    backoff = self.config.poll_interval;
                    self.set_state(WorkerState::Idle);
                    if self.pause(self.config.poll_interval).await {
                        break;
                    }
                }
                Err(err) => {
                    error!(error = %err, retry_in = ?backoff, "failed to claim task");
                    self.set_state(WorkerState::Idle);
                    if self.pause(backoff).await {
                        break;
                    }
                    backoff = next_backoff(backoff, self.config.max_backoff);
                }
            }
        }

        self.set_state(WorkerState::Stopping);
        info!(
            claimed = report.claimed,
            completed = report.completed,
            failed = report.failed,
            timed_out = report.timed_out,
            "worker stopped"
        );
        self.set_state(WorkerState::Stopped);
        report
    }

    /// Sleeps for `duration`; returns true if shutdown was requested meanwhile.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            () = sleep(duration) => false,
            () = self.shutdown.cancelled() => true,
        }
    }

    async fn hand_back(&self, task: &Task) {
        match self.store.release(&task.id, &self.config.worker_id).await {
            Ok(_) => debug!(task_id = %task.id, "released task claimed during shutdown"),
            Err(err) => warn!(task_id = %task.id, error = %err, "could not release task"),
        }
    }

    #[instrument(
        skip_all,
        fields(task_id = %task.id, task_type = %task.task_type, attempt = task.retry_count)
    )]
    async fn execute(&self, task: Task, report: &mut WorkerReport) {
        let task_id = task.id.clone();

        let Some(handler) = self.registry.get(task.task_type) else {
            error!("no handler registered, failing task");
            self.set_state(WorkerState::Failing);
            let message = format!("no handler registered for task type {}", task.task_type);
            self.report_failure(&task_id, &message, true).await;
            report.failed += 1;
            return;
        };

        self.set_state(WorkerState::Executing);
        debug!("dispatching task");

        let deadline = Instant::now() + self.config.task_timeout;
        let mut run = tokio::spawn(async move { handler.handle(&task).await });

        let first = tokio::select! {
            res = timeout_at(deadline, &mut run) => Some(res),
            () = self.shutdown.cancelled() => None,
        };

        let outcome = match first {
            Some(Ok(result)) => Outcome::Finished(result),
            Some(Err(_)) => Outcome::TimedOut,
            None => {
                self.set_state(WorkerState::Stopping);
                info!(grace = ?self.config.shutdown_timeout, "shutdown requested, waiting for in-flight task");
                let grace = (Instant::now() + self.config.shutdown_timeout).min(deadline);
                match timeout_at(grace, &mut run).await {
                    Ok(result) => Outcome::Finished(result),
                    Err(_) if grace >= deadline => Outcome::TimedOut,
                    Err(_) => Outcome::Abandoned,
                }
            }
        };

        match outcome {
            Outcome::Finished(Ok(Ok(value))) => {
                self.set_state(WorkerState::Completing);
                match self.store.complete(&task_id, &self.config.worker_id, value).await {
                    Ok(_) => {
                        report.completed += 1;
                        info!("task completed");
                    }
                    Err(err) => error!(error = %err, "failed to record task completion"),
                }
            }
            Outcome::Finished(Ok(Err(err))) => {
                self.set_state(WorkerState::Failing);
                warn!(error = %err, "task handler failed");
                self.report_failure(&task_id, &err.to_string(), err.is_permanent())
                    .await;
                report.failed += 1;
            }
            Outcome::Finished(Err(join_err)) => {
                self.set_state(WorkerState::Failing);
                error!(error = %join_err, "task handler panicked");
                let err = AppError::Handler(format!("handler panicked: {join_err}"));
                self.report_failure(&task_id, &err.to_string(), false).await;
                report.failed += 1;
            }
            Outcome::TimedOut => {
                run.abort();
                self.set_state(WorkerState::Failing);
                let err = AppError::Timeout(self.config.task_timeout);
                warn!(error = %err, "task exceeded its timeout, abandoning handler");
                self.report_failure(&task_id, &err.to_string(), false).await;
                report.failed += 1;
                report.timed_out += 1;
            }
            Outcome::Abandoned => {
                warn!("shutdown grace period elapsed, leaving task to lease expiry");
            }
        }
    }

    async fn report_failure(&self, task_id: &str, message: &str, permanent: bool) {
        let result = if permanent {
            self.store.fail_permanently(task_id, &self.config.worker_id, message).await
        } else {
            self.store.fail(task_id, &self.config.worker_id, message).await
        };

        if let Err(err) = result {
            error!(task_id, error = %err, "failed to record task failure");
        }
    }
}

/// Smallest step the store-error backoff doubles from.
const MIN_STORE_BACKOFF: Duration = Duration::from_secs(1);

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.max(MIN_STORE_BACKOFF).saturating_mul(2).min(max)
}
