use std::{str::FromStr, sync::Arc};

use anyhow::Context;
use clap::Parser;
use common::{
    storage::{db::SurrealDbClient, task_store::TaskStore, types::task::TaskType},
    utils::config::get_config,
};
use ingestion_pipeline::{IngestBatchHandler, IngestDocumentHandler, IngestionSupervisor};
use task_worker::{
    handlers::{NoopHandler, PurgeTasksHandler},
    shutdown::spawn_signal_listener,
    HandlerRegistry, Worker, WorkerConfig,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "worker", about = "Claims and executes queued tasks")]
struct Args {
    /// Comma separated task types to claim; every registered type when empty
    #[arg(long, env = "WORKER_TASK_TYPES", value_delimiter = ',')]
    task_types: Vec<String>,

    /// Exit after this many tasks
    #[arg(long, env = "WORKER_MAX_TASKS")]
    max_tasks: Option<usize>,

    #[arg(long, env = "WORKER_ID")]
    worker_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let args = Args::parse();
    let config = get_config().context("loading configuration")?;

    let task_types = args
        .task_types
        .iter()
        .filter(|name| !name.trim().is_empty())
        .map(|name| TaskType::from_str(name))
        .collect::<Result<Vec<_>, _>>()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await
        .context("connecting to surrealdb")?,
    );
    db.ensure_initialized().await?;

    let store = TaskStore::new(Arc::clone(&db));
    let supervisor = Arc::new(IngestionSupervisor::new(Arc::clone(&db), &config).await?);

    let registry = HandlerRegistry::new()
        .with(TaskType::Noop, Arc::new(NoopHandler))
        .with(TaskType::PurgeTasks, Arc::new(PurgeTasksHandler::new(store.clone())))
        .with(
            TaskType::IngestBatch,
            Arc::new(IngestBatchHandler::new(Arc::clone(&supervisor))),
        )
        .with(
            TaskType::IngestDocument,
            Arc::new(IngestDocumentHandler::new(supervisor)),
        );

    let mut worker_config = WorkerConfig::from_app_config(&config);
    worker_config.task_types = task_types;
    worker_config.max_tasks = args.max_tasks;
    if let Some(worker_id) = args.worker_id {
        worker_config.worker_id = worker_id;
    }

    let shutdown = CancellationToken::new();
    let signals = spawn_signal_listener(shutdown.clone());

    let worker = Worker::new(store, Arc::new(registry), worker_config)?.with_shutdown(shutdown.clone());
    info!(worker_id = %worker.worker_id(), "worker starting");

    worker.run().await;

    shutdown.cancel();
    signals.await.ok();
    Ok(())
}
