use std::sync::Arc;

use anyhow::Context;
use common::{storage::db::SurrealDbClient, utils::config::get_config};
use ingestion_pipeline::IngestionSupervisor;
use task_worker::shutdown::spawn_signal_listener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Drains the download queue on its own schedule, without the task queue.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config().context("loading configuration")?;

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

    let supervisor = IngestionSupervisor::new(db, &config).await?;

    let shutdown = CancellationToken::new();
    let signals = spawn_signal_listener(shutdown.clone());

    supervisor.run(shutdown.clone()).await;

    shutdown.cancel();
    signals.await.ok();
    Ok(())
}
