mod config;
mod context;
mod services;
mod stages;
mod state;

pub use config::IngestionConfig;
#[allow(clippy::module_name_repetitions)]
pub use services::{DefaultPipelineServices, PipelineServices};

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{download_queue_item::DownloadQueueItem, extracted_document::ExtractedDocument},
    },
    utils::config::AppConfig,
};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::{
    context::PipelineContext,
    stages::{analyze, download, extract, persist},
    state::ready,
};

/// `tokio::time::interval` panics on a zero period.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Leases batches from the download queue and drives every document through
/// download, extraction, analysis and persistence. A failing document is
/// recorded against its own queue row; the rest of the batch carries on.
pub struct IngestionSupervisor {
    db: Arc<SurrealDbClient>,
    config: IngestionConfig,
    services: Arc<dyn PipelineServices>,
}

impl IngestionSupervisor {
    pub async fn new(db: Arc<SurrealDbClient>, app_config: &AppConfig) -> Result<Self, AppError> {
        let services = DefaultPipelineServices::from_config(app_config, Arc::clone(&db)).await?;
        Ok(Self::with_services(
            db,
            IngestionConfig::from_app_config(app_config),
            Arc::new(services),
        ))
    }

    pub fn with_services(
        db: Arc<SurrealDbClient>,
        config: IngestionConfig,
        services: Arc<dyn PipelineServices>,
    ) -> Self {
        Self {
            db,
            config,
            services,
        }
    }

    pub fn config(&self) -> &IngestionConfig {
        &self.config
    }

    /// Claims up to `batch_size` queue rows, processes them concurrently and
    /// records every outcome in one update.
    #[tracing::instrument(skip_all, fields(worker_id = %self.config.worker_id))]
    pub async fn run_batch(&self) -> Result<BatchReport, AppError> {
        let items = DownloadQueueItem::claim_batch(
            &self.db,
            self.config.batch_size,
            &self.config.worker_id,
            self.config.lease_timeout,
            Utc::now(),
        )
        .await?;

        if items.is_empty() {
            debug!("download queue empty");
            return Ok(BatchReport::default());
        }

        let claimed = items.len();
        let started = Instant::now();

        let outcomes: Vec<(String, Result<ExtractedDocument, AppError>)> = stream::iter(items)
            .map(|item| async move {
                let outcome = self
                    .process_document(&item.package_id, &item.download_link, &item.collection)
                    .await;
                (item.id, outcome)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut completed = Vec::new();
        let mut failed = Vec::new();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(_) => completed.push(id),
                Err(err) => failed.push((id, err.to_string())),
            }
        }

        DownloadQueueItem::mark_finished(&self.db, &completed, &failed).await?;

        let report = BatchReport {
            claimed,
            succeeded: completed.len(),
            failed: failed.len(),
        };
        info!(
            claimed = report.claimed,
            succeeded = report.succeeded,
            failed = report.failed,
            elapsed_ms = duration_millis(started.elapsed()),
            "ingestion batch finished"
        );
        Ok(report)
    }

    /// Runs a batch every `interval` until `shutdown` fires. A batch that is
    /// already running is allowed to finish.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            worker_id = %self.config.worker_id,
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "ingestion supervisor started"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.run_batch().await {
                        warn!(error = %err, "ingestion batch failed");
                    }
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "ingestion supervisor stopped");
    }

    /// Single document pipeline. The downloaded file is removed before this
    /// returns, on success and on failure.
    #[tracing::instrument(skip_all, fields(package_id = %package_id, collection = %collection))]
    pub async fn process_document(
        &self,
        package_id: &str,
        download_link: &str,
        collection: &str,
    ) -> Result<ExtractedDocument, AppError> {
        let mut ctx = PipelineContext::new(
            package_id,
            download_link,
            collection,
            self.services.as_ref(),
        );
        let started = Instant::now();

        let machine = ready();
        let machine = download(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let machine = extract(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let machine = analyze(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let (_machine, stored) = persist(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;

        debug!(
            package_id,
            total_ms = duration_millis(started.elapsed()),
            "document pipeline finished"
        );
        Ok(stored)
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
