use std::sync::Arc;

use common::error::AppError;
use tokio::sync::Semaphore;

/// Bounded pool for CPU heavy stages such as text extraction and entity
/// tagging. Separate from the download permits, so parsing a large PDF never
/// holds up network I/O.
#[derive(Clone, Debug)]
pub struct CpuPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl CpuPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs `job` on the blocking thread pool once a permit is free. The
    /// permit travels with the job, so it is held until the job returns even
    /// if the caller stops waiting.
    pub async fn run<F, T>(&self, job: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Result<T, AppError> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| AppError::InternalError("cpu pool closed".into()))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await?
    }
}

impl Default for CpuPool {
    fn default() -> Self {
        let size = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self::new(size)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[tokio::test]
    async fn never_runs_more_jobs_than_permits() {
        let pool = CpuPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs = (0..6).map(|_| {
            let pool = pool.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                pool.run(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }
        });

        for result in futures::future::join_all(jobs).await {
            result.expect("job");
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn job_errors_are_returned() {
        let pool = CpuPool::new(1);
        let err = pool
            .run(|| -> Result<(), AppError> { Err(AppError::Validation("bad input".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
