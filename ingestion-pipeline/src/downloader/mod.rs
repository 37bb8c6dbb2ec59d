use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use common::{
    error::AppError,
    storage::types::download_queue_item::DownloadQueueItem,
    utils::{config::AppConfig, rate_limiter::RateLimiter},
};
use reqwest::{
    header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER},
    StatusCode,
};
use sha2::{Digest, Sha256};
use tokio::{io::AsyncWriteExt, sync::Semaphore, time::sleep};
use tracing::{debug, info, instrument, warn};
use url::Url;

const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    pub scratch_dir: PathBuf,
    /// Simultaneous downloads across every caller of this downloader.
    pub concurrency: usize,
    /// Attempts per document, including the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub request_timeout: Duration,
    /// Appended as the `api_key` query parameter when set.
    pub api_key: Option<String>,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            scratch_dir: PathBuf::from("./data/scratch"),
            concurrency: 4,
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            request_timeout: Duration::from_secs(120),
            api_key: None,
        }
    }
}

impl DownloaderConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            scratch_dir: config.scratch_path(),
            concurrency: config.download_concurrency,
            max_retries: config.download_max_retries,
            api_key: config.document_api_key.clone(),
            ..Self::default()
        }
    }
}

/// A fully written file in the scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub file_path: PathBuf,
    pub content_length: u64,
    pub content_type: String,
}

enum FetchError {
    RateLimited(Option<Duration>),
    Failed(AppError),
}

impl From<AppError> for FetchError {
    fn from(err: AppError) -> Self {
        FetchError::Failed(err)
    }
}

pub struct DocumentDownloader {
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    limiter: Arc<RateLimiter>,
    config: DownloaderConfig,
}

impl DocumentDownloader {
    pub fn new(config: DownloaderConfig, limiter: Arc<RateLimiter>) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            limiter,
            config,
        })
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    pub async fn download_item(&self, item: &DownloadQueueItem) -> Result<DownloadedFile, AppError> {
        self.download(&item.package_id, &item.download_link).await
    }

    /// Fetches `link` into the scratch directory, retrying with backoff.
    /// Every failure, including a persistent 4xx, uses up the full attempt
    /// budget before the error is returned.
    #[instrument(skip_all, fields(package_id = %package_id))]
    pub async fn download(&self, package_id: &str, link: &str) -> Result<DownloadedFile, AppError> {
        let url = self.request_url(link)?;
        let endpoint = endpoint_key(&url);

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AppError::InternalError("download permits closed".into()))?;

        tokio::fs::create_dir_all(&self.config.scratch_dir).await?;

        let attempts = self.config.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.backoff(attempt);
                debug!(attempt, delay_ms = delay.as_millis(), "backing off before retry");
                sleep(delay).await;
            }

            self.limiter.acquire(&endpoint).await;

            match self.fetch_once(&url, package_id).await {
                Ok(file) => {
                    info!(
                        attempt,
                        bytes = file.content_length,
                        content_type = %file.content_type,
                        "document downloaded"
                    );
                    return Ok(file);
                }
                Err(FetchError::RateLimited(reset)) => {
                    let wait = reset.unwrap_or_else(|| self.backoff(attempt.saturating_add(1)));
                    warn!(attempt, %endpoint, wait_ms = wait.as_millis(), "rate limited by endpoint");
                    self.limiter.defer(&endpoint, wait).await;
                    last_error = format!("rate limited by {endpoint}");
                }
                Err(FetchError::Failed(err)) => {
                    warn!(attempt, error = %err, "download attempt failed");
                    last_error = err.to_string();
                }
            }
        }

        Err(AppError::stage(
            "download",
            format!("{package_id}: giving up after {attempts} attempts: {last_error}"),
        ))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt);
        self.config
            .base_delay
            .saturating_mul(factor)
            .min(self.config.max_delay)
    }

    fn request_url(&self, link: &str) -> Result<Url, AppError> {
        let mut url = Url::parse(link)
            .map_err(|err| AppError::Validation(format!("invalid download link '{link}': {err}")))?;

        match url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(AppError::Validation(format!(
                    "unsupported download scheme '{scheme}'"
                )))
            }
        }

        if let Some(key) = &self.config.api_key {
            url.query_pairs_mut().append_pair("api_key", key);
        }

        Ok(url)
    }

    async fn fetch_once(&self, url: &Url, package_id: &str) -> Result<DownloadedFile, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(AppError::from)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited(reset_window(
                response.headers(),
                Utc::now(),
            )));
        }
        if !status.is_success() {
            return Err(AppError::stage("download", format!("HTTP {status}")).into());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| {
                mime_guess::from_path(url.path())
                    .first_or_octet_stream()
                    .to_string()
            });

        let extension = extension_for(&content_type, url);
        let final_path = self
            .config
            .scratch_dir
            .join(format!("{}.{extension}", file_stem(package_id)));
        let part_path = final_path.with_extension(format!("{extension}.part"));

        let content_length = match write_body(response, &part_path).await {
            Ok(written) => written,
            Err(err) => {
                let _ = tokio::fs::remove_file(&part_path).await;
                return Err(err.into());
            }
        };
        tokio::fs::rename(&part_path, &final_path)
            .await
            .map_err(AppError::from)?;

        Ok(DownloadedFile {
            file_path: final_path,
            content_length,
            content_type,
        })
    }
}

async fn write_body(mut response: reqwest::Response, path: &Path) -> Result<u64, AppError> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written: u64 = 0;

    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        written = written.saturating_add(chunk.len() as u64);
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

/// Rate limit endpoints share a slot per host and port.
fn endpoint_key(url: &Url) -> String {
    format!(
        "{}:{}",
        url.host_str().unwrap_or("unknown"),
        url.port_or_known_default().unwrap_or(0)
    )
}

/// How long a 429 asks us to stay away: `Retry-After` in seconds, or an
/// `X-RateLimit-Reset` epoch timestamp.
fn reset_window(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
    };

    if let Some(seconds) = header(RETRY_AFTER.as_str()) {
        return Some(Duration::from_secs(seconds));
    }

    header(RATE_LIMIT_RESET_HEADER).map(|reset_at| {
        let now = u64::try_from(now.timestamp()).unwrap_or(0);
        Duration::from_secs(reset_at.saturating_sub(now))
    })
}

fn extension_for(content_type: &str, url: &Url) -> String {
    let from_mime = content_type
        .parse::<mime::Mime>()
        .ok()
        .and_then(|parsed| match parsed.essence_str() {
            "application/pdf" => Some("pdf".to_string()),
            "text/html" | "application/xhtml+xml" => Some("html".to_string()),
            "text/plain" => Some("txt".to_string()),
            "text/xml" | "application/xml" => Some("xml".to_string()),
            "application/json" => Some("json".to_string()),
            "text/csv" => Some("csv".to_string()),
            "text/markdown" => Some("md".to_string()),
            "application/octet-stream" => None,
            _ => mime_guess::get_mime_extensions(&parsed)
                .and_then(|extensions| extensions.first())
                .map(|ext| (*ext).to_string()),
        });

    from_mime
        .or_else(|| {
            Path::new(url.path())
                .extension()
                .and_then(|ext| ext.to_str())
                .map(str::to_ascii_lowercase)
        })
        .unwrap_or_else(|| "bin".to_string())
}

/// Filesystem-safe name for `package_id`. Ids that needed rewriting get a
/// short digest of the original so `a.b` and `a_b` land on different files.
fn file_stem(package_id: &str) -> String {
    let safe: String = package_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if safe == package_id && !safe.is_empty() {
        return safe;
    }

    let digest = Sha256::digest(package_id.as_bytes());
    let suffix: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("{safe}-{suffix}")
}
