//! Batch download engine with bounded concurrency and per-task timeouts.
//!
//! A batch is a set of (url, destination) tasks submitted together — all
//! attachments for one lesson, or all assets for one page. At most
//! [`MAX_CONCURRENT_TRANSFERS`](super::MAX_CONCURRENT_TRANSFERS) transfers are
//! in flight at once; each task gets its own timeout window covering slot wait
//! plus every retry attempt, and a task that exhausts its budget is logged and
//! dropped without disturbing the rest of the batch.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{COOKIE, HeaderMap, HeaderValue, USER_AGENT};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use url::Url;

use super::retry::{RetryPolicy, retry_with_policy};
use super::{DownloadError, MAX_CONCURRENT_TRANSFERS, TASK_TIMEOUT, WRITE_BUFFER_BYTES};
use crate::config::Credentials;

/// HTTP connect timeout for transfer clients.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// One (source URL, destination path) pair in a batch. Tasks have no identity
/// beyond this pair.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    /// Source URL.
    pub url: String,
    /// Exact destination file path.
    pub dest: PathBuf,
}

impl DownloadTask {
    /// Creates a task.
    #[must_use]
    pub fn new(url: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            dest: dest.into(),
        }
    }
}

/// Statistics from one batch run.
///
/// Uses atomic counters so concurrent transfer tasks can update them without
/// locking.
#[derive(Debug, Default)]
pub struct BatchStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
}

impl BatchStats {
    /// Number of tasks whose destination file was fully written.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Number of tasks dropped after exhausting their budget or timing out.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    fn increment_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Builds the HTTP client carrying the fixed request identity.
///
/// Every request this client sends has the cookie and user-agent headers from
/// the credential bundle attached.
pub(crate) fn build_identity_client(credentials: &Credentials) -> Result<Client, DownloadError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        COOKIE,
        HeaderValue::from_str(&credentials.cookie_header())
            .map_err(|e| DownloadError::credentials(format!("cookie header: {e}")))?,
    );
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(credentials.user_agent())
            .map_err(|e| DownloadError::credentials(format!("user-agent header: {e}")))?,
    );

    Client::builder()
        .default_headers(headers)
        .connect_timeout(CONNECT_TIMEOUT)
        .gzip(true)
        .build()
        .map_err(|e| DownloadError::credentials(format!("client build: {e}")))
}

/// Concurrent batch fetcher for plain file URLs.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    semaphore: Arc<Semaphore>,
    policy: RetryPolicy,
    task_timeout: Duration,
}

impl Downloader {
    /// Creates a downloader with the default concurrency bound, retry policy,
    /// and per-task timeout.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Credentials`] when the bundle cannot be
    /// expressed as request headers.
    pub fn new(credentials: &Credentials) -> Result<Self, DownloadError> {
        Self::with_limits(credentials, RetryPolicy::default(), TASK_TIMEOUT)
    }

    /// Creates a downloader with an explicit retry policy and task timeout.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Credentials`] when the bundle cannot be
    /// expressed as request headers.
    pub fn with_limits(
        credentials: &Credentials,
        policy: RetryPolicy,
        task_timeout: Duration,
    ) -> Result<Self, DownloadError> {
        Ok(Self {
            client: build_identity_client(credentials)?,
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_TRANSFERS)),
            policy,
            task_timeout,
        })
    }

    /// Runs a whole batch to completion and reports what happened.
    ///
    /// Individual task failures never fail the batch; they are logged exactly
    /// once as exhausted and counted in the returned stats.
    pub async fn run_batch(&self, tasks: Vec<DownloadTask>) -> BatchStats {
        let stats = Arc::new(BatchStats::default());
        if tasks.is_empty() {
            return unwrap_stats(stats);
        }

        info!(tasks = tasks.len(), "starting download batch");
        let mut handles = Vec::with_capacity(tasks.len());

        for task in tasks {
            let client = self.client.clone();
            let semaphore = Arc::clone(&self.semaphore);
            let policy = self.policy.clone();
            let stats = Arc::clone(&stats);
            let task_timeout = self.task_timeout;

            handles.push(tokio::spawn(async move {
                // The timeout window opens at task start: slot wait and every
                // retry attempt all count against it.
                let attempt_task = async {
                    // The semaphore is never closed; a failed acquire would
                    // only mean the engine itself is gone.
                    let _permit = semaphore.acquire_owned().await.ok();
                    retry_with_policy(&policy, |attempt| {
                        debug!(url = %task.url, attempt, "attempting download");
                        transfer(&client, &task.url, &task.dest)
                    })
                    .await
                };

                match tokio::time::timeout(task_timeout, attempt_task).await {
                    Ok(Ok(bytes)) => {
                        info!(url = %task.url, path = %task.dest.display(), bytes, "download complete");
                        stats.increment_completed();
                    }
                    Ok(Err((error, attempts))) => {
                        warn!(
                            url = %task.url,
                            path = %task.dest.display(),
                            %error,
                            attempts,
                            "download failed after all attempts"
                        );
                        stats.increment_failed();
                    }
                    Err(_) => {
                        warn!(
                            url = %task.url,
                            path = %task.dest.display(),
                            timeout_secs = task_timeout.as_secs(),
                            "download task timed out"
                        );
                        let _ = tokio::fs::remove_file(&task.dest).await;
                        stats.increment_failed();
                    }
                }
            }));
        }

        for handle in handles {
            // Task panics are logged but don't fail the batch.
            if let Err(e) = handle.await {
                warn!(error = %e, "download task panicked");
            }
        }

        let stats = unwrap_stats(stats);
        info!(
            completed = stats.completed(),
            failed = stats.failed(),
            "download batch finished"
        );
        stats
    }
}

fn unwrap_stats(stats: Arc<BatchStats>) -> BatchStats {
    Arc::try_unwrap(stats).unwrap_or_else(|arc| {
        let fallback = BatchStats::default();
        fallback.completed.store(arc.completed(), Ordering::SeqCst);
        fallback.failed.store(arc.failed(), Ordering::SeqCst);
        fallback
    })
}

/// One transfer attempt: request, status check, stream body to destination.
///
/// A failed stream removes the partial file so a retry starts clean and a
/// permanently failed task leaves nothing behind.
pub(crate) async fn transfer(
    client: &Client,
    url: &str,
    dest: &std::path::Path,
) -> Result<u64, DownloadError> {
    // Malformed URLs abort before any network work; retrying cannot help.
    Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            DownloadError::timeout(url)
        } else {
            DownloadError::network(url, e)
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::http_status(url, status.as_u16()));
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::io(parent.to_path_buf(), e))?;
    }

    let file = File::create(dest)
        .await
        .map_err(|e| DownloadError::io(dest.to_path_buf(), e))?;
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER_BYTES, file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = match chunk_result {
            Ok(chunk) => chunk,
            Err(e) => {
                drop(writer);
                let _ = tokio::fs::remove_file(dest).await;
                return Err(DownloadError::network(url, e));
            }
        };
        if let Err(e) = writer.write_all(&chunk).await {
            drop(writer);
            let _ = tokio::fs::remove_file(dest).await;
            return Err(DownloadError::io(dest.to_path_buf(), e));
        }
        bytes_written += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(dest.to_path_buf(), e))?;

    Ok(bytes_written)
}
