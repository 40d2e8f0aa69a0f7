//! Concurrent HTTP download engine and HLS video assembly.
//!
//! Plain files (attachments, page assets) go through [`Downloader::run_batch`]:
//! a semaphore-bounded batch where every task is independently retried and
//! independently timed out, and a failed task never aborts the batch. Videos go
//! through [`VideoDownloader`], which resolves an HLS playlist and assembles
//! its segments into a single file.
//!
//! All requests carry the fixed cookie and user-agent headers from the
//! [`Credentials`](crate::config::Credentials) bundle.

use std::time::Duration;

mod engine;
mod error;
mod retry;
mod video;

pub use engine::{BatchStats, DownloadTask, Downloader};
pub use error::DownloadError;
pub use retry::{
    DEFAULT_MAX_ATTEMPTS, FailureType, RetryDecision, RetryPolicy, classify_error,
    retry_with_policy,
};
pub use video::{SEGMENT_ATTEMPTS, SEGMENT_CONCURRENCY, VideoDownloader};

/// Maximum simultaneous in-flight transfers per batch.
pub const MAX_CONCURRENT_TRANSFERS: usize = 5;

/// Budget for one batch task, measured from task start (slot wait included),
/// not from connection time.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(60);

/// Write-buffer size for streaming bodies to disk; bounds memory per transfer.
pub const WRITE_BUFFER_BYTES: usize = 512 * 1024;
