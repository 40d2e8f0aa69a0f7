//! Retry logic shared by every retrying operation in the crate.
//!
//! When an attempt fails, the error is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - temporary failures that may succeed on retry
//! - [`FailureType::Permanent`] - failures that won't succeed regardless
//!
//! A [`RetryPolicy`] then decides retry-vs-stop per attempt, and the
//! [`retry_with_policy`] combinator drives the loop. File downloads, video
//! segments, video call-site retries, and the rewrite pass's asset batches all
//! go through the same combinator instead of hand-rolling their own loops.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use super::DownloadError;

/// Default maximum attempts for file and page retries.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (32 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Maximum jitter added to non-zero delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: network timeout, connection refused, any non-success HTTP
    /// status.
    Transient,

    /// Permanent failure that won't succeed regardless of retries.
    ///
    /// Examples: invalid URL, unusable playlist, local IO.
    Permanent,
}

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior.
///
/// Delay formula: `min(base_delay * multiplier^(attempt-1), max_delay) + jitter`.
/// A zero base delay (see [`RetryPolicy::immediate`]) skips sleeping entirely.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplier applied each attempt.
    backoff_multiplier: f32,

    /// Retry even permanent failures until the budget runs out.
    retry_permanent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            retry_permanent: false,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
            retry_permanent: false,
        }
    }

    /// Creates a policy with a custom `max_attempts`, defaults otherwise.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Creates a pause-free policy: retries immediately, no backoff, no
    /// jitter. Used where the source of failure is bursty rather than
    /// load-related (segment refetches).
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            retry_permanent: false,
        }
    }

    /// Creates a pause-free policy that retries every failure, permanent
    /// ones included, until the budget runs out. Used at the video call
    /// site, where each attempt re-runs the whole playlist-to-file assembly.
    #[must_use]
    pub fn immediate_all(max_attempts: u32) -> Self {
        Self {
            retry_permanent: true,
            ..Self::immediate(max_attempts)
        }
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Determines whether to retry after a failed attempt.
    ///
    /// `attempt` is the attempt number that just failed (1-indexed).
    #[must_use]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent && !self.retry_permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Calculates the delay for a retry with exponential backoff and jitter.
    fn calculate_delay(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);

        // attempt is 1-indexed; attempt 1 gets 1x base
        let exponent = f64::from(attempt - 1);
        let delay_ms = base_ms * multiplier.powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + jitter()
    }
}

/// Random jitter between 0 and [`MAX_JITTER`], so simultaneous failures don't
/// all retry at the same instant.
fn jitter() -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(0..=MAX_JITTER.as_millis() as u64))
}

/// Classifies a download error into a failure type for retry decisions.
///
/// Everything that crossed the network is transient: timeouts, connection
/// errors, and every non-success HTTP status (the authenticated site answers
/// 401/403 while rotating tokens). The attempt budget is the only limit on
/// those. Invalid URLs, unusable playlists, local IO errors, and an unusable
/// credential bundle are permanent.
#[must_use]
pub fn classify_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::HttpStatus { .. }
        | DownloadError::Timeout { .. }
        | DownloadError::Network { .. } => FailureType::Transient,

        DownloadError::Io { .. }
        | DownloadError::InvalidUrl { .. }
        | DownloadError::Playlist { .. }
        | DownloadError::Credentials { .. } => FailureType::Permanent,
    }
}

/// Runs `operation` under `policy` until it succeeds or the policy gives up.
///
/// The operation receives the 1-indexed attempt number. On exhaustion or a
/// permanent failure, returns the last error together with the number of
/// attempts made.
///
/// # Errors
///
/// Returns `(error, attempts)` when the final attempt fails.
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, (DownloadError, u32)>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, DownloadError>>,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let failure_type = classify_error(&error);
                match policy.should_retry(failure_type, attempt) {
                    RetryDecision::Retry { delay, .. } => {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    RetryDecision::DoNotRetry { reason } => {
                        debug!(attempt, %reason, "giving up");
                        return Err((error, attempt));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(32));
    }

    #[test]
    fn test_retry_policy_max_attempts_minimum_is_one() {
        let policy = RetryPolicy::with_max_attempts(0);
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn test_immediate_policy_has_zero_delay() {
        let policy = RetryPolicy::immediate(30);
        let decision = policy.should_retry(FailureType::Transient, 1);
        match decision {
            RetryDecision::Retry { delay, attempt } => {
                assert_eq!(delay, Duration::ZERO);
                assert_eq!(attempt, 2);
            }
            RetryDecision::DoNotRetry { .. } => panic!("expected retry"),
        }
    }

    #[test]
    fn test_permanent_failure_does_not_retry() {
        let policy = RetryPolicy::default();
        let decision = policy.should_retry(FailureType::Permanent, 1);
        assert!(matches!(decision, RetryDecision::DoNotRetry { .. }));
    }

    #[test]
    fn test_immediate_all_retries_permanent_until_budget() {
        let policy = RetryPolicy::immediate_all(3);
        assert!(matches!(
            policy.should_retry(FailureType::Permanent, 1),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureType::Permanent, 2),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureType::Permanent, 3),
            RetryDecision::DoNotRetry { .. }
        ));
    }

    #[test]
    fn test_transient_retries_until_budget_exhausted() {
        let policy = RetryPolicy::with_max_attempts(3);
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 1),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 2),
            RetryDecision::Retry { .. }
        ));
        let decision = policy.should_retry(FailureType::Transient, 3);
        match decision {
            RetryDecision::DoNotRetry { reason } => assert!(reason.contains("exhausted")),
            RetryDecision::Retry { .. } => panic!("attempt 3 of 3 must not retry"),
        }
    }

    #[test]
    fn test_backoff_delay_increases() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(32), 2.0);
        let d1 = policy.calculate_delay(1);
        let d2 = policy.calculate_delay(2);
        // ~1s+jitter vs ~2s+jitter
        assert!(d1 >= Duration::from_secs(1) && d1 <= Duration::from_millis(1500));
        assert!(d2 >= Duration::from_secs(2) && d2 <= Duration::from_millis(2500));
    }

    #[test]
    fn test_backoff_respects_max_delay() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(5), 2.0);
        let delay = policy.calculate_delay(6);
        assert!(delay >= Duration::from_secs(5));
        assert!(delay <= Duration::from_millis(5500));
    }

    #[test]
    fn test_classify_any_http_status_transient() {
        for status in [401, 403, 404, 408, 429, 500, 503] {
            assert_eq!(
                classify_error(&DownloadError::http_status("u", status)),
                FailureType::Transient,
                "status {status} must be retried up to the attempt budget"
            );
        }
    }

    #[test]
    fn test_classify_timeout_transient() {
        assert_eq!(
            classify_error(&DownloadError::timeout("u")),
            FailureType::Transient
        );
    }

    #[test]
    fn test_classify_invalid_url_permanent() {
        assert_eq!(
            classify_error(&DownloadError::invalid_url("not-a-url")),
            FailureType::Permanent
        );
    }

    #[test]
    fn test_classify_io_permanent() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(
            classify_error(&DownloadError::io("/p", io_err)),
            FailureType::Permanent
        );
    }

    #[test]
    fn test_classify_playlist_permanent() {
        assert_eq!(
            classify_error(&DownloadError::playlist("u", "no segments")),
            FailureType::Permanent
        );
    }

    #[tokio::test]
    async fn test_combinator_succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(3);

        let result = retry_with_policy(&policy, |attempt| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(DownloadError::http_status("https://flaky", 500))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_combinator_stops_after_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(3);

        let result: Result<(), _> = retry_with_policy(&policy, |_| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DownloadError::http_status("https://down", 503))
            }
        })
        .await;

        let (error, attempts) = result.unwrap_err();
        assert_eq!(attempts, 3);
        assert!(matches!(error, DownloadError::HttpStatus { status: 503, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_combinator_aborts_immediately_on_permanent_failure() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(3);

        let result: Result<(), _> = retry_with_policy(&policy, |_| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DownloadError::invalid_url("::bad::"))
            }
        })
        .await;

        let (_, attempts) = result.unwrap_err();
        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_combinator_with_immediate_all_burns_budget_on_permanent_failure() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate_all(3);

        let result: Result<(), _> = retry_with_policy(&policy, |_| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DownloadError::playlist("https://cdn/v.m3u8", "no segments"))
            }
        })
        .await;

        let (error, attempts) = result.unwrap_err();
        assert_eq!(attempts, 3);
        assert!(matches!(error, DownloadError::Playlist { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
