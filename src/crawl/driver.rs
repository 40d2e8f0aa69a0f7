//! Retry supervisor for whole crawl passes.
//!
//! A pass that aborts (module fetch failure, browser launch failure, an
//! unexpected error) is retried against the same in-memory state, which
//! reflects everything already committed, so no completed lesson is redone.
//! The retry budget is bounded: long outages get hours of patience through
//! exponential backoff, but a deterministic failure terminates with an
//! explicit error instead of spinning forever.

use std::time::Duration;

use tracing::{info, warn};

use super::{CrawlError, Crawler};
use crate::state::CrawlState;

/// Default maximum crawl passes before giving up.
pub const DEFAULT_MAX_PASSES: u32 = 12;

/// Default base delay between passes.
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Default cap on the between-pass delay.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

/// Terminal failure of the whole crawl.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Every allowed pass failed; the last pass error is attached.
    #[error("crawl did not complete after {passes} passes; last error: {source}")]
    PassBudgetExhausted {
        /// How many passes were attempted.
        passes: u32,
        /// The error from the final pass.
        #[source]
        source: CrawlError,
    },
}

/// Restarts failed crawl passes with exponential backoff.
#[derive(Debug, Clone)]
pub struct Supervisor {
    max_passes: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self {
            max_passes: DEFAULT_MAX_PASSES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl Supervisor {
    /// Creates a supervisor with explicit limits.
    #[must_use]
    pub fn new(max_passes: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_passes: max_passes.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Runs crawl passes until one completes or the pass budget is spent.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::PassBudgetExhausted`] carrying the final
    /// pass's error.
    pub async fn run(
        &self,
        crawler: &Crawler,
        state: &mut CrawlState,
    ) -> Result<(), SupervisorError> {
        let mut pass = 0u32;

        loop {
            pass += 1;
            match crawler.run_pass(state).await {
                Ok(()) => {
                    info!(passes = pass, "crawl complete");
                    return Ok(());
                }
                Err(error) => {
                    warn!(pass, max_passes = self.max_passes, %error, "crawl pass failed");
                    if pass >= self.max_passes {
                        return Err(SupervisorError::PassBudgetExhausted {
                            passes: pass,
                            source: error,
                        });
                    }

                    let delay = self.delay_for(pass);
                    info!(delay_secs = delay.as_secs(), "backing off before next pass");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Exponential backoff: `base * 2^(pass-1)`, capped.
    fn delay_for(&self, pass: u32) -> Duration {
        let factor = 2u64.saturating_pow(pass.saturating_sub(1).min(16));
        let delay = self
            .base_delay
            .checked_mul(u32::try_from(factor).unwrap_or(u32::MAX))
            .unwrap_or(self.max_delay);
        delay.min(self.max_delay)
    }
}
