//! Bounded retry of transient storage failures

use std::time::Duration;

use tracing::warn;

use crate::error::LedgerError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling from `base_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F>(&self, what: &str, mut op: F) -> Result<T, LedgerError>
    where
        F: FnMut() -> Result<T, LedgerError>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if attempt >= attempts {
                        return Err(LedgerError::Exhausted {
                            attempts,
                            source: Box::new(e),
                        });
                    }
                    warn!(op = what, attempt, error = %e, "Transient storage failure, retrying");
                    tokio::time::sleep(self.backoff(attempt - 1)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
