//! Retry policy for transient chunk failures

use std::time::Duration;

use reqwest::StatusCode;

/// Bounded exponential backoff.
///
/// `max_attempts` counts every attempt of a chunk, including the first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based), capped at `max_delay`
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let factor = 2u64.saturating_pow(retry);
        let delay_ms = base_ms.saturating_mul(factor);
        let capped = delay_ms.min(self.max_delay.as_millis() as u64);
        Duration::from_millis(capped)
    }

    /// Delay honouring a server `Retry-After` hint when it asks for longer
    pub fn delay_with_hint(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self.delay_for_retry(retry);
        match retry_after {
            Some(hint) if hint > backoff => hint.min(self.max_delay),
            _ => backoff,
        }
    }
}

/// Status codes worth retrying against the same session
pub fn is_transient_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504)
}

/// Whether a transport error is a transient network fault
pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_body() || err.is_request()
}
