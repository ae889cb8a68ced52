//! Retry with exponential backoff and jitter for transport calls.
//!
//! The agent loop itself never retries; this lives entirely inside provider
//! implementations, which also clamp server-requested delays to the run's
//! `max_retry_delay_ms` pass-through.

use crate::provider::ProviderError;
use std::time::Duration;
use tracing::warn;

/// Configuration for automatic retry of transient provider errors.
///
/// Defaults: 3 retries, 1s initial delay, 2x backoff, 30s max delay.
/// Use `RetryConfig::none()` to disable retries entirely.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries).
    pub max_retries: usize,
    /// Initial delay before the first retry (milliseconds).
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after each attempt.
    pub backoff_multiplier: f64,
    /// Maximum delay between retries (milliseconds).
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// No retries — fail immediately on any error.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before the given retry attempt (1-indexed).
    ///
    /// A server-provided hint wins over the computed backoff; computed
    /// delays carry ±20% jitter. Both are capped by `max_delay_ms` and the
    /// optional `max_retry_delay_ms` bound.
    pub fn next_delay(
        &self,
        attempt: usize,
        server_hint: Option<Duration>,
        max_retry_delay_ms: Option<u64>,
    ) -> Duration {
        let ms = match server_hint {
            Some(hint) => hint.as_millis() as f64,
            None => {
                let base = self.initial_delay_ms as f64
                    * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
                // Jitter: multiply by 0.8–1.2
                base * (0.8 + rand::random::<f64>() * 0.4)
            }
        };
        let mut capped = ms.min(self.max_delay_ms as f64);
        if let Some(bound) = max_retry_delay_ms {
            capped = capped.min(bound as f64);
        }
        Duration::from_millis(capped as u64)
    }
}

impl ProviderError {
    /// Whether this error is safe to retry.
    ///
    /// Retryable: rate limits (429) and network/transient errors.
    /// Not retryable: auth errors, API errors (bad request), cancellation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Network(_))
    }

    /// If this is a rate limit with a server-specified retry delay, return it.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited {
                retry_after_ms: Some(ms),
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }
}

/// Log a retry attempt.
pub(crate) fn log_retry(attempt: usize, max: usize, delay: &Duration, error: &ProviderError) {
    warn!(
        "Provider error (attempt {}/{}), retrying in {:.1}s: {}",
        attempt,
        max,
        delay.as_secs_f64(),
        error
    );
}
