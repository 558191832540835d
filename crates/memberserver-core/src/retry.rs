//! ============================================================================
//! Retry Logic - Exponential Backoff for Flaky Endpoints
//! ============================================================================
//! Door controllers and the payment provider are both reached over the
//! network and fail transiently. This module provides:
//! - Exponential backoff with jitter between attempts
//! - Error classification (retryable vs permanent vs rate limited)
//! - A bounded async retry loop shared by device pushes and provider calls
//! ============================================================================

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Base delay between retries (will be multiplied by 2^attempt)
    pub base_delay_ms: u64,
    /// Maximum delay between retries
    pub max_delay_ms: u64,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Error classification for retry decisions
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorKind {
    /// Error is likely transient, should retry
    Retryable,
    /// Error is permanent, don't retry
    Permanent,
    /// Rate limited, back off more aggressively
    RateLimited,
}

/// Errors that know whether another attempt could succeed
pub trait Classify {
    fn error_kind(&self) -> ErrorKind;
}

/// Classify an error message to determine if retry is appropriate
pub fn classify_error(error: &str) -> ErrorKind {
    let lower = error.to_lowercase();

    // Rate limiting errors
    if lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("429")
    {
        return ErrorKind::RateLimited;
    }

    // Permanent errors - don't retry these
    if lower.contains("not found")
        || lower.contains("404")
        || lower.contains("unauthorized")
        || lower.contains("401")
        || lower.contains("forbidden")
        || lower.contains("403")
        || lower.contains("400")
        || lower.contains("invalid")
    {
        return ErrorKind::Permanent;
    }

    // Network/connection errors are usually retryable
    if lower.contains("connection")
        || lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("network")
        || lower.contains("temporary")
        || lower.contains("try again")
    {
        return ErrorKind::Retryable;
    }

    // Default to retryable for unknown errors
    ErrorKind::Retryable
}

/// Calculate delay with exponential backoff and optional jitter
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let multiplier = 2u64.saturating_pow(attempt.min(63));
    let base_delay = config.base_delay_ms.saturating_mul(multiplier);
    let capped_delay = base_delay.min(config.max_delay_ms);

    let final_delay = if config.jitter {
        // Add random jitter (0-50% of delay)
        let jitter_factor = 1.0 + rand::thread_rng().gen_range(0.0..=0.5);
        (capped_delay as f64 * jitter_factor) as u64
    } else {
        capped_delay
    };

    Duration::from_millis(final_delay)
}

/// Run `op` until it succeeds, fails permanently, or `max_attempts` is spent.
/// The last error is returned when attempts run out.
pub async fn retry_async<T, E, F, Fut>(config: &RetryConfig, label: &str, mut op: F) -> Result<T, E>
where
    E: Classify + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("{} succeeded on attempt {}", label, attempt + 1);
                }
                return Ok(value);
            }
            Err(e) => {
                let kind = e.error_kind();
                attempt += 1;

                if kind == ErrorKind::Permanent || attempt >= max_attempts {
                    return Err(e);
                }

                let delay = match kind {
                    ErrorKind::RateLimited => {
                        let rate_limit_delay = Duration::from_millis(config.max_delay_ms);
                        warn!("{} rate limited, waiting {:?}", label, rate_limit_delay);
                        rate_limit_delay
                    }
                    _ => calculate_delay(attempt - 1, config),
                };

                warn!(
                    "{} attempt {}/{} failed ({:?}): {} - retrying in {:?}",
                    label, attempt, max_attempts, kind, e, delay
                );
                sleep(delay).await;
            }
        }
    }
}
