//! Retry with exponential backoff and jitter.
//!
//! Used for two things: reconnecting to the router, and calling a
//! destination that may not have registered yet (typically right after a
//! router restart). The latter only retries `DestinationUnknown`, which
//! guarantees the message was never delivered, and reports exhaustion as
//! [`PamrError::NotYetAvailable`].

use crate::agent::Agent;
use bytes::Bytes;
use pamr_types::{AgentId, PamrError, PamrResult};
use rand::Rng;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first try).
    pub max_attempts: u32,
    /// Minimum delay between retries in milliseconds.
    pub min_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 = no jitter, 1.0 = full jitter).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay_ms: 100,
            max_delay_ms: 5_000,
            jitter: 0.2,
        }
    }
}

/// Result of a retry operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Success { result: T, attempts: u32 },
    Exhausted { last_error: E, attempts: u32 },
}

/// Compute the delay for a given attempt (0-indexed).
///
/// Formula: `min(min_delay * 2^attempt, max_delay) * (1 + random * jitter)`,
/// clamped to `max_delay`.
pub fn compute_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config
        .min_delay_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped = base.min(config.max_delay_ms);
    if config.jitter <= 0.0 {
        return capped;
    }

    let frac: f64 = rand::thread_rng().gen();
    let with_jitter = (capped as f64) * (1.0 + frac * config.jitter);
    (with_jitter as u64).min(config.max_delay_ms)
}

/// Execute an async operation, retrying errors accepted by `should_retry`.
pub async fn retry_async<F, Fut, T, E, P>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "retry succeeded");
                }
                return RetryOutcome::Success {
                    result,
                    attempts: attempt + 1,
                };
            }
            Err(err) => {
                let retryable = should_retry(&err);
                if attempt + 1 >= max || !retryable {
                    if retryable {
                        warn!(attempts = attempt + 1, "all retry attempts exhausted: {err}");
                    }
                    return RetryOutcome::Exhausted {
                        last_error: err,
                        attempts: attempt + 1,
                    };
                }
                let delay_ms = compute_backoff(config, attempt);
                debug!(attempt = attempt + 1, delay_ms, "retrying after error: {err}");
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                attempt += 1;
            }
        }
    }
}

/// Backoff between router connection attempts. Attempts are bounded by the
/// agent's connect timeout, not by `max_attempts`.
pub fn connect_retry_config() -> RetryConfig {
    RetryConfig {
        max_attempts: u32::MAX,
        min_delay_ms: 250,
        max_delay_ms: 5_000,
        jitter: 0.2,
    }
}

/// Two-way call that tolerates a destination that has not registered yet.
///
/// Only `DestinationUnknown` is retried; every other failure is returned
/// as is. Exhausting `config` yields [`PamrError::NotYetAvailable`].
pub async fn call_when_available(
    agent: &Agent,
    destination: AgentId,
    payload: Bytes,
    config: &RetryConfig,
) -> PamrResult<Bytes> {
    let outcome = retry_async(
        config,
        || agent.call(destination, payload.clone()),
        |e| matches!(e, PamrError::DestinationUnknown(_)),
    )
    .await;
    match outcome {
        RetryOutcome::Success { result, .. } => Ok(result),
        RetryOutcome::Exhausted {
            last_error: PamrError::DestinationUnknown(agent),
            attempts,
        } => Err(PamrError::NotYetAvailable { agent, attempts }),
        RetryOutcome::Exhausted { last_error, .. } => Err(last_error),
    }
}
