//! Retry and polling utilities.
//!
//! Two shapes of waiting live here:
//!
//! - [`retry_with_backoff`] retries a fallible call (a Kubernetes API request,
//!   a helm invocation) with exponential backoff and jitter.
//! - [`poll_until`] checks a condition at a fixed interval for a fixed number
//!   of attempts. Every bootstrap wait uses it, so each wait has an explicit
//!   ceiling that the caller converts into a typed error.
//!
//! Both sleep through `tokio::time`, so tests drive them with paused time.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, trace, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Returns the first success, or the last error once `max_attempts` is
/// exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Fixed-interval, attempt-bounded polling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollConfig {
    /// Time between attempts
    pub interval: Duration,
    /// Maximum number of checks before giving up
    pub max_attempts: u32,
}

impl PollConfig {
    /// Create a poll config
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Worst-case time spent waiting
    pub fn ceiling(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

/// Result of an exhausted poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollExhausted<S> {
    /// Attempts made
    pub attempts: u32,
    /// State seen on the last attempt, if the check produced one
    pub last: Option<S>,
}

/// Outcome of a single poll check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus<S> {
    /// Condition met, stop polling
    Done(S),
    /// Not yet; keep the observed state for reporting on exhaustion
    Pending(S),
}

/// Poll `check` until it reports [`PollStatus::Done`] or attempts run out.
///
/// Check errors are treated like a pending result: they are logged at trace
/// level and polling continues. No sleep happens after the final attempt.
pub async fn poll_until<F, Fut, S, E>(
    config: PollConfig,
    what: &str,
    mut check: F,
) -> Result<S, PollExhausted<S>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollStatus<S>, E>>,
    E: std::fmt::Display,
{
    let mut last = None;

    for attempt in 1..=config.max_attempts {
        match check().await {
            Ok(PollStatus::Done(state)) => return Ok(state),
            Ok(PollStatus::Pending(state)) => {
                trace!(what, attempt, "condition not yet met");
                last = Some(state);
            }
            Err(e) => {
                trace!(what, attempt, error = %e, "poll check failed, retrying");
            }
        }

        if attempt < config.max_attempts {
            tokio::time::sleep(config.interval).await;
        }
    }

    Err(PollExhausted {
        attempts: config.max_attempts,
        last,
    })
}
