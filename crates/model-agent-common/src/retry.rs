//! Retry utilities with exponential backoff and jitter.
//!
//! Three flavours are provided:
//! - [`retry_with_backoff`]: general-purpose retry of any fallible async
//!   operation, used for startup calls such as building the API client.
//! - [`retry_on_conflict`]: re-runs a read-modify-write closure while it loses
//!   optimistic-concurrency races, following the Kubernetes client defaults.
//! - [`retry_transient`]: re-runs an operation while it fails with transient
//!   transport errors.
//!
//! The last two are cancellation-aware: a cancelled token interrupts both the
//! operation and any sleep between attempts.
//!
//! # Example
//!
//! ```ignore
//! use model_agent_common::retry::{retry_on_conflict, DEFAULT_BACKOFF};
//!
//! retry_on_conflict(&DEFAULT_BACKOFF, &token, "set_status", || async {
//!     let (record, created) = store.get_or_init(&name).await?;
//!     // mutate and write back
//!     Ok(())
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::Error;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = infinite)
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
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
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

    /// Create a config that retries forever (infinite attempts)
    pub fn infinite() -> Self {
        Self::default()
    }
}

/// Backoff schedule for optimistic-concurrency retries.
///
/// Mirrors the Kubernetes client's `wait.Backoff`: `steps` attempts in total,
/// sleeping `duration` before the second attempt and multiplying by `factor`
/// after each sleep, with up to `jitter * duration` added at random.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    /// Total number of attempts
    pub steps: u32,
    /// Delay before the second attempt
    pub duration: Duration,
    /// Multiplier applied to the delay after each attempt
    pub factor: f64,
    /// Maximum fraction of the delay added as random jitter
    pub jitter: f64,
}

/// Budget used by generic read-modify-write helpers (5 attempts, flat 10ms)
pub const DEFAULT_RETRY: Backoff = Backoff {
    steps: 5,
    duration: Duration::from_millis(10),
    factor: 1.0,
    jitter: 0.1,
};

/// Budget used by entry updates (4 attempts, 10ms growing 5x)
pub const DEFAULT_BACKOFF: Backoff = Backoff {
    steps: 4,
    duration: Duration::from_millis(10),
    factor: 5.0,
    jitter: 0.1,
};

impl Backoff {
    /// Delay to sleep after the given attempt (1-based), before jitter
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        Duration::from_secs_f64(self.duration.as_secs_f64() * self.factor.powi(exp))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        delay + Duration::from_secs_f64(delay.as_secs_f64() * extra)
    }
}

/// Sleep for `delay` unless `token` is cancelled first.
pub async fn sleep_or_cancel(
    token: &CancellationToken,
    delay: Duration,
    context: &str,
) -> Result<(), Error> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::cancelled(context)),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Drive `fut` to completion unless `token` is cancelled first.
///
/// The future is dropped on cancellation, aborting any in-flight request.
pub async fn cancellable<T, Fut>(
    token: &CancellationToken,
    context: &str,
    fut: Fut,
) -> Result<T, Error>
where
    Fut: Future<Output = Result<T, Error>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::cancelled(context)),
        result = fut => result,
    }
}

/// Jittered exponential delays between attempts of a [`RetryConfig`]
struct DelaySchedule<'a> {
    config: &'a RetryConfig,
    attempt: u32,
    delay: Duration,
}

impl<'a> DelaySchedule<'a> {
    fn new(config: &'a RetryConfig) -> Self {
        Self {
            config,
            attempt: 0,
            delay: config.initial_delay,
        }
    }

    /// Number of failed attempts recorded so far
    fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a failed attempt and return how long to wait before the next
    /// one, or `None` once `max_attempts` is reached.
    fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.config.max_attempts > 0 && self.attempt >= self.config.max_attempts {
            return None;
        }

        // Add jitter: 0.5x to 1.5x of the delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered_delay = Duration::from_secs_f64(self.delay.as_secs_f64() * jitter);

        // Exponential backoff, capped at max_delay
        self.delay = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * self.config.backoff_multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );
        Some(jittered_delay)
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries indefinitely (or up to max_attempts if set) until success.
///
/// # Arguments
/// * `config` - Retry configuration
/// * `operation_name` - Name for logging purposes
/// * `operation` - The async operation to retry
///
/// # Returns
/// The result of the operation, or the last error if max_attempts is exhausted.
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
    let mut schedule = DelaySchedule::new(config);

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let Some(delay) = schedule.next_delay() else {
                    error!(
                        operation = %operation_name,
                        attempt = schedule.attempt(),
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                };

                warn!(
                    operation = %operation_name,
                    attempt = schedule.attempt(),
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Re-run a read-modify-write closure while it loses version races.
///
/// `operation` must perform a fresh read on every invocation. Errors other
/// than [`Error::Conflict`] are returned immediately. When every attempt in
/// the budget conflicts, [`Error::VersionExhausted`] is returned.
pub async fn retry_on_conflict<F, Fut, T>(
    backoff: &Backoff,
    token: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let steps = backoff.steps.max(1);

    for attempt in 1..=steps {
        if token.is_cancelled() {
            return Err(Error::cancelled(operation_name));
        }

        match cancellable(token, operation_name, operation()).await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_conflict() => {
                if attempt == steps {
                    break;
                }
                let delay = backoff.jittered(backoff.delay_after(attempt));
                debug!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Version conflict, retrying with fresh read"
                );
                sleep_or_cancel(token, delay, operation_name).await?;
            }
            Err(e) => return Err(e),
        }
    }

    warn!(
        operation = %operation_name,
        attempts = steps,
        "Exhausted retries due to version conflicts"
    );
    Err(Error::VersionExhausted {
        context: operation_name.to_string(),
        attempts: steps,
    })
}

/// Re-run an operation while it fails with transient transport errors.
///
/// Non-retryable errors (see [`Error::is_retryable`]) are returned
/// immediately; the last transient error is returned once `max_attempts`
/// is reached. Delays follow the same schedule as [`retry_with_backoff`].
pub async fn retry_transient<F, Fut, T>(
    config: &RetryConfig,
    token: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut schedule = DelaySchedule::new(config);

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                let Some(delay) = schedule.next_delay() else {
                    error!(
                        operation = %operation_name,
                        attempt = schedule.attempt(),
                        error = %e,
                        "Store still unavailable after max retries"
                    );
                    return Err(e);
                };

                warn!(
                    operation = %operation_name,
                    attempt = schedule.attempt(),
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Store unavailable, retrying"
                );

                sleep_or_cancel(token, delay, operation_name).await?;
            }
        }
    }
}
