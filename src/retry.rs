//! Bounded retry with per-attempt timeouts and exponential backoff.
//!
//! Both the unsubscribe resolver and the WHOIS client run their network
//! calls through `RetryExecutor::run`, so the total time a single target can
//! hold up the batch is bounded by `max_attempts × attempt_timeout` plus the
//! backoff delays. Every attempt is returned to the caller, which lets the
//! unsubscribe resolver record each try individually.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{sleep, timeout};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of tries, including the first one
    pub max_attempts: u32,

    /// Hard limit for one try
    pub attempt_timeout: Duration,

    /// Initial delay between tries
    pub initial_delay: Duration,

    /// Maximum delay between tries
    pub max_delay: Duration,

    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,

    /// Whether to add ±10% jitter to the delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(10),
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Why one attempt did not produce a value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptError<E> {
    /// The attempt exceeded `attempt_timeout` and was cancelled.
    TimedOut(Duration),
    /// The operation itself returned an error.
    Failed(E),
}

impl<E: std::fmt::Display> std::fmt::Display for AttemptError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::TimedOut(d) => write!(f, "timed out after {}ms", d.as_millis()),
            AttemptError::Failed(e) => write!(f, "{e}"),
        }
    }
}

/// Policy for determining if an operation should be retried
pub trait RetryPolicy<E> {
    /// Returns true if another attempt is worthwhile after this error.
    /// `attempt` is the 1-based number of the attempt that just failed.
    fn should_retry(&self, error: &AttemptError<E>, attempt: u32) -> bool;
}

/// Retries every failure until the budget is spent.
pub struct AlwaysRetry;

impl<E> RetryPolicy<E> for AlwaysRetry {
    fn should_retry(&self, _error: &AttemptError<E>, _attempt: u32) -> bool {
        true
    }
}

/// Retries timeouts and errors whose message looks like a transient
/// connection problem. Definitive answers (no match, malformed data) stop.
pub struct TransientOnly;

impl<E: std::fmt::Display> RetryPolicy<E> for TransientOnly {
    fn should_retry(&self, error: &AttemptError<E>, _attempt: u32) -> bool {
        match error {
            AttemptError::TimedOut(_) => true,
            AttemptError::Failed(e) => {
                let error_str = e.to_string().to_lowercase();
                error_str.contains("timeout")
                    || error_str.contains("timed out")
                    || error_str.contains("connection")
                    || error_str.contains("connect error")
                    || error_str.contains("rate limit")
                    || error_str.contains("temporarily unavailable")
                    || error_str.contains("try again")
            }
        }
    }
}

/// Record of a single try.
#[derive(Debug, Clone)]
pub struct Attempt<T, E> {
    /// 1-based attempt number
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub result: Result<T, AttemptError<E>>,
}

/// Every attempt made by one `RetryExecutor::run` call, in order.
#[derive(Debug, Clone)]
pub struct RetryOutcome<T, E> {
    pub attempts: Vec<Attempt<T, E>>,
}

impl<T, E> RetryOutcome<T, E> {
    pub fn succeeded(&self) -> bool {
        matches!(self.attempts.last(), Some(a) if a.result.is_ok())
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// Final result: the value on success, otherwise the last error.
    pub fn into_result(mut self) -> Result<T, AttemptError<E>> {
        match self.attempts.pop() {
            Some(last) => last.result,
            None => Err(AttemptError::TimedOut(Duration::ZERO)),
        }
    }
}

/// Retry executor that handles the retry logic
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new retry executor with the given configuration
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until it succeeds, the policy gives up, or
    /// `max_attempts` tries have been made. Each try is cut off after
    /// `attempt_timeout`. Never errors itself: the outcome carries the
    /// history.
    pub async fn run<F, Fut, T, E, P>(&self, mut operation: F, policy: &P) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: RetryPolicy<E> + ?Sized,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = Vec::with_capacity(max_attempts as usize);
        let mut delay = self.config.initial_delay;

        for number in 1..=max_attempts {
            let started_at = Utc::now();
            let result = match timeout(self.config.attempt_timeout, operation(number)).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(AttemptError::Failed(e)),
                Err(_) => Err(AttemptError::TimedOut(self.config.attempt_timeout)),
            };

            let retry = match &result {
                Ok(_) => false,
                Err(e) => number < max_attempts && policy.should_retry(e, number),
            };
            attempts.push(Attempt {
                number,
                started_at,
                result,
            });
            if !retry {
                break;
            }

            let actual_delay = if self.config.jitter {
                add_jitter(delay)
            } else {
                delay
            };
            if !actual_delay.is_zero() {
                sleep(actual_delay).await;
            }

            delay = std::cmp::min(
                Duration::from_millis(
                    (delay.as_millis() as f64 * self.config.backoff_multiplier) as u64,
                ),
                self.config.max_delay,
            );
        }

        RetryOutcome { attempts }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Add random jitter to prevent thundering herd problems
fn add_jitter(delay: Duration) -> Duration {
    use rand::Rng;

    let jitter_range = delay.as_millis() as f64 * 0.1; // 10% jitter
    if jitter_range <= 0.0 {
        return delay;
    }
    let mut rng = rand::rng();
    let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);

    let jittered_ms = (delay.as_millis() as f64 + jitter).max(0.0) as u64;
    Duration::from_millis(jittered_ms)
}
