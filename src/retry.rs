//! Retry policy and executor with square-root backoff.

use crate::error::{FailureKind, StreamError};
use crate::pool::TaskPool;
use rand::Rng;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Immutable retry/backoff configuration.
///
/// After the first retryable failure the delay is `initial_delay`; every further
/// failure multiplies it by `sqrt(backoff_factor)`, capped at `max_delay`:
///
/// ```
/// use sse_relay::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::builder()
///     .initial_delay(Duration::from_secs(2))
///     .backoff_factor(10.0)
///     .max_delay(Duration::from_secs(60))
///     .build()
///     .unwrap();
/// let delays: Vec<_> = policy.delays().take(4).map(|d| d.as_millis()).collect();
/// assert_eq!(delays[0], 2000);
/// assert_eq!(delays[1], 6324);
/// assert_eq!(delays[3], 60000);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    initial_delay: Duration,
    backoff_factor: f64,
    max_delay: Duration,
    max_attempts: u32,
    retryable: HashSet<FailureKind>,
    jitter: JitterMode,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            backoff_factor: 10.0,
            max_delay: Duration::from_secs(60),
            max_attempts: 3,
            retryable: default_retryable(),
            jitter: JitterMode::None,
        }
    }
}

fn default_retryable() -> HashSet<FailureKind> {
    [FailureKind::Transport, FailureKind::StreamEnded]
        .into_iter()
        .collect()
}

impl RetryPolicy {
    /// Create a builder seeded with the default policy.
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn backoff_factor(&self) -> f64 {
        self.backoff_factor
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn jitter(&self) -> &JitterMode {
        &self.jitter
    }

    /// Failure kinds this policy retries.
    pub fn retryable_kinds(&self) -> &HashSet<FailureKind> {
        &self.retryable
    }

    pub fn is_retryable(&self, kind: FailureKind) -> bool {
        self.retryable.contains(&kind)
    }

    /// Delay to wait after a failure, given the delay used after the previous one.
    ///
    /// `None` means this is the first failure. Jitter is not applied here.
    pub fn next_delay(&self, previous: Option<Duration>) -> Duration {
        match previous {
            None => self.initial_delay,
            Some(prev) => {
                let grown = prev.as_secs_f64() * self.backoff_factor.sqrt();
                Duration::from_secs_f64(grown.min(self.max_delay.as_secs_f64()))
            }
        }
    }

    /// The unbounded sequence of delays for consecutive retryable failures.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        std::iter::successors(Some(self.initial_delay), move |prev| {
            Some(self.next_delay(Some(*prev)))
        })
    }
}

/// Builder for [`RetryPolicy`]. Validation happens in [`build`](Self::build).
#[derive(Clone, Debug)]
#[must_use = "builders do nothing unless you call .build()"]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self {
            policy: RetryPolicy::default(),
        }
    }

    /// Set the delay after the first retryable failure
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Set the backoff factor (the delay grows by its square root)
    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.policy.backoff_factor = factor;
        self
    }

    /// Set the upper bound for any delay
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Set the total number of attempts, including the first one
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    /// Replace the set of retryable failure kinds
    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.policy.retryable = kinds.into_iter().collect();
        self
    }

    /// Set jitter mode
    pub fn jitter(mut self, jitter: JitterMode) -> Self {
        self.policy.jitter = jitter;
        self
    }

    pub fn build(self) -> Result<RetryPolicy, StreamError> {
        let policy = self.policy;
        if !policy.backoff_factor.is_finite() || policy.backoff_factor < 1.0 {
            return Err(StreamError::InvalidConfig(format!(
                "backoff factor must be a finite number >= 1, got {}",
                policy.backoff_factor
            )));
        }
        if policy.max_attempts == 0 {
            return Err(StreamError::InvalidConfig(
                "max attempts must be at least 1".to_string(),
            ));
        }
        if policy.initial_delay > policy.max_delay {
            return Err(StreamError::InvalidConfig(format!(
                "initial delay {:?} exceeds max delay {:?}",
                policy.initial_delay, policy.max_delay
            )));
        }
        Ok(policy)
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Jitter mode for retry backoff.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum JitterMode {
    /// No jitter - use exact backoff delay
    #[default]
    None,
    /// Full jitter: random delay between 0 and calculated backoff
    Full,
    /// Equal jitter: half fixed + half random
    Equal,
}

/// Apply jitter to a backoff delay.
pub fn apply_jitter(delay: Duration, mode: &JitterMode) -> Duration {
    match mode {
        JitterMode::None => delay,
        JitterMode::Full => {
            let mut rng = rand::thread_rng();
            Duration::from_secs_f64(rng.gen::<f64>() * delay.as_secs_f64())
        }
        JitterMode::Equal => {
            let mut rng = rand::thread_rng();
            let half = delay.as_secs_f64() / 2.0;
            Duration::from_secs_f64(half + rng.gen::<f64>() * half)
        }
    }
}

/// Runs an operation until it succeeds, fails permanently, or runs out of attempts.
///
/// Each attempt is spawned on the [`TaskPool`]; the backoff delay is a timer inside
/// the spawned task. The caller of [`run`](Self::run) awaits every attempt, so
/// attempts never overlap.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    pool: Arc<TaskPool>,
    cancel: Option<watch::Receiver<bool>>,
}

impl RetryExecutor {
    pub fn new(pool: Arc<TaskPool>) -> Self {
        Self { pool, cancel: None }
    }

    /// Stop retrying once the signal flips to `true`.
    ///
    /// The signal is checked before each attempt and raced against both the
    /// backoff timer and the running attempt, which is aborted on cancellation.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub async fn run<T, F, Fut>(&self, policy: &RetryPolicy, mut operation: F) -> Result<T, StreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StreamError>> + Send + 'static,
        T: Send + 'static,
    {
        let mut cancel = self.cancel.clone();
        let mut attempt = 0u32;
        let mut delay: Option<Duration> = None;
        let mut last_error = None;

        while attempt < policy.max_attempts {
            if is_cancelled(&cancel) {
                return Err(StreamError::Cancelled);
            }

            let wait = delay
                .map(|d| apply_jitter(d, &policy.jitter).min(policy.max_delay))
                .unwrap_or(Duration::ZERO);
            let fut = operation();
            let mut join = self.pool.spawn(async move {
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
                fut.await
            })?;

            tracing::debug!(attempt = attempt + 1, delay_ms = wait.as_millis() as u64, "scheduled attempt");

            let outcome = match cancel.as_mut() {
                Some(rx) => tokio::select! {
                    res = &mut join => res?,
                    _ = cancelled(rx) => {
                        join.abort();
                        return Err(StreamError::Cancelled);
                    }
                },
                None => join.await?,
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if is_cancelled(&cancel) {
                return Err(StreamError::Cancelled);
            }

            let kind = err.kind();
            if !policy.is_retryable(kind) {
                tracing::debug!(?kind, error = %err, "non-retryable failure");
                return Err(err);
            }

            attempt += 1;
            if attempt < policy.max_attempts {
                let next = policy.next_delay(delay);
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    ?kind,
                    error = %err,
                    delay_ms = next.as_millis() as u64,
                    "attempt failed, retrying"
                );
                delay = Some(next);
            }
            last_error = Some(err);
        }

        let last = match last_error {
            Some(err) => err,
            None => {
                return Err(StreamError::InvalidConfig(
                    "max attempts must be at least 1".to_string(),
                ))
            }
        };
        tracing::warn!(attempts = attempt, error = %last, "retries exhausted");
        Err(StreamError::RetryExhausted {
            attempts: attempt,
            last: Box::new(last),
        })
    }
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().is_some_and(|rx| *rx.borrow())
}

pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let signalled = rx.wait_for(|closed| *closed).await.is_ok();
    if !signalled {
        // Sender gone: nobody can cancel anymore.
        std::future::pending::<()>().await;
    }
}
