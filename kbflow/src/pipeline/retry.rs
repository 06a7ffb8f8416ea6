//! Retry policy for network-bound calls.
//!
//! Transient failures back off exponentially with jitter, or wait exactly
//! as long as the remote side asked. A missing model triggers one
//! capability refresh and a single immediate retry. Everything else is
//! returned to the caller untouched.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::{ErrorKind, PipelineError, Result};
use crate::models::ModelRouter;

/// How the wait grows between transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Doubles after every failure.
    #[default]
    Exponential,
    /// Grows by the base delay after every failure.
    Linear,
    /// Always the base delay.
    Constant,
}

impl BackoffStrategy {
    fn delay_ms(self, base_ms: u64, attempt: usize) -> u64 {
        match self {
            Self::Exponential => {
                let exp = u32::try_from(attempt).unwrap_or(u32::MAX);
                base_ms.saturating_mul(2u64.saturating_pow(exp))
            }
            Self::Linear => {
                base_ms.saturating_mul(u64::try_from(attempt + 1).unwrap_or(u64::MAX))
            }
            Self::Constant => base_ms,
        }
    }
}

/// Randomisation applied on top of the backoff, so workers that failed
/// together do not retry together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Wait exactly the backoff.
    None,
    /// Anywhere between zero and the backoff.
    #[default]
    Full,
    /// At least half the backoff.
    Equal,
}

impl JitterStrategy {
    fn apply(self, delay_ms: u64) -> u64 {
        let mut rng = rand::thread_rng();
        match self {
            Self::None => delay_ms,
            Self::Full if delay_ms > 0 => rng.gen_range(0..=delay_ms),
            Self::Equal if delay_ms > 1 => {
                let half = delay_ms / 2;
                half + rng.gen_range(0..=half)
            }
            Self::Full | Self::Equal => delay_ms,
        }
    }
}

/// Retry policy for one run, part of [`super::PipelineConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per call for transient failures, the first one included.
    pub max_attempts: usize,
    /// First backoff, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single backoff, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth of the backoff.
    pub backoff_strategy: BackoffStrategy,
    /// Randomisation of the backoff.
    pub jitter_strategy: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_strategy: BackoffStrategy::default(),
            jitter_strategy: JitterStrategy::default(),
        }
    }
}

impl RetryConfig {
    /// The default policy: three attempts, exponential from one second.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the attempt budget.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the first backoff.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Caps every backoff.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets how the backoff grows.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the randomisation.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }

    /// Wait before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let capped = self
            .backoff_strategy
            .delay_ms(self.base_delay_ms, attempt)
            .min(self.max_delay_ms);
        Duration::from_millis(self.jitter_strategy.apply(capped))
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep, then try again.
    Retry(Duration),
    /// Refresh model capabilities, then try again at once.
    RefreshAndRetry,
    /// The attempt budget is spent.
    GiveUp,
    /// The error kind is never retried.
    NotRetryable,
}

/// Attempt bookkeeping for one call.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryState {
    /// Failed attempts so far.
    pub attempt: usize,
    /// Whether the one capability refresh was used.
    pub refreshed: bool,
}

/// Decides what to do after `error` on the current attempt.
#[must_use]
pub fn should_retry(state: &mut RetryState, config: &RetryConfig, error: &PipelineError) -> RetryDecision {
    match error.kind() {
        ErrorKind::TransientNetwork => {
            state.attempt += 1;
            if state.attempt >= config.max_attempts {
                return RetryDecision::GiveUp;
            }
            let delay = error
                .retry_after()
                .unwrap_or_else(|| config.delay_for(state.attempt - 1));
            RetryDecision::Retry(delay)
        }
        ErrorKind::ModelUnavailable => {
            if state.refreshed {
                RetryDecision::GiveUp
            } else {
                state.refreshed = true;
                RetryDecision::RefreshAndRetry
            }
        }
        _ => RetryDecision::NotRetryable,
    }
}

/// Executes an operation under the retry policy.
///
/// `router`, when given, is used to refresh capabilities after a
/// model-unavailable failure.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    key: &str,
    router: Option<&ModelRouter>,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut state = RetryState::default();
    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        match should_retry(&mut state, config, &error) {
            RetryDecision::Retry(delay) => {
                debug!(
                    key = %key,
                    attempt = state.attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "Retrying after error"
                );
                tokio::time::sleep(delay).await;
            }
            RetryDecision::RefreshAndRetry => {
                let Some(router) = router else {
                    return Err(error);
                };
                warn!(key = %key, error = %error, "Model unavailable, refreshing capabilities");
                router.cache().refresh_all().await;
            }
            RetryDecision::GiveUp | RetryDecision::NotRetryable => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ModelPhase;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryConfig {
        RetryConfig::new()
            .with_base_delay_ms(1)
            .with_jitter(JitterStrategy::None)
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.backoff_strategy, BackoffStrategy::Exponential);
    }

    #[test]
    fn test_delay_strategies_without_jitter() {
        let exp = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_jitter(JitterStrategy::None);
        assert_eq!(exp.delay_for(0), Duration::from_millis(100));
        assert_eq!(exp.delay_for(2), Duration::from_millis(400));

        let linear = exp.clone().with_backoff(BackoffStrategy::Linear);
        assert_eq!(linear.delay_for(2), Duration::from_millis(300));

        let capped = exp.with_max_delay_ms(250);
        assert_eq!(capped.delay_for(10), Duration::from_millis(250));
    }

    #[test]
    fn test_full_jitter_stays_below_delay() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant);
        assert!((0..20).all(|_| config.delay_for(0) <= Duration::from_millis(100)));
    }

    #[test]
    fn test_decisions_by_kind() {
        let config = fast().with_max_attempts(2);
        let mut state = RetryState::default();

        let rate_limited = PipelineError::rate_limited("429", Duration::from_secs(7));
        assert_eq!(
            should_retry(&mut state, &config, &rate_limited),
            RetryDecision::Retry(Duration::from_secs(7))
        );
        assert_eq!(
            should_retry(&mut state, &config, &PipelineError::transient("reset")),
            RetryDecision::GiveUp
        );

        let missing = PipelineError::model_unavailable(ModelPhase::Vision, "down");
        assert_eq!(
            should_retry(&mut state, &config, &missing),
            RetryDecision::RefreshAndRetry
        );
        assert_eq!(should_retry(&mut state, &config, &missing), RetryDecision::GiveUp);

        assert_eq!(
            should_retry(
                &mut RetryState::default(),
                &config,
                &PipelineError::validation("1", "x")
            ),
            RetryDecision::NotRetryable
        );
    }

    #[tokio::test]
    async fn test_with_retry_recovers_from_transient_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = with_retry(&fast().with_max_attempts(5), "fetch", None, || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(PipelineError::transient("flaky"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_stops_at_max_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: Result<()> = with_retry(&fast().with_max_attempts(3), "fetch", None, || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(PipelineError::transient("down")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_validation_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: Result<()> = with_retry(&fast(), "item", None, || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(PipelineError::validation("1", "empty")) }
        })
        .await;
        assert!(matches!(result, Err(PipelineError::Validation { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
