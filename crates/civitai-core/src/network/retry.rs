//! Exponential backoff for transient Civitai failures.
//!
//! The policy knows nothing about what it retries. Batch redownloads, single
//! downloads and scanner hash lookups all drive it with their own predicate
//! (usually [`CivitaiError::is_retryable`](crate::CivitaiError::is_retryable))
//! and an optional `Retry-After` hint.

use crate::config::NetworkConfig;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// No single wait is longer than this, hints included.
    pub max_delay: Duration,
    pub exponential_base: f64,
    /// Scale each wait by a random factor in `0.5..1.5`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: NetworkConfig::MAX_RETRIES,
            base_delay: NetworkConfig::RETRY_BASE_DELAY,
            max_delay: NetworkConfig::RETRY_MAX_DELAY,
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Wait before retry number `attempt + 1`, where `attempt` counts from 0.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let cap = self.max_delay.as_secs_f64();
        let backoff = (self.base_delay.as_secs_f64()
            * self.exponential_base.powi(attempt as i32))
        .min(cap);

        let secs = if self.jitter {
            (backoff * rand::rng().random_range(0.5..1.5)).min(cap)
        } else {
            backoff
        };
        Duration::from_secs_f64(secs)
    }

    /// Backoff stretched to a server hint, still capped at `max_delay`.
    pub fn delay_with_hint(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let backoff = self.calculate_delay(attempt);
        hint.map_or(backoff, |hint| backoff.max(hint).min(self.max_delay))
    }
}

/// What happened across all attempts.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    pub attempts: u32,
    /// Sum of all waits.
    pub total_delay: Duration,
    pub success: bool,
    pub last_error: Option<String>,
}

impl RetryStats {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Handed to the observer before each wait.
#[derive(Debug, Clone)]
pub struct RetryNotice {
    /// The attempt that just failed (1-based).
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub error: String,
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or runs out of attempts.
pub async fn retry_async<F, Fut, T, E>(
    config: &RetryConfig,
    operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> (Result<T, E>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_async_observed(config, operation, should_retry, |_| None, |_| {}).await
}

/// [`retry_async`] with a per-error delay hint (such as `Retry-After`) and an
/// observer called before every wait.
pub async fn retry_async_observed<F, Fut, T, E>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
    delay_hint: impl Fn(&E) -> Option<Duration>,
    mut on_retry: impl FnMut(&RetryNotice),
) -> (Result<T, E>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut stats = RetryStats::default();

    for attempt in 1..=max_attempts {
        stats.attempts = attempt;

        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("Succeeded on attempt {}/{}", attempt, max_attempts);
                }
                stats.success = true;
                return (Ok(value), stats);
            }
            Err(err) => err,
        };
        stats.last_error = Some(err.to_string());

        if !should_retry(&err) {
            debug!("Not retrying: {}", err);
            return (Err(err), stats);
        }
        if attempt == max_attempts {
            warn!("Giving up after {} attempts: {}", max_attempts, err);
            return (Err(err), stats);
        }

        let delay = config.delay_with_hint(attempt - 1, delay_hint(&err));
        stats.total_delay += delay;
        warn!(
            "Attempt {}/{} failed: {}. Retrying in {:.1}s",
            attempt,
            max_attempts,
            err,
            delay.as_secs_f64()
        );
        on_retry(&RetryNotice {
            attempt,
            max_attempts,
            delay,
            error: err.to_string(),
        });
        tokio::time::sleep(delay).await;
    }

    unreachable!("the final attempt always returns")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CivitaiError;
    use std::cell::Cell;

    fn fixed(base_ms: u64) -> RetryConfig {
        RetryConfig::new()
            .with_base_delay(Duration::from_millis(base_ms))
            .with_jitter(false)
    }

    fn busy() -> CivitaiError {
        CivitaiError::ServiceUnavailable {
            url: "https://civitai.com/api/v1/models/1".to_string(),
        }
    }

    #[test]
    fn test_defaults_follow_network_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, NetworkConfig::MAX_RETRIES);
        assert_eq!(config.base_delay, NetworkConfig::RETRY_BASE_DELAY);
        assert_eq!(config.max_delay, NetworkConfig::RETRY_MAX_DELAY);
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = fixed(1000).with_max_delay(Duration::from_secs(5));
        let delays: Vec<u64> = (0..5).map(|a| config.calculate_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn test_jitter_band() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_secs(2))
            .with_jitter(true);
        for _ in 0..32 {
            let delay = config.calculate_delay(0);
            assert!(
                delay >= Duration::from_secs(1) && delay <= Duration::from_secs(3),
                "{delay:?}"
            );
        }
    }

    #[test]
    fn test_retry_after_hint() {
        let config = fixed(1000).with_max_delay(Duration::from_secs(60));
        // longer hint wins
        assert_eq!(
            config.delay_with_hint(0, Some(Duration::from_secs(20))),
            Duration::from_secs(20)
        );
        // shorter hint loses to the backoff
        assert_eq!(
            config.delay_with_hint(2, Some(Duration::from_millis(10))),
            Duration::from_secs(4)
        );
        assert_eq!(
            config.delay_with_hint(0, Some(Duration::from_secs(600))),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        assert_eq!(RetryConfig::new().with_max_attempts(0).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_first_try() {
        let (result, stats) =
            retry_async(&fixed(10), || async { Ok::<_, CivitaiError>(7) }, CivitaiError::is_retryable)
                .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.retries(), 0);
        assert!(stats.success);
    }

    #[tokio::test]
    async fn test_recovers_from_transient_errors() {
        let calls = Cell::new(0);
        let (result, stats) = retry_async(
            &fixed(5).with_max_attempts(4),
            || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    if n < 3 {
                        Err(busy())
                    } else {
                        Ok("done")
                    }
                }
            },
            CivitaiError::is_retryable,
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.retries(), 2);
        assert_eq!(stats.total_delay, Duration::from_millis(5 + 10));
    }

    #[tokio::test]
    async fn test_exhaustion_keeps_last_error() {
        let (result, stats) = retry_async(
            &fixed(5).with_max_attempts(3),
            || async { Err::<(), _>(busy()) },
            CivitaiError::is_retryable,
        )
        .await;

        assert!(matches!(result, Err(CivitaiError::ServiceUnavailable { .. })));
        assert_eq!(stats.attempts, 3);
        assert!(!stats.success);
        assert!(stats.last_error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_permanent_error_stops_immediately() {
        let (result, stats) = retry_async(
            &fixed(5),
            || async {
                Err::<(), _>(CivitaiError::NotFound {
                    url: "x".to_string(),
                })
            },
            CivitaiError::is_retryable,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.total_delay, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_observer_and_hint() {
        let mut notices = Vec::new();
        let (result, stats) = retry_async_observed(
            &fixed(5).with_max_attempts(3),
            || async {
                Err::<(), _>(CivitaiError::RateLimited {
                    url: "x".to_string(),
                    retry_after_secs: None,
                })
            },
            CivitaiError::is_retryable,
            |_: &CivitaiError| Some(Duration::from_millis(20)),
            |notice| notices.push((notice.attempt, notice.delay)),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(stats.attempts, 3);
        assert_eq!(
            notices,
            vec![
                (1, Duration::from_millis(20)),
                (2, Duration::from_millis(20)),
            ]
        );
        assert_eq!(stats.total_delay, Duration::from_millis(40));
    }
}
