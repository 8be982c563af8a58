//! Bounded exponential backoff for calls into external capabilities.
//!
//! Only [`ProviderError::Transient`] failures are retried. Permanent failures
//! and exhausted budgets surface as [`CanonError::ExternalService`].

use std::cell::Cell;
use std::time::Duration;

use backon::{BlockingRetryable, ExponentialBuilder};

use crate::error::{CanonError, ProviderError, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Values below 1 are treated as 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &crate::config::EmbeddingConfig) -> Self {
        Self {
            max_attempts: config.max_retries.saturating_add(1),
            initial_backoff: Duration::from_millis(config.retry_backoff_ms),
            max_backoff: Duration::from_secs(5),
        }
    }

    /// A policy that never sleeps. Used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
            .with_jitter()
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget is spent.
    ///
    /// Blocking: sleeps the current thread between attempts. Call from
    /// `spawn_blocking` contexts only.
    pub fn run<T, F>(&self, service: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> std::result::Result<T, ProviderError>,
    {
        let attempts = Cell::new(0u32);
        let result = (|| {
            attempts.set(attempts.get() + 1);
            op()
        })
        .retry(self.backoff())
        .sleep(std::thread::sleep)
        .when(ProviderError::is_transient)
        .notify(|err: &ProviderError, delay: Duration| {
            tracing::warn!(
                service,
                attempt = attempts.get(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure, retrying"
            );
        })
        .call();

        result.map_err(|err| CanonError::ExternalService {
            service,
            attempts: attempts.get(),
            message: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::immediate(3);
        let mut calls = 0;
        let value = policy
            .run("embedding", || {
                calls += 1;
                if calls < 3 {
                    Err(ProviderError::Transient("timeout".into()))
                } else {
                    Ok(42)
                }
            })
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls, 3);
    }

    #[test]
    fn permanent_failure_is_not_retried() {
        let policy = RetryPolicy::immediate(5);
        let mut calls = 0;
        let err = policy
            .run::<(), _>("embedding", || {
                calls += 1;
                Err(ProviderError::Permanent("bad request".into()))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        match err {
            CanonError::ExternalService { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn budget_is_bounded() {
        let policy = RetryPolicy::immediate(2);
        let mut calls = 0;
        let err = policy
            .run::<(), _>("llm", || {
                calls += 1;
                Err(ProviderError::Transient("503".into()))
            })
            .unwrap_err();
        assert_eq!(calls, 2);
        assert_eq!(err.kind(), "external_service_error");
    }

    #[test]
    fn waits_between_attempts_within_cap() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        };
        let started = std::time::Instant::now();
        let mut calls = 0;
        let err = policy
            .run::<(), _>("embedding", || {
                calls += 1;
                Err(ProviderError::Transient("timeout".into()))
            })
            .unwrap_err();
        let elapsed = started.elapsed();
        assert_eq!(calls, 3);
        assert!(elapsed >= Duration::from_millis(5));
        assert!(elapsed < Duration::from_secs(2));
        match err {
            CanonError::ExternalService { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn config_retries_map_to_attempts() {
        let mut config = crate::config::EmbeddingConfig::default();
        config.max_retries = 2;
        config.retry_backoff_ms = 50;
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(50));
    }
}
