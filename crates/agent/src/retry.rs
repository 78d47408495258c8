//! Retry controller for the upstream model call.
//!
//! Exponential backoff with uniform jitter:
//! `delay = min(initial * 2^attempt, max_delay) * (1 ± jitter)`.
//! Only transient failures are retried; permanent ones and cancellation
//! propagate immediately. Tool execution is never wrapped by this.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use reagent_config::RetryConfig;
use reagent_core::error::{Error, ProviderError};
use reagent_core::event::{DomainEvent, MetricsSink};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::classify::is_transient;

/// Backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first; 0 is treated as 1
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Jitter fraction, e.g. 0.25 for ±25%
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: config.initial_delay(),
            max_delay: config.max_delay(),
            jitter: config.jitter,
        }
    }

    /// Jitter as actually applied: NaN counts as none, above 1.0 as 1.0.
    fn jitter(&self) -> f64 {
        if self.jitter.is_nan() {
            return 0.0;
        }
        self.jitter.clamp(0.0, 1.0)
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Un-jittered delay before retry number `attempt` (0-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay with jitter applied, drawn from `rng`.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter();
        if jitter == 0.0 {
            return base;
        }
        let factor = rng.random_range(-jitter..=jitter);
        base.mul_f64((1.0 + factor).max(0.0))
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Wraps one model call with the retry policy.
#[derive(Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts,
    /// or `cancel` fires. Each attempt and each backoff wait race the token.
    pub async fn call<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let attempts = self.policy.attempts();
        let mut attempt = 0u32;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                r = op() => r,
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(ProviderError::Cancelled) => return Err(Error::Cancelled),
                Err(e) => e,
            };

            if !is_transient(&err) {
                debug!(error = %err, "Permanent model-call failure, not retrying");
                return Err(err.into());
            }

            attempt += 1;
            if attempt >= attempts {
                warn!(attempts, error = %err, "Model call failed, retries exhausted");
                return Err(err.into());
            }

            let delay = self.policy.jittered_delay(attempt - 1, &mut rand::rng());
            warn!(
                attempt,
                max_attempts = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient model-call failure, backing off"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record(DomainEvent::RetryScheduled {
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    error_message: err.to_string(),
                    timestamp: Utc::now(),
                });
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
