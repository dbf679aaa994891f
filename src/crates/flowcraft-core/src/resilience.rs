//! Retry and circuit breaking for node invocations
//!
//! Every `execute` step goes through [`invoke_with_policy`]:
//!
//! ```text
//! ┌─────────────────────────────┐
//! │ cancelled already?          │──yes──► Aborted (node never called)
//! └──────────────┬──────────────┘
//!                ↓
//! ┌─────────────────────────────┐
//! │ CircuitBreaker::acquire     │──none─► CircuitOpen (node never called)
//! └──────────────┬──────────────┘
//!                ↓
//! ┌─────────────────────────────┐
//! │ attempt 1..=retries+1       │◄──┐
//! │  ok      → permit.success() │   │ sleep(delay) raced
//! │  aborted → release permit   │   │ against cancellation
//! │  error   → retry or give up ├───┘
//! └──────────────┬──────────────┘
//!                ↓ exhausted
//!        permit.failure() once, NodeInvocation
//! ```
//!
//! The breaker sees one outcome per invocation, not one per attempt. Aborts
//! are never retried and never counted.
//!
//! # Circuit States
//!
//! - **Closed**: calls flow; consecutive failures are counted
//! - **Open**: calls fail fast until `reset_timeout` has elapsed since opening
//! - **HalfOpen**: exactly one trial call is admitted; success closes the
//!   breaker, failure reopens it and restarts the timer

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{CircuitBreakerConfig, ErrorHandlingConfig};
use crate::context::RunContext;
use crate::error::{is_abort, BoxError, FlowError, Result};
use crate::events::FlowEventKind;

/// How often and how patiently a failed node call is retried
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Extra attempts after the first
    pub max_retries: u32,
    pub base_delay: Duration,
    pub exponential: bool,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    /// A single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            exponential: false,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    pub fn from_config(config: &ErrorHandlingConfig) -> Self {
        Self {
            max_retries: config.default_retries,
            base_delay: config.retry_delay(),
            exponential: config.exponential_backoff,
            max_delay: config.max_retry_delay(),
            jitter: config.jitter,
        }
    }

    /// Attempts including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (0-based)
    ///
    /// `base * 2^retry` with exponential backoff, otherwise `base`; capped at
    /// `max_delay` and optionally scaled by a random factor in `0.5..=1.5`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = if self.exponential {
            let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
            self.base_delay.saturating_mul(factor)
        } else {
            self.base_delay
        };
        let capped = if self.max_delay > Duration::ZERO {
            base.min(self.max_delay)
        } else {
            base
        };
        if self.jitter && capped > Duration::ZERO {
            let factor = rand::thread_rng().gen_range(0.5..=1.5);
            capped.mul_f64(factor)
        } else {
            capped
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ErrorHandlingConfig::default())
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// Per-flow circuit breaker shared by all concurrent runs
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                trial_in_flight: false,
            })),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Ask to make a call; `None` means fail fast
    pub fn acquire(&self) -> Option<BreakerPermit> {
        if !self.config.enabled {
            return Some(BreakerPermit::passthrough());
        }
        let mut inner = self.inner.lock();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled = inner
                    .last_failure
                    .map(|at| at.elapsed() >= self.config.reset_timeout())
                    .unwrap_or(true);
                if !cooled {
                    return None;
                }
                tracing::debug!("circuit breaker half-open, admitting trial call");
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return None;
                }
                inner.trial_in_flight = true;
                true
            }
        };
        Some(BreakerPermit {
            inner: Some(Arc::clone(&self.inner)),
            threshold: self.config.failure_threshold,
            trial,
        })
    }
}

/// Admission to make one call through the breaker
///
/// Settle it with [`success`](Self::success) or [`failure`](Self::failure).
/// Dropping it unsettled (abort, cancelled future) releases a half-open trial
/// without touching the counters.
#[must_use]
pub struct BreakerPermit {
    inner: Option<Arc<Mutex<BreakerState>>>,
    threshold: u32,
    trial: bool,
}

impl BreakerPermit {
    fn passthrough() -> Self {
        Self {
            inner: None,
            threshold: 0,
            trial: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        if let Some(inner) = self.inner.take() {
            let mut inner = inner.lock();
            if self.trial || inner.state == CircuitState::Closed {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
            }
            if self.trial {
                inner.trial_in_flight = false;
            }
        }
    }

    /// Returns the failure count when this failure opened the breaker
    pub fn failure(mut self) -> Option<u32> {
        let inner = self.inner.take()?;
        let mut inner = inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        if self.trial {
            inner.trial_in_flight = false;
            inner.state = CircuitState::Open;
            return Some(inner.consecutive_failures);
        }
        if inner.state == CircuitState::Closed && inner.consecutive_failures >= self.threshold {
            inner.state = CircuitState::Open;
            return Some(inner.consecutive_failures);
        }
        None
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            if self.trial {
                inner.lock().trial_in_flight = false;
            }
        }
    }
}

/// Sleep for `delay` unless `token` fires first
async fn backoff(delay: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Invoke a node call under the retry policy and circuit breaker
///
/// `call` receives the 1-based attempt number.
pub(crate) async fn invoke_with_policy<F, Fut>(
    node: &str,
    policy: &RetryPolicy,
    breaker: &CircuitBreaker,
    ctx: &RunContext,
    mut call: F,
) -> Result<Value>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<Value, BoxError>>,
{
    ctx.check(&format!("node '{}'", node))?;

    let permit = breaker.acquire().ok_or_else(|| {
        tracing::debug!(node, "circuit open, failing fast");
        FlowError::CircuitOpen {
            node: node.to_string(),
        }
    })?;

    let max_attempts = policy.max_attempts();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match call(attempt).await {
            Ok(output) => {
                permit.success();
                return Ok(output);
            }
            Err(err) => err,
        };

        if is_abort(&err) {
            drop(permit);
            return Err(FlowError::from_node(node, attempt, err));
        }
        if ctx.token.is_cancelled() {
            drop(permit);
            return Err(FlowError::aborted(format!(
                "cancelled while node '{}' was failing",
                node
            )));
        }
        if attempt >= max_attempts {
            tracing::warn!(node, attempts = attempt, error = %err, "node failed, retries exhausted");
            if let Some(failures) = permit.failure() {
                tracing::error!(node, consecutive_failures = failures, "circuit breaker opened");
                ctx.emit(FlowEventKind::CircuitOpened {
                    node: node.to_string(),
                    consecutive_failures: failures,
                });
            }
            return Err(FlowError::from_node(node, attempt, err));
        }

        let delay = policy.delay_for(attempt - 1);
        ctx.emit(FlowEventKind::NodeRetry {
            node: node.to_string(),
            attempt,
            delay_ms: delay.as_millis() as u64,
            error: err.to_string(),
        });
        if !backoff(delay, &ctx.token).await {
            drop(permit);
            return Err(FlowError::aborted(format!(
                "cancelled while waiting to retry node '{}'",
                node
            )));
        }
    }
}
