//! Flow configuration
//!
//! [`FlowConfig`] collects everything a flow needs at construction time:
//! automatic parallelism, the concurrency cap, and the error handling policy
//! (retries and the circuit breaker). It can be built in code, parsed from
//! YAML, or read from environment variables.
//!
//! # YAML
//!
//! ```rust
//! use flowcraft_core::FlowConfig;
//!
//! let config = FlowConfig::from_yaml_str(r#"
//! auto_parallel: true
//! max_concurrency: 4
//! error_handling:
//!   default_retries: 2
//!   retry_delay_ms: 250
//!   exponential_backoff: true
//!   circuit_breaker:
//!     enabled: true
//!     failure_threshold: 3
//!     reset_timeout_ms: 10000
//! "#).unwrap();
//!
//! assert_eq!(config.max_concurrency, Some(4));
//! assert_eq!(config.error_handling.circuit_breaker.failure_threshold, 3);
//! ```
//!
//! # Environment
//!
//! [`FlowConfig::from_env`] reads `{PREFIX}AUTO_PARALLEL`,
//! `{PREFIX}MAX_CONCURRENCY`, `{PREFIX}DEFAULT_RETRIES`,
//! `{PREFIX}RETRY_DELAY_MS`, `{PREFIX}MAX_RETRY_DELAY_MS`,
//! `{PREFIX}EXPONENTIAL_BACKOFF`, `{PREFIX}RETRY_JITTER`,
//! `{PREFIX}CIRCUIT_BREAKER_ENABLED`, `{PREFIX}CIRCUIT_FAILURE_THRESHOLD`,
//! `{PREFIX}CIRCUIT_RESET_TIMEOUT_MS` and `{PREFIX}DEBUG`. Unset variables keep
//! their defaults; a value that does not parse is an error naming the variable.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Circuit breaker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a trial call
    pub reset_timeout_ms: u64,
}

impl CircuitBreakerConfig {
    pub fn enabled(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            enabled: true,
            failure_threshold,
            reset_timeout_ms: reset_timeout.as_millis() as u64,
        }
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
        }
    }
}

/// Retry and circuit breaker policy for node invocations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorHandlingConfig {
    /// Extra attempts after the first one
    pub default_retries: u32,
    pub retry_delay_ms: u64,
    /// Double the delay after every failed attempt
    pub exponential_backoff: bool,
    /// Upper bound for any single delay
    pub max_retry_delay_ms: u64,
    /// Randomize each delay by a factor in `0.5..=1.5`
    pub jitter: bool,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl ErrorHandlingConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            default_retries: 0,
            retry_delay_ms: 1_000,
            exponential_backoff: false,
            max_retry_delay_ms: 30_000,
            jitter: false,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Construction-time configuration of a flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Batch independent steps into parallel groups
    pub auto_parallel: bool,
    /// Cap on concurrently running steps or branches; `None` is unbounded
    pub max_concurrency: Option<usize>,
    pub error_handling: ErrorHandlingConfig,
    /// Emit flow events through the default `tracing` logger
    pub debug: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            auto_parallel: true,
            max_concurrency: None,
            error_handling: ErrorHandlingConfig::default(),
            debug: false,
        }
    }
}

impl FlowConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auto_parallel(mut self, enabled: bool) -> Self {
        self.auto_parallel = enabled;
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn with_error_handling(mut self, error_handling: ErrorHandlingConfig) -> Self {
        self.error_handling = error_handling;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `{prefix}`-named environment variables over the defaults
    pub fn from_env(prefix: &str) -> Result<Self> {
        let mut config = Self::default();
        let key = |name: &str| format!("{}{}", prefix, name);

        if let Some(v) = env_bool(&key("AUTO_PARALLEL"))? {
            config.auto_parallel = v;
        }
        if let Some(v) = env_parse::<usize>(&key("MAX_CONCURRENCY"))? {
            config.max_concurrency = Some(v);
        }
        if let Some(v) = env_bool(&key("DEBUG"))? {
            config.debug = v;
        }

        let eh = &mut config.error_handling;
        if let Some(v) = env_parse(&key("DEFAULT_RETRIES"))? {
            eh.default_retries = v;
        }
        if let Some(v) = env_parse(&key("RETRY_DELAY_MS"))? {
            eh.retry_delay_ms = v;
        }
        if let Some(v) = env_parse(&key("MAX_RETRY_DELAY_MS"))? {
            eh.max_retry_delay_ms = v;
        }
        if let Some(v) = env_bool(&key("EXPONENTIAL_BACKOFF"))? {
            eh.exponential_backoff = v;
        }
        if let Some(v) = env_bool(&key("RETRY_JITTER"))? {
            eh.jitter = v;
        }

        let cb = &mut eh.circuit_breaker;
        if let Some(v) = env_bool(&key("CIRCUIT_BREAKER_ENABLED"))? {
            cb.enabled = v;
        }
        if let Some(v) = env_parse(&key("CIRCUIT_FAILURE_THRESHOLD"))? {
            cb.failure_threshold = v;
        }
        if let Some(v) = env_parse(&key("CIRCUIT_RESET_TIMEOUT_MS"))? {
            cb.reset_timeout_ms = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the executor cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == Some(0) {
            return Err(FlowError::configuration(
                "max_concurrency must be at least 1",
            ));
        }
        let cb = &self.error_handling.circuit_breaker;
        if cb.enabled && cb.failure_threshold == 0 {
            return Err(FlowError::configuration(
                "circuit_breaker.failure_threshold must be at least 1",
            ));
        }
        if self.error_handling.max_retry_delay_ms < self.error_handling.retry_delay_ms {
            return Err(FlowError::configuration(
                "max_retry_delay_ms must not be smaller than retry_delay_ms",
            ));
        }
        Ok(())
    }
}

fn env_var(key: &str) -> Result<Option<String>> {
    match env::var(key) {
        Ok(val) => Ok(Some(val)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(FlowError::configuration(format!(
            "Environment variable {} contains invalid UTF-8",
            key
        ))),
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_var(key)? {
        Some(val) => val.trim().parse::<T>().map(Some).map_err(|e| {
            FlowError::configuration(format!(
                "Failed to parse environment variable {}: {}",
                key, e
            ))
        }),
        None => Ok(None),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    match env_var(key)? {
        Some(val) => match val.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(FlowError::configuration(format!(
                "Invalid boolean value for {}: {}",
                key, val
            ))),
        },
        None => Ok(None),
    }
}
