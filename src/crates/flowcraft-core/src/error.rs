//! Error types for flow construction, configuration and execution
//!
//! Every fallible operation in this crate returns [`Result<T>`], an alias over
//! [`FlowError`]. Errors raised by user code (node programs, map transforms)
//! travel as [`BoxError`] and are wrapped with the step or node that produced
//! them, so the original error stays reachable through
//! [`std::error::Error::source`] and `downcast_ref`.
//!
//! # Error Hierarchy
//!
//! ```text
//! FlowError
//! ├── Construction     - Builder misuse (duplicate node, malformed branch, ...)
//! ├── Aborted          - Cancellation observed; never retried or counted
//! ├── NodeInvocation   - A node failed after its retry budget was spent
//! ├── CircuitOpen      - Breaker rejected the call without invoking the node
//! ├── Step             - A map transform or merge reducer failed
//! ├── DemoRouting      - Demo list does not address a flow that has children
//! ├── State            - State shape errors (non-object input, typed merge)
//! ├── LoopLimit        - A while loop exceeded its iteration cap
//! ├── Configuration    - Invalid configuration values
//! ├── Serialization    - JSON errors
//! └── Yaml             - YAML errors
//! ```
//!
//! # Matching Errors
//!
//! ```rust
//! use flowcraft_core::FlowError;
//!
//! fn describe(err: &FlowError) -> String {
//!     match err {
//!         FlowError::Aborted { .. } => "cancelled".to_string(),
//!         FlowError::NodeInvocation { node, attempts, .. } => {
//!             format!("{} gave up after {} attempts", node, attempts)
//!         }
//!         FlowError::CircuitOpen { node } => format!("{} is failing fast", node),
//!         other => other.to_string(),
//!     }
//! }
//! ```
//!
//! # Aborts Across Nested Flows
//!
//! A nested flow returns its [`FlowError::Aborted`] boxed inside a
//! [`BoxError`]. [`FlowError::from_node`] and [`FlowError::from_step`] unwrap
//! it again, so an abort keeps its identity no matter how deep it started.

use thiserror::Error;

/// Boxed error returned by node programs and user transforms
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Convenience result type using [`FlowError`]
pub type Result<T> = std::result::Result<T, FlowError>;

/// Errors produced while building or running a flow
#[derive(Error, Debug)]
pub enum FlowError {
    /// The builder was used incorrectly
    ///
    /// Raised synchronously by builder methods and by `build()`:
    /// duplicate node names, unknown nodes in `execute`, `when` outside a
    /// branch, invalid field categories on extended nodes, and similar.
    #[error("Flow construction failed: {0}")]
    Construction(String),

    /// Cancellation was observed before or during execution
    ///
    /// Never retried and never counted by the circuit breaker.
    #[error("Flow execution aborted: {reason}")]
    Aborted {
        /// Where the abort was observed
        reason: String,
    },

    /// A node kept failing until its retry budget was exhausted
    #[error("Node '{node}' failed after {attempts} attempt(s): {source}")]
    NodeInvocation {
        /// Registered node name
        node: String,
        /// Number of attempts made, including the first
        attempts: u32,
        /// The error returned by the last attempt
        #[source]
        source: BoxError,
    },

    /// The flow's circuit breaker is open
    #[error("Circuit breaker is open; node '{node}' was not invoked")]
    CircuitOpen {
        /// Node whose invocation was rejected
        node: String,
    },

    /// A map transform, selector or merge reducer failed
    #[error("Step '{step}' failed: {source}")]
    Step {
        /// Label of the failing step
        step: String,
        #[source]
        source: BoxError,
    },

    /// `set_demos` was called without an entry for the flow itself
    #[error("Demo routing failed: {0}")]
    DemoRouting(String),

    /// State had an unexpected shape
    #[error("State error: {0}")]
    State(String),

    /// A while loop hit its iteration cap with the condition still true
    #[error("Loop exceeded {max_iterations} iterations")]
    LoopLimit {
        /// Configured cap
        max_iterations: usize,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl FlowError {
    /// Create a construction error
    pub fn construction(msg: impl Into<String>) -> Self {
        Self::Construction(msg.into())
    }

    /// Create an abort error
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Whether this error represents cancellation
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// Whether the retry layer may attempt the call again
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Aborted { .. }
                | Self::Construction(_)
                | Self::DemoRouting(_)
                | Self::Configuration(_)
        )
    }

    /// Wrap the final error of a node after retries
    ///
    /// An abort coming out of a nested flow is returned unchanged.
    pub fn from_node(node: impl Into<String>, attempts: u32, err: BoxError) -> Self {
        match err.downcast::<FlowError>() {
            Ok(flow_err) if flow_err.is_aborted() => *flow_err,
            Ok(flow_err) => Self::NodeInvocation {
                node: node.into(),
                attempts,
                source: flow_err,
            },
            Err(source) => Self::NodeInvocation {
                node: node.into(),
                attempts,
                source,
            },
        }
    }

    /// Wrap an error returned by a transform or reducer
    pub fn from_step(step: impl Into<String>, err: BoxError) -> Self {
        match err.downcast::<FlowError>() {
            Ok(flow_err) if flow_err.is_aborted() => *flow_err,
            Ok(flow_err) => Self::Step {
                step: step.into(),
                source: flow_err,
            },
            Err(source) => Self::Step {
                step: step.into(),
                source,
            },
        }
    }
}

/// Whether a boxed node error is a [`FlowError::Aborted`]
pub fn is_abort(err: &BoxError) -> bool {
    err.downcast_ref::<FlowError>()
        .map(FlowError::is_aborted)
        .unwrap_or(false)
}
