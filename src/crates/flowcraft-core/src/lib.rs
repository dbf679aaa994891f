//! # flowcraft-core - Dataflow Orchestration for Program Graphs
//!
//! Compose pure state transforms and calls to pluggable, possibly LLM-backed
//! programs into flows with automatic parallelism, explicit branching and
//! merging, retries, a circuit breaker, and cancellation that reaches every
//! node.
//!
//! ## Overview
//!
//! - **Fluent construction** - [`FlowBuilder`] records nodes and steps in order
//! - **Automatic parallelism** - steps with disjoint declared keys are batched
//!   into groups that run concurrently under a concurrency cap
//! - **Resilience** - per-node retry with backoff and a per-flow circuit breaker
//! - **Cancellation** - a [`CancellationToken`](tokio_util::sync::CancellationToken)
//!   per run, plus [`Flow::stop`] for every run in flight
//! - **Tracing** - an optional [`Tracer`] span per run, handed to nodes as parent
//! - **Nesting** - [`Flow`] is itself [`Programmable`]; demos and
//!   optimizations are routed to children by dotted id
//!
//! ## Core Concepts
//!
//! ### State
//!
//! A run threads a [`FlowState`] (a JSON object) through its steps. Steps
//! return a [`StateUpdate`]: a patch merged shallowly or a full replacement.
//! An `execute("name", ...)` step stores the node's output under `nameResult`.
//!
//! ### Planning
//!
//! Every step declares the keys it reads and writes ([`Access`]). Transforms
//! that declare nothing are treated as touching everything and run alone.
//! The resulting [`ExecutionPlan`] is fixed at build time.
//!
//! ```text
//!  map{w:a}   map{w:b}        execute{r:a,b}      branch ... merge
//!  └── group 0 ───┘           └── group 1 ─┘      └── group 2 ───┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use flowcraft_core::{FlowBuilder, FlowState, FnProgram, ForwardOptions, NamedAi, Transform};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> flowcraft_core::Result<()> {
//! let scorer = FnProgram::new("text:string -> score:number", |_ai, input, _opts| async move {
//!     let len = input["text"].as_str().map_or(0, str::len);
//!     Ok(json!({ "score": len }))
//! })?;
//!
//! let mut builder = FlowBuilder::new();
//! builder
//!     .with_id("review")
//!     .node("scorer", Arc::new(scorer))
//!     .map_with(
//!         Transform::new(|s: &FlowState| s.with("title", "draft"))
//!             .reads(["text"])
//!             .writes(["title"]),
//!     )
//!     .execute("scorer", |s: &FlowState| json!({ "text": s.get("text") }));
//! let flow = builder.build()?;
//!
//! let output = flow
//!     .invoke(
//!         Arc::new(NamedAi::new("mock")),
//!         FlowState::from_value(json!({ "text": "hello" }))?,
//!         &ForwardOptions::new(),
//!     )
//!     .await?;
//! assert_eq!(output.get("scorerResult"), Some(&json!({ "score": 5 })));
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! [`FlowConfig`] controls auto-parallelism, the concurrency cap, retries and
//! the circuit breaker. It can be built in code, parsed from YAML with
//! [`FlowConfig::from_yaml_str`], or read from the environment with
//! [`FlowConfig::from_env`].
//!
//! ## Observability
//!
//! Entry points are instrumented with `tracing`. For a per-run event stream,
//! plug a [`FlowLogger`](events::FlowLogger) into the builder, or set
//! `debug` in the config to log [`FlowEvent`](events::FlowEvent)s through
//! `tracing`.

pub mod builder;
pub mod config;
pub(crate) mod context;
pub mod error;
pub mod events;
pub mod flow;
pub mod planner;
pub mod program;
pub mod resilience;
pub mod signature;
pub mod state;
pub mod step;
pub mod trace;

pub use builder::{FlowBuilder, ParallelBuilder};
pub use config::{CircuitBreakerConfig, ErrorHandlingConfig, FlowConfig};
pub use error::{BoxError, FlowError, Result};
pub use events::{FlowEvent, FlowEventKind, FlowLogger, TracingFlowLogger};
pub use flow::Flow;
pub use planner::{ExecutionPlan, PlannedGroup, PlannedStep};
pub use program::{
    AiService, DemoAssignment, FnProgram, ForwardOptions, NamedAi, OptimizedProgram, ProgramFactory,
    ProgramTrace, ProgramUsage, Programmable,
};
pub use resilience::{CircuitBreaker, CircuitState, RetryPolicy};
pub use signature::{Field, FieldType, IntoSignature, NodeExtension, Signature};
pub use state::{Access, FlowState, StateUpdate};
pub use step::{ExecuteOptions, SubFlow, Transform};
pub use trace::{InMemoryTracer, RecordedSpan, Span, SpanGuard, TraceContext, Tracer, TracingTracer};
