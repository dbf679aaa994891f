//! The executable flow
//!
//! A [`Flow`] is produced by [`FlowBuilder::build`](crate::FlowBuilder::build)
//! and can be run any number of times, concurrently if needed. Each
//! [`invoke`](Flow::invoke) owns its state and cancellation token; the only
//! state shared between runs is the circuit breaker and the registry of
//! in-flight runs that [`stop`](Flow::stop) cancels.
//!
//! # Key Types
//!
//! - [`Flow`] - Compiled step list, node table and resilience policy
//! - [`ExecutionPlan`](crate::ExecutionPlan) - How steps were grouped
//!
//! # Nesting
//!
//! `Flow` implements [`Programmable`](crate::Programmable), so a flow can be
//! registered as a node of another flow. Ids, demos, optimizations, examples,
//! traces and usage flow through the tree by dotted id (`root.child.leaf`).

mod execution;
mod introspection;
mod optimization;

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::builder::FlowBuilder;
use crate::config::FlowConfig;
use crate::context::RunRegistry;
use crate::events::{FlowLogger, TracingFlowLogger};
use crate::planner::ExecutionPlan;
use crate::program::{OptimizedProgram, Programmable};
use crate::resilience::{CircuitBreaker, RetryPolicy};
use crate::signature::Signature;
use crate::step::Block;

/// A registered node
pub(crate) struct NodeEntry {
    pub(crate) name: String,
    pub(crate) program: Arc<dyn Programmable>,
}

/// Everything the builder hands over
pub(crate) struct FlowParts {
    pub(crate) id: String,
    pub(crate) signature: Signature,
    pub(crate) nodes: Vec<NodeEntry>,
    pub(crate) root: Block,
    pub(crate) plan: ExecutionPlan,
    pub(crate) config: FlowConfig,
    pub(crate) logger: Option<Arc<dyn FlowLogger>>,
}

#[derive(Debug, Default)]
struct FlowMeta {
    parent_id: Option<String>,
    demos: Vec<Value>,
    examples: Vec<Value>,
    optimization: Option<OptimizedProgram>,
}

/// Compiled flow ready for execution
pub struct Flow {
    id: RwLock<String>,
    signature: Signature,
    nodes: Vec<NodeEntry>,
    root: Block,
    plan: ExecutionPlan,
    config: FlowConfig,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    runs: Arc<RunRegistry>,
    logger: Option<Arc<dyn FlowLogger>>,
    meta: RwLock<FlowMeta>,
}

impl Flow {
    /// Start building a flow
    pub fn builder() -> FlowBuilder {
        FlowBuilder::new()
    }

    pub(crate) fn from_parts(parts: FlowParts) -> Self {
        let logger = parts.logger.or_else(|| {
            parts
                .config
                .debug
                .then(|| Arc::new(TracingFlowLogger) as Arc<dyn FlowLogger>)
        });
        let flow = Self {
            id: RwLock::new(parts.id),
            signature: parts.signature,
            nodes: parts.nodes,
            root: parts.root,
            plan: parts.plan,
            retry: RetryPolicy::from_config(&parts.config.error_handling),
            breaker: CircuitBreaker::new(parts.config.error_handling.circuit_breaker.clone()),
            config: parts.config,
            runs: Arc::new(RunRegistry::default()),
            logger,
            meta: RwLock::new(FlowMeta::default()),
        };
        flow.address_children();
        flow
    }

    pub(crate) fn node_entry(&self, name: &str) -> Option<&NodeEntry> {
        self.nodes.iter().find(|node| node.name == name)
    }

    /// Give every child the id `{flow id}.{node name}`
    fn address_children(&self) {
        let id = self.id.read().clone();
        for node in &self.nodes {
            node.program.set_parent_id(&id);
            node.program.set_id(&format!("{}.{}", id, node.name));
        }
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("id", &*self.id.read())
            .field("nodes", &self.node_names())
            .field("plan", &self.plan)
            .field("config", &self.config)
            .finish()
    }
}
