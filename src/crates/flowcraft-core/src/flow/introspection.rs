//! Flow introspection
//!
//! Read-only accessors for the plan, nodes and resilience state.

use std::sync::Arc;

use super::Flow;
use crate::config::FlowConfig;
use crate::planner::ExecutionPlan;
use crate::program::Programmable;
use crate::resilience::CircuitState;

impl Flow {
    /// Current id; children are addressed as `{id}.{node}`
    pub fn id(&self) -> String {
        self.id.read().clone()
    }

    /// How the steps were grouped, computed once at build time
    pub fn execution_plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// The program registered under `name`
    pub fn node(&self, name: &str) -> Option<Arc<dyn Programmable>> {
        self.node_entry(name).map(|entry| Arc::clone(&entry.program))
    }

    /// Node names in registration order
    pub fn node_names(&self) -> Vec<String> {
        self.nodes.iter().map(|node| node.name.clone()).collect()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Runs currently in flight
    pub fn active_runs(&self) -> usize {
        self.runs.active_count()
    }
}
