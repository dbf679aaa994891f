//! `Programmable` for flows: nesting, demo routing and optimization fan-out
//!
//! Demos are addressed by dotted id. For a flow `root` with children `actor`
//! and `responder`:
//!
//! ```text
//! root            -> the flow's own demos
//! root.actor      -> child "actor"
//! root.actor.x    -> child "actor", which routes it further
//! other.actor     -> ignored
//! ```
//!
//! A flow with children rejects a demo list that addresses nothing under its
//! own id, so a mis-addressed optimizer result fails loudly.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::Flow;
use crate::error::{BoxError, FlowError, Result};
use crate::program::{
    merge_usage, AiService, DemoAssignment, ForwardOptions, OptimizedProgram, ProgramTrace, ProgramUsage,
    Programmable,
};
use crate::signature::Signature;
use crate::state::FlowState;

fn addresses(program_id: &str, id: &str) -> bool {
    program_id == id
        || program_id
            .strip_prefix(id)
            .map_or(false, |rest| rest.starts_with('.'))
}

impl Flow {
    fn route_demos(&self, demos: &[DemoAssignment]) -> Result<()> {
        let id = self.id();
        if !self.nodes.is_empty() && !demos.iter().any(|demo| addresses(&demo.program_id, &id)) {
            return Err(FlowError::DemoRouting(format!(
                "flow '{}' has {} child node(s) but no demo is addressed to '{}' or below it",
                id,
                self.nodes.len(),
                id
            )));
        }

        self.meta.write().demos = demos
            .iter()
            .filter(|demo| demo.program_id == id)
            .flat_map(|demo| demo.traces.iter().cloned())
            .collect();

        for node in &self.nodes {
            let child_id = format!("{}.{}", id, node.name);
            let slice: Vec<DemoAssignment> = demos
                .iter()
                .filter(|demo| addresses(&demo.program_id, &child_id))
                .cloned()
                .collect();
            if !slice.is_empty() {
                tracing::debug!(node = %node.name, demos = slice.len(), "routing demos to child");
                node.program.set_demos(&slice)?;
            }
        }
        Ok(())
    }

    /// Demo traces addressed to the flow itself
    pub fn demos(&self) -> Vec<Value> {
        self.meta.read().demos.clone()
    }

    pub fn examples(&self) -> Vec<Value> {
        self.meta.read().examples.clone()
    }

    /// The last optimization applied to this flow
    pub fn optimization(&self) -> Option<OptimizedProgram> {
        self.meta.read().optimization.clone()
    }

    pub fn parent_id(&self) -> Option<String> {
        self.meta.read().parent_id.clone()
    }
}

#[async_trait]
impl Programmable for Flow {
    fn signature(&self) -> Signature {
        self.signature.clone()
    }

    async fn forward(
        &self,
        ai: Arc<dyn AiService>,
        input: Value,
        options: &ForwardOptions,
    ) -> std::result::Result<Value, BoxError> {
        let state = FlowState::from_value(input)?;
        let output = self.invoke(ai, state, options).await?;
        Ok(output.into_value())
    }

    fn id(&self) -> Option<String> {
        Some(Flow::id(self))
    }

    fn set_id(&self, id: &str) {
        *self.id.write() = id.to_string();
        self.address_children();
    }

    fn set_parent_id(&self, parent_id: &str) {
        self.meta.write().parent_id = Some(parent_id.to_string());
    }

    fn set_demos(&self, demos: &[DemoAssignment]) -> Result<()> {
        self.route_demos(demos)
    }

    fn apply_optimization(&self, optimized: &OptimizedProgram) {
        self.meta.write().optimization = Some(optimized.clone());
        for node in &self.nodes {
            node.program.apply_optimization(optimized);
        }
    }

    fn set_examples(&self, examples: &[Value]) {
        self.meta.write().examples = examples.to_vec();
        for node in &self.nodes {
            node.program.set_examples(examples);
        }
    }

    fn traces(&self) -> Vec<ProgramTrace> {
        self.nodes
            .iter()
            .flat_map(|node| node.program.traces())
            .collect()
    }

    fn usage(&self) -> Vec<ProgramUsage> {
        merge_usage(self.nodes.iter().flat_map(|node| node.program.usage()))
    }

    fn reset_usage(&self) {
        for node in &self.nodes {
            node.program.reset_usage();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::addresses;

    #[test]
    fn test_addressing() {
        assert!(addresses("root", "root"));
        assert!(addresses("root.actor", "root"));
        assert!(addresses("root.actor.inner", "root.actor"));
        assert!(!addresses("rooted.actor", "root"));
        assert!(!addresses("root.actorX", "root.actor"));
    }
}
