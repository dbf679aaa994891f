//! Fluent flow construction
//!
//! [`FlowBuilder`] records nodes and steps in declaration order and turns them
//! into an executable [`Flow`] with [`build`](FlowBuilder::build). Builder
//! methods chain on `&mut Self`; misuse (duplicate node names, `when` without
//! `branch`, executing an unknown node, ...) is recorded and reported as a
//! [`FlowError::Construction`] by `build()`, before anything runs.
//!
//! ```rust
//! use std::sync::Arc;
//! use flowcraft_core::{FlowBuilder, FlowState, FnProgram, Programmable};
//! use serde_json::json;
//!
//! # fn main() -> flowcraft_core::Result<()> {
//! let summarizer = FnProgram::new("text:string -> summary:string", |_ai, input, _opts| async move {
//!     Ok(json!({ "summary": input["text"] }))
//! })?;
//!
//! let mut builder = FlowBuilder::new();
//! builder
//!     .with_id("pipeline")
//!     .node("summarizer", Arc::new(summarizer))
//!     .execute("summarizer", |s: &FlowState| json!({ "text": s.get("text") }))
//!     .map(|s: &FlowState| s.with("done", true));
//! let flow = builder.build()?;
//!
//! assert_eq!(flow.execution_plan().total_steps, 2);
//! # Ok(())
//! # }
//! ```
//!
//! # Branching
//!
//! `branch(discriminator)` opens a block, each `when(value)` starts a case and
//! `merge()` closes it. Only the case whose value equals the discriminator
//! result runs; with no match the state passes through untouched.
//!
//! # Loops
//!
//! `while_loop(condition, max_iterations)` … `end_while()` repeats the
//! enclosed steps. Loops and branches nest inside each other, but a branch
//! cannot open while another branch is still open.

use std::any::type_name;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::FlowConfig;
use crate::error::{BoxError, FlowError, Result};
use crate::events::FlowLogger;
use crate::flow::{Flow, FlowParts, NodeEntry};
use crate::planner::{plan_block, validate_reads, ExecutionPlan};
use crate::program::{ProgramFactory, Programmable};
use crate::signature::{Field, FieldType, IntoSignature, NodeExtension, Signature};
use crate::state::{Access, FlowState, StateUpdate};
use crate::step::{
    execute_step, result_key, Block, ConditionFn, DiscriminatorFn, ExecuteOptions, MergeStrategy,
    ReducerFn, StateCheck, Step, StepKind, SubFlow, Transform,
};

const DEFAULT_FLOW_ID: &str = "flow";

struct NodeSlot {
    name: String,
    program: Option<Arc<dyn Programmable>>,
    /// The node's own contract, handed to the program factory
    signature: Signature,
    /// What the node adds to the flow's aggregate signature
    exposed: Signature,
}

enum OpenBlock {
    Branch {
        discriminator: DiscriminatorFn,
        cases: Vec<(Value, Vec<Step>)>,
    },
    Loop {
        condition: ConditionFn,
        max_iterations: usize,
        body: Vec<Step>,
    },
}

/// Builder for [`Flow`]
pub struct FlowBuilder {
    id: String,
    config: FlowConfig,
    input_signature: Option<Signature>,
    nodes: Vec<NodeSlot>,
    steps: Vec<Step>,
    open: Vec<OpenBlock>,
    factory: Option<Arc<dyn ProgramFactory>>,
    logger: Option<Arc<dyn FlowLogger>>,
    error: Option<FlowError>,
}

impl Default for FlowBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowBuilder {
    pub fn new() -> Self {
        Self {
            id: DEFAULT_FLOW_ID.to_string(),
            config: FlowConfig::default(),
            input_signature: None,
            nodes: Vec::new(),
            steps: Vec::new(),
            open: Vec::new(),
            factory: None,
            logger: None,
            error: None,
        }
    }

    /// Id used to address the flow and, as `{id}.{node}`, its children
    pub fn with_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.id = id.into();
        self
    }

    pub fn with_config(&mut self, config: FlowConfig) -> &mut Self {
        self.config = config;
        self
    }

    /// Declare the flow's input (and output) fields
    ///
    /// With an input signature, declared step reads are checked at build time.
    pub fn with_signature(&mut self, signature: impl IntoSignature) -> &mut Self {
        match signature.into_signature() {
            Ok(signature) => {
                self.input_signature = Some(signature);
                self
            }
            Err(err) => self.fail(err),
        }
    }

    /// Builds programs for nodes registered with [`node_signature`](Self::node_signature)
    pub fn with_program_factory(&mut self, factory: Arc<dyn ProgramFactory>) -> &mut Self {
        self.factory = Some(factory);
        self
    }

    /// Receive structured execution events
    pub fn with_logger(&mut self, logger: Arc<dyn FlowLogger>) -> &mut Self {
        self.logger = Some(logger);
        self
    }

    // ---- nodes ----

    /// Register a program under `name`
    pub fn node(&mut self, name: impl Into<String>, program: Arc<dyn Programmable>) -> &mut Self {
        let name = name.into();
        let exposed = result_signature(&name);
        let signature = program.signature();
        self.register(name, Some(program), signature, exposed)
    }

    /// Alias for [`node`](Self::node)
    pub fn n(&mut self, name: impl Into<String>, program: Arc<dyn Programmable>) -> &mut Self {
        self.node(name, program)
    }

    /// Register a node by signature; the program comes from the factory at build time
    pub fn node_signature(&mut self, name: impl Into<String>, signature: impl IntoSignature) -> &mut Self {
        let name = name.into();
        match signature.into_signature() {
            Ok(signature) => {
                let exposed = result_signature(&name);
                self.register(name, None, signature, exposed)
            }
            Err(err) => self.fail(err),
        }
    }

    /// Register a node whose signature is `base` with extra fields spliced in
    ///
    /// The fields the node contributes to the flow signature are prefixed
    /// with the node name (`reasoner` + `answer` becomes `reasonerAnswer`).
    pub fn node_extended(
        &mut self,
        name: impl Into<String>,
        base: impl IntoSignature,
        extension: NodeExtension,
    ) -> &mut Self {
        let name = name.into();
        let extended = base
            .into_signature()
            .and_then(|base| base.extend(&extension));
        match extended {
            Ok(signature) => {
                let exposed = signature.prefixed(&name);
                self.register(name, None, signature, exposed)
            }
            Err(err) => self.fail(err),
        }
    }

    /// Alias for [`node_extended`](Self::node_extended)
    pub fn nx(&mut self, name: impl Into<String>, base: impl IntoSignature, extension: NodeExtension) -> &mut Self {
        self.node_extended(name, base, extension)
    }

    fn register(
        &mut self,
        name: String,
        program: Option<Arc<dyn Programmable>>,
        signature: Signature,
        exposed: Signature,
    ) -> &mut Self {
        if name.is_empty() {
            return self.fail(FlowError::construction("Node name cannot be empty"));
        }
        if self.has_node(&name) {
            return self.fail(FlowError::construction(format!(
                "Node '{}' is already registered",
                name
            )));
        }
        self.nodes.push(NodeSlot {
            name,
            program,
            signature,
            exposed,
        });
        self
    }

    fn has_node(&self, name: &str) -> bool {
        self.nodes.iter().any(|node| node.name == name)
    }

    // ---- steps ----

    /// Transform the state; runs in a group of its own
    pub fn map<F, U>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&FlowState) -> U + Send + Sync + 'static,
        U: Into<StateUpdate>,
    {
        self.map_with(Transform::new(f))
    }

    /// Alias for [`map`](Self::map)
    pub fn m<F, U>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&FlowState) -> U + Send + Sync + 'static,
        U: Into<StateUpdate>,
    {
        self.map(f)
    }

    /// Transform that may fail
    pub fn try_map<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&FlowState) -> std::result::Result<StateUpdate, BoxError> + Send + Sync + 'static,
    {
        self.map_with(Transform::fallible(f))
    }

    /// Transform that awaits
    pub fn map_async<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn(FlowState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<StateUpdate, BoxError>> + Send + 'static,
    {
        self.map_with(Transform::from_async(f))
    }

    /// Transform that awaits and receives the run's cancellation token
    pub fn map_async_cancellable<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn(FlowState, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<StateUpdate, BoxError>> + Send + 'static,
    {
        self.map_with(Transform::from_async_cancellable(f))
    }

    /// Transform with declared read/write keys, eligible for batching
    pub fn map_with(&mut self, transform: Transform) -> &mut Self {
        let (reads, writes) = (transform.reads.clone(), transform.writes.clone());
        self.push_step(Step::new(StepKind::Map(transform), reads, writes))
    }

    /// Several transforms as one step
    ///
    /// With `parallel`, every transform sees the same input and their changes
    /// are merged in order; otherwise each sees the previous one's output.
    pub fn map_many(&mut self, transforms: Vec<Transform>, parallel: bool) -> &mut Self {
        if transforms.is_empty() {
            return self.fail(FlowError::construction("map_many() needs at least one transform"));
        }
        for (i, first) in transforms.iter().enumerate() {
            for second in &transforms[i + 1..] {
                if let (Some(a), Some(b)) = (first.writes.key_set(), second.writes.key_set()) {
                    if let Some(key) = a.intersection(b).next() {
                        let key = key.clone();
                        return self.fail(FlowError::construction(format!(
                            "map_many() transforms both write '{}'",
                            key
                        )));
                    }
                }
            }
        }
        let reads = transforms
            .iter()
            .fold(Access::none(), |acc, t| acc.union(&t.reads));
        let writes = transforms
            .iter()
            .fold(Access::none(), |acc, t| acc.union(&t.writes));
        self.push_step(Step::new(StepKind::MapMany { transforms, parallel }, reads, writes))
    }

    /// Invoke node `name` with the selector's output; the result lands in `{name}Result`
    pub fn execute<F>(&mut self, name: impl Into<String>, selector: F) -> &mut Self
    where
        F: Fn(&FlowState) -> Value + Send + Sync + 'static,
    {
        self.execute_with(name, selector, ExecuteOptions::new())
    }

    /// Alias for [`execute`](Self::execute)
    pub fn e<F>(&mut self, name: impl Into<String>, selector: F) -> &mut Self
    where
        F: Fn(&FlowState) -> Value + Send + Sync + 'static,
    {
        self.execute(name, selector)
    }

    pub fn execute_with<F>(&mut self, name: impl Into<String>, selector: F, options: ExecuteOptions) -> &mut Self
    where
        F: Fn(&FlowState) -> Value + Send + Sync + 'static,
    {
        let name = name.into();
        if !self.has_node(&name) {
            return self.fail(unknown_node(&name));
        }
        self.push_step(execute_step(name, Arc::new(selector), options))
    }

    // ---- branches ----

    /// Open a branch on the discriminator's value
    pub fn branch<F>(&mut self, discriminator: F) -> &mut Self
    where
        F: Fn(&FlowState) -> Value + Send + Sync + 'static,
    {
        if self.open.iter().any(|block| matches!(block, OpenBlock::Branch { .. })) {
            return self.fail(FlowError::construction(
                "Nested branches are not supported; merge() the open branch first",
            ));
        }
        self.open.push(OpenBlock::Branch {
            discriminator: Arc::new(discriminator),
            cases: Vec::new(),
        });
        self
    }

    /// Alias for [`branch`](Self::branch)
    pub fn b<F>(&mut self, discriminator: F) -> &mut Self
    where
        F: Fn(&FlowState) -> Value + Send + Sync + 'static,
    {
        self.branch(discriminator)
    }

    /// Start the case taken when the discriminator equals `value`
    pub fn when(&mut self, value: impl Into<Value>) -> &mut Self {
        let value = value.into();
        match self.open.last_mut() {
            Some(OpenBlock::Branch { cases, .. }) => {
                if cases.iter().any(|(existing, _)| *existing == value) {
                    let message = format!("Duplicate when() value {} in branch", value);
                    return self.fail(FlowError::construction(message));
                }
                cases.push((value, Vec::new()));
                self
            }
            _ => self.fail(FlowError::construction("when() called without a matching branch()")),
        }
    }

    /// Alias for [`when`](Self::when)
    pub fn w(&mut self, value: impl Into<Value>) -> &mut Self {
        self.when(value)
    }

    /// Close the open branch
    pub fn merge(&mut self) -> &mut Self {
        self.close_branch(None)
    }

    /// Alias for [`merge`](Self::merge)
    pub fn mg(&mut self) -> &mut Self {
        self.merge()
    }

    /// Close the open branch and check the merged state deserialises into `T`
    pub fn merge_as<T>(&mut self) -> &mut Self
    where
        T: DeserializeOwned + 'static,
    {
        self.close_branch(Some(typed_check::<T>()))
    }

    fn close_branch(&mut self, check: Option<StateCheck>) -> &mut Self {
        let (discriminator, cases) = match self.open.pop() {
            Some(OpenBlock::Branch { discriminator, cases }) => (discriminator, cases),
            Some(other) => {
                self.open.push(other);
                return self.fail(FlowError::construction(
                    "merge() called while a while_loop() is open; end_while() first",
                ));
            }
            None => return self.fail(FlowError::construction("merge() called without a matching branch()")),
        };
        if cases.is_empty() {
            return self.fail(FlowError::construction("branch() needs at least one when() case"));
        }

        let cases: Vec<(Value, Block)> = cases
            .into_iter()
            .map(|(value, steps)| (value, unplanned(steps)))
            .collect();
        let writes = cases
            .iter()
            .fold(Access::none(), |acc, (_, block)| acc.union(&block.writes()));
        let step = Step::new(
            StepKind::Branch {
                discriminator,
                cases,
                check,
            },
            Access::All,
            writes,
        )
        .barrier();
        self.push_step(step)
    }

    // ---- loops ----

    /// Repeat the following steps while `condition` holds
    pub fn while_loop<F>(&mut self, condition: F, max_iterations: usize) -> &mut Self
    where
        F: Fn(&FlowState) -> bool + Send + Sync + 'static,
    {
        if max_iterations == 0 {
            return self.fail(FlowError::construction("while_loop() needs max_iterations > 0"));
        }
        if let Some(OpenBlock::Branch { cases, .. }) = self.open.last() {
            if cases.is_empty() {
                return self.fail(FlowError::construction("steps inside branch() must follow when()"));
            }
        }
        self.open.push(OpenBlock::Loop {
            condition: Arc::new(condition),
            max_iterations,
            body: Vec::new(),
        });
        self
    }

    /// Close the innermost loop
    pub fn end_while(&mut self) -> &mut Self {
        let (condition, max_iterations, body) = match self.open.pop() {
            Some(OpenBlock::Loop {
                condition,
                max_iterations,
                body,
            }) => (condition, max_iterations, body),
            Some(other) => {
                self.open.push(other);
                return self.fail(FlowError::construction(
                    "end_while() called while a branch() is open; merge() first",
                ));
            }
            None => return self.fail(FlowError::construction("end_while() called without a matching while_loop()")),
        };
        let body = unplanned(body);
        let writes = body.writes();
        let step = Step::new(
            StepKind::While {
                condition,
                body,
                max_iterations,
            },
            Access::All,
            writes,
        )
        .barrier();
        self.push_step(step)
    }

    // ---- parallel ----

    /// Run sub-flows against the same input state
    ///
    /// Finish with one of the [`ParallelBuilder`] merge methods.
    pub fn parallel(&mut self, branches: impl IntoIterator<Item = SubFlow>) -> ParallelBuilder<'_> {
        ParallelBuilder {
            builder: self,
            branches: branches.into_iter().collect(),
            concurrent: true,
        }
    }

    /// Alias for [`parallel`](Self::parallel)
    pub fn p(&mut self, branches: impl IntoIterator<Item = SubFlow>) -> ParallelBuilder<'_> {
        self.parallel(branches)
    }

    fn push_step(&mut self, step: Step) -> &mut Self {
        let target = match self.open.last_mut() {
            Some(OpenBlock::Branch { cases, .. }) => cases.last_mut().map(|(_, steps)| steps),
            Some(OpenBlock::Loop { body, .. }) => Some(body),
            None => Some(&mut self.steps),
        };
        if let Some(steps) = target {
            steps.push(step);
            return self;
        }
        self.fail(FlowError::construction("steps inside branch() must follow when()"))
    }

    /// Keep the first construction error; `build()` reports it
    fn fail(&mut self, err: FlowError) -> &mut Self {
        if self.error.is_none() {
            tracing::debug!(error = %err, "flow construction error recorded");
            self.error = Some(err);
        }
        self
    }

    // ---- build ----

    /// Aggregate signature: flow fields plus every node's contribution
    pub fn signature(&self) -> Signature {
        let mut signature = self.input_signature.clone().unwrap_or_default();
        for node in &self.nodes {
            signature.absorb(&node.exposed);
        }
        signature
    }

    /// Validate, plan and produce the executable flow
    #[tracing::instrument(skip(self), fields(flow_id = %self.id))]
    pub fn build(mut self) -> Result<Flow> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        match self.open.last() {
            Some(OpenBlock::Branch { .. }) => {
                return Err(FlowError::construction("branch() was never closed with merge()"))
            }
            Some(OpenBlock::Loop { .. }) => {
                return Err(FlowError::construction("while_loop() was never closed with end_while()"))
            }
            None => {}
        }
        self.config.validate()?;

        let signature = self.signature();
        if let Some(input) = &self.input_signature {
            let inputs: BTreeSet<String> = input.inputs().iter().map(|f| f.name.clone()).collect();
            validate_reads(&self.steps, &inputs)?;
        }

        let mut nodes = Vec::with_capacity(self.nodes.len());
        for slot in self.nodes {
            let program = match slot.program {
                Some(program) => program,
                None => match &self.factory {
                    Some(factory) => factory.create(&slot.name, &slot.signature)?,
                    None => {
                        return Err(FlowError::construction(format!(
                            "Node '{}' was registered by signature but no program factory is set",
                            slot.name
                        )))
                    }
                },
            };
            nodes.push(NodeEntry {
                name: slot.name,
                program,
            });
        }

        let auto_parallel = self.config.auto_parallel;
        let root = plan_block(self.steps, auto_parallel);
        let plan = ExecutionPlan::from_block(&root, auto_parallel);
        tracing::debug!(
            total_steps = plan.total_steps,
            parallel_groups = plan.parallel_groups,
            max_parallelism = plan.max_parallelism,
            "flow planned"
        );

        Ok(Flow::from_parts(FlowParts {
            id: self.id,
            signature,
            nodes,
            root,
            plan,
            config: self.config,
            logger: self.logger,
        }))
    }
}

/// Merge options for [`FlowBuilder::parallel`]
pub struct ParallelBuilder<'a> {
    builder: &'a mut FlowBuilder,
    branches: Vec<SubFlow>,
    concurrent: bool,
}

impl<'a> ParallelBuilder<'a> {
    /// Run the sub-flows one after another instead of concurrently
    pub fn sequential(mut self) -> Self {
        self.concurrent = false;
        self
    }

    /// Store `reducer(branch states)` under `key`
    pub fn merge<F>(self, key: impl Into<String>, reducer: F) -> &'a mut FlowBuilder
    where
        F: Fn(&[FlowState]) -> Value + Send + Sync + 'static,
    {
        let reducer: ReducerFn = Arc::new(
            move |states: &[FlowState]| -> std::result::Result<Value, BoxError> { Ok(reducer(states)) },
        );
        self.finish_reduce(key.into(), reducer)
    }

    /// Like [`merge`](Self::merge) with a reducer that may fail
    pub fn try_merge<F>(self, key: impl Into<String>, reducer: F) -> &'a mut FlowBuilder
    where
        F: Fn(&[FlowState]) -> std::result::Result<Value, BoxError> + Send + Sync + 'static,
    {
        self.finish_reduce(key.into(), Arc::new(reducer))
    }

    /// Apply every sub-flow's changes in order; later sub-flows win
    pub fn merge_all(self) -> &'a mut FlowBuilder {
        self.finish(MergeStrategy::Shallow { check: None }, None)
    }

    /// [`merge_all`](Self::merge_all), then check the state deserialises into `T`
    pub fn merge_as<T>(self) -> &'a mut FlowBuilder
    where
        T: DeserializeOwned + 'static,
    {
        self.finish(
            MergeStrategy::Shallow {
                check: Some(typed_check::<T>()),
            },
            None,
        )
    }

    fn finish_reduce(self, key: String, reducer: ReducerFn) -> &'a mut FlowBuilder {
        let writes = Access::keys([key.clone()]);
        self.finish(MergeStrategy::Reduce { key, reducer }, Some(writes))
    }

    fn finish(self, merge: MergeStrategy, writes: Option<Access>) -> &'a mut FlowBuilder {
        let Self {
            builder,
            branches,
            concurrent,
        } = self;
        if branches.is_empty() {
            return builder.fail(FlowError::construction("parallel() needs at least one sub-flow"));
        }
        let unknown = branches
            .iter()
            .flat_map(|branch| branch.steps.iter())
            .find_map(|step| match &step.kind {
                StepKind::Execute { node, .. } if !builder.has_node(node) => Some(node.clone()),
                _ => None,
            });
        if let Some(node) = unknown {
            return builder.fail(unknown_node(&node));
        }

        let blocks: Vec<Block> = branches.into_iter().map(|branch| unplanned(branch.steps)).collect();
        let reads = blocks
            .iter()
            .fold(Access::none(), |acc, block| acc.union(&block.reads()));
        let writes = writes.unwrap_or_else(|| {
            blocks
                .iter()
                .fold(Access::none(), |acc, block| acc.union(&block.writes()))
        });
        let step = Step::new(
            StepKind::Parallel {
                branches: blocks,
                merge,
                parallel: concurrent,
            },
            reads,
            writes,
        );
        builder.push_step(step)
    }
}

fn unplanned(steps: Vec<Step>) -> Block {
    Block {
        steps,
        groups: Vec::new(),
    }
}

fn unknown_node(name: &str) -> FlowError {
    FlowError::construction(format!("Node '{}' not found; register it before execute()", name))
}

fn result_signature(name: &str) -> Signature {
    Signature::new(Vec::new(), vec![Field::new(result_key(name), FieldType::Json)]).unwrap_or_default()
}

fn typed_check<T>() -> StateCheck
where
    T: DeserializeOwned + 'static,
{
    Arc::new(|state: &FlowState| {
        state.to_typed::<T>().map(|_| ()).map_err(|err| {
            FlowError::state(format!(
                "merged state does not match {}: {}",
                type_name::<T>(),
                err
            ))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::FnProgram;
    use serde_json::json;

    fn echo(sig: &str) -> Arc<dyn Programmable> {
        Arc::new(FnProgram::new(sig, |_ai, input, _opts| async move { Ok(input) }).unwrap())
    }

    fn construction_message(builder: FlowBuilder) -> String {
        match builder.build() {
            Err(FlowError::Construction(message)) => message,
            Err(other) => panic!("expected construction error, got {other}"),
            Ok(_) => panic!("expected construction error"),
        }
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut builder = FlowBuilder::new();
        builder.node("a", echo("x -> y")).node("a", echo("x -> y"));
        assert!(construction_message(builder).contains("'a' is already registered"));
    }

    #[test]
    fn test_execute_unknown_node_rejected() {
        let mut builder = FlowBuilder::new();
        builder.execute("ghost", |s: &FlowState| s.to_value());
        assert!(construction_message(builder).contains("'ghost' not found"));
    }

    #[test]
    fn test_branch_misuse() {
        let mut builder = FlowBuilder::new();
        builder.when("a");
        assert!(construction_message(builder).contains("without a matching branch()"));

        let mut builder = FlowBuilder::new();
        builder.merge();
        assert!(construction_message(builder).contains("merge() called without"));

        let mut builder = FlowBuilder::new();
        builder
            .branch(|s: &FlowState| s.get("k").cloned().unwrap_or_default())
            .when("a")
            .branch(|_: &FlowState| json!(1));
        assert!(construction_message(builder).contains("Nested branches"));

        let mut builder = FlowBuilder::new();
        builder
            .branch(|_: &FlowState| json!(1))
            .map(|s: &FlowState| s.clone());
        assert!(construction_message(builder).contains("must follow when()"));

        let mut builder = FlowBuilder::new();
        builder.branch(|_: &FlowState| json!(1)).when(1);
        assert!(construction_message(builder).contains("never closed"));
    }

    #[test]
    fn test_loop_misuse() {
        let mut builder = FlowBuilder::new();
        builder.end_while();
        assert!(construction_message(builder).contains("without a matching while_loop()"));

        let mut builder = FlowBuilder::new();
        builder.while_loop(|_: &FlowState| false, 3);
        assert!(construction_message(builder).contains("end_while()"));
    }

    #[test]
    fn test_loops_and_branches_nest() {
        let mut builder = FlowBuilder::new();
        builder
            .while_loop(|_: &FlowState| false, 3)
            .branch(|_: &FlowState| json!("a"))
            .when("a")
            .map(|s: &FlowState| s.clone())
            .merge()
            .end_while();
        let flow = builder.build().unwrap();
        assert_eq!(flow.execution_plan().total_steps, 1);
    }

    #[test]
    fn test_map_many_overlapping_writes_rejected() {
        let mut builder = FlowBuilder::new();
        builder.map_many(
            vec![
                Transform::new(|s: &FlowState| s.clone()).writes(["x"]),
                Transform::new(|s: &FlowState| s.clone()).writes(["x", "y"]),
            ],
            true,
        );
        assert!(construction_message(builder).contains("both write 'x'"));
    }

    #[test]
    fn test_signature_nodes_need_a_factory() {
        let mut builder = FlowBuilder::new();
        builder.node_signature("writer", "topic -> draft");
        assert!(construction_message(builder).contains("no program factory"));

        let mut builder = FlowBuilder::new();
        let factory = |_node: &str, sig: &Signature| -> Result<Arc<dyn Programmable>> {
            Ok(Arc::new(FnProgram::new(sig.clone(), |_ai, input, _opts| async move {
                Ok(input)
            })?))
        };
        builder
            .with_program_factory(Arc::new(factory))
            .node_signature("writer", "topic -> draft");
        let flow = builder.build().unwrap();
        assert_eq!(flow.node_names(), vec!["writer".to_string()]);
    }

    #[test]
    fn test_declared_reads_checked_against_inputs() {
        let mut builder = FlowBuilder::new();
        builder
            .with_signature("question:string -> answer:string")
            .map_with(Transform::new(|s: &FlowState| s.clone()).reads(["missing"]).writes(["x"]));
        assert!(construction_message(builder).contains("'missing'"));
    }

    #[test]
    fn test_malformed_flow_signature_fails_build() {
        let mut builder = FlowBuilder::new();
        builder
            .with_signature("question:widget -> answer")
            .map(|s: &FlowState| s.clone());
        assert!(builder.build().is_err());

        let mut builder = FlowBuilder::new();
        builder.with_signature("question -> answer");
        let inputs: Vec<_> = builder.signature().inputs().iter().map(|f| f.name.clone()).collect();
        assert_eq!(inputs, vec!["question".to_string()]);
        assert!(builder.build().is_ok());
    }

    #[test]
    fn test_invalid_config_rejected_at_build() {
        let mut builder = FlowBuilder::new();
        builder.with_config(FlowConfig::new().with_max_concurrency(0));
        assert!(matches!(builder.build(), Err(FlowError::Configuration(_))));
    }

    #[test]
    fn test_aggregate_signature() {
        let mut builder = FlowBuilder::new();
        builder
            .with_signature("userQuestion:string -> finalAnswer:string")
            .node("summarizer", echo("text -> summary"))
            .node_extended(
                "reasoner",
                "question -> answer",
                NodeExtension::new().prepend_output(Field::string("reasoning")),
            );
        let signature = builder.signature();

        let inputs: Vec<_> = signature.inputs().iter().map(|f| f.name.as_str()).collect();
        let outputs: Vec<_> = signature.outputs().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(inputs, vec!["userQuestion", "reasonerQuestion"]);
        assert_eq!(
            outputs,
            vec!["finalAnswer", "summarizerResult", "reasonerReasoning", "reasonerAnswer"]
        );
    }

    #[test]
    fn test_parallel_validates_nodes() {
        let mut builder = FlowBuilder::new();
        builder
            .parallel([SubFlow::new().execute("nope", |s: &FlowState| s.to_value())])
            .merge_all();
        assert!(construction_message(builder).contains("'nope' not found"));
    }
}
