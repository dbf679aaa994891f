//! Recorded steps and the closures they carry
//!
//! The builder turns each fluent call into a [`Step`] with declared read and
//! write key sets. Blocks of steps (the flow body, branch cases, loop bodies,
//! parallel sub-flows) are stored as a [`Block`] together with the parallel
//! groups the planner computed for them.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, Result};
use crate::program::{AiService, ForwardOptions};
use crate::state::{Access, FlowState, StateUpdate};

pub type MapFn = Arc<dyn Fn(&FlowState) -> std::result::Result<StateUpdate, BoxError> + Send + Sync>;
pub type AsyncMapFn =
    Arc<dyn Fn(FlowState) -> BoxFuture<'static, std::result::Result<StateUpdate, BoxError>> + Send + Sync>;
pub type CancellableMapFn = Arc<
    dyn Fn(FlowState, CancellationToken) -> BoxFuture<'static, std::result::Result<StateUpdate, BoxError>>
        + Send
        + Sync,
>;
pub type SelectorFn = Arc<dyn Fn(&FlowState) -> Value + Send + Sync>;
pub type DiscriminatorFn = Arc<dyn Fn(&FlowState) -> Value + Send + Sync>;
pub type ConditionFn = Arc<dyn Fn(&FlowState) -> bool + Send + Sync>;
pub type ReducerFn = Arc<dyn Fn(&[FlowState]) -> std::result::Result<Value, BoxError> + Send + Sync>;
pub(crate) type StateCheck = Arc<dyn Fn(&FlowState) -> Result<()> + Send + Sync>;

#[derive(Clone)]
enum TransformFn {
    Sync(MapFn),
    Async(AsyncMapFn),
    Cancellable(CancellableMapFn),
}

/// A state transform with the keys it reads and writes
///
/// Undeclared access defaults to "everything", which keeps the transform in
/// a group of its own. Declaring keys lets the planner batch it with
/// neighbouring steps.
#[derive(Clone)]
pub struct Transform {
    func: TransformFn,
    pub(crate) reads: Access,
    pub(crate) writes: Access,
}

impl Transform {
    /// Wrap a synchronous transform
    pub fn new<F, U>(f: F) -> Self
    where
        F: Fn(&FlowState) -> U + Send + Sync + 'static,
        U: Into<StateUpdate>,
    {
        let func: MapFn = Arc::new(
            move |state: &FlowState| -> std::result::Result<StateUpdate, BoxError> { Ok(f(state).into()) },
        );
        Self::from_fn(TransformFn::Sync(func))
    }

    /// Wrap a synchronous transform that may fail
    pub fn fallible<F>(f: F) -> Self
    where
        F: Fn(&FlowState) -> std::result::Result<StateUpdate, BoxError> + Send + Sync + 'static,
    {
        Self::from_fn(TransformFn::Sync(Arc::new(f)))
    }

    /// Wrap an async transform
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(FlowState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<StateUpdate, BoxError>> + Send + 'static,
    {
        let func: AsyncMapFn = Arc::new(
            move |state: FlowState| -> BoxFuture<'static, std::result::Result<StateUpdate, BoxError>> {
                Box::pin(f(state))
            },
        );
        Self::from_fn(TransformFn::Async(func))
    }

    /// Wrap an async transform that watches the run's cancellation token
    ///
    /// The token fires on `Flow::stop()` or when the caller's token is
    /// cancelled; long transforms should race it against their own work.
    pub fn from_async_cancellable<F, Fut>(f: F) -> Self
    where
        F: Fn(FlowState, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<StateUpdate, BoxError>> + Send + 'static,
    {
        let func: CancellableMapFn = Arc::new(
            move |state: FlowState,
                  token: CancellationToken|
                  -> BoxFuture<'static, std::result::Result<StateUpdate, BoxError>> {
                Box::pin(f(state, token))
            },
        );
        Self::from_fn(TransformFn::Cancellable(func))
    }

    fn from_fn(func: TransformFn) -> Self {
        Self {
            func,
            reads: Access::All,
            writes: Access::All,
        }
    }

    /// Declare the keys this transform reads
    pub fn reads<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reads = Access::keys(keys);
        self
    }

    /// Declare the keys this transform writes
    pub fn writes<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.writes = Access::keys(keys);
        self
    }

    pub(crate) fn is_async(&self) -> bool {
        !matches!(self.func, TransformFn::Sync(_))
    }

    pub(crate) async fn apply(
        &self,
        state: &FlowState,
        token: &CancellationToken,
    ) -> std::result::Result<StateUpdate, BoxError> {
        match &self.func {
            TransformFn::Sync(f) => f(state),
            TransformFn::Async(f) => f(state.clone()).await,
            TransformFn::Cancellable(f) => f(state.clone(), token.clone()).await,
        }
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transform")
            .field("async", &self.is_async())
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .finish()
    }
}

/// Per-step options for `execute_with`
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    pub(crate) reads: Option<Access>,
    pub(crate) ai: Option<Arc<dyn AiService>>,
    pub(crate) options: Option<ForwardOptions>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the state keys the selector reads
    pub fn reads<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reads = Some(Access::keys(keys));
        self
    }

    /// Use a different AI service for this step
    pub fn ai(mut self, ai: Arc<dyn AiService>) -> Self {
        self.ai = Some(ai);
        self
    }

    /// Override caller-level forward options for this step
    pub fn options(mut self, options: ForwardOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// How the results of parallel sub-flows are combined
#[derive(Clone)]
pub(crate) enum MergeStrategy {
    /// Apply each branch's changes in order, later branches winning
    Shallow { check: Option<StateCheck> },
    /// Store `reducer(branch states)` under `key`
    Reduce { key: String, reducer: ReducerFn },
}

#[derive(Clone)]
pub(crate) enum StepKind {
    Map(Transform),
    MapMany {
        transforms: Vec<Transform>,
        parallel: bool,
    },
    Execute {
        node: String,
        selector: SelectorFn,
        ai: Option<Arc<dyn AiService>>,
        options: Option<ForwardOptions>,
    },
    Branch {
        discriminator: DiscriminatorFn,
        cases: Vec<(Value, Block)>,
        check: Option<StateCheck>,
    },
    Parallel {
        branches: Vec<Block>,
        merge: MergeStrategy,
        parallel: bool,
    },
    While {
        condition: ConditionFn,
        body: Block,
        max_iterations: usize,
    },
}

impl StepKind {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Map(_) => "map",
            Self::MapMany { .. } => "map_many",
            Self::Execute { .. } => "execute",
            Self::Branch { .. } => "branch",
            Self::Parallel { .. } => "parallel",
            Self::While { .. } => "while",
        }
    }
}

/// One recorded unit of work
#[derive(Clone)]
pub(crate) struct Step {
    pub(crate) label: String,
    pub(crate) kind: StepKind,
    pub(crate) reads: Access,
    pub(crate) writes: Access,
    /// Always scheduled alone
    pub(crate) barrier: bool,
}

impl Step {
    pub(crate) fn new(kind: StepKind, reads: Access, writes: Access) -> Self {
        Self {
            label: kind.name().to_string(),
            kind,
            barrier: writes.is_all(),
            reads,
            writes,
        }
    }

    pub(crate) fn barrier(mut self) -> Self {
        self.barrier = true;
        self
    }

    pub(crate) fn labelled(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("label", &self.label)
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .field("barrier", &self.barrier)
            .finish()
    }
}

/// Steps plus the parallel groups they run in
#[derive(Clone, Debug, Default)]
pub(crate) struct Block {
    pub(crate) steps: Vec<Step>,
    /// Indices into `steps`, in execution order
    pub(crate) groups: Vec<Vec<usize>>,
}

impl Block {
    /// Keys read from outside the block, ignoring those an earlier step in
    /// the block already wrote
    pub(crate) fn reads(&self) -> Access {
        let mut written = Access::none();
        let mut external = Access::none();
        for step in &self.steps {
            match step.reads.key_set() {
                None => return Access::All,
                Some(keys) => {
                    let outside: Vec<String> = keys
                        .iter()
                        .filter(|key| !written.contains(key))
                        .cloned()
                        .collect();
                    external.extend(&Access::keys(outside));
                }
            }
            written.extend(&step.writes);
        }
        external
    }

    pub(crate) fn writes(&self) -> Access {
        self.steps
            .iter()
            .fold(Access::none(), |acc, step| acc.union(&step.writes))
    }
}

/// A sub-flow for `parallel`, built by value
///
/// ```rust
/// use flowcraft_core::{FlowState, SubFlow};
///
/// let left = SubFlow::new().map(|s: &FlowState| s.with("x", 1));
/// let right = SubFlow::new().execute("scorer", |s: &FlowState| s.to_value());
/// # let _ = (left, right);
/// ```
#[derive(Clone, Default)]
pub struct SubFlow {
    pub(crate) steps: Vec<Step>,
}

impl SubFlow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map<F, U>(self, f: F) -> Self
    where
        F: Fn(&FlowState) -> U + Send + Sync + 'static,
        U: Into<StateUpdate>,
    {
        self.map_with(Transform::new(f))
    }

    pub fn map_with(mut self, transform: Transform) -> Self {
        let (reads, writes) = (transform.reads.clone(), transform.writes.clone());
        self.steps.push(Step::new(StepKind::Map(transform), reads, writes));
        self
    }

    pub fn execute<F>(self, node: impl Into<String>, selector: F) -> Self
    where
        F: Fn(&FlowState) -> Value + Send + Sync + 'static,
    {
        self.execute_with(node, selector, ExecuteOptions::new())
    }

    pub fn execute_with<F>(mut self, node: impl Into<String>, selector: F, options: ExecuteOptions) -> Self
    where
        F: Fn(&FlowState) -> Value + Send + Sync + 'static,
    {
        self.steps.push(execute_step(node.into(), Arc::new(selector), options));
        self
    }
}

pub(crate) fn result_key(node: &str) -> String {
    format!("{}Result", node)
}

pub(crate) fn execute_step(node: String, selector: SelectorFn, options: ExecuteOptions) -> Step {
    let reads = options.reads.unwrap_or(Access::All);
    let writes = Access::keys([result_key(&node)]);
    let label = format!("execute:{}", node);
    Step::new(
        StepKind::Execute {
            node,
            selector,
            ai: options.ai,
            options: options.options,
        },
        reads,
        writes,
    )
    .labelled(label)
}
