//! The contract every flow node satisfies
//!
//! A node is any value implementing [`Programmable`]: it exposes a
//! [`Signature`], runs through [`Programmable::forward`], and takes part in
//! the configuration lifecycle (ids, demos, optimizations, usage accounting).
//! [`Flow`](crate::Flow) implements the trait itself, so flows nest as nodes.
//!
//! [`FnProgram`] adapts an async closure into a full program with the
//! bookkeeping already wired up:
//!
//! ```rust
//! use flowcraft_core::{FnProgram, Programmable};
//! use serde_json::json;
//!
//! let echo = FnProgram::new("text:string -> echo:string", |_ai, input, _opts| async move {
//!     Ok(json!({ "echo": input["text"].clone() }))
//! })
//! .unwrap();
//!
//! assert_eq!(echo.signature().outputs()[0].name, "echo");
//! ```

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, FlowError, Result};
use crate::signature::{IntoSignature, Signature};
use crate::trace::{TraceContext, Tracer};

/// Handle to the AI service a program talks to
///
/// Flows never call the service themselves; they hand it to each node.
pub trait AiService: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> Option<&str> {
        None
    }
}

/// An [`AiService`] that only carries a name and model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedAi {
    name: String,
    model: Option<String>,
}

impl NamedAi {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

impl AiService for NamedAi {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }
}

/// Options accepted by every `forward` call
///
/// The cancellation token, tracer and trace context belong to the run and
/// reach every nested call unchanged.
#[derive(Clone, Default)]
pub struct ForwardOptions {
    pub cancel: Option<CancellationToken>,
    pub tracer: Option<Arc<dyn Tracer>>,
    pub trace_context: Option<TraceContext>,
    pub session_id: Option<String>,
    /// Opaque memory handle passed through to nodes
    pub mem: Option<Arc<dyn Any + Send + Sync>>,
    pub trace_label: Option<String>,
    pub debug: Option<bool>,
}

impl ForwardOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn with_trace_context(mut self, context: TraceContext) -> Self {
        self.trace_context = Some(context);
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_mem(mut self, mem: Arc<dyn Any + Send + Sync>) -> Self {
        self.mem = Some(mem);
        self
    }

    pub fn with_trace_label(mut self, label: impl Into<String>) -> Self {
        self.trace_label = Some(label.into());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = Some(debug);
        self
    }

    /// Whether the attached token has fired
    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(CancellationToken::is_cancelled)
            .unwrap_or(false)
    }

    /// Layer per-step overrides on top of these options
    ///
    /// Only caller-level fields (session, memory, label, debug) are taken
    /// from `overrides`.
    pub fn overlay(&self, overrides: &ForwardOptions) -> ForwardOptions {
        ForwardOptions {
            cancel: self.cancel.clone(),
            tracer: self.tracer.clone(),
            trace_context: self.trace_context.clone(),
            session_id: overrides.session_id.clone().or_else(|| self.session_id.clone()),
            mem: overrides.mem.clone().or_else(|| self.mem.clone()),
            trace_label: overrides.trace_label.clone().or_else(|| self.trace_label.clone()),
            debug: overrides.debug.or(self.debug),
        }
    }
}

impl fmt::Debug for ForwardOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardOptions")
            .field("cancelled", &self.is_cancelled())
            .field("tracer", &self.tracer.is_some())
            .field("trace_context", &self.trace_context)
            .field("session_id", &self.session_id)
            .field("mem", &self.mem.is_some())
            .field("trace_label", &self.trace_label)
            .field("debug", &self.debug)
            .finish()
    }
}

/// Demonstrations addressed to a program by dotted id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemoAssignment {
    pub program_id: String,
    pub traces: Vec<Value>,
}

impl DemoAssignment {
    pub fn new(program_id: impl Into<String>, traces: Vec<Value>) -> Self {
        Self {
            program_id: program_id.into(),
            traces,
        }
    }
}

/// Output of an optimizer, applied to a whole program tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizedProgram {
    pub optimizer: String,
    pub best_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(default)]
    pub demos: Vec<DemoAssignment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_config: Option<Value>,
}

/// A recorded input/output pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramTrace {
    pub program_id: String,
    pub trace: Value,
}

/// Token usage attributed to one AI service and model
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramUsage {
    pub ai: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Collapse usage entries with the same `(ai, model)`, summing tokens
pub fn merge_usage(entries: impl IntoIterator<Item = ProgramUsage>) -> Vec<ProgramUsage> {
    let mut merged: BTreeMap<(String, String), ProgramUsage> = BTreeMap::new();
    for entry in entries {
        let slot = merged
            .entry((entry.ai.clone(), entry.model.clone()))
            .or_insert_with(|| ProgramUsage {
                ai: entry.ai.clone(),
                model: entry.model.clone(),
                ..ProgramUsage::default()
            });
        slot.prompt_tokens += entry.prompt_tokens;
        slot.completion_tokens += entry.completion_tokens;
        slot.total_tokens += entry.total_tokens;
    }
    merged.into_values().collect()
}

/// Minimal contract a flow node must implement
///
/// Only [`signature`](Self::signature) and [`forward`](Self::forward) are
/// required. The configuration methods take `&self` because nodes are shared
/// behind `Arc`; implementations use interior mutability.
#[async_trait]
pub trait Programmable: Send + Sync {
    fn signature(&self) -> Signature;

    async fn forward(
        &self,
        ai: Arc<dyn AiService>,
        input: Value,
        options: &ForwardOptions,
    ) -> std::result::Result<Value, BoxError>;

    fn id(&self) -> Option<String> {
        None
    }

    fn set_id(&self, _id: &str) {}

    fn set_parent_id(&self, _parent_id: &str) {}

    fn set_demos(&self, _demos: &[DemoAssignment]) -> Result<()> {
        Ok(())
    }

    fn apply_optimization(&self, _optimized: &OptimizedProgram) {}

    fn set_examples(&self, _examples: &[Value]) {}

    fn traces(&self) -> Vec<ProgramTrace> {
        Vec::new()
    }

    fn usage(&self) -> Vec<ProgramUsage> {
        Vec::new()
    }

    fn reset_usage(&self) {}
}

/// Builds programs for nodes registered by signature only
pub trait ProgramFactory: Send + Sync {
    fn create(&self, node: &str, signature: &Signature) -> Result<Arc<dyn Programmable>>;
}

impl<F> ProgramFactory for F
where
    F: Fn(&str, &Signature) -> Result<Arc<dyn Programmable>> + Send + Sync,
{
    fn create(&self, node: &str, signature: &Signature) -> Result<Arc<dyn Programmable>> {
        self(node, signature)
    }
}

type ForwardFn = dyn Fn(Arc<dyn AiService>, Value, ForwardOptions) -> BoxFuture<'static, std::result::Result<Value, BoxError>>
    + Send
    + Sync;

#[derive(Debug, Default)]
struct ProgramMeta {
    id: Option<String>,
    parent_id: Option<String>,
    demos: Vec<Value>,
    examples: Vec<Value>,
    optimization: Option<OptimizedProgram>,
    last_trace: Option<Value>,
    usage: Vec<ProgramUsage>,
}

/// A [`Programmable`] built from an async closure
pub struct FnProgram {
    signature: Signature,
    forward: Arc<ForwardFn>,
    meta: RwLock<ProgramMeta>,
}

impl FnProgram {
    pub fn new<S, F, Fut>(signature: S, f: F) -> Result<Self>
    where
        S: IntoSignature,
        F: Fn(Arc<dyn AiService>, Value, ForwardOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, BoxError>> + Send + 'static,
    {
        let forward: Arc<ForwardFn> = Arc::new(
            move |ai: Arc<dyn AiService>,
                  input: Value,
                  options: ForwardOptions|
                  -> BoxFuture<'static, std::result::Result<Value, BoxError>> {
                Box::pin(f(ai, input, options))
            },
        );
        Ok(Self {
            signature: signature.into_signature()?,
            forward,
            meta: RwLock::new(ProgramMeta::default()),
        })
    }

    /// Demo traces routed to this program
    pub fn demos(&self) -> Vec<Value> {
        self.meta.read().demos.clone()
    }

    pub fn examples(&self) -> Vec<Value> {
        self.meta.read().examples.clone()
    }

    pub fn optimization(&self) -> Option<OptimizedProgram> {
        self.meta.read().optimization.clone()
    }

    pub fn parent_id(&self) -> Option<String> {
        self.meta.read().parent_id.clone()
    }

    /// Account usage against this program
    pub fn record_usage(&self, usage: ProgramUsage) {
        self.meta.write().usage.push(usage);
    }
}

impl fmt::Debug for FnProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProgram")
            .field("signature", &self.signature.to_string())
            .field("id", &self.meta.read().id)
            .finish()
    }
}

#[async_trait]
impl Programmable for FnProgram {
    fn signature(&self) -> Signature {
        self.signature.clone()
    }

    async fn forward(
        &self,
        ai: Arc<dyn AiService>,
        input: Value,
        options: &ForwardOptions,
    ) -> std::result::Result<Value, BoxError> {
        if options.is_cancelled() {
            return Err(Box::new(FlowError::aborted("cancelled before program start")));
        }
        let output = (self.forward)(ai, input.clone(), options.clone()).await?;
        self.meta.write().last_trace = Some(serde_json::json!({
            "input": input,
            "output": output.clone(),
        }));
        Ok(output)
    }

    fn id(&self) -> Option<String> {
        self.meta.read().id.clone()
    }

    fn set_id(&self, id: &str) {
        self.meta.write().id = Some(id.to_string());
    }

    fn set_parent_id(&self, parent_id: &str) {
        self.meta.write().parent_id = Some(parent_id.to_string());
    }

    fn set_demos(&self, demos: &[DemoAssignment]) -> Result<()> {
        let mut meta = self.meta.write();
        let own = meta.id.clone();
        meta.demos = demos
            .iter()
            .filter(|demo| own.as_deref() == Some(demo.program_id.as_str()))
            .flat_map(|demo| demo.traces.iter().cloned())
            .collect();
        Ok(())
    }

    fn apply_optimization(&self, optimized: &OptimizedProgram) {
        self.meta.write().optimization = Some(optimized.clone());
    }

    fn set_examples(&self, examples: &[Value]) {
        self.meta.write().examples = examples.to_vec();
    }

    fn traces(&self) -> Vec<ProgramTrace> {
        let meta = self.meta.read();
        match (&meta.id, &meta.last_trace) {
            (Some(id), Some(trace)) => vec![ProgramTrace {
                program_id: id.clone(),
                trace: trace.clone(),
            }],
            _ => Vec::new(),
        }
    }

    fn usage(&self) -> Vec<ProgramUsage> {
        merge_usage(self.meta.read().usage.clone())
    }

    fn reset_usage(&self) {
        self.meta.write().usage.clear();
    }
}
