#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowcraft_core::{
    AiService, BoxError, DemoAssignment, FlowError, FlowState, ForwardOptions, NamedAi, OptimizedProgram,
    ProgramUsage, Programmable, Signature,
};
use parking_lot::Mutex;
use serde_json::{json, Value};

pub fn ai() -> Arc<dyn AiService> {
    Arc::new(NamedAi::new("mock").with_model("mock-1"))
}

pub fn state(value: Value) -> FlowState {
    FlowState::from_value(value).unwrap()
}

/// Scriptable node that records how it was called
pub struct MockNode {
    signature: Signature,
    delay: Duration,
    fail_first: u32,
    abort: bool,
    calls: AtomicU32,
    last_options: Mutex<Option<ForwardOptions>>,
    id: Mutex<Option<String>>,
    parent_id: Mutex<Option<String>>,
    demos: Mutex<Vec<DemoAssignment>>,
    optimizations: Mutex<Vec<OptimizedProgram>>,
    usage: Mutex<Vec<ProgramUsage>>,
}

impl MockNode {
    pub fn new() -> Self {
        Self {
            signature: "input:json -> output:json".parse().unwrap(),
            delay: Duration::ZERO,
            fail_first: 0,
            abort: false,
            calls: AtomicU32::new(0),
            last_options: Mutex::new(None),
            id: Mutex::new(None),
            parent_id: Mutex::new(None),
            demos: Mutex::new(Vec::new()),
            optimizations: Mutex::new(Vec::new()),
            usage: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the first `n` calls
    pub fn failing_first(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    pub fn always_failing(self) -> Self {
        self.failing_first(u32::MAX)
    }

    /// Fail every call with an abort error
    pub fn aborting(mut self) -> Self {
        self.abort = true;
        self
    }

    pub fn with_usage(self, usage: ProgramUsage) -> Self {
        self.usage.lock().push(usage);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> Option<ForwardOptions> {
        self.last_options.lock().clone()
    }

    pub fn current_id(&self) -> Option<String> {
        self.id.lock().clone()
    }

    pub fn current_parent_id(&self) -> Option<String> {
        self.parent_id.lock().clone()
    }

    pub fn received_demos(&self) -> Vec<DemoAssignment> {
        self.demos.lock().clone()
    }

    pub fn received_optimizations(&self) -> usize {
        self.optimizations.lock().len()
    }
}

#[async_trait]
impl Programmable for MockNode {
    fn signature(&self) -> Signature {
        self.signature.clone()
    }

    async fn forward(
        &self,
        _ai: Arc<dyn AiService>,
        input: Value,
        options: &ForwardOptions,
    ) -> Result<Value, BoxError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_options.lock() = Some(options.clone());

        if self.abort {
            return Err(Box::new(FlowError::aborted("node saw the abort signal")));
        }
        if !self.delay.is_zero() {
            match &options.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            return Err(Box::new(FlowError::aborted("cancelled during node call")));
                        }
                        _ = tokio::time::sleep(self.delay) => {}
                    }
                }
                None => tokio::time::sleep(self.delay).await,
            }
        }
        if call <= self.fail_first {
            return Err(format!("call {} failed", call).into());
        }
        Ok(json!({ "input": input, "call": call }))
    }

    fn id(&self) -> Option<String> {
        self.current_id()
    }

    fn set_id(&self, id: &str) {
        *self.id.lock() = Some(id.to_string());
    }

    fn set_parent_id(&self, parent_id: &str) {
        *self.parent_id.lock() = Some(parent_id.to_string());
    }

    fn set_demos(&self, demos: &[DemoAssignment]) -> flowcraft_core::Result<()> {
        *self.demos.lock() = demos.to_vec();
        Ok(())
    }

    fn apply_optimization(&self, optimized: &OptimizedProgram) {
        self.optimizations.lock().push(optimized.clone());
    }

    fn usage(&self) -> Vec<ProgramUsage> {
        self.usage.lock().clone()
    }

    fn reset_usage(&self) {
        self.usage.lock().clear();
    }
}
