//! Per-run context and cancellation plumbing
//!
//! Every top-level `forward()` gets a [`RunContext`]: a cancellation token
//! (a child of the caller's token when one is supplied), the options every
//! node invocation receives, and the event sink. The token is registered in
//! the flow's [`RunRegistry`] for the duration of the run so `Flow::stop()`
//! can cancel all in-flight runs at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{FlowError, Result};
use crate::events::{FlowEvent, FlowEventKind, FlowLogger};
use crate::program::{AiService, ForwardOptions};
use crate::trace::TraceContext;

/// Tokens of the runs currently in flight on one flow
#[derive(Debug, Default)]
pub(crate) struct RunRegistry {
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, CancellationToken>>,
}

impl RunRegistry {
    /// Track `token` until the returned guard drops
    pub(crate) fn register(registry: &Arc<Self>, token: CancellationToken) -> RunRegistration {
        let id = registry.next_id.fetch_add(1, Ordering::Relaxed);
        registry.active.lock().insert(id, token);
        RunRegistration {
            id,
            registry: Arc::clone(registry),
        }
    }

    /// Cancel every registered run; returns how many were signalled
    pub(crate) fn cancel_all(&self) -> usize {
        let active = self.active.lock();
        for token in active.values() {
            token.cancel();
        }
        active.len()
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

pub(crate) struct RunRegistration {
    id: u64,
    registry: Arc<RunRegistry>,
}

impl Drop for RunRegistration {
    fn drop(&mut self) {
        self.registry.active.lock().remove(&self.id);
    }
}

/// State shared by every step of one run
pub(crate) struct RunContext {
    pub(crate) run_id: String,
    pub(crate) token: CancellationToken,
    pub(crate) ai: Arc<dyn AiService>,
    /// Options handed to nodes, already carrying the run token and span context
    pub(crate) options: ForwardOptions,
    logger: Option<Arc<dyn FlowLogger>>,
}

impl RunContext {
    pub(crate) fn new(
        ai: Arc<dyn AiService>,
        caller: &ForwardOptions,
        logger: Option<Arc<dyn FlowLogger>>,
    ) -> Self {
        let token = caller
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let mut options = caller.clone();
        options.cancel = Some(token.clone());
        Self {
            run_id: Uuid::new_v4().to_string(),
            token,
            ai,
            options,
            logger,
        }
    }

    /// Point nested calls at the run's span
    pub(crate) fn set_trace_context(&mut self, context: Option<TraceContext>) {
        if context.is_some() {
            self.options.trace_context = context;
        }
    }

    /// Fail with `Aborted` once the token has fired
    pub(crate) fn check(&self, at: &str) -> Result<()> {
        if self.token.is_cancelled() {
            Err(FlowError::aborted(format!("cancelled before {}", at)))
        } else {
            Ok(())
        }
    }

    pub(crate) fn emit(&self, kind: FlowEventKind) {
        if let Some(logger) = &self.logger {
            logger.log(&FlowEvent::new(self.run_id.clone(), kind));
        }
    }

    /// Options for one node invocation
    pub(crate) fn node_options(&self, node: &str, overrides: Option<&ForwardOptions>) -> ForwardOptions {
        let mut options = match overrides {
            Some(overrides) => self.options.overlay(overrides),
            None => self.options.clone(),
        };
        options.trace_label = Some(match &options.trace_label {
            Some(label) => format!("Node:{} ({})", node, label),
            None => format!("Node:{}", node),
        });
        options
    }
}
