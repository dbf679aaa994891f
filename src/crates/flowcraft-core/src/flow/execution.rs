//! Flow execution: the group scheduler and step semantics
//!
//! Groups run strictly in plan order. A single-step group applies its update
//! directly; the steps of a larger group all read the same snapshot, run
//! concurrently (at most `max_concurrency` at a time), and their changes are
//! merged in declaration order.

use std::future::Future;
use std::sync::Arc;

use futures::future::{try_join_all, BoxFuture};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::time::Instant;

use super::Flow;
use crate::context::{RunContext, RunRegistry};
use crate::error::{FlowError, Result};
use crate::events::FlowEventKind;
use crate::program::{AiService, ForwardOptions};
use crate::resilience::invoke_with_policy;
use crate::state::{FlowState, StateUpdate};
use crate::step::{result_key, Block, MergeStrategy, Step, StepKind};
use crate::trace::SpanGuard;

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn state_keys(state: &FlowState) -> Vec<String> {
    state.keys().cloned().collect()
}

impl Flow {
    /// Run the flow once
    ///
    /// The run observes `options.cancel` and [`stop`](Self::stop); a run
    /// cancelled at any point fails with [`FlowError::Aborted`]. With a tracer
    /// in `options`, the run is wrapped in a `Flow:{id}` span that nodes see
    /// as their parent.
    #[tracing::instrument(skip(self, ai, input, options), fields(flow_id = %self.id(), total_steps = self.plan.total_steps))]
    pub async fn invoke(
        &self,
        ai: Arc<dyn AiService>,
        input: FlowState,
        options: &ForwardOptions,
    ) -> Result<FlowState> {
        let mut ctx = RunContext::new(ai, options, self.logger.clone());
        let _registration = RunRegistry::register(&self.runs, ctx.token.clone());

        let span = options.tracer.as_ref().map(|tracer| {
            SpanGuard::new(tracer.start_span(&format!("Flow:{}", self.id()), options.trace_context.as_ref()))
        });
        if let Some(span) = &span {
            span.set_attribute("flow.id", Value::String(self.id()));
            span.set_attribute("flow.total_steps", Value::from(self.plan.total_steps));
            ctx.set_trace_context(span.context());
        }

        let started = Instant::now();
        ctx.emit(FlowEventKind::FlowStart {
            flow_id: self.id(),
            input_keys: state_keys(&input),
            total_steps: self.plan.total_steps,
            parallel_groups: self.plan.parallel_groups,
        });

        match self.run_root(&ctx, input).await {
            Ok(output) => {
                ctx.emit(FlowEventKind::FlowComplete {
                    duration_ms: elapsed_ms(started),
                    output_keys: state_keys(&output),
                });
                if let Some(span) = span {
                    span.finish_ok();
                }
                Ok(output)
            }
            Err(err) => {
                ctx.emit(FlowEventKind::FlowError {
                    error: err.to_string(),
                    duration_ms: elapsed_ms(started),
                });
                if let Some(span) = span {
                    span.finish_err(&err.to_string());
                }
                Err(err)
            }
        }
    }

    /// Run with typed input and output
    pub async fn forward_typed<I, O>(&self, ai: Arc<dyn AiService>, input: &I, options: &ForwardOptions) -> Result<O>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let output = self.invoke(ai, FlowState::from_serialize(input)?, options).await?;
        output.to_typed()
    }

    /// Cancel every in-flight run of this flow
    ///
    /// Idempotent; returns how many runs were signalled.
    pub fn stop(&self) -> usize {
        let cancelled = self.runs.cancel_all();
        if cancelled > 0 {
            tracing::info!(flow_id = %self.id(), runs = cancelled, "stopping flow");
        }
        cancelled
    }

    async fn run_root(&self, ctx: &RunContext, input: FlowState) -> Result<FlowState> {
        ctx.check("flow start")?;
        match self.run_block(ctx, &self.root, input).await {
            Ok(output) => {
                ctx.check("returning flow output")?;
                Ok(output)
            }
            // once cancelled, whatever a step failed with is reported as the abort
            Err(err) if !err.is_aborted() && ctx.token.is_cancelled() => {
                tracing::debug!(error = %err, "step failed after cancellation");
                Err(FlowError::aborted(format!("cancelled while running ({})", err)))
            }
            Err(err) => Err(err),
        }
    }

    fn run_block<'a>(&'a self, ctx: &'a RunContext, block: &'a Block, input: FlowState) -> BoxFuture<'a, Result<FlowState>> {
        Box::pin(async move {
            let mut state = input;
            for (level, group) in block.groups.iter().enumerate() {
                ctx.check(&format!("group {}", level))?;
                if let [index] = group.as_slice() {
                    let update = self.run_logged(ctx, &block.steps[*index], *index, &state).await?;
                    update.apply(&mut state);
                    continue;
                }

                let started = Instant::now();
                ctx.emit(FlowEventKind::ParallelGroupStart {
                    level,
                    step_count: group.len(),
                });
                let snapshot = state.clone();
                let updates = self
                    .run_limited(
                        group
                            .iter()
                            .map(|&index| self.run_logged(ctx, &block.steps[index], index, &snapshot))
                            .collect(),
                    )
                    .await?;
                for update in updates {
                    state.merge(update.into_patch(&snapshot));
                }
                ctx.emit(FlowEventKind::ParallelGroupComplete {
                    level,
                    step_count: group.len(),
                    duration_ms: elapsed_ms(started),
                });
            }
            Ok(state)
        })
    }

    /// Await futures in batches of at most `max_concurrency`, keeping order
    async fn run_limited<T, Fut>(&self, futures: Vec<Fut>) -> Result<Vec<T>>
    where
        Fut: Future<Output = Result<T>>,
    {
        let limit = match self.config.max_concurrency {
            Some(limit) if limit < futures.len() => limit,
            _ => return try_join_all(futures).await,
        };
        let mut results = Vec::with_capacity(futures.len());
        let mut pending = futures.into_iter();
        loop {
            let batch: Vec<Fut> = pending.by_ref().take(limit).collect();
            if batch.is_empty() {
                return Ok(results);
            }
            results.extend(try_join_all(batch).await?);
        }
    }

    async fn run_logged(&self, ctx: &RunContext, step: &Step, index: usize, state: &FlowState) -> Result<StateUpdate> {
        ctx.check(&format!("step '{}'", step.label))?;
        let started = Instant::now();
        ctx.emit(FlowEventKind::StepStart {
            step_index: index,
            label: step.label.clone(),
        });
        let update = self.run_step(ctx, step, index, state).await?;
        ctx.emit(FlowEventKind::StepComplete {
            step_index: index,
            label: step.label.clone(),
            duration_ms: elapsed_ms(started),
            updated_keys: updated_keys(&update, state),
        });
        Ok(update)
    }

    fn run_step<'a>(
        &'a self,
        ctx: &'a RunContext,
        step: &'a Step,
        index: usize,
        state: &'a FlowState,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        Box::pin(async move {
            match &step.kind {
                StepKind::Map(transform) => transform
                    .apply(state, &ctx.token)
                    .await
                    .map_err(|err| FlowError::from_step(&step.label, err)),

                StepKind::MapMany { transforms, parallel } => {
                    if *parallel {
                        let updates = self
                            .run_limited(
                                transforms
                                    .iter()
                                    .map(|transform| async move {
                                        transform
                                            .apply(state, &ctx.token)
                                            .await
                                            .map_err(|err| FlowError::from_step(&step.label, err))
                                    })
                                    .collect(),
                            )
                            .await?;
                        let mut patch = Map::new();
                        for update in updates {
                            patch.extend(update.into_patch(state));
                        }
                        Ok(StateUpdate::Patch(patch))
                    } else {
                        let mut current = state.clone();
                        for transform in transforms {
                            ctx.check(&format!("step '{}'", step.label))?;
                            transform
                                .apply(&current, &ctx.token)
                                .await
                                .map_err(|err| FlowError::from_step(&step.label, err))?
                                .apply(&mut current);
                        }
                        Ok(StateUpdate::Replace(current))
                    }
                }

                StepKind::Execute {
                    node,
                    selector,
                    ai,
                    options,
                } => {
                    let entry = self
                        .node_entry(node)
                        .ok_or_else(|| FlowError::construction(format!("Node '{}' not found", node)))?;
                    let input = selector(state);
                    let ai = ai.clone().unwrap_or_else(|| ctx.ai.clone());
                    let node_options = ctx.node_options(node, options.as_ref());
                    tracing::debug!(node = %node, "invoking node");

                    let output = invoke_with_policy(node, &self.retry, &self.breaker, ctx, |_attempt| {
                        let program = Arc::clone(&entry.program);
                        let ai = Arc::clone(&ai);
                        let input = input.clone();
                        let node_options = node_options.clone();
                        async move { program.forward(ai, input, &node_options).await }
                    })
                    .await?;
                    Ok(StateUpdate::set(result_key(node), output))
                }

                StepKind::Branch {
                    discriminator,
                    cases,
                    check,
                } => {
                    let value = discriminator(state);
                    let case = cases.iter().find(|(when, _)| *when == value);
                    ctx.emit(FlowEventKind::BranchEvaluation {
                        step_index: index,
                        value: value.clone(),
                        matched: case.is_some(),
                    });
                    let merged = match case {
                        Some((_, block)) => self.run_block(ctx, block, state.clone()).await?,
                        None => {
                            tracing::debug!(value = %value, "no branch case matched, passing state through");
                            state.clone()
                        }
                    };
                    if let Some(check) = check {
                        check(&merged)?;
                    }
                    Ok(StateUpdate::Replace(merged))
                }

                StepKind::Parallel {
                    branches,
                    merge,
                    parallel,
                } => {
                    let outputs = if *parallel {
                        self.run_limited(
                            branches
                                .iter()
                                .map(|branch| self.run_block(ctx, branch, state.clone()))
                                .collect(),
                        )
                        .await?
                    } else {
                        let mut outputs = Vec::with_capacity(branches.len());
                        for branch in branches {
                            outputs.push(self.run_block(ctx, branch, state.clone()).await?);
                        }
                        outputs
                    };
                    merge_branches(merge, &step.label, state, &outputs)
                }

                StepKind::While {
                    condition,
                    body,
                    max_iterations,
                } => {
                    let mut current = state.clone();
                    let mut iterations = 0usize;
                    while condition(&current) {
                        if iterations >= *max_iterations {
                            return Err(FlowError::LoopLimit {
                                max_iterations: *max_iterations,
                            });
                        }
                        ctx.check(&format!("loop iteration {}", iterations + 1))?;
                        current = self.run_block(ctx, body, current).await?;
                        iterations += 1;
                    }
                    tracing::debug!(iterations, "loop finished");
                    Ok(StateUpdate::Replace(current))
                }
            }
        })
    }
}

fn merge_branches(merge: &MergeStrategy, label: &str, base: &FlowState, outputs: &[FlowState]) -> Result<StateUpdate> {
    match merge {
        MergeStrategy::Shallow { check } => {
            let mut patch = Map::new();
            for output in outputs {
                patch.extend(output.diff(base));
            }
            if let Some(check) = check {
                let mut merged = base.clone();
                merged.merge(patch.clone());
                check(&merged)?;
            }
            Ok(StateUpdate::Patch(patch))
        }
        MergeStrategy::Reduce { key, reducer } => {
            let value = reducer(outputs).map_err(|err| FlowError::from_step(label, err))?;
            Ok(StateUpdate::set(key.clone(), value))
        }
    }
}

fn updated_keys(update: &StateUpdate, base: &FlowState) -> Vec<String> {
    match update {
        StateUpdate::Patch(patch) => patch.keys().cloned().collect(),
        StateUpdate::Replace(next) => next.diff(base).keys().cloned().collect(),
    }
}
