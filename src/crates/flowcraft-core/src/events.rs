//! Structured flow execution events
//!
//! The executor reports its progress as [`FlowEvent`]s: one `FlowStart` and
//! one terminal `FlowComplete`/`FlowError` per run, plus group, step, branch,
//! retry and breaker events in between. Events go to a [`FlowLogger`];
//! [`TracingFlowLogger`] forwards them to `tracing` and is installed
//! automatically when the flow is built with `debug` enabled.
//!
//! ```rust
//! use std::sync::Arc;
//! use flowcraft_core::events::{FlowEvent, FlowLogger};
//! use parking_lot::Mutex;
//!
//! #[derive(Default)]
//! struct Collect(Mutex<Vec<FlowEvent>>);
//!
//! impl FlowLogger for Collect {
//!     fn log(&self, event: &FlowEvent) {
//!         self.0.lock().push(event.clone());
//!     }
//! }
//!
//! let logger: Arc<dyn FlowLogger> = Arc::new(Collect::default());
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// A single event emitted during a run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEvent {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: FlowEventKind,
}

impl FlowEvent {
    pub fn new(run_id: impl Into<String>, kind: FlowEventKind) -> Self {
        Self {
            run_id: run_id.into(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FlowEventKind {
    #[serde(rename_all = "camelCase")]
    FlowStart {
        flow_id: String,
        input_keys: Vec<String>,
        total_steps: usize,
        parallel_groups: usize,
    },
    #[serde(rename_all = "camelCase")]
    StepStart {
        step_index: usize,
        label: String,
    },
    #[serde(rename_all = "camelCase")]
    StepComplete {
        step_index: usize,
        label: String,
        duration_ms: u64,
        updated_keys: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    ParallelGroupStart {
        level: usize,
        step_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    ParallelGroupComplete {
        level: usize,
        step_count: usize,
        duration_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    BranchEvaluation {
        step_index: usize,
        value: Value,
        matched: bool,
    },
    #[serde(rename_all = "camelCase")]
    NodeRetry {
        node: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    CircuitOpened {
        node: String,
        consecutive_failures: u32,
    },
    #[serde(rename_all = "camelCase")]
    FlowComplete {
        duration_ms: u64,
        output_keys: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    FlowError {
        error: String,
        duration_ms: u64,
    },
}

/// Receives flow events
pub trait FlowLogger: Send + Sync {
    fn log(&self, event: &FlowEvent);
}

/// Writes events as structured `tracing` records
#[derive(Debug, Clone, Default)]
pub struct TracingFlowLogger;

impl FlowLogger for TracingFlowLogger {
    fn log(&self, event: &FlowEvent) {
        let run_id = event.run_id.as_str();
        match &event.kind {
            FlowEventKind::FlowStart {
                flow_id,
                input_keys,
                total_steps,
                parallel_groups,
            } => tracing::info!(
                run_id,
                flow_id = %flow_id,
                ?input_keys,
                total_steps,
                parallel_groups,
                "flow started"
            ),
            FlowEventKind::StepStart { step_index, label } => {
                tracing::debug!(run_id, step_index, label = %label, "step started")
            }
            FlowEventKind::StepComplete {
                step_index,
                label,
                duration_ms,
                updated_keys,
            } => tracing::debug!(
                run_id,
                step_index,
                label = %label,
                duration_ms,
                ?updated_keys,
                "step completed"
            ),
            FlowEventKind::ParallelGroupStart { level, step_count } => {
                tracing::debug!(run_id, level, step_count, "parallel group started")
            }
            FlowEventKind::ParallelGroupComplete {
                level,
                step_count,
                duration_ms,
            } => tracing::debug!(
                run_id,
                level,
                step_count,
                duration_ms,
                "parallel group completed"
            ),
            FlowEventKind::BranchEvaluation {
                step_index,
                value,
                matched,
            } => tracing::debug!(run_id, step_index, value = %value, matched, "branch evaluated"),
            FlowEventKind::NodeRetry {
                node,
                attempt,
                delay_ms,
                error,
            } => tracing::warn!(
                run_id,
                node = %node,
                attempt,
                delay_ms,
                error = %error,
                "node failed, retrying"
            ),
            FlowEventKind::CircuitOpened {
                node,
                consecutive_failures,
            } => tracing::error!(
                run_id,
                node = %node,
                consecutive_failures,
                "circuit breaker opened"
            ),
            FlowEventKind::FlowComplete {
                duration_ms,
                output_keys,
            } => tracing::info!(run_id, duration_ms, ?output_keys, "flow completed"),
            FlowEventKind::FlowError { error, duration_ms } => {
                tracing::warn!(run_id, duration_ms, error = %error, "flow failed")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serializes_flat() {
        let event = FlowEvent::new(
            "run-1",
            FlowEventKind::StepStart {
                step_index: 2,
                label: "execute:summarizer".into(),
            },
        );
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], json!("stepStart"));
        assert_eq!(value["runId"], json!("run-1"));
        assert_eq!(value["stepIndex"], json!(2));
        assert!(value.get("timestamp").is_some());
    }

    #[test]
    fn test_tracing_logger_handles_every_kind() {
        let logger = TracingFlowLogger;
        let kinds = vec![
            FlowEventKind::ParallelGroupStart { level: 0, step_count: 2 },
            FlowEventKind::BranchEvaluation {
                step_index: 1,
                value: json!("a"),
                matched: false,
            },
            FlowEventKind::CircuitOpened {
                node: "n".into(),
                consecutive_failures: 3,
            },
        ];
        for kind in kinds {
            logger.log(&FlowEvent::new("run", kind));
        }
    }
}
