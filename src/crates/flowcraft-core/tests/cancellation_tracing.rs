//! Cancellation, stop() and tracer propagation

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ai, state, MockNode};
use flowcraft_core::{
    BoxError, FlowBuilder, FlowError, FlowState, ForwardOptions, InMemoryTracer, StateUpdate, TraceContext,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn single_node_flow(node: Arc<MockNode>) -> flowcraft_core::Flow {
    let mut builder = FlowBuilder::new();
    builder
        .with_id("traced")
        .node("worker", node)
        .execute("worker", |s: &FlowState| s.to_value());
    builder.build().unwrap()
}

#[tokio::test]
async fn test_pre_aborted_run_invokes_nothing() {
    let node = Arc::new(MockNode::new());
    let flow = single_node_flow(node.clone());

    let token = CancellationToken::new();
    token.cancel();
    let err = flow
        .invoke(ai(), FlowState::new(), &ForwardOptions::new().with_cancel(token))
        .await
        .unwrap_err();

    assert!(matches!(err, FlowError::Aborted { .. }));
    assert_eq!(node.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_aborts_in_flight_runs() {
    let node = Arc::new(MockNode::new().with_delay(Duration::from_secs(5)));
    let flow = Arc::new(single_node_flow(node.clone()));

    let running = Arc::clone(&flow);
    let handle = tokio::spawn(async move {
        running
            .invoke(ai(), FlowState::new(), &ForwardOptions::new())
            .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(flow.active_runs(), 1);
    assert_eq!(flow.stop(), 1);
    let result = handle.await.unwrap();
    assert!(result.unwrap_err().is_aborted());

    assert_eq!(flow.active_runs(), 0);
    assert_eq!(flow.stop(), 0);

    let node_fast = Arc::new(MockNode::new());
    let fresh = single_node_flow(node_fast);
    fresh.stop();
    assert!(fresh
        .invoke(ai(), FlowState::new(), &ForwardOptions::new())
        .await
        .is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_last_group_still_rejects() {
    let mut builder = FlowBuilder::new();
    builder.map_async(|_s: FlowState| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<_, BoxError>(StateUpdate::set("done", true))
    });
    let flow = Arc::new(builder.build().unwrap());

    let running = Arc::clone(&flow);
    let handle = tokio::spawn(async move {
        running
            .invoke(ai(), FlowState::new(), &ForwardOptions::new())
            .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    flow.stop();

    assert!(handle.await.unwrap().unwrap_err().is_aborted());
}

#[tokio::test(start_paused = true)]
async fn test_step_failing_after_stop_rejects_as_aborted() {
    let mut builder = FlowBuilder::new();
    builder.map_async(|_s: FlowState| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Err::<StateUpdate, BoxError>("downstream connection reset".into())
    });
    let flow = Arc::new(builder.build().unwrap());

    let running = Arc::clone(&flow);
    let handle = tokio::spawn(async move {
        running
            .invoke(ai(), FlowState::new(), &ForwardOptions::new())
            .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    flow.stop();

    let err = handle.await.unwrap().unwrap_err();
    assert!(err.is_aborted(), "unexpected error: {err}");
    assert!(err.to_string().contains("downstream connection reset"));

    // without a stop the same failure keeps its step error
    let err = flow
        .invoke(ai(), FlowState::new(), &ForwardOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Step { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_cancellable_map_returns_promptly_after_stop() {
    let mut builder = FlowBuilder::new();
    builder.map_async_cancellable(|_s: FlowState, token: CancellationToken| async move {
        tokio::select! {
            _ = token.cancelled() => Err::<StateUpdate, BoxError>("map interrupted".into()),
            _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(StateUpdate::set("done", true)),
        }
    });
    let flow = Arc::new(builder.build().unwrap());

    let started = tokio::time::Instant::now();
    let running = Arc::clone(&flow);
    let handle = tokio::spawn(async move {
        running
            .invoke(ai(), FlowState::new(), &ForwardOptions::new())
            .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(flow.stop(), 1);

    let err = handle.await.unwrap().unwrap_err();
    assert!(err.is_aborted());
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_caller_token_cancels_nested_flows() {
    let leaf = Arc::new(MockNode::new().with_delay(Duration::from_secs(5)));
    let mut inner = FlowBuilder::new();
    inner.node("leaf", leaf.clone()).execute("leaf", |s: &FlowState| s.to_value());
    let inner = Arc::new(inner.build().unwrap());

    let mut outer = FlowBuilder::new();
    outer
        .with_id("outer")
        .node("inner", inner)
        .execute("inner", |s: &FlowState| s.to_value());
    let outer = outer.build().unwrap();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let err = outer
        .invoke(ai(), FlowState::new(), &ForwardOptions::new().with_cancel(token))
        .await
        .unwrap_err();
    assert!(err.is_aborted());
    assert_eq!(leaf.calls(), 1);
}

#[tokio::test]
async fn test_tracer_and_context_reach_nodes() {
    let tracer = Arc::new(InMemoryTracer::new());
    let root = TraceContext::root();
    let node = Arc::new(MockNode::new());
    let flow = single_node_flow(node.clone());

    let options = ForwardOptions::new()
        .with_tracer(tracer.clone())
        .with_trace_context(root.clone())
        .with_session_id("session-1");
    flow.invoke(ai(), state(json!({"q": 1})), &options).await.unwrap();

    let spans = tracer.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name, "Flow:traced");
    assert_eq!(spans[0].context.trace_id, root.trace_id);
    assert_eq!(tracer.end_count(), 1);

    let seen = node.last_options().unwrap();
    assert!(seen.tracer.is_some());
    assert_eq!(seen.session_id.as_deref(), Some("session-1"));
    assert_eq!(seen.trace_label.as_deref(), Some("Node:worker"));
    let context = seen.trace_context.unwrap();
    assert_eq!(context.span_id, spans[0].context.span_id);
    assert_eq!(context.parent_span_id.as_deref(), Some(root.span_id.as_str()));
}

#[tokio::test]
async fn test_span_ends_once_on_failure() {
    let tracer = Arc::new(InMemoryTracer::new());
    let flow = single_node_flow(Arc::new(MockNode::new().always_failing()));

    let err = flow
        .invoke(ai(), FlowState::new(), &ForwardOptions::new().with_tracer(tracer.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::NodeInvocation { .. }));

    let spans = tracer.spans();
    assert_eq!(tracer.end_count(), 1);
    assert_eq!(spans[0].errors.len(), 1);
}
