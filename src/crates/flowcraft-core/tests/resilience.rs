//! Retry and circuit breaker behaviour of node invocations

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ai, MockNode};
use flowcraft_core::{
    CircuitBreakerConfig, CircuitState, ErrorHandlingConfig, Flow, FlowBuilder, FlowConfig, FlowError, FlowState,
    ForwardOptions,
};
use tokio::time::Instant;

fn flow_with(node: Arc<MockNode>, error_handling: ErrorHandlingConfig) -> Flow {
    let mut builder = FlowBuilder::new();
    builder
        .with_config(FlowConfig::new().with_error_handling(error_handling))
        .node("flaky", node)
        .execute("flaky", |s: &FlowState| s.to_value());
    builder.build().unwrap()
}

fn retries(count: u32, delay_ms: u64) -> ErrorHandlingConfig {
    ErrorHandlingConfig {
        default_retries: count,
        retry_delay_ms: delay_ms,
        ..ErrorHandlingConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_retry_succeeds_on_third_attempt() {
    let node = Arc::new(MockNode::new().failing_first(2));
    let flow = flow_with(node.clone(), retries(2, 100));

    let output = flow
        .invoke(ai(), FlowState::new(), &ForwardOptions::new())
        .await
        .unwrap();

    assert_eq!(node.calls(), 3);
    assert_eq!(output.get("flakyResult").and_then(|r| r.get("call")), Some(&serde_json::json!(3)));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_keep_the_node_error() {
    let node = Arc::new(MockNode::new().always_failing());
    let flow = flow_with(node.clone(), retries(2, 10));

    let err = flow
        .invoke(ai(), FlowState::new(), &ForwardOptions::new())
        .await
        .unwrap_err();

    match err {
        FlowError::NodeInvocation { node: name, attempts, source } => {
            assert_eq!(name, "flaky");
            assert_eq!(attempts, 3);
            assert_eq!(source.to_string(), "call 3 failed");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(node.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_exponential_backoff_doubles_delays() {
    let node = Arc::new(MockNode::new().always_failing());
    let flow = flow_with(
        node.clone(),
        ErrorHandlingConfig {
            exponential_backoff: true,
            ..retries(3, 100)
        },
    );

    let started = Instant::now();
    let _ = flow.invoke(ai(), FlowState::new(), &ForwardOptions::new()).await;
    let elapsed = started.elapsed();

    // 100 + 200 + 400
    assert!(elapsed >= Duration::from_millis(700) && elapsed < Duration::from_millis(720));
    assert_eq!(node.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_abort_errors_are_not_retried() {
    let node = Arc::new(MockNode::new().aborting());
    let flow = flow_with(node.clone(), retries(5, 10));

    let err = flow
        .invoke(ai(), FlowState::new(), &ForwardOptions::new())
        .await
        .unwrap_err();

    assert!(err.is_aborted());
    assert_eq!(node.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_fails_fast_then_allows_one_trial() {
    let node = Arc::new(MockNode::new().always_failing());
    let flow = flow_with(
        node.clone(),
        ErrorHandlingConfig {
            circuit_breaker: CircuitBreakerConfig::enabled(2, Duration::from_millis(1_000)),
            ..retries(0, 0)
        },
    );
    let options = ForwardOptions::new();
    let run = || flow.invoke(ai(), FlowState::new(), &options);

    assert!(matches!(run().await, Err(FlowError::NodeInvocation { .. })));
    assert!(matches!(run().await, Err(FlowError::NodeInvocation { .. })));
    assert_eq!(flow.circuit_state(), CircuitState::Open);

    assert!(matches!(run().await, Err(FlowError::CircuitOpen { .. })));
    assert_eq!(node.calls(), 2);

    tokio::time::advance(Duration::from_millis(1_001)).await;
    assert!(matches!(run().await, Err(FlowError::NodeInvocation { .. })));
    assert_eq!(node.calls(), 3);
    assert_eq!(flow.circuit_state(), CircuitState::Open);

    assert!(matches!(run().await, Err(FlowError::CircuitOpen { .. })));
    assert_eq!(node.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_successful_trial_closes_the_breaker() {
    let node = Arc::new(MockNode::new().failing_first(2));
    let flow = flow_with(
        node.clone(),
        ErrorHandlingConfig {
            circuit_breaker: CircuitBreakerConfig::enabled(2, Duration::from_millis(500)),
            ..retries(0, 0)
        },
    );
    let options = ForwardOptions::new();
    let run = || flow.invoke(ai(), FlowState::new(), &options);

    let _ = run().await;
    let _ = run().await;
    assert_eq!(flow.circuit_state(), CircuitState::Open);

    tokio::time::advance(Duration::from_millis(501)).await;
    assert!(run().await.is_ok());
    assert_eq!(flow.circuit_state(), CircuitState::Closed);
    assert!(run().await.is_ok());
    assert_eq!(node.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_counts_one_failure_per_exhausted_invocation() {
    let node = Arc::new(MockNode::new().always_failing());
    let flow = flow_with(
        node.clone(),
        ErrorHandlingConfig {
            circuit_breaker: CircuitBreakerConfig::enabled(2, Duration::from_secs(60)),
            ..retries(2, 1)
        },
    );

    let _ = flow.invoke(ai(), FlowState::new(), &ForwardOptions::new()).await;
    assert_eq!(flow.circuit_state(), CircuitState::Closed);
    assert_eq!(node.calls(), 3);

    let _ = flow.invoke(ai(), FlowState::new(), &ForwardOptions::new()).await;
    assert_eq!(flow.circuit_state(), CircuitState::Open);
}
