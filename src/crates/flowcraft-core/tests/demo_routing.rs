//! Demo, optimization and bookkeeping propagation through nested flows

mod common;

use std::sync::Arc;

use common::{ai, state, MockNode};
use flowcraft_core::{
    DemoAssignment, Flow, FlowBuilder, FlowError, FlowState, FnProgram, ForwardOptions, OptimizedProgram,
    ProgramUsage, Programmable,
};
use serde_json::json;

struct Tree {
    flow: Flow,
    actor: Arc<MockNode>,
    responder: Arc<MockNode>,
}

fn tree() -> Tree {
    let actor = Arc::new(MockNode::new());
    let responder = Arc::new(MockNode::new());
    let mut builder = FlowBuilder::new();
    builder
        .with_id("root")
        .node("actor", actor.clone())
        .node("responder", responder.clone())
        .execute("actor", |s: &FlowState| s.to_value())
        .execute("responder", |s: &FlowState| s.to_value());
    Tree {
        flow: builder.build().unwrap(),
        actor,
        responder,
    }
}

fn usage(total: u64) -> ProgramUsage {
    ProgramUsage {
        ai: "mock".into(),
        model: "mock-1".into(),
        prompt_tokens: total,
        completion_tokens: 0,
        total_tokens: total,
    }
}

#[test]
fn test_children_are_addressed_under_the_flow() {
    let tree = tree();
    assert_eq!(tree.actor.current_id().as_deref(), Some("root.actor"));
    assert_eq!(tree.actor.current_parent_id().as_deref(), Some("root"));

    tree.flow.set_id("renamed");
    assert_eq!(tree.responder.current_id().as_deref(), Some("renamed.responder"));
    assert_eq!(Programmable::id(&tree.flow).as_deref(), Some("renamed"));
}

#[test]
fn test_demos_reach_only_the_addressed_child() {
    let tree = tree();
    tree.flow
        .set_demos(&[DemoAssignment::new("root.actor", vec![json!({"in": 1})])])
        .unwrap();

    assert_eq!(tree.actor.received_demos().len(), 1);
    assert!(tree.responder.received_demos().is_empty());
    assert!(tree.flow.demos().is_empty());
}

#[test]
fn test_demos_for_the_flow_itself_stay_on_the_flow() {
    let tree = tree();
    tree.flow
        .set_demos(&[DemoAssignment::new("root", vec![json!({"q": "a"}), json!({"q": "b"})])])
        .unwrap();

    assert_eq!(tree.flow.demos().len(), 2);
    assert!(tree.actor.received_demos().is_empty());
}

#[test]
fn test_unaddressed_demos_are_rejected() {
    let tree = tree();
    assert!(matches!(tree.flow.set_demos(&[]), Err(FlowError::DemoRouting(_))));

    let stray = [DemoAssignment::new("elsewhere.actor", vec![json!({})])];
    assert!(matches!(tree.flow.set_demos(&stray), Err(FlowError::DemoRouting(_))));

    let lookalike = [DemoAssignment::new("rooted.actor", vec![json!({})])];
    assert!(tree.flow.set_demos(&lookalike).is_err());
}

#[test]
fn test_flow_without_children_accepts_empty_demos() {
    let mut builder = FlowBuilder::new();
    builder.map(|s: &FlowState| s.clone());
    let flow = builder.build().unwrap();
    assert!(flow.set_demos(&[]).is_ok());
}

#[test]
fn test_demos_route_through_nested_flows() {
    let leaf = Arc::new(MockNode::new());
    let mut inner = FlowBuilder::new();
    inner.node("leaf", leaf.clone()).execute("leaf", |s: &FlowState| s.to_value());
    let inner = inner.build().unwrap();

    let mut outer = FlowBuilder::new();
    outer
        .with_id("root")
        .node("sub", Arc::new(inner))
        .execute("sub", |s: &FlowState| s.to_value());
    let outer = outer.build().unwrap();

    assert_eq!(leaf.current_id().as_deref(), Some("root.sub.leaf"));

    outer
        .set_demos(&[DemoAssignment::new("root.sub.leaf", vec![json!({"deep": true})])])
        .unwrap();
    assert_eq!(leaf.received_demos()[0].program_id, "root.sub.leaf");
}

#[test]
fn test_optimization_reaches_every_child() {
    let tree = tree();
    let optimized = OptimizedProgram {
        optimizer: "bootstrap".into(),
        best_score: 0.92,
        instruction: Some("be brief".into()),
        ..OptimizedProgram::default()
    };
    tree.flow.apply_optimization(&optimized);

    assert_eq!(tree.actor.received_optimizations(), 1);
    assert_eq!(tree.responder.received_optimizations(), 1);
    assert_eq!(tree.flow.optimization(), Some(optimized));
}

#[test]
fn test_examples_propagate() {
    let program = Arc::new(
        FnProgram::new("q -> a", |_ai, input, _opts| async move { Ok::<_, flowcraft_core::BoxError>(input) })
            .unwrap(),
    );
    let mut builder = FlowBuilder::new();
    builder.node("answer", program.clone());
    let flow = builder.build().unwrap();

    flow.set_examples(&[json!({"q": "1+1", "a": "2"})]);
    assert_eq!(program.examples().len(), 1);
    assert_eq!(flow.examples().len(), 1);
}

#[test]
fn test_usage_is_merged_and_reset() {
    let a = Arc::new(MockNode::new().with_usage(usage(10)));
    let b = Arc::new(MockNode::new().with_usage(usage(5)));
    let mut builder = FlowBuilder::new();
    builder.node("a", a).node("b", b);
    let flow = builder.build().unwrap();

    let merged = flow.usage();
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].total_tokens, 15);

    flow.reset_usage();
    assert!(flow.usage().is_empty());
}

#[tokio::test]
async fn test_traces_are_collected_from_children() {
    let program = Arc::new(
        FnProgram::new("q -> a", |_ai, input, _opts| async move { Ok::<_, flowcraft_core::BoxError>(input) })
            .unwrap(),
    );
    let mut builder = FlowBuilder::new();
    builder
        .with_id("qa")
        .node("answer", program)
        .execute("answer", |s: &FlowState| json!({ "q": s.get("q") }));
    let flow = builder.build().unwrap();

    flow.invoke(ai(), state(json!({"q": "hi"})), &ForwardOptions::new())
        .await
        .unwrap();

    let traces = flow.traces();
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].program_id, "qa.answer");
    assert_eq!(traces[0].trace["input"], json!({"q": "hi"}));
}

#[tokio::test]
async fn test_flow_forwards_as_a_program() {
    let tree = tree();
    let output = Programmable::forward(&tree.flow, ai(), json!({"x": 1}), &ForwardOptions::new())
        .await
        .unwrap();
    assert_eq!(output["x"], json!(1));
    assert!(output.get("actorResult").is_some());
    assert!(output.get("responderResult").is_some());

    let err = Programmable::forward(&tree.flow, ai(), json!([1, 2]), &ForwardOptions::new())
        .await
        .unwrap_err();
    assert!(err.downcast_ref::<FlowError>().is_some());
}
