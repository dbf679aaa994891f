//! Parallel pipeline example
//!
//! Three independent transforms run in the same group, a scoring node reads
//! their outputs, and a branch picks a follow-up step from the score.
//!
//! Run with `RUST_LOG=flowcraft_core=debug` to see the step events.

use std::sync::Arc;
use std::time::Duration;

use flowcraft_core::{
    BoxError, FlowBuilder, FlowConfig, FlowState, FnProgram, ForwardOptions, NamedAi, StateUpdate, SubFlow,
    Transform,
};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

fn word_count(state: &FlowState) -> StateUpdate {
    let text = state.get("text").and_then(Value::as_str).unwrap_or_default();
    StateUpdate::set("words", text.split_whitespace().count())
}

fn char_count(state: &FlowState) -> StateUpdate {
    let text = state.get("text").and_then(Value::as_str).unwrap_or_default();
    StateUpdate::set("chars", text.chars().count())
}

fn shout(state: &FlowState) -> StateUpdate {
    let text = state.get("text").and_then(Value::as_str).unwrap_or_default();
    StateUpdate::set("loud", text.to_uppercase())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("flowcraft_core=info".parse()?))
        .init();

    println!("=== Parallel Pipeline Example ===\n");

    let scorer = FnProgram::new("words:number, chars:number -> score:number", |_ai, input, _opts| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let words = input["words"].as_u64().unwrap_or(0);
        let chars = input["chars"].as_u64().unwrap_or(0);
        Ok::<_, BoxError>(json!({ "score": words * 10 + chars }))
    })?;

    let mut builder = FlowBuilder::new();
    builder
        .with_id("pipeline")
        .with_config(FlowConfig::new().with_max_concurrency(4).with_debug(true))
        .with_signature("text:string -> verdict:string")
        .node("scorer", Arc::new(scorer))
        .map_with(Transform::new(word_count).reads(["text"]).writes(["words"]))
        .map_with(Transform::new(char_count).reads(["text"]).writes(["chars"]))
        .map_with(Transform::new(shout).reads(["text"]).writes(["loud"]))
        .execute("scorer", |s: &FlowState| {
            json!({ "words": s.get("words"), "chars": s.get("chars") })
        })
        .map(|s: &FlowState| {
            let score = s
                .get("scorerResult")
                .and_then(|r| r.get("score"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            StateUpdate::set("score", score)
        })
        .branch(|s: &FlowState| json!(s.get("score").and_then(Value::as_u64).unwrap_or(0) > 100))
        .when(true)
        .map(|_: &FlowState| StateUpdate::set("verdict", "long"))
        .when(false)
        .map(|_: &FlowState| StateUpdate::set("verdict", "short"))
        .merge()
        .parallel([
            SubFlow::new().map(|s: &FlowState| StateUpdate::set("shape", s.len())),
            SubFlow::new().map(|_: &FlowState| StateUpdate::set("stamp", "reviewed")),
        ])
        .merge_all();

    let flow = builder.build()?;

    println!("Execution plan:");
    println!("{}\n", serde_json::to_string_pretty(flow.execution_plan())?);

    let ai = Arc::new(NamedAi::new("local"));
    let input = FlowState::from_value(json!({
        "text": "the quick brown fox jumps over the lazy dog"
    }))?;
    let output = flow.invoke(ai, input, &ForwardOptions::new()).await?;

    println!("Output:");
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
