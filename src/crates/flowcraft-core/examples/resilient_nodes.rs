//! Retries, circuit breaking and cancellation
//!
//! A node that fails its first two calls recovers through retries, a node
//! that always fails trips the breaker, and a slow run is cancelled from
//! the outside.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flowcraft_core::{
    BoxError, CircuitBreakerConfig, ErrorHandlingConfig, FlowBuilder, FlowConfig, FlowState, FnProgram,
    ForwardOptions, InMemoryTracer, NamedAi,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn flaky(failures: u32) -> Result<FnProgram, flowcraft_core::FlowError> {
    let calls = Arc::new(AtomicU32::new(0));
    FnProgram::new("prompt:string -> reply:string", move |_ai, input, _opts| {
        let calls = Arc::clone(&calls);
        async move {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= failures {
                return Err::<serde_json::Value, BoxError>(format!("upstream unavailable (call {})", call).into());
            }
            Ok(json!({ "reply": format!("echo: {}", input["prompt"]), "call": call }))
        }
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let ai = Arc::new(NamedAi::new("local"));

    println!("=== Retry ===");
    let mut builder = FlowBuilder::new();
    builder
        .with_id("retrying")
        .with_config(FlowConfig::new().with_error_handling(ErrorHandlingConfig {
            default_retries: 2,
            retry_delay_ms: 50,
            exponential_backoff: true,
            ..ErrorHandlingConfig::default()
        }))
        .node("writer", Arc::new(flaky(2)?))
        .execute("writer", |s: &FlowState| json!({ "prompt": s.get("prompt") }));
    let flow = builder.build()?;

    let tracer = Arc::new(InMemoryTracer::new());
    let output = flow
        .invoke(
            ai.clone(),
            FlowState::from_value(json!({ "prompt": "hello" }))?,
            &ForwardOptions::new().with_tracer(tracer.clone()),
        )
        .await?;
    println!("writerResult = {}", output.get("writerResult").cloned().unwrap_or_default());
    for span in tracer.spans() {
        println!("span {} (trace {})", span.name, span.context.trace_id);
    }

    println!("\n=== Circuit breaker ===");
    let mut builder = FlowBuilder::new();
    builder
        .with_id("breaking")
        .with_config(FlowConfig::new().with_error_handling(ErrorHandlingConfig {
            circuit_breaker: CircuitBreakerConfig::enabled(2, Duration::from_millis(200)),
            ..ErrorHandlingConfig::default()
        }))
        .node("writer", Arc::new(flaky(u32::MAX)?))
        .execute("writer", |s: &FlowState| s.to_value());
    let flow = builder.build()?;

    for attempt in 1..=3 {
        let result = flow.invoke(ai.clone(), FlowState::new(), &ForwardOptions::new()).await;
        match result {
            Ok(_) => println!("attempt {}: ok", attempt),
            Err(err) => println!("attempt {}: {} (breaker {:?})", attempt, err, flow.circuit_state()),
        }
    }

    println!("\n=== Cancellation ===");
    let slow = FnProgram::new("prompt -> reply", |_ai, _input, opts| async move {
        let sleep = tokio::time::sleep(Duration::from_secs(10));
        match opts.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err::<serde_json::Value, BoxError>("cancelled".into()),
                _ = sleep => Ok(json!({ "reply": "late" })),
            },
            None => {
                sleep.await;
                Ok(json!({ "reply": "late" }))
            }
        }
    })?;
    let mut builder = FlowBuilder::new();
    builder
        .with_id("slow")
        .node("writer", Arc::new(slow))
        .execute("writer", |s: &FlowState| s.to_value());
    let flow = builder.build()?;

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });
    match flow
        .invoke(ai, FlowState::new(), &ForwardOptions::new().with_cancel(token))
        .await
    {
        Ok(_) => println!("finished before the deadline"),
        Err(err) => println!("run ended: {} (aborted: {})", err, err.is_aborted()),
    }

    Ok(())
}
