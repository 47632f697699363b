//! Tests for static branches and dynamic fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tideflow::engine::FlowEngine;
use tideflow::engine::definition::{
    BranchStrategy, FlowDefinition, StaticBranch, StepBuilder, SubStep,
};
use tideflow::engine::registry::FlowKindRegistry;
use tideflow::engine::types::{FlowStatus, StepResult};
use tideflow::engine::value::{self, SafeValue};
use tideflow::storage::memory_store::MemoryStore;

fn engine_for<F>(kind: &str, define: F) -> Arc<FlowEngine>
where
    F: Fn() -> FlowDefinition + Send + Sync + 'static,
{
    let mut registry = FlowKindRegistry::new();
    registry.register_fn(kind, define).unwrap();
    FlowEngine::new(Arc::new(registry), Arc::new(MemoryStore::new()))
}

fn amount(v: i64) -> HashMap<String, SafeValue> {
    let mut data = HashMap::new();
    data.insert("amount".to_string(), SafeValue::Int(v));
    data
}

fn routing_definition() -> FlowDefinition {
    FlowDefinition::new("routed")
        .step("route")
        .with_static_branches(vec![
            StaticBranch::when(
                "high",
                |ctx| ctx.try_get_data::<i64>("amount").is_some_and(|a| a > 100),
                vec![
                    StepBuilder::detached("mark_high")
                        .execute(|ctx| {
                            Box::pin(async move {
                                ctx.set_data("branch", &"high");
                                Ok(StepResult::success("high path"))
                            })
                        })
                        .into_step(),
                ],
            ),
            StaticBranch::fallback(
                "low",
                vec![
                    StepBuilder::detached("mark_low")
                        .execute(|ctx| {
                            Box::pin(async move {
                                ctx.set_data("branch", &"low");
                                Ok(StepResult::success("low path"))
                            })
                        })
                        .into_step(),
                ],
            ),
        ])
        .build()
}

// --- Static branches ---

#[tokio::test]
async fn first_matching_static_branch_runs() {
    let engine = engine_for("routed", routing_definition);
    let state = engine.execute("routed", "user-1", None, amount(200)).await.unwrap();

    assert_eq!(state.status, FlowStatus::Completed);
    assert_eq!(
        value::decode::<String>(state.data.get("branch").unwrap()).unwrap(),
        "high"
    );
}

#[tokio::test]
async fn default_static_branch_runs_when_nothing_matches() {
    let engine = engine_for("routed", routing_definition);
    let state = engine.execute("routed", "user-1", None, amount(50)).await.unwrap();

    assert_eq!(state.status, FlowStatus::Completed);
    assert_eq!(
        value::decode::<String>(state.data.get("branch").unwrap()).unwrap(),
        "low"
    );
}

#[tokio::test]
async fn failing_branch_step_fails_the_parent() {
    let engine = engine_for("doomed", || {
        FlowDefinition::new("doomed")
            .step("route")
            .with_static_branches(vec![StaticBranch::fallback(
                "always",
                vec![
                    StepBuilder::detached("bad")
                        .execute(|_ctx| Box::pin(async { Ok(StepResult::failure("inner boom")) }))
                        .into_step(),
                ],
            )])
            .build()
    });

    let state = engine.execute("doomed", "user-1", None, HashMap::new()).await.unwrap();
    assert_eq!(state.status, FlowStatus::Failed);
    assert!(state.last_error.as_ref().unwrap().summary().contains("bad"));
}

// --- Dynamic fan-out ---

fn process_items_definition(strategy: BranchStrategy) -> FlowDefinition {
    FlowDefinition::new("process_items")
        .step("process")
        .with_dynamic_branches(
            |_ctx| {
                ["a", "b", "c", "d", "e"]
                    .iter()
                    .map(|s| SafeValue::from(*s))
                    .collect()
            },
            |item, idx| {
                let tag = match item {
                    SafeValue::Str(s) => s.clone(),
                    _ => idx.to_string(),
                };
                SubStep::new(
                    StepBuilder::detached(&format!("process_{}", tag))
                        .execute(move |ctx| {
                            let key = format!("processed_{}", tag);
                            Box::pin(async move {
                                tokio::time::sleep(Duration::from_millis(50)).await;
                                ctx.set_data(&key, &true);
                                Ok(StepResult::success("processed"))
                            })
                        })
                        .into_step(),
                )
            },
            strategy,
        )
        .build()
}

#[tokio::test]
async fn parallel_fan_out_processes_every_item_concurrently() {
    let engine = engine_for("process_items", || {
        process_items_definition(BranchStrategy::Parallel)
    });

    let started = Instant::now();
    let state = engine
        .execute("process_items", "user-1", None, HashMap::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(state.status, FlowStatus::Completed);
    for tag in ["a", "b", "c", "d", "e"] {
        let key = format!("processed_{}", tag);
        assert_eq!(
            value::decode::<bool>(state.data.get(&key).unwrap()).unwrap(),
            true,
            "missing {}",
            key
        );
    }
    // Five 50ms sub-steps in parallel finish well under the serial 250ms.
    assert!(elapsed < Duration::from_millis(240), "took {:?}", elapsed);
}

#[tokio::test]
async fn sequential_fan_out_processes_in_index_order() {
    let engine = engine_for("process_items", || {
        process_items_definition(BranchStrategy::Sequential)
    });

    let state = engine
        .execute("process_items", "user-1", None, HashMap::new())
        .await
        .unwrap();

    assert_eq!(state.status, FlowStatus::Completed);

    // Branch step events appear in declaration/index order.
    let starts: Vec<&str> = state
        .events
        .iter()
        .filter(|e| e.description.starts_with("Branch step") && e.description.contains("started"))
        .map(|e| e.description.as_str())
        .collect();
    assert_eq!(starts.len(), 5);
    assert!(starts[0].contains("process_a"));
    assert!(starts[4].contains("process_e"));
}

#[tokio::test]
async fn fan_out_failure_respects_allow_failure() {
    let engine = engine_for("mixed", || {
        FlowDefinition::new("mixed")
            .step("fan")
            .with_dynamic_branches(
                |_ctx| vec![SafeValue::Int(1), SafeValue::Int(2)],
                |item, idx| {
                    let fails = matches!(item, SafeValue::Int(1));
                    let mut builder = StepBuilder::detached(&format!("sub_{}", idx));
                    builder = if fails {
                        builder
                            .allow_failure()
                            .execute(|_ctx| Box::pin(async { Ok(StepResult::failure("tolerated")) }))
                    } else {
                        builder.execute(|_ctx| Box::pin(async { Ok(StepResult::success("fine")) }))
                    };
                    SubStep::new(builder.into_step())
                },
                BranchStrategy::Sequential,
            )
            .build()
    });

    let state = engine.execute("mixed", "user-1", None, HashMap::new()).await.unwrap();
    assert_eq!(state.status, FlowStatus::Completed);
}
