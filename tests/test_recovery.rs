//! Tests for the recovery service: re-adopting stalled Running flows from
//! their last durable snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use tideflow::engine::FlowEngine;
use tideflow::engine::definition::FlowDefinition;
use tideflow::engine::recovery::RecoveryService;
use tideflow::engine::registry::FlowKindRegistry;
use tideflow::engine::types::{
    FlowEventType, FlowState, FlowStatus, StepResult, StepStatus,
};
use tideflow::storage::StateStore;
use tideflow::storage::memory_store::MemoryStore;

fn ledger_definition(
    insert_runs: Arc<AtomicU32>,
    finish_runs: Arc<AtomicU32>,
) -> impl Fn() -> FlowDefinition + Send + Sync + 'static {
    move || {
        let insert_runs = insert_runs.clone();
        let finish_runs = finish_runs.clone();
        FlowDefinition::new("ledger")
            .step("prepare")
            .execute(|_ctx| Box::pin(async { Ok(StepResult::success("prepared")) }))
            .build()
            .step("insert")
            .after(&["prepare"])
            .with_idempotency()
            .execute(move |_ctx| {
                let insert_runs = insert_runs.clone();
                Box::pin(async move {
                    insert_runs.fetch_add(1, Ordering::SeqCst);
                    Ok(StepResult::success("row inserted"))
                })
            })
            .build()
            .step("finish")
            .after(&["insert"])
            .execute(move |_ctx| {
                let finish_runs = finish_runs.clone();
                Box::pin(async move {
                    finish_runs.fetch_add(1, Ordering::SeqCst);
                    Ok(StepResult::success("done"))
                })
            })
            .build()
    }
}

/// Persist a snapshot that looks like a crash mid-flow: `insert` already
/// Completed, `finish` still Pending, flow left Running.
async fn plant_crashed_flow(store: &MemoryStore) -> FlowState {
    let names: Vec<String> = ["prepare", "insert", "finish"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let mut state = FlowState::new("ledger", "user-1", None, HashMap::new(), &names);
    state.status = FlowStatus::Running;
    state.started_at = Some(Utc::now());
    state.current_step_index = 1;
    state.current_step_name = "insert".to_string();

    for name in ["prepare", "insert"] {
        let step = state.step_mut(name).unwrap();
        step.status = StepStatus::Completed;
        step.started_at = Some(Utc::now());
        step.completed_at = Some(Utc::now());
        step.result = Some(StepResult::success("done before crash"));
    }

    state.version = store.save(&state).await.unwrap();
    state
}

#[tokio::test]
async fn recovery_resumes_a_stalled_flow_without_replaying_side_effects() {
    let insert_runs = Arc::new(AtomicU32::new(0));
    let finish_runs = Arc::new(AtomicU32::new(0));

    let mut registry = FlowKindRegistry::new();
    registry
        .register_fn(
            "ledger",
            ledger_definition(insert_runs.clone(), finish_runs.clone()),
        )
        .unwrap();

    let store = Arc::new(MemoryStore::new());
    let engine = FlowEngine::new(Arc::new(registry), store.clone());
    let planted = plant_crashed_flow(&store).await;

    // Zero threshold: anything persisted before the sweep counts as stalled.
    let recovery = RecoveryService::new(engine.clone(), Duration::ZERO, Duration::from_secs(3600));
    let result = recovery.recover_stalled().await.unwrap();

    assert_eq!(result.checked, 1);
    assert_eq!(result.recovered, 1);
    assert_eq!(result.failed, 0);
    assert_eq!(result.recovered_ids, vec![planted.flow_id]);

    let state = engine.flow(planted.flow_id).await.unwrap();
    assert_eq!(state.status, FlowStatus::Completed);
    assert!(
        state
            .events
            .iter()
            .any(|e| e.event_type == FlowEventType::FlowRecovered)
    );

    // The completed insert was not re-executed; only finish ran.
    assert_eq!(insert_runs.load(Ordering::SeqCst), 0);
    assert_eq!(finish_runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn recently_updated_flows_are_left_alone() {
    let insert_runs = Arc::new(AtomicU32::new(0));
    let finish_runs = Arc::new(AtomicU32::new(0));

    let mut registry = FlowKindRegistry::new();
    registry
        .register_fn(
            "ledger",
            ledger_definition(insert_runs.clone(), finish_runs.clone()),
        )
        .unwrap();

    let store = Arc::new(MemoryStore::new());
    let engine = FlowEngine::new(Arc::new(registry), store.clone());
    plant_crashed_flow(&store).await;

    let recovery = RecoveryService::new(
        engine.clone(),
        Duration::from_secs(30 * 60),
        Duration::from_secs(3600),
    );
    let result = recovery.recover_stalled().await.unwrap();

    assert_eq!(result.checked, 0);
    assert_eq!(result.recovered, 0);
    assert_eq!(finish_runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn definition_drift_is_reported_per_flow() {
    let mut registry = FlowKindRegistry::new();
    registry
        .register_fn("drifty", || {
            FlowDefinition::new("drifty")
                .step("renamed_step")
                .execute(|_ctx| Box::pin(async { Ok(StepResult::success("ok")) }))
                .build()
        })
        .unwrap();

    let store = Arc::new(MemoryStore::new());
    let engine = FlowEngine::new(Arc::new(registry), store.clone());

    let names = vec!["old_step".to_string()];
    let mut state = FlowState::new("drifty", "user-1", None, HashMap::new(), &names);
    state.status = FlowStatus::Running;
    state.version = store.save(&state).await.unwrap();

    let recovery = RecoveryService::new(engine.clone(), Duration::ZERO, Duration::from_secs(3600));
    let result = recovery.recover_stalled().await.unwrap();

    assert_eq!(result.checked, 1);
    assert_eq!(result.recovered, 0);
    assert_eq!(result.failed, 1);
    assert!(result.failures.contains_key(&state.flow_id));

    // The flow is untouched, awaiting operator intervention.
    assert_eq!(engine.status(state.flow_id).await.unwrap(), FlowStatus::Running);
}

#[tokio::test]
async fn unregistered_kind_is_reported_per_flow() {
    let registry = FlowKindRegistry::new();
    let store = Arc::new(MemoryStore::new());
    let engine = FlowEngine::new(Arc::new(registry), store.clone());

    let names = vec!["only".to_string()];
    let mut state = FlowState::new("ghost", "user-1", None, HashMap::new(), &names);
    state.status = FlowStatus::Running;
    state.version = store.save(&state).await.unwrap();

    let recovery = RecoveryService::new(engine, Duration::ZERO, Duration::from_secs(3600));
    let result = recovery.recover_stalled().await.unwrap();

    assert_eq!(result.failed, 1);
    assert!(result.failures[&state.flow_id].contains("ghost"));
}
