//! Tests for pause snapshots and the three resume trigger kinds: named
//! events, manual action with roles, and polled predicates.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tideflow::engine::FlowEngine;
use tideflow::engine::definition::{FlowDefinition, PauseDecision, ResumeConfig};
use tideflow::engine::executor::ResumeActor;
use tideflow::engine::registry::FlowKindRegistry;
use tideflow::engine::resume::ResumeController;
use tideflow::engine::types::{FlowEventType, FlowStatus, StepResult};
use tideflow::engine::value::SafeValue;
use tideflow::storage::memory_store::MemoryStore;

fn engine_for<F>(kind: &str, define: F) -> Arc<FlowEngine>
where
    F: Fn() -> FlowDefinition + Send + Sync + 'static,
{
    let mut registry = FlowKindRegistry::new();
    registry.register_fn(kind, define).unwrap();
    FlowEngine::new(Arc::new(registry), Arc::new(MemoryStore::new()))
}

fn approval_needed() -> HashMap<String, SafeValue> {
    let mut data = HashMap::new();
    data.insert("requiresApproval".to_string(), SafeValue::Bool(true));
    data
}

fn approval_definition(resume: ResumeConfig) -> FlowDefinition {
    FlowDefinition::new("onboarding")
        .step("collect")
        .execute(|_ctx| Box::pin(async { Ok(StepResult::success("collected")) }))
        .build()
        .step("await_approval")
        .after(&["collect"])
        .can_pause(|ctx| {
            if ctx.try_get_data::<bool>("requiresApproval") == Some(true) {
                PauseDecision::pause("compliance_review", "need approval")
            } else {
                PauseDecision::Continue
            }
        })
        .resume_on(resume)
        .execute(|_ctx| Box::pin(async { Ok(StepResult::success("approved")) }))
        .build()
        .step("finish")
        .after(&["await_approval"])
        .execute(|_ctx| Box::pin(async { Ok(StepResult::success("done")) }))
        .build()
}

// --- Pause on predicate, resume on event ---

#[tokio::test]
async fn pause_then_resume_on_event() {
    let engine = engine_for("onboarding", || {
        approval_definition(ResumeConfig::new().on_event("Approved"))
    });

    let state = engine
        .execute("onboarding", "user-1", None, approval_needed())
        .await
        .unwrap();

    assert_eq!(state.status, FlowStatus::Paused);
    let pause = state.pause.as_ref().unwrap();
    assert_eq!(pause.reason, "compliance_review");
    assert_eq!(state.current_step_name, "await_approval");

    let resumed = engine
        .publish_event("Approved", &serde_json::json!({}))
        .await
        .unwrap();
    assert_eq!(resumed, 1);

    let state = engine.flow(state.flow_id).await.unwrap();
    assert_eq!(state.status, FlowStatus::Completed);
    assert!(state.pause.is_none());

    // Exactly one pause/resume round trip.
    let kinds: Vec<FlowEventType> = state.events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds
            .iter()
            .filter(|k| **k == FlowEventType::FlowPaused)
            .count(),
        1
    );
    assert_eq!(
        kinds
            .iter()
            .filter(|k| **k == FlowEventType::FlowResumed)
            .count(),
        1
    );
}

#[tokio::test]
async fn unrelated_events_do_not_resume() {
    let engine = engine_for("onboarding", || {
        approval_definition(ResumeConfig::new().on_event("Approved"))
    });

    let state = engine
        .execute("onboarding", "user-1", None, approval_needed())
        .await
        .unwrap();
    assert_eq!(state.status, FlowStatus::Paused);

    let resumed = engine
        .publish_event("SomethingElse", &serde_json::json!({}))
        .await
        .unwrap();
    assert_eq!(resumed, 0);
    assert_eq!(engine.status(state.flow_id).await.unwrap(), FlowStatus::Paused);
}

#[tokio::test]
async fn event_payload_filter_is_honored() {
    let engine = engine_for("onboarding", || {
        approval_definition(ResumeConfig::new().on_event_filtered("Approved", |payload| {
            payload.get("level").and_then(|v| v.as_str()) == Some("full")
        }))
    });

    let state = engine
        .execute("onboarding", "user-1", None, approval_needed())
        .await
        .unwrap();

    let resumed = engine
        .publish_event("Approved", &serde_json::json!({ "level": "partial" }))
        .await
        .unwrap();
    assert_eq!(resumed, 0);

    let resumed = engine
        .publish_event("Approved", &serde_json::json!({ "level": "full" }))
        .await
        .unwrap();
    assert_eq!(resumed, 1);
    assert_eq!(
        engine.status(state.flow_id).await.unwrap(),
        FlowStatus::Completed
    );
}

#[tokio::test]
async fn pause_predicate_not_reevaluated_after_resume() {
    // The predicate keeps demanding a pause; after resume the body must
    // run anyway, exactly once.
    let body_runs = Arc::new(AtomicU32::new(0));
    let body_in = body_runs.clone();

    let engine = engine_for("sticky", move || {
        let body_runs = body_in.clone();
        FlowDefinition::new("sticky")
            .step("gate")
            .can_pause(|_ctx| PauseDecision::pause("always", "always pauses"))
            .resume_on(ResumeConfig::new().on_event("Go"))
            .execute(move |_ctx| {
                let body_runs = body_runs.clone();
                Box::pin(async move {
                    body_runs.fetch_add(1, Ordering::SeqCst);
                    Ok(StepResult::success("ran"))
                })
            })
            .build()
    });

    let state = engine.execute("sticky", "user-1", None, HashMap::new()).await.unwrap();
    assert_eq!(state.status, FlowStatus::Paused);
    assert_eq!(body_runs.load(Ordering::SeqCst), 0);

    engine.publish_event("Go", &serde_json::json!({})).await.unwrap();
    assert_eq!(engine.status(state.flow_id).await.unwrap(), FlowStatus::Completed);
    assert_eq!(body_runs.load(Ordering::SeqCst), 1);
}

// --- Manual resume with roles ---

#[tokio::test]
async fn manual_resume_requires_an_allowed_role() {
    let engine = engine_for("onboarding", || {
        approval_definition(ResumeConfig::new().manual(&["compliance"]))
    });

    let state = engine
        .execute("onboarding", "user-1", None, approval_needed())
        .await
        .unwrap();
    assert_eq!(state.status, FlowStatus::Paused);

    let intern = ResumeActor::new("intern-7", &["support"]);
    let ok = engine
        .resume(state.flow_id, "manual", &intern, "please")
        .await
        .unwrap();
    assert!(!ok);
    assert_eq!(engine.status(state.flow_id).await.unwrap(), FlowStatus::Paused);

    let officer = ResumeActor::new("officer-1", &["compliance"]);
    let ok = engine
        .resume(state.flow_id, "manual", &officer, "reviewed and cleared")
        .await
        .unwrap();
    assert!(ok);
    assert_eq!(
        engine.status(state.flow_id).await.unwrap(),
        FlowStatus::Completed
    );
}

// --- Polled predicate conditions ---

#[tokio::test]
async fn polled_condition_resumes_when_it_holds() {
    let ready = Arc::new(AtomicBool::new(false));
    let ready_in = ready.clone();

    let engine = engine_for("poller", move || {
        let ready = ready_in.clone();
        approval_definition(ResumeConfig::new().on_condition(
            move |_state| {
                let ready = ready.clone();
                Box::pin(async move { ready.load(Ordering::SeqCst) })
            },
            Duration::from_millis(10),
            10,
        ))
    });
    let controller = ResumeController::new(engine.clone(), Duration::from_millis(10));

    let state = engine
        .execute("poller", "user-1", None, approval_needed())
        .await
        .unwrap();
    assert_eq!(state.status, FlowStatus::Paused);

    // Condition does not hold yet.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(controller.poll_once().await.unwrap(), 0);
    assert_eq!(engine.status(state.flow_id).await.unwrap(), FlowStatus::Paused);

    ready.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(controller.poll_once().await.unwrap(), 1);
    assert_eq!(
        engine.status(state.flow_id).await.unwrap(),
        FlowStatus::Completed
    );
}

#[tokio::test]
async fn exhausted_polled_condition_fails_the_flow() {
    let engine = engine_for("hopeless", || {
        approval_definition(ResumeConfig::new().on_condition(
            |_state| Box::pin(async { false }),
            Duration::from_millis(5),
            2,
        ))
    });
    let controller = ResumeController::new(engine.clone(), Duration::from_millis(5));

    let state = engine
        .execute("hopeless", "user-1", None, approval_needed())
        .await
        .unwrap();
    assert_eq!(state.status, FlowStatus::Paused);

    tokio::time::sleep(Duration::from_millis(10)).await;
    controller.poll_once().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    controller.poll_once().await.unwrap();

    let state = engine.flow(state.flow_id).await.unwrap();
    assert_eq!(state.status, FlowStatus::Failed);
    assert!(
        state
            .last_error
            .as_ref()
            .unwrap()
            .summary()
            .contains("resume predicate")
    );
}

// --- Cancellation while paused ---

#[tokio::test]
async fn cancelling_a_paused_flow_is_immediate() {
    let engine = engine_for("onboarding", || {
        approval_definition(ResumeConfig::new().on_event("Approved"))
    });

    let state = engine
        .execute("onboarding", "user-1", None, approval_needed())
        .await
        .unwrap();
    assert_eq!(state.status, FlowStatus::Paused);

    assert!(engine.cancel(state.flow_id, "abandoned").await.unwrap());
    let state = engine.flow(state.flow_id).await.unwrap();
    assert_eq!(state.status, FlowStatus::Cancelled);
    assert!(state.pause.is_none());

    // Terminal flows cannot be cancelled twice.
    assert!(!engine.cancel(state.flow_id, "again").await.unwrap());
}
