//! Tests for the flow builder, definition validation, and the flow-kind
//! registry.

use std::sync::Arc;
use std::time::Duration;

use tideflow::engine::definition::{FlowDefinition, PauseDecision, ResumeConfig, StepBuilder};
use tideflow::engine::error::EngineError;
use tideflow::engine::registry::{FlowKind, FlowKindRegistry};
use tideflow::engine::types::{RetryPolicy, StepResult};

fn noop() -> FlowDefinition {
    FlowDefinition::new("noop")
        .step("only")
        .execute(|_ctx| Box::pin(async { Ok(StepResult::success("ok")) }))
        .build()
}

// --- Builder ---

#[test]
fn builder_preserves_declaration_order() {
    let def = FlowDefinition::new("ordered")
        .step("a")
        .build()
        .step("b")
        .after(&["a"])
        .build()
        .step("c")
        .after(&["a", "b"])
        .build();

    assert_eq!(def.step_names(), vec!["a", "b", "c"]);
    assert_eq!(def.step_index("b"), Some(1));
    assert_eq!(def.steps[2].after, vec!["a", "b"]);
    assert!(def.validate().is_ok());
}

#[test]
fn builder_records_policies() {
    let def = FlowDefinition::new("policies")
        .step("careful")
        .with_retries(4, Duration::from_millis(250))
        .with_timeout(Duration::from_secs(30))
        .critical()
        .with_idempotency()
        .build();

    let step = &def.steps[0];
    assert_eq!(
        step.retry,
        RetryPolicy {
            max_retries: 4,
            delay: Duration::from_millis(250),
        }
    );
    assert_eq!(step.timeout, Some(Duration::from_secs(30)));
    assert!(step.critical);
    assert!(step.idempotent);
    assert!(!step.allow_failure);
}

#[test]
fn detached_steps_do_not_touch_a_flow() {
    let step = StepBuilder::detached("loose")
        .allow_failure()
        .execute(|_ctx| Box::pin(async { Ok(StepResult::success("ok")) }))
        .into_step();
    assert_eq!(step.name, "loose");
    assert!(step.allow_failure);
}

// --- Validation ---

#[test]
fn duplicate_step_names_are_rejected() {
    let def = FlowDefinition::new("dup").step("same").build().step("same").build();
    let err = def.validate().unwrap_err();
    assert!(err.contains("duplicate"));
}

#[test]
fn unknown_dependency_is_rejected() {
    let def = FlowDefinition::new("missing").step("a").after(&["ghost"]).build();
    let err = def.validate().unwrap_err();
    assert!(err.contains("ghost"));
}

#[test]
fn forward_dependency_is_rejected() {
    let def = FlowDefinition::new("forward")
        .step("a")
        .after(&["b"])
        .build()
        .step("b")
        .build();
    let err = def.validate().unwrap_err();
    assert!(err.contains("declared after"));
}

#[test]
fn unknown_jump_target_is_rejected() {
    let def = FlowDefinition::new("jumpy").step("a").jump_to("nowhere", 1).build();
    let err = def.validate().unwrap_err();
    assert!(err.contains("nowhere"));
}

#[test]
fn empty_resume_config_on_pausable_step_is_rejected() {
    let def = FlowDefinition::new("pauser")
        .step("gate")
        .can_pause(|_ctx| PauseDecision::pause("hold", "holding"))
        .resume_on(ResumeConfig::new())
        .build();
    let err = def.validate().unwrap_err();
    assert!(err.contains("resume"));
}

// --- Registry ---

struct Onboarding;

impl FlowKind for Onboarding {
    fn kind(&self) -> &str {
        "user_onboarding"
    }

    fn description(&self) -> &str {
        "Collect and verify a new user"
    }

    fn define(&self) -> FlowDefinition {
        FlowDefinition::new("user_onboarding")
            .step("collect")
            .execute(|_ctx| Box::pin(async { Ok(StepResult::success("ok")) }))
            .build()
    }
}

#[test]
fn registry_registers_and_lists_kinds() {
    let mut registry = FlowKindRegistry::new();
    registry.register(Arc::new(Onboarding)).unwrap();
    registry.register_fn("noop", noop).unwrap();

    let listed = registry.list();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].0, "noop");
    assert_eq!(listed[1].0, "user_onboarding");
    assert_eq!(listed[1].1, "Collect and verify a new user");

    assert!(registry.get("user_onboarding").is_some());
    let def = registry.definition("user_onboarding").unwrap();
    assert_eq!(def.step_names(), vec!["collect"]);
}

#[test]
fn registry_rejects_invalid_definitions() {
    let mut registry = FlowKindRegistry::new();
    let result = registry.register_fn("broken", || {
        FlowDefinition::new("broken").step("a").after(&["ghost"]).build()
    });
    assert!(matches!(
        result,
        Err(EngineError::InvalidDefinition { .. })
    ));
}

#[test]
fn unknown_kind_is_an_error() {
    let registry = FlowKindRegistry::new();
    assert!(matches!(
        registry.definition("nope"),
        Err(EngineError::UnknownFlowKind(_))
    ));
}
