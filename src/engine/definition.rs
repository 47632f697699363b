//! Declarative flow definitions and the fluent step builder.
//!
//! A definition is a pure recipe: it assembles the step graph
//! (dependencies, conditions, branches, pause/resume specs, retries,
//! timeouts, idempotency, triggered child flows) and never executes
//! anything. Definitions are rebound from the flow-kind registry when a
//! snapshot is loaded; nothing in this module is persisted.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::engine::context::ExecutionContext;
use crate::engine::middleware::{Middleware, StepBody, StepFuture};
use crate::engine::types::{FlowState, RetryPolicy};
use crate::engine::value::{self, SafeValue};

/// Synchronous predicate over the live execution context.
pub type Predicate = Arc<dyn Fn(&ExecutionContext) -> bool + Send + Sync>;

/// Pause predicate, evaluated right before the first body attempt.
pub type PausePredicate = Arc<dyn Fn(&ExecutionContext) -> PauseDecision + Send + Sync>;

/// Factory producing a stable idempotency key for a step run.
pub type KeyFactory = Arc<dyn Fn(&ExecutionContext) -> String + Send + Sync>;

/// Structural check applied to a stored value by a data dependency.
pub type DataCheck = Arc<dyn Fn(&SafeValue) -> bool + Send + Sync>;

/// Selector producing the source data items of a dynamic branch.
pub type BranchSelector = Arc<dyn Fn(&ExecutionContext) -> Vec<SafeValue> + Send + Sync>;

/// Factory instantiating a sub-step for one source datum.
pub type SubStepFactory = Arc<dyn Fn(&SafeValue, usize) -> SubStep + Send + Sync>;

/// Factory computing a triggered child flow's initial data.
pub type InitialDataFactory =
    Arc<dyn Fn(&ExecutionContext) -> HashMap<String, SafeValue> + Send + Sync>;

/// Payload filter attached to an event resume trigger.
pub type EventFilter = Arc<dyn Fn(&serde_json::Value) -> bool + Send + Sync>;

/// Boxed boolean future used by polled resume predicates.
pub type BoolFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Async predicate re-evaluated on a schedule while a flow is paused.
pub type ResumePredicate = Arc<dyn for<'a> Fn(&'a FlowState) -> BoolFuture<'a> + Send + Sync>;

/// Outcome of a step's pause predicate.
#[derive(Debug, Clone)]
pub enum PauseDecision {
    Continue,
    Pause {
        reason: String,
        message: String,
        data: HashMap<String, SafeValue>,
    },
}

impl PauseDecision {
    pub fn pause(reason: impl Into<String>, message: impl Into<String>) -> Self {
        PauseDecision::Pause {
            reason: reason.into(),
            message: message.into(),
            data: HashMap::new(),
        }
    }
}

/// Named event that resumes a paused flow, with an optional payload filter.
#[derive(Clone)]
pub struct EventTrigger {
    pub name: String,
    pub filter: Option<EventFilter>,
}

/// Polled resume predicate with its schedule and retry budget.
#[derive(Clone)]
pub struct PolledPredicate {
    pub check: ResumePredicate,
    pub check_interval: Duration,
    pub max_retries: u32,
}

/// What causes a paused step to resume: named events, manual action with a
/// role allow-list, or a polled predicate. Triggers combine; any firing
/// trigger resumes the flow.
#[derive(Clone, Default)]
pub struct ResumeConfig {
    pub events: Vec<EventTrigger>,
    pub manual_roles: Option<Vec<String>>,
    pub predicate: Option<PolledPredicate>,
}

impl ResumeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event(mut self, name: impl Into<String>) -> Self {
        self.events.push(EventTrigger {
            name: name.into(),
            filter: None,
        });
        self
    }

    pub fn on_event_filtered<F>(mut self, name: impl Into<String>, filter: F) -> Self
    where
        F: Fn(&serde_json::Value) -> bool + Send + Sync + 'static,
    {
        self.events.push(EventTrigger {
            name: name.into(),
            filter: Some(Arc::new(filter)),
        });
        self
    }

    /// Allow manual resume by actors holding any of the given roles.
    pub fn manual(mut self, roles: &[&str]) -> Self {
        self.manual_roles = Some(roles.iter().map(|r| r.to_string()).collect());
        self
    }

    /// Re-evaluate `check` every `interval`; after `max_retries` negative
    /// evaluations the flow fails with a distinguished error.
    pub fn on_condition<F>(mut self, check: F, interval: Duration, max_retries: u32) -> Self
    where
        F: for<'a> Fn(&'a FlowState) -> BoolFuture<'a> + Send + Sync + 'static,
    {
        self.predicate = Some(PolledPredicate {
            check: Arc::new(check),
            check_interval: interval,
            max_retries,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.manual_roles.is_none() && self.predicate.is_none()
    }
}

/// Execution strategy for dynamic branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchStrategy {
    Sequential,
    Parallel,
}

/// A condition-guarded sub-graph inside a static branch set. Exactly the
/// first matching branch (or the explicit default) runs.
#[derive(Clone)]
pub struct StaticBranch {
    pub name: String,
    pub condition: Option<Predicate>,
    pub steps: Vec<StepDefinition>,
}

impl StaticBranch {
    pub fn when<F>(name: impl Into<String>, condition: F, steps: Vec<StepDefinition>) -> Self
    where
        F: Fn(&ExecutionContext) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            condition: Some(Arc::new(condition)),
            steps,
        }
    }

    /// The fallback branch taken when no condition matches.
    pub fn fallback(name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            name: name.into(),
            condition: None,
            steps,
        }
    }
}

/// Dynamic fan-out: the selector produces source items from live data, the
/// factory instantiates a sub-step per item.
#[derive(Clone)]
pub struct DynamicBranches {
    pub selector: BranchSelector,
    pub factory: SubStepFactory,
    pub strategy: BranchStrategy,
}

/// Branch specification attached to a step.
#[derive(Clone)]
pub enum BranchSpec {
    Static(Vec<StaticBranch>),
    Dynamic(DynamicBranches),
}

/// A step instantiated inside a branch, owned by its parent step.
#[derive(Clone)]
pub struct SubStep {
    pub definition: StepDefinition,
    pub priority: i32,
    pub source: Option<SafeValue>,
    pub index: usize,
    pub resource_group: Option<String>,
}

impl SubStep {
    pub fn new(definition: StepDefinition) -> Self {
        Self {
            definition,
            priority: 0,
            source: None,
            index: 0,
            resource_group: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn in_resource_group(mut self, group: impl Into<String>) -> Self {
        self.resource_group = Some(group.into());
        self
    }
}

/// Data dependency declared with [`StepBuilder::requires_data`]: the key
/// must be present and decode as the declared type before the body runs.
#[derive(Clone)]
pub struct DataDependency {
    pub key: String,
    pub type_name: &'static str,
    pub check: DataCheck,
}

/// Jump taken after the step completes, bounded to avoid infinite loops.
#[derive(Debug, Clone)]
pub struct JumpSpec {
    pub target: String,
    pub max_jumps: u32,
}

/// Child flow enqueued on step completion.
#[derive(Clone)]
pub struct ChildTrigger {
    pub kind: String,
    pub initial_data: Option<InitialDataFactory>,
}

/// A named unit of work inside a flow. Built through [`StepBuilder`];
/// never constructed directly by hosts.
#[derive(Clone)]
pub struct StepDefinition {
    pub name: String,
    pub after: Vec<String>,
    pub data_deps: Vec<DataDependency>,
    pub condition: Option<Predicate>,
    pub body: Option<StepBody>,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
    pub critical: bool,
    pub allow_failure: bool,
    pub idempotent: bool,
    pub idempotency_key: Option<KeyFactory>,
    pub pause: Option<PausePredicate>,
    pub resume: Option<ResumeConfig>,
    pub branches: Option<BranchSpec>,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub jump: Option<JumpSpec>,
    pub triggers: Vec<ChildTrigger>,
}

impl StepDefinition {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            after: Vec::new(),
            data_deps: Vec::new(),
            condition: None,
            body: None,
            retry: RetryPolicy::default(),
            timeout: None,
            critical: false,
            allow_failure: false,
            idempotent: false,
            idempotency_key: None,
            pause: None,
            resume: None,
            branches: None,
            middleware: Vec::new(),
            jump: None,
            triggers: Vec::new(),
        }
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("after", &self.after)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("critical", &self.critical)
            .field("allow_failure", &self.allow_failure)
            .field("idempotent", &self.idempotent)
            .field("jump", &self.jump)
            .finish_non_exhaustive()
    }
}

/// The recipe for one flow kind: an ordered step graph plus flow-level
/// middleware wrapping every step.
#[derive(Clone, Default)]
pub struct FlowDefinition {
    pub kind: String,
    pub steps: Vec<StepDefinition>,
    pub middleware: Vec<Arc<dyn Middleware>>,
}

impl FlowDefinition {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            steps: Vec::new(),
            middleware: Vec::new(),
        }
    }

    /// Begin declaring a step. Call [`StepBuilder::build`] to attach it.
    pub fn step(self, name: &str) -> StepBuilder {
        StepBuilder {
            flow: self,
            step: StepDefinition::new(name),
        }
    }

    /// Register flow-level middleware, applied to every step in
    /// registration order, outside step-level middleware.
    pub fn with_middleware(mut self, mw: Arc<dyn Middleware>) -> Self {
        self.middleware.push(mw);
        self
    }

    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name.clone()).collect()
    }

    /// Structural validation: unique step names, dependencies that name
    /// earlier declared steps, jump targets that exist.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(format!("duplicate step name '{}'", step.name));
            }
        }

        for (idx, step) in self.steps.iter().enumerate() {
            for dep in &step.after {
                match self.step_index(dep) {
                    None => {
                        return Err(format!(
                            "step '{}' depends on '{}', which does not exist",
                            step.name, dep
                        ));
                    }
                    Some(dep_idx) if dep_idx >= idx => {
                        return Err(format!(
                            "step '{}' depends on '{}', which is declared after it",
                            step.name, dep
                        ));
                    }
                    Some(_) => {}
                }
            }

            if let Some(ref jump) = step.jump
                && self.step_index(&jump.target).is_none()
            {
                return Err(format!(
                    "step '{}' jumps to '{}', which does not exist",
                    step.name, jump.target
                ));
            }

            if step.pause.is_some() && step.resume.as_ref().is_some_and(|r| r.is_empty()) {
                return Err(format!(
                    "step '{}' declares an empty resume config",
                    step.name
                ));
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for FlowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowDefinition")
            .field("kind", &self.kind)
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

/// Fluent builder for a single step. Consumes the flow and returns it on
/// [`build`](StepBuilder::build), so declarations chain naturally.
pub struct StepBuilder {
    flow: FlowDefinition,
    step: StepDefinition,
}

impl StepBuilder {
    /// Begin a standalone step, detached from any flow. Used by branch
    /// factories to assemble sub-steps; finish with
    /// [`into_step`](StepBuilder::into_step).
    pub fn detached(name: &str) -> Self {
        Self {
            flow: FlowDefinition::default(),
            step: StepDefinition::new(name),
        }
    }

    /// Finish a detached step without attaching it to a flow.
    pub fn into_step(self) -> StepDefinition {
        self.step
    }

    /// Declare execution-order dependencies on earlier steps.
    pub fn after(mut self, predecessors: &[&str]) -> Self {
        self.step
            .after
            .extend(predecessors.iter().map(|p| p.to_string()));
        self
    }

    /// Require `key` to be present and decodable as `T` before the body
    /// runs; a miss is a step failure subject to the step's policy.
    pub fn requires_data<T: DeserializeOwned + 'static>(mut self, key: &str) -> Self {
        self.step.data_deps.push(DataDependency {
            key: key.to_string(),
            type_name: std::any::type_name::<T>(),
            check: Arc::new(|v| value::decode::<T>(v).is_ok()),
        });
        self
    }

    /// Conditional execution: when the predicate is false the step is
    /// marked Skipped.
    pub fn only_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ExecutionContext) -> bool + Send + Sync + 'static,
    {
        self.step.condition = Some(Arc::new(predicate));
        self
    }

    /// The step body.
    pub fn execute<F>(mut self, body: F) -> Self
    where
        F: for<'a> Fn(&'a mut ExecutionContext) -> StepFuture<'a> + Send + Sync + 'static,
    {
        self.step.body = Some(Arc::new(body));
        self
    }

    pub fn with_retries(mut self, max_retries: u32, delay: Duration) -> Self {
        self.step.retry = RetryPolicy { max_retries, delay };
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.step.timeout = Some(timeout);
        self
    }

    /// Failure of this step fails the whole flow.
    pub fn critical(mut self) -> Self {
        self.step.critical = true;
        self
    }

    /// Failure is recorded on the step but the flow continues.
    pub fn allow_failure(mut self) -> Self {
        self.step.allow_failure = true;
        self
    }

    /// Persist the step's result under a stable key; re-executions with
    /// the same key return the persisted result without running the body.
    pub fn with_idempotency(mut self) -> Self {
        self.step.idempotent = true;
        self
    }

    pub fn with_idempotency_key<F>(mut self, factory: F) -> Self
    where
        F: Fn(&ExecutionContext) -> String + Send + Sync + 'static,
    {
        self.step.idempotent = true;
        self.step.idempotency_key = Some(Arc::new(factory));
        self
    }

    /// Evaluated right before the first body attempt; returning
    /// [`PauseDecision::Pause`] persists a pause snapshot and parks the
    /// flow. Retries do not re-evaluate the predicate.
    pub fn can_pause<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ExecutionContext) -> PauseDecision + Send + Sync + 'static,
    {
        self.step.pause = Some(Arc::new(predicate));
        self
    }

    pub fn resume_on(mut self, config: ResumeConfig) -> Self {
        self.step.resume = Some(config);
        self
    }

    pub fn with_static_branches(mut self, branches: Vec<StaticBranch>) -> Self {
        self.step.branches = Some(BranchSpec::Static(branches));
        self
    }

    pub fn with_dynamic_branches<S, F>(
        mut self,
        selector: S,
        factory: F,
        strategy: BranchStrategy,
    ) -> Self
    where
        S: Fn(&ExecutionContext) -> Vec<SafeValue> + Send + Sync + 'static,
        F: Fn(&SafeValue, usize) -> SubStep + Send + Sync + 'static,
    {
        self.step.branches = Some(BranchSpec::Dynamic(DynamicBranches {
            selector: Arc::new(selector),
            factory: Arc::new(factory),
            strategy,
        }));
        self
    }

    /// After the step completes, re-enter the graph at `target`, at most
    /// `max_jumps` times across the flow's lifetime.
    pub fn jump_to(mut self, target: &str, max_jumps: u32) -> Self {
        self.step.jump = Some(JumpSpec {
            target: target.to_string(),
            max_jumps,
        });
        self
    }

    /// On step completion, enqueue a new root-level flow of `kind`.
    pub fn triggers(mut self, kind: &str) -> Self {
        self.step.triggers.push(ChildTrigger {
            kind: kind.to_string(),
            initial_data: None,
        });
        self
    }

    pub fn triggers_with<F>(mut self, kind: &str, initial_data: F) -> Self
    where
        F: Fn(&ExecutionContext) -> HashMap<String, SafeValue> + Send + Sync + 'static,
    {
        self.step.triggers.push(ChildTrigger {
            kind: kind.to_string(),
            initial_data: Some(Arc::new(initial_data)),
        });
        self
    }

    /// Step-level middleware, applied inside flow-level middleware.
    pub fn with_middleware(mut self, mw: Arc<dyn Middleware>) -> Self {
        self.step.middleware.push(mw);
        self
    }

    /// Attach the step to the flow's step list in declaration order.
    pub fn build(mut self) -> FlowDefinition {
        self.flow.steps.push(self.step);
        self.flow
    }
}

