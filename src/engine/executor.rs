//! The scheduler/executor: owns the step loop and the in-process host API.
//!
//! Model: cooperative, single-writer-per-flow. A flow is owned by at most
//! one executor task at a time; the optimistic version on every durable
//! write enforces the invariant across processes. Within a flow, steps run
//! sequentially in declaration order; dynamic-parallel branches fan out
//! bounded by a configurable cap; different flows execute independently in
//! parallel under a semaphore.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::TideflowConfig;
use crate::engine::context::{ExecutionContext, NoServices, ServiceProvider};
use crate::engine::definition::{
    BranchSpec, BranchStrategy, FlowDefinition, JumpSpec, PauseDecision, ResumeConfig,
    StepDefinition, SubStep,
};
use crate::engine::error::EngineError;
use crate::engine::middleware::{self, Middleware, StepBody};
use crate::engine::registry::FlowKindRegistry;
use crate::engine::types::{
    FlowEvent, FlowEventType, FlowState, FlowStatistics, FlowStatus, FlowSummary, HealthReport,
    PagedResult, PauseState, QueryCriteria, ResumeConditionRecord, StepResult, StepStatus,
    Timeline, TimelineEntry,
};
use crate::engine::value::SafeValue;
use crate::storage::{StateStore, StoreError};

/// Actor attempting a manual resume; checked against the paused step's
/// role allow-list.
#[derive(Debug, Clone)]
pub struct ResumeActor {
    pub id: String,
    pub roles: Vec<String>,
}

impl ResumeActor {
    pub fn new(id: impl Into<String>, roles: &[&str]) -> Self {
        Self {
            id: id.into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }
}

/// How a run entered the executor.
enum RunMode {
    Fresh,
    /// Re-entry after resume; the pause predicate of the named step is not
    /// re-evaluated so the flow cannot re-pause on the same condition.
    Resume { skip_pause_for: String },
    Recover,
}

/// Live-run bookkeeping for cooperative cancel/pause.
#[derive(Clone)]
struct RunHandle {
    cancel: CancellationToken,
    pause_request: Arc<Mutex<Option<(String, String)>>>,
}

impl RunHandle {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            pause_request: Arc::new(Mutex::new(None)),
        }
    }
}

/// Outcome of one sub-step inside a branch.
struct SubOutcome {
    name: String,
    result: StepResult,
    allow_failure: bool,
    jump: Option<JumpSpec>,
}

/// How the step loop should proceed after a step settled.
enum StepExit {
    Advance,
    Jump(usize),
    FlowSettled,
}

fn idempotency_digest(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// The core workflow execution engine.
pub struct FlowEngine {
    registry: Arc<FlowKindRegistry>,
    store: Arc<dyn StateStore>,
    services: Arc<dyn ServiceProvider>,
    flow_limit: Arc<Semaphore>,
    branch_fan_out: usize,
    recent_failure_window: Duration,
    max_recent_failures: u64,
    live: Mutex<HashMap<Uuid, RunHandle>>,
    self_ref: Weak<FlowEngine>,
}

impl FlowEngine {
    pub fn new(registry: Arc<FlowKindRegistry>, store: Arc<dyn StateStore>) -> Arc<Self> {
        Self::with_config(registry, store, &TideflowConfig::default())
    }

    pub fn with_config(
        registry: Arc<FlowKindRegistry>,
        store: Arc<dyn StateStore>,
        config: &TideflowConfig,
    ) -> Arc<Self> {
        Self::with_services(registry, store, Arc::new(NoServices), config)
    }

    /// Full constructor: install the host's service provider, consumed by
    /// step bodies through the execution context.
    pub fn with_services(
        registry: Arc<FlowKindRegistry>,
        store: Arc<dyn StateStore>,
        services: Arc<dyn ServiceProvider>,
        config: &TideflowConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            registry,
            store,
            services,
            flow_limit: Arc::new(Semaphore::new(config.max_concurrent_flows())),
            branch_fan_out: config.branch_fan_out(),
            recent_failure_window: config.recent_failure_window(),
            max_recent_failures: config.max_recent_failures(),
            live: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }

    pub fn registry(&self) -> Arc<FlowKindRegistry> {
        self.registry.clone()
    }

    /// True when this process currently owns a live executor run for the
    /// flow. Used by recovery to avoid re-adopting its own flows.
    pub(crate) fn is_live(&self, flow_id: Uuid) -> bool {
        self.live.lock().unwrap().contains_key(&flow_id)
    }

    // --- Host API ---

    /// Create a flow, persist the Ready snapshot, and run it in the
    /// background. Returns the flow id immediately.
    pub async fn submit(
        &self,
        flow_kind: &str,
        principal_id: &str,
        correlation_id: Option<String>,
        initial_data: HashMap<String, SafeValue>,
    ) -> Result<Uuid, EngineError> {
        let definition = self.registry.definition(flow_kind)?;
        let mut state = FlowState::new(
            flow_kind,
            principal_id,
            correlation_id,
            initial_data,
            &definition.step_names(),
        );
        let flow_id = state.flow_id;
        state.version = self.store.save(&state).await?;
        self.spawn_run(state, definition);

        Ok(flow_id)
    }

    /// Hand a freshly persisted flow to a background executor task. Kept
    /// synchronous so spawning from inside a run does not recurse the
    /// executor's future types.
    fn spawn_run(&self, state: FlowState, definition: FlowDefinition) {
        if let Some(engine) = self.self_ref.upgrade() {
            tokio::spawn(async move {
                engine.run_flow(state, definition, RunMode::Fresh).await;
            });
        }
    }

    /// Create a flow and drive it inline until it settles (terminal or
    /// paused). Returns the settled snapshot. Convenient for tests and
    /// hosts that want backpressure.
    pub async fn execute(
        &self,
        flow_kind: &str,
        principal_id: &str,
        correlation_id: Option<String>,
        initial_data: HashMap<String, SafeValue>,
    ) -> Result<FlowState, EngineError> {
        let definition = self.registry.definition(flow_kind)?;
        let mut state = FlowState::new(
            flow_kind,
            principal_id,
            correlation_id,
            initial_data,
            &definition.step_names(),
        );
        let flow_id = state.flow_id;
        state.version = self.store.save(&state).await?;

        self.run_flow(state, definition, RunMode::Fresh).await;
        Ok(self.store.load(flow_id).await?)
    }

    pub async fn status(&self, flow_id: Uuid) -> Result<FlowStatus, EngineError> {
        Ok(self.store.load(flow_id).await?.status)
    }

    pub async fn flow(&self, flow_id: Uuid) -> Result<FlowState, EngineError> {
        Ok(self.store.load(flow_id).await?)
    }

    /// Request a pause. A live flow pauses cooperatively at the next
    /// inter-step point; a stalled Running flow is paused directly in the
    /// store. Returns false when the flow cannot pause.
    pub async fn pause(
        &self,
        flow_id: Uuid,
        reason: &str,
        message: &str,
    ) -> Result<bool, EngineError> {
        let handle = self.live.lock().unwrap().get(&flow_id).cloned();
        if let Some(handle) = handle {
            *handle.pause_request.lock().unwrap() =
                Some((reason.to_string(), message.to_string()));
            return Ok(true);
        }

        let mut state = self.store.load(flow_id).await?;
        if state.status != FlowStatus::Running {
            return Ok(false);
        }
        let now = Utc::now();
        state.status = FlowStatus::Paused;
        state.paused_at = Some(now);
        state.pause = Some(PauseState {
            reason: reason.to_string(),
            message: message.to_string(),
            data: HashMap::new(),
            paused_at: now,
        });
        state.push_event(FlowEventType::FlowPaused, format!("Paused: {}", reason));
        self.store.save(&state).await?;
        Ok(true)
    }

    /// Manually resume a paused flow. When the paused step declares a
    /// manual role allow-list, the actor must hold one of the roles.
    pub async fn resume(
        &self,
        flow_id: Uuid,
        resume_reason: &str,
        actor: &ResumeActor,
        message: &str,
    ) -> Result<bool, EngineError> {
        let state = self.store.load(flow_id).await?;
        if state.status != FlowStatus::Paused {
            return Ok(false);
        }

        let definition = self.registry.definition(&state.flow_kind)?;
        if let Some(step) = definition
            .steps
            .iter()
            .find(|s| s.name == state.current_step_name)
            && let Some(roles) = step.resume.as_ref().and_then(|r| r.manual_roles.as_ref())
            && !actor.roles.iter().any(|r| roles.contains(r))
        {
            warn!(
                flow_id = %flow_id,
                actor = %actor.id,
                "Manual resume rejected — actor holds none of the allowed roles"
            );
            return Ok(false);
        }

        let description = format!("Resumed by {} ({}): {}", actor.id, resume_reason, message);
        self.resume_internal(state, definition, description).await
    }

    /// Cancel a flow. Live runs acknowledge at the next checkpoint; parked
    /// flows transition immediately. Returns false for terminal flows.
    pub async fn cancel(&self, flow_id: Uuid, reason: &str) -> Result<bool, EngineError> {
        let handle = self.live.lock().unwrap().get(&flow_id).cloned();
        if let Some(handle) = handle {
            info!(flow_id = %flow_id, reason = %reason, "Cancellation requested");
            handle.cancel.cancel();
            return Ok(true);
        }

        let mut state = self.store.load(flow_id).await?;
        if state.status.is_terminal() {
            return Ok(false);
        }
        state.status = FlowStatus::Cancelled;
        state.completed_at = Some(Utc::now());
        state.pause = None;
        state.push_event(
            FlowEventType::FlowCancelled,
            format!("Cancelled: {}", reason),
        );
        self.store.save(&state).await?;
        self.store.delete_resume_condition(flow_id).await?;
        Ok(true)
    }

    pub async fn query(
        &self,
        criteria: &QueryCriteria,
        page: usize,
        page_size: usize,
    ) -> Result<PagedResult<FlowSummary>, EngineError> {
        Ok(self.store.query(criteria, page, page_size).await?)
    }

    pub async fn timeline(&self, flow_id: Uuid) -> Result<Timeline, EngineError> {
        let state = self.store.load(flow_id).await?;
        Ok(Timeline {
            flow_id: state.flow_id,
            flow_kind: state.flow_kind.clone(),
            status: state.status,
            entries: state
                .events
                .iter()
                .map(|e| TimelineEntry {
                    at: e.at,
                    event_type: e.event_type,
                    description: e.description.clone(),
                })
                .collect(),
        })
    }

    /// Publish a named event. Every paused flow whose resume config
    /// matches (name plus optional payload filter) is resumed inline.
    /// Returns the number of flows resumed.
    pub async fn publish_event(
        &self,
        name: &str,
        payload: &serde_json::Value,
    ) -> Result<usize, EngineError> {
        let paused = self.store.load_by_statuses(&[FlowStatus::Paused]).await?;
        let mut resumed = 0;

        for state in paused {
            let Ok(definition) = self.registry.definition(&state.flow_kind) else {
                warn!(
                    flow_id = %state.flow_id,
                    flow_kind = %state.flow_kind,
                    "Paused flow references an unregistered flow kind"
                );
                continue;
            };

            let matches = definition
                .steps
                .iter()
                .find(|s| s.name == state.current_step_name)
                .and_then(|s| s.resume.as_ref())
                .map(|resume| {
                    resume.events.iter().any(|trigger| {
                        trigger.name == name
                            && trigger.filter.as_ref().is_none_or(|f| f(payload))
                    })
                })
                .unwrap_or(false);

            if matches {
                let description = format!("Resumed by event '{}'", name);
                if self.resume_internal(state, definition, description).await? {
                    resumed += 1;
                }
            }
        }

        Ok(resumed)
    }

    pub async fn health(&self) -> Result<HealthReport, EngineError> {
        let running = self.store.load_by_statuses(&[FlowStatus::Running]).await?;
        let paused = self.store.load_by_statuses(&[FlowStatus::Paused]).await?;

        let window_start =
            Utc::now() - chrono::Duration::from_std(self.recent_failure_window).unwrap_or_else(|_| chrono::Duration::zero());
        let failures = self
            .store
            .query(
                &QueryCriteria {
                    statuses: Some(vec![FlowStatus::Failed]),
                    created_after: Some(window_start),
                    ..Default::default()
                },
                0,
                1,
            )
            .await?;

        Ok(HealthReport {
            running: running.len() as u64,
            paused: paused.len() as u64,
            recent_failures: failures.total,
            healthy: failures.total <= self.max_recent_failures,
            checked_at: Utc::now(),
        })
    }

    /// Aggregate statistics over flows created within `window`.
    pub async fn statistics(&self, window: Duration) -> Result<FlowStatistics, EngineError> {
        let criteria = QueryCriteria {
            created_after: Some(
                Utc::now() - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero()),
            ),
            ..Default::default()
        };

        let mut stats = FlowStatistics::default();
        let mut execution_ms: Vec<f64> = Vec::new();
        let mut page = 0;
        const PAGE_SIZE: usize = 200;

        loop {
            let result = self.store.query(&criteria, page, PAGE_SIZE).await?;
            for summary in &result.items {
                stats.total += 1;
                *stats.by_kind.entry(summary.flow_kind.clone()).or_insert(0) += 1;
                match summary.status {
                    FlowStatus::Completed => {
                        stats.completed += 1;
                        if let Some(done) = summary.completed_at {
                            execution_ms
                                .push((done - summary.created_at).num_milliseconds() as f64);
                        }
                    }
                    FlowStatus::Failed => {
                        stats.failed += 1;
                        let reason = summary
                            .last_error
                            .clone()
                            .unwrap_or_else(|| "unknown".to_string());
                        *stats.failures_by_reason.entry(reason).or_insert(0) += 1;
                    }
                    FlowStatus::Running => stats.running += 1,
                    FlowStatus::Paused => stats.paused += 1,
                    FlowStatus::Cancelled => stats.cancelled += 1,
                    FlowStatus::Ready => {}
                }
            }
            if result.items.len() < PAGE_SIZE {
                break;
            }
            page += 1;
        }

        let finished = stats.completed + stats.failed;
        stats.success_rate = if finished == 0 {
            0.0
        } else {
            stats.completed as f64 / finished as f64
        };
        stats.avg_execution_ms = if execution_ms.is_empty() {
            None
        } else {
            Some(execution_ms.iter().sum::<f64>() / execution_ms.len() as f64)
        };

        Ok(stats)
    }

    // --- Resume plumbing (shared by manual, event, predicate, recovery) ---

    /// Optimistically transition Paused → Running and re-enter the
    /// executor at the paused step.
    pub(crate) async fn resume_internal(
        &self,
        mut state: FlowState,
        definition: FlowDefinition,
        description: String,
    ) -> Result<bool, EngineError> {
        if state.status != FlowStatus::Paused {
            return Ok(false);
        }

        let skip_pause_for = state.current_step_name.clone();
        state.status = FlowStatus::Running;
        state.pause = None;
        state.push_event(FlowEventType::FlowResumed, description);

        match self.store.save(&state).await {
            Ok(version) => state.version = version,
            Err(StoreError::ConcurrencyConflict { .. }) => {
                // Another writer got there first (e.g. a concurrent event).
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        self.store.delete_resume_condition(state.flow_id).await?;

        info!(flow_id = %state.flow_id, step = %skip_pause_for, "Flow resumed");
        self.run_flow(state, definition, RunMode::Resume { skip_pause_for })
            .await;
        Ok(true)
    }

    /// Re-adopt a stalled Running flow from its last durable snapshot.
    pub(crate) async fn run_recovered(
        &self,
        mut state: FlowState,
        definition: FlowDefinition,
    ) -> Result<(), EngineError> {
        state.push_event(
            FlowEventType::FlowRecovered,
            format!("Recovered at step '{}'", state.current_step_name),
        );
        state.version = self.store.save(&state).await?;
        self.run_flow(state, definition, RunMode::Recover).await;
        Ok(())
    }

    // --- The main loop ---

    async fn run_flow(&self, state: FlowState, definition: FlowDefinition, mode: RunMode) {
        let flow_id = state.flow_id;

        let handle = RunHandle::new();
        {
            let mut live = self.live.lock().unwrap();
            if live.contains_key(&flow_id) {
                warn!(flow_id = %flow_id, "Flow already owned by a live executor run");
                return;
            }
            live.insert(flow_id, handle.clone());
        }

        let _permit = self.flow_limit.clone().acquire_owned().await.ok();
        self.drive(state, &definition, mode, &handle).await;

        self.live.lock().unwrap().remove(&flow_id);
    }

    async fn drive(
        &self,
        state: FlowState,
        definition: &FlowDefinition,
        mode: RunMode,
        handle: &RunHandle,
    ) {
        let flow_id = state.flow_id;
        let mut ctx = ExecutionContext::new(state, self.services.clone(), handle.cancel.clone());
        let mut skip_pause_for = match mode {
            RunMode::Resume { skip_pause_for } => Some(skip_pause_for),
            _ => None,
        };

        if ctx.state.status == FlowStatus::Ready {
            ctx.state.status = FlowStatus::Running;
            ctx.state.started_at = Some(Utc::now());
            ctx.state
                .push_event(FlowEventType::FlowStarted, "Flow started");
            if self.persist(&mut ctx).await.is_err() {
                return;
            }
            info!(flow_id = %flow_id, flow_kind = %ctx.state.flow_kind, "Starting flow execution");
        }

        let mut cursor = ctx.state.current_step_index;

        while cursor < definition.steps.len() {
            // Inter-step checkpoint: acknowledge cancel and pause requests.
            if handle.cancel.is_cancelled() {
                self.finish_cancelled(&mut ctx, "Cancellation acknowledged")
                    .await;
                return;
            }
            let pause_request = handle.pause_request.lock().unwrap().take();
            if let Some((reason, message)) = pause_request {
                self.park_paused(&mut ctx, reason, message, HashMap::new(), None)
                    .await;
                return;
            }

            let step_def = &definition.steps[cursor];
            ctx.state.current_step_index = cursor;
            ctx.state.current_step_name = step_def.name.clone();
            ctx.current_step = step_def.name.clone();

            let step_status = ctx
                .state
                .step(&step_def.name)
                .map(|s| s.status)
                .unwrap_or(StepStatus::Pending);
            if matches!(step_status, StepStatus::Completed | StepStatus::Skipped) {
                cursor += 1;
                continue;
            }

            let skip_pause = skip_pause_for.as_deref() == Some(step_def.name.as_str());
            if skip_pause {
                skip_pause_for = None;
            }

            match self.run_step(&mut ctx, definition, cursor, skip_pause).await {
                Some(StepExit::Advance) => cursor += 1,
                Some(StepExit::Jump(target)) => cursor = target,
                Some(StepExit::FlowSettled) | None => return,
            }
        }

        ctx.state.status = FlowStatus::Completed;
        ctx.state.completed_at = Some(Utc::now());
        ctx.state
            .push_event(FlowEventType::FlowCompleted, "Flow completed");
        let _ = self.persist(&mut ctx).await;
        info!(flow_id = %flow_id, "Flow completed");
    }

    /// Run one step through the full pipeline. Returns None when a persist
    /// conflict aborted the run.
    async fn run_step(
        &self,
        ctx: &mut ExecutionContext,
        definition: &FlowDefinition,
        cursor: usize,
        skip_pause: bool,
    ) -> Option<StepExit> {
        let step_def = &definition.steps[cursor];
        let step_name = step_def.name.clone();

        // 1. Dependency gate.
        for dep in &step_def.after {
            let dep_status = ctx.state.step(dep).map(|s| s.status);
            let dep_allows_failure = definition
                .steps
                .iter()
                .find(|s| &s.name == dep)
                .map(|s| s.allow_failure)
                .unwrap_or(false);

            match dep_status {
                Some(StepStatus::Completed) | Some(StepStatus::Skipped) => {}
                Some(StepStatus::Failed) if dep_allows_failure => {}
                _ => {
                    self.fail_flow(
                        ctx,
                        format!(
                            "Step '{}' dependency '{}' was not satisfied",
                            step_name, dep
                        ),
                    )
                    .await;
                    return Some(StepExit::FlowSettled);
                }
            }
        }

        // 2. Condition.
        if let Some(ref condition) = step_def.condition
            && !condition(ctx)
        {
            if let Some(s) = ctx.state.step_mut(&step_name) {
                s.status = StepStatus::Skipped;
                s.completed_at = Some(Utc::now());
            }
            ctx.state.push_event(
                FlowEventType::StepSkipped,
                format!("Step '{}' skipped — condition not met", step_name),
            );
            if self.persist(ctx).await.is_err() {
                return None;
            }
            return Some(StepExit::Advance);
        }

        // 3. Data dependencies. Data only changes between steps, so a miss
        // is deterministic within the run and bypasses the retry budget.
        if let Some(missing) = self.check_data_deps(ctx, step_def) {
            return self.settle_step_failure(ctx, definition, cursor, missing).await;
        }

        // 4. Idempotency probe.
        if step_def.idempotent {
            let raw_key = match step_def.idempotency_key {
                Some(ref factory) => factory(ctx),
                None => format!("{}:{}", ctx.state.flow_id, step_name),
            };
            let digest = idempotency_digest(&raw_key);

            let recorded = ctx.state.step(&step_name).and_then(|s| {
                (s.idempotency_key.as_deref() == Some(digest.as_str()))
                    .then(|| s.result.clone())
                    .flatten()
            });

            if let Some(result) = recorded {
                info!(
                    flow_id = %ctx.state.flow_id,
                    step = %step_name,
                    "Reusing idempotent step result"
                );
                if let StepResult::Success { ref data, .. } = result {
                    for (k, v) in data {
                        ctx.state.data.insert(k.clone(), v.clone());
                    }
                }
                if let Some(s) = ctx.state.step_mut(&step_name) {
                    s.status = StepStatus::Completed;
                    s.completed_at = Some(Utc::now());
                }
                ctx.state.push_event(
                    FlowEventType::StepCompleted,
                    format!("Step '{}' completed (idempotent replay)", step_name),
                );
                if self.persist(ctx).await.is_err() {
                    return None;
                }
                return Some(StepExit::Advance);
            }

            if let Some(s) = ctx.state.step_mut(&step_name) {
                s.idempotency_key = Some(digest);
            }
        }

        // 5. Pause evaluation — only before the first body attempt, never
        // on resume re-entry or retries.
        if !skip_pause
            && let Some(ref pause) = step_def.pause
            && let PauseDecision::Pause {
                reason,
                message,
                data,
            } = pause(ctx)
        {
            self.park_paused(ctx, reason, message, data, step_def.resume.as_ref())
                .await;
            return Some(StepExit::FlowSettled);
        }

        // 6. Body execution.
        {
            let now = Utc::now();
            if let Some(s) = ctx.state.step_mut(&step_name) {
                s.status = StepStatus::Running;
                s.started_at = Some(now);
            }
            ctx.state.push_event(
                FlowEventType::StepStarted,
                format!("Step '{}' started", step_name),
            );
            if self.persist(ctx).await.is_err() {
                return None;
            }
        }

        let (result, attempts) = self
            .run_with_retries(ctx, step_def, &definition.middleware)
            .await;
        if let Some(s) = ctx.state.step_mut(&step_name) {
            s.attempts += attempts;
        }

        match result {
            StepResult::Success { .. } => {}
            StepResult::Cancelled { .. } => {
                if let Some(s) = ctx.state.step_mut(&step_name) {
                    s.status = StepStatus::Cancelled;
                    s.completed_at = Some(Utc::now());
                }
                self.finish_cancelled(ctx, format!("Step '{}' cancelled", step_name))
                    .await;
                return Some(StepExit::FlowSettled);
            }
            failure => {
                return self.settle_step_failure(ctx, definition, cursor, failure).await;
            }
        }

        // Merge produced data; the flow's single writer owns the map.
        if let StepResult::Success { ref data, .. } = result {
            for (k, v) in data {
                ctx.state.data.insert(k.clone(), v.clone());
            }
        }

        // 9. Branches.
        let mut branch_jump = None;
        if let Some(ref spec) = step_def.branches {
            match self.run_branches(ctx, definition, step_def, spec).await {
                Ok(jump) => branch_jump = jump,
                Err(branch_failure) => {
                    return self
                        .settle_step_failure(ctx, definition, cursor, branch_failure)
                        .await;
                }
            }
        }

        self.complete_step_and_exit(ctx, definition, cursor, result, branch_jump)
            .await
    }

    /// Record step completion, then triggers, then jump (in that order).
    async fn complete_step_and_exit(
        &self,
        ctx: &mut ExecutionContext,
        definition: &FlowDefinition,
        cursor: usize,
        result: StepResult,
        branch_jump: Option<JumpSpec>,
    ) -> Option<StepExit> {
        let step_def = &definition.steps[cursor];
        let step_name = step_def.name.clone();

        let now = Utc::now();
        if let Some(s) = ctx.state.step_mut(&step_name) {
            s.status = StepStatus::Completed;
            s.completed_at = Some(now);
            s.result = Some(result.clone());
        }
        ctx.state.push_event(
            FlowEventType::StepCompleted,
            format!("Step '{}' completed: {}", step_name, result.message()),
        );
        if self.persist(ctx).await.is_err() {
            return None;
        }

        // 10. Triggered child flows run independently, before any jump.
        for trigger in &step_def.triggers {
            let initial = trigger
                .initial_data
                .as_ref()
                .map(|f| f(ctx))
                .unwrap_or_default();
            let principal = ctx.state.principal_id.clone();
            let correlation = ctx.state.correlation_id.clone();

            match self
                .submit(&trigger.kind, &principal, correlation, initial)
                .await
            {
                Ok(child_id) => {
                    ctx.state.push_event(
                        FlowEventType::ChildFlowTriggered,
                        format!(
                            "Step '{}' triggered child flow '{}' ({})",
                            step_name, trigger.kind, child_id
                        ),
                    );
                    if self.persist(ctx).await.is_err() {
                        return None;
                    }
                }
                Err(e) => {
                    error!(
                        flow_id = %ctx.state.flow_id,
                        child_kind = %trigger.kind,
                        error = %e,
                        "Failed to trigger child flow"
                    );
                }
            }
        }

        // 11. Jump.
        let jump = branch_jump.as_ref().or(step_def.jump.as_ref());
        if let Some(jump) = jump {
            let jump = jump.clone();
            return self.take_jump(ctx, definition, cursor, &jump).await;
        }

        Some(StepExit::Advance)
    }

    /// Take a bounded jump if budget remains; otherwise advance.
    async fn take_jump(
        &self,
        ctx: &mut ExecutionContext,
        definition: &FlowDefinition,
        cursor: usize,
        jump: &JumpSpec,
    ) -> Option<StepExit> {
        let step_def = &definition.steps[cursor];
        let step_name = step_def.name.clone();

        let Some(target_idx) = definition.step_index(&jump.target) else {
            // A dangling target can only come from a branch sub-step's
            // jump; definition validation rejects it on top-level steps.
            let message = format!("Jump target '{}' does not exist in the flow", jump.target);
            let now = Utc::now();
            if let Some(s) = ctx.state.step_mut(&step_name) {
                s.status = StepStatus::Failed;
                s.completed_at = Some(now);
                s.error = Some(SafeValue::Str(message.clone()));
            }
            ctx.state.push_event(
                FlowEventType::StepFailed,
                format!("Step '{}' failed: {}", step_name, message),
            );
            if step_def.allow_failure && !step_def.critical {
                if self.persist(ctx).await.is_err() {
                    return None;
                }
                return Some(StepExit::Advance);
            }
            self.fail_flow(ctx, format!("Step '{}' failed: {}", step_name, message))
                .await;
            return Some(StepExit::FlowSettled);
        };

        let jumps_taken = ctx
            .state
            .step(&step_name)
            .map(|s| s.jumps_taken)
            .unwrap_or(0);
        if jumps_taken >= jump.max_jumps {
            return Some(StepExit::Advance);
        }

        if let Some(s) = ctx.state.step_mut(&step_name) {
            s.jumps_taken += 1;
        }
        ctx.state.push_event(
            FlowEventType::JumpTaken,
            format!("Step '{}' jumped to '{}'", step_name, jump.target),
        );

        // Re-arm the jumped-over range. Results and idempotency keys are
        // kept so idempotent steps replay instead of re-executing.
        for idx in target_idx..=cursor {
            let name = definition.steps[idx].name.clone();
            if let Some(s) = ctx.state.step_mut(&name) {
                s.status = StepStatus::Pending;
            }
        }

        if self.persist(ctx).await.is_err() {
            return None;
        }
        Some(StepExit::Jump(target_idx))
    }

    /// Steps 7–8: terminal failure handling with the jump catch.
    async fn settle_step_failure(
        &self,
        ctx: &mut ExecutionContext,
        definition: &FlowDefinition,
        cursor: usize,
        failure: StepResult,
    ) -> Option<StepExit> {
        let step_def = &definition.steps[cursor];
        let step_name = step_def.name.clone();
        let message = failure.message().to_string();

        let now = Utc::now();
        if let Some(s) = ctx.state.step_mut(&step_name) {
            s.status = StepStatus::Failed;
            s.completed_at = Some(now);
            s.error = Some(SafeValue::Str(message.clone()));
            s.result = Some(failure.clone());
        }
        ctx.state.push_event(
            FlowEventType::StepFailed,
            format!("Step '{}' failed: {}", step_name, message),
        );

        if step_def.critical {
            self.fail_flow(
                ctx,
                format!("Critical step '{}' failed: {}", step_name, message),
            )
            .await;
            return Some(StepExit::FlowSettled);
        }

        if step_def.allow_failure {
            warn!(
                flow_id = %ctx.state.flow_id,
                step = %step_name,
                "Step failed but the flow continues"
            );
            if self.persist(ctx).await.is_err() {
                return None;
            }
            return Some(StepExit::Advance);
        }

        // A declared jump catches the failure while budget remains.
        if let Some(ref jump) = step_def.jump {
            let jumps_taken = ctx
                .state
                .step(&step_name)
                .map(|s| s.jumps_taken)
                .unwrap_or(0);
            if jumps_taken < jump.max_jumps && definition.step_index(&jump.target).is_some() {
                let jump = jump.clone();
                return self.take_jump(ctx, definition, cursor, &jump).await;
            }
        }

        self.fail_flow(ctx, format!("Step '{}' failed: {}", step_name, message))
            .await;
        Some(StepExit::FlowSettled)
    }

    fn check_data_deps(
        &self,
        ctx: &ExecutionContext,
        step_def: &StepDefinition,
    ) -> Option<StepResult> {
        for dep in &step_def.data_deps {
            match ctx.state.data.get(&dep.key) {
                None => {
                    return Some(StepResult::failure(format!(
                        "Missing required data key '{}'",
                        dep.key
                    )));
                }
                Some(v) if !(dep.check)(v) => {
                    return Some(StepResult::failure(format!(
                        "Data key '{}' does not decode as {}",
                        dep.key, dep.type_name
                    )));
                }
                Some(_) => {}
            }
        }
        None
    }

    /// Run the body under middleware, timeout, and cancellation, with the
    /// step's retry budget. Returns the final result and attempt count.
    async fn run_with_retries(
        &self,
        ctx: &mut ExecutionContext,
        step_def: &StepDefinition,
        flow_middleware: &[Arc<dyn Middleware>],
    ) -> (StepResult, u32) {
        let max_attempts = step_def.retry.max_retries + 1;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if ctx.is_cancelled() {
                return (
                    StepResult::Cancelled {
                        message: "flow cancelled".to_string(),
                    },
                    attempt,
                );
            }

            let outcome = match self.run_body_once(ctx, step_def, flow_middleware).await {
                Ok(result) => result,
                Err(e) => {
                    StepResult::failure_with("step body raised an error", format!("{:#}", e))
                }
            };

            match outcome {
                StepResult::Success { .. } | StepResult::Cancelled { .. } => {
                    return (outcome, attempt);
                }
                _ => {
                    if attempt < max_attempts {
                        warn!(
                            flow_id = %ctx.state.flow_id,
                            step = %step_def.name,
                            attempt = attempt,
                            max = max_attempts,
                            "Step attempt failed — retrying after delay"
                        );
                        tokio::time::sleep(step_def.retry.delay).await;
                        continue;
                    }
                    return (outcome, attempt);
                }
            }
        }
    }

    /// One body attempt: flow middleware, then step middleware, then the
    /// body, bounded by the step timeout and the flow's cancel signal.
    async fn run_body_once(
        &self,
        ctx: &mut ExecutionContext,
        step_def: &StepDefinition,
        flow_middleware: &[Arc<dyn Middleware>],
    ) -> anyhow::Result<StepResult> {
        let mut chain: Vec<Arc<dyn Middleware>> =
            Vec::with_capacity(flow_middleware.len() + step_def.middleware.len());
        chain.extend(flow_middleware.iter().cloned());
        chain.extend(step_def.middleware.iter().cloned());

        let body: StepBody = step_def.body.clone().unwrap_or_else(|| {
            Arc::new(|_ctx: &mut ExecutionContext| {
                Box::pin(async { Ok(StepResult::success("no-op")) })
            })
        });

        let cancel = ctx.cancellation();
        let pipeline = middleware::run_pipeline(&chain, &body, ctx);

        if let Some(limit) = step_def.timeout {
            tokio::select! {
                outcome = tokio::time::timeout(limit, pipeline) => match outcome {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("step timed out after {:?}", limit)),
                },
                _ = cancel.cancelled() => Ok(StepResult::Cancelled {
                    message: "flow cancelled".to_string(),
                }),
            }
        } else {
            tokio::select! {
                outcome = pipeline => outcome,
                _ = cancel.cancelled() => Ok(StepResult::Cancelled {
                    message: "flow cancelled".to_string(),
                }),
            }
        }
    }

    // --- Branches ---

    /// Run a step's branch spec. Returns an outward jump request from a
    /// sub-step, or a failure result when the branch failed.
    async fn run_branches(
        &self,
        ctx: &mut ExecutionContext,
        definition: &FlowDefinition,
        step_def: &StepDefinition,
        spec: &BranchSpec,
    ) -> Result<Option<JumpSpec>, StepResult> {
        match spec {
            BranchSpec::Static(branches) => {
                let chosen = branches
                    .iter()
                    .find(|b| b.condition.as_ref().is_some_and(|c| c(ctx)))
                    .or_else(|| branches.iter().find(|b| b.condition.is_none()));

                let Some(branch) = chosen else {
                    return Ok(None);
                };
                info!(
                    flow_id = %ctx.state.flow_id,
                    step = %step_def.name,
                    branch = %branch.name,
                    "Taking static branch"
                );

                let subs: Vec<SubStep> = branch
                    .steps
                    .iter()
                    .enumerate()
                    .map(|(i, s)| {
                        let mut sub = SubStep::new(s.clone());
                        sub.index = i;
                        sub
                    })
                    .collect();
                self.run_subs_sequential(ctx, definition, subs).await
            }
            BranchSpec::Dynamic(dynamic) => {
                let items = (dynamic.selector)(ctx);
                let mut subs: Vec<SubStep> = items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| {
                        let mut sub = (dynamic.factory)(item, i);
                        sub.index = i;
                        sub.source = Some(item.clone());
                        sub
                    })
                    .collect();

                match dynamic.strategy {
                    BranchStrategy::Sequential => {
                        self.run_subs_sequential(ctx, definition, subs).await
                    }
                    BranchStrategy::Parallel => {
                        // Higher priority launches first; index breaks ties.
                        subs.sort_by(|a, b| {
                            b.priority.cmp(&a.priority).then(a.index.cmp(&b.index))
                        });
                        self.run_subs_parallel(ctx, definition, subs).await
                    }
                }
            }
        }
    }

    async fn run_subs_sequential(
        &self,
        ctx: &mut ExecutionContext,
        definition: &FlowDefinition,
        subs: Vec<SubStep>,
    ) -> Result<Option<JumpSpec>, StepResult> {
        let mut jump = None;
        for sub in &subs {
            let outcome = self.run_sub_step(ctx, definition, sub).await;
            if self.persist(ctx).await.is_err() {
                return Err(StepResult::ConcurrencyConflict);
            }
            if jump.is_none() {
                jump = outcome.jump.clone();
            }
            if !outcome.result.is_success() && !outcome.allow_failure {
                return Err(StepResult::failure(format!(
                    "Branch step '{}' failed: {}",
                    outcome.name,
                    outcome.result.message()
                )));
            }
        }
        Ok(jump)
    }

    async fn run_subs_parallel(
        &self,
        ctx: &mut ExecutionContext,
        definition: &FlowDefinition,
        subs: Vec<SubStep>,
    ) -> Result<Option<JumpSpec>, StepResult> {
        // Sub-steps sharing a resource group run as one sequential lane;
        // lanes fan out concurrently, bounded by the configured cap.
        let mut lanes: Vec<Vec<SubStep>> = Vec::new();
        let mut group_lane: HashMap<String, usize> = HashMap::new();
        for sub in subs {
            match sub.resource_group.clone() {
                Some(group) => match group_lane.get(&group) {
                    Some(&idx) => lanes[idx].push(sub),
                    None => {
                        group_lane.insert(group, lanes.len());
                        lanes.push(vec![sub]);
                    }
                },
                None => lanes.push(vec![sub]),
            }
        }

        let parent: &ExecutionContext = ctx;
        let lane_futures = lanes.into_iter().map(|lane| {
            let mut fork = parent.fork();
            async move {
                let base_events = fork.state.events.len();
                let mut outcomes = Vec::new();
                for sub in &lane {
                    let outcome = self.run_sub_step(&mut fork, definition, sub).await;
                    let stop = !outcome.result.is_success() && !outcome.allow_failure;
                    outcomes.push(outcome);
                    if stop {
                        break;
                    }
                }
                (fork, base_events, outcomes)
            }
        });

        let results: Vec<_> = futures_util::stream::iter(lane_futures)
            .buffer_unordered(self.branch_fan_out)
            .collect()
            .await;

        // Merge in completion order; writes serialize through the flow's
        // single writer.
        let mut jump = None;
        let mut failure: Option<StepResult> = None;
        for (fork, base_events, outcomes) in results {
            let new_events: Vec<FlowEvent> =
                fork.state.events.iter().skip(base_events).cloned().collect();
            ctx.state.events.extend(new_events);
            ctx.absorb_data(fork);

            for outcome in outcomes {
                if jump.is_none() {
                    jump = outcome.jump.clone();
                }
                if !outcome.result.is_success() && !outcome.allow_failure && failure.is_none() {
                    failure = Some(StepResult::failure(format!(
                        "Branch step '{}' failed: {}",
                        outcome.name,
                        outcome.result.message()
                    )));
                }
            }
        }

        if self.persist(ctx).await.is_err() {
            return Err(StepResult::ConcurrencyConflict);
        }

        match failure {
            Some(f) => Err(f),
            None => Ok(jump),
        }
    }

    /// Run one sub-step against the given context (the parent's for
    /// sequential branches, a fork for parallel lanes). Boxed because
    /// sub-steps may carry nested branches.
    fn run_sub_step<'a>(
        &'a self,
        ctx: &'a mut ExecutionContext,
        definition: &'a FlowDefinition,
        sub: &'a SubStep,
    ) -> Pin<Box<dyn Future<Output = SubOutcome> + Send + 'a>> {
        Box::pin(async move {
            let step_def = &sub.definition;
            let name = step_def.name.clone();

            if let Some(ref condition) = step_def.condition
                && !condition(ctx)
            {
                ctx.state.push_event(
                    FlowEventType::StepSkipped,
                    format!("Branch step '{}' skipped — condition not met", name),
                );
                return SubOutcome {
                    name,
                    result: StepResult::success("skipped"),
                    allow_failure: step_def.allow_failure,
                    jump: None,
                };
            }

            if let Some(missing) = self.check_data_deps(ctx, step_def) {
                ctx.state.push_event(
                    FlowEventType::StepFailed,
                    format!("Branch step '{}' failed: {}", name, missing.message()),
                );
                return SubOutcome {
                    name,
                    result: missing,
                    allow_failure: step_def.allow_failure,
                    jump: None,
                };
            }

            ctx.state.push_event(
                FlowEventType::StepStarted,
                format!("Branch step '{}' started", name),
            );

            let (mut result, _attempts) = self
                .run_with_retries(ctx, step_def, &definition.middleware)
                .await;

            if result.is_success() {
                if let StepResult::Success { ref data, .. } = result {
                    for (k, v) in data {
                        ctx.state.data.insert(k.clone(), v.clone());
                    }
                }

                if let Some(ref spec) = step_def.branches {
                    if let Err(nested_failure) =
                        self.run_branches(ctx, definition, step_def, spec).await
                    {
                        result = nested_failure;
                    }
                }
            }

            if result.is_success() {
                ctx.state.push_event(
                    FlowEventType::StepCompleted,
                    format!("Branch step '{}' completed: {}", name, result.message()),
                );
                SubOutcome {
                    name,
                    result,
                    allow_failure: step_def.allow_failure,
                    jump: step_def.jump.clone(),
                }
            } else {
                ctx.state.push_event(
                    FlowEventType::StepFailed,
                    format!("Branch step '{}' failed: {}", name, result.message()),
                );
                SubOutcome {
                    name,
                    result,
                    allow_failure: step_def.allow_failure,
                    jump: step_def.jump.clone(),
                }
            }
        })
    }

    // --- Settlement helpers ---

    async fn park_paused(
        &self,
        ctx: &mut ExecutionContext,
        reason: String,
        message: String,
        data: HashMap<String, SafeValue>,
        resume: Option<&ResumeConfig>,
    ) {
        let now = Utc::now();
        ctx.state.status = FlowStatus::Paused;
        ctx.state.paused_at = Some(now);
        ctx.state.pause = Some(PauseState {
            reason: reason.clone(),
            message,
            data,
            paused_at: now,
        });
        ctx.state.push_event(
            FlowEventType::FlowPaused,
            format!("Paused at '{}': {}", ctx.state.current_step_name, reason),
        );

        if self.persist(ctx).await.is_err() {
            return;
        }

        if let Some(polled) = resume.and_then(|r| r.predicate.as_ref()) {
            let record = ResumeConditionRecord {
                flow_id: ctx.state.flow_id,
                check_interval: polled.check_interval,
                next_check: now
                    + chrono::Duration::from_std(polled.check_interval).unwrap_or_else(|_| chrono::Duration::zero()),
                max_retries: polled.max_retries,
                current_retries: 0,
                created_at: now,
            };
            if let Err(e) = self.store.save_resume_condition(&record).await {
                error!(flow_id = %ctx.state.flow_id, error = %e, "Failed to save resume condition");
            }
        }

        info!(
            flow_id = %ctx.state.flow_id,
            step = %ctx.state.current_step_name,
            reason = %reason,
            "Flow paused"
        );
    }

    async fn finish_cancelled(&self, ctx: &mut ExecutionContext, description: impl Into<String>) {
        ctx.state.status = FlowStatus::Cancelled;
        ctx.state.completed_at = Some(Utc::now());
        ctx.state.pause = None;
        ctx.state
            .push_event(FlowEventType::FlowCancelled, description);
        let _ = self.persist(ctx).await;
        let _ = self.store.delete_resume_condition(ctx.state.flow_id).await;
        info!(flow_id = %ctx.state.flow_id, "Flow cancelled");
    }

    async fn fail_flow(&self, ctx: &mut ExecutionContext, message: String) {
        ctx.state.status = FlowStatus::Failed;
        ctx.state.completed_at = Some(Utc::now());
        ctx.state.last_error = Some(SafeValue::Str(message.clone()));
        ctx.state
            .push_event(FlowEventType::FlowFailed, message.clone());
        let _ = self.persist(ctx).await;
        let _ = self.store.delete_resume_condition(ctx.state.flow_id).await;
        error!(flow_id = %ctx.state.flow_id, error = %message, "Flow failed");
    }

    /// Durable snapshot with expected-version save. A concurrency conflict
    /// means another writer owns the flow: abort this run and leave the
    /// flow for recovery.
    async fn persist(&self, ctx: &mut ExecutionContext) -> Result<(), StoreError> {
        ctx.state.last_updated_at = Utc::now();
        match self.store.save(&ctx.state).await {
            Ok(version) => {
                ctx.state.version = version;
                Ok(())
            }
            Err(e @ StoreError::ConcurrencyConflict { .. }) => {
                warn!(
                    flow_id = %ctx.state.flow_id,
                    "Concurrent writer detected — aborting this executor run"
                );
                Err(e)
            }
            Err(e) => {
                error!(flow_id = %ctx.state.flow_id, error = %e, "Failed to persist snapshot");
                Err(e)
            }
        }
    }
}
