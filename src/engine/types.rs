use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::value::SafeValue;

/// Status of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Ready,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl FlowStatus {
    /// Terminal flows accept no further writes except administrative purge.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowStatus::Completed | FlowStatus::Failed | FlowStatus::Cancelled
        )
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowStatus::Ready => write!(f, "ready"),
            FlowStatus::Running => write!(f, "running"),
            FlowStatus::Paused => write!(f, "paused"),
            FlowStatus::Completed => write!(f, "completed"),
            FlowStatus::Failed => write!(f, "failed"),
            FlowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Status of an individual step within a flow.
///
/// Paused is a flow state, not a step state — a step awaiting resume
/// remains Pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Cancelled => write!(f, "cancelled"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Retry policy for a step: a fixed delay between attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first failure.
    pub max_retries: u32,
    /// Delay before each retry.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::from_secs(1),
        }
    }
}

/// Outcome of a step body (or of a middleware short-circuit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepResult {
    Success {
        message: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        data: HashMap<String, SafeValue>,
    },
    Failure {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Cancelled {
        message: String,
    },
    NotFound,
    NotAuthorized,
    ConcurrencyConflict,
}

impl StepResult {
    pub fn success(message: impl Into<String>) -> Self {
        StepResult::Success {
            message: message.into(),
            data: HashMap::new(),
        }
    }

    pub fn success_with(message: impl Into<String>, data: HashMap<String, SafeValue>) -> Self {
        StepResult::Success {
            message: message.into(),
            data,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        StepResult::Failure {
            message: message.into(),
            error: None,
        }
    }

    pub fn failure_with(message: impl Into<String>, error: impl Into<String>) -> Self {
        StepResult::Failure {
            message: message.into(),
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepResult::Success { .. })
    }

    /// Short description used in events and error records.
    pub fn message(&self) -> &str {
        match self {
            StepResult::Success { message, .. }
            | StepResult::Failure { message, .. }
            | StepResult::Cancelled { message } => message,
            StepResult::NotFound => "not found",
            StepResult::NotAuthorized => "not authorized",
            StepResult::ConcurrencyConflict => "concurrency conflict",
        }
    }
}

/// Event types appended to a flow's event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowEventType {
    FlowStarted,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepSkipped,
    FlowPaused,
    FlowResumed,
    FlowCancelled,
    FlowFailed,
    FlowCompleted,
    FlowRecovered,
    ChildFlowTriggered,
    JumpTaken,
}

impl std::fmt::Display for FlowEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FlowEventType::FlowStarted => "flow_started",
            FlowEventType::StepStarted => "step_started",
            FlowEventType::StepCompleted => "step_completed",
            FlowEventType::StepFailed => "step_failed",
            FlowEventType::StepSkipped => "step_skipped",
            FlowEventType::FlowPaused => "flow_paused",
            FlowEventType::FlowResumed => "flow_resumed",
            FlowEventType::FlowCancelled => "flow_cancelled",
            FlowEventType::FlowFailed => "flow_failed",
            FlowEventType::FlowCompleted => "flow_completed",
            FlowEventType::FlowRecovered => "flow_recovered",
            FlowEventType::ChildFlowTriggered => "child_flow_triggered",
            FlowEventType::JumpTaken => "jump_taken",
        };
        write!(f, "{}", s)
    }
}

/// An entry in a flow's append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    pub event_id: Uuid,
    pub flow_id: Uuid,
    pub event_type: FlowEventType,
    pub description: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, SafeValue>,
}

impl FlowEvent {
    pub fn new(flow_id: Uuid, event_type: FlowEventType, description: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            flow_id,
            event_type,
            description: description.into(),
            at: Utc::now(),
            data: HashMap::new(),
        }
    }

    pub fn with_data(mut self, data: HashMap<String, SafeValue>) -> Self {
        self.data = data;
        self
    }
}

/// Pause record carried by a flow while it awaits an external trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseState {
    pub reason: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, SafeValue>,
    pub paused_at: DateTime<Utc>,
}

/// Persisted state of an individual step.
///
/// Bodies, predicates, and factories are never persisted; they are rebound
/// from the flow-kind registry when the snapshot is loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub name: String,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SafeValue>,
    pub jumps_taken: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl StepState {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StepStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            jumps_taken: 0,
            idempotency_key: None,
        }
    }
}

/// Full persisted snapshot of a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowState {
    pub flow_id: Uuid,
    pub flow_kind: String,
    pub principal_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub status: FlowStatus,
    /// Monotonic version for optimistic concurrency. Starts at 0; the
    /// store bumps it on every durable write.
    pub version: u64,
    pub current_step_name: String,
    pub current_step_index: usize,
    pub data: HashMap<String, SafeValue>,
    pub steps: Vec<StepState>,
    pub events: Vec<FlowEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause: Option<PauseState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<SafeValue>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    pub last_updated_at: DateTime<Utc>,
}

impl FlowState {
    pub fn new(
        flow_kind: &str,
        principal_id: &str,
        correlation_id: Option<String>,
        initial_data: HashMap<String, SafeValue>,
        step_names: &[String],
    ) -> Self {
        let now = Utc::now();
        Self {
            flow_id: Uuid::new_v4(),
            flow_kind: flow_kind.to_string(),
            principal_id: principal_id.to_string(),
            correlation_id,
            status: FlowStatus::Ready,
            version: 0,
            current_step_name: step_names.first().cloned().unwrap_or_default(),
            current_step_index: 0,
            data: initial_data,
            steps: step_names.iter().map(|n| StepState::new(n)).collect(),
            events: Vec::new(),
            pause: None,
            last_error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            paused_at: None,
            last_updated_at: now,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepState> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut StepState> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    pub fn push_event(&mut self, event_type: FlowEventType, description: impl Into<String>) {
        let ev = FlowEvent::new(self.flow_id, event_type, description);
        self.events.push(ev);
    }
}

/// Resume-condition record for a paused flow with a polled predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeConditionRecord {
    pub flow_id: Uuid,
    pub check_interval: Duration,
    pub next_check: DateTime<Utc>,
    pub max_retries: u32,
    pub current_retries: u32,
    pub created_at: DateTime<Utc>,
}

/// Filter criteria for [`crate::storage::StateStore::query`].
#[derive(Debug, Clone, Default)]
pub struct QueryCriteria {
    pub statuses: Option<Vec<FlowStatus>>,
    pub principal_id: Option<String>,
    pub correlation_id: Option<String>,
    pub flow_kind: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub pause_reason: Option<String>,
}

impl QueryCriteria {
    /// True when the given flow matches every set filter.
    pub fn matches(&self, flow: &FlowState) -> bool {
        if let Some(ref statuses) = self.statuses
            && !statuses.contains(&flow.status)
        {
            return false;
        }
        if let Some(ref p) = self.principal_id
            && &flow.principal_id != p
        {
            return false;
        }
        if let Some(ref c) = self.correlation_id
            && flow.correlation_id.as_ref() != Some(c)
        {
            return false;
        }
        if let Some(ref k) = self.flow_kind
            && &flow.flow_kind != k
        {
            return false;
        }
        if let Some(after) = self.created_after
            && flow.created_at < after
        {
            return false;
        }
        if let Some(before) = self.created_before
            && flow.created_at >= before
        {
            return false;
        }
        if let Some(ref reason) = self.pause_reason
            && flow.pause.as_ref().map(|p| p.reason.as_str()) != Some(reason.as_str())
        {
            return false;
        }
        true
    }
}

/// Lightweight flow summary returned by queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSummary {
    pub flow_id: Uuid,
    pub flow_kind: String,
    pub principal_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub status: FlowStatus,
    pub current_step_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub last_updated_at: DateTime<Utc>,
}

impl From<&FlowState> for FlowSummary {
    fn from(flow: &FlowState) -> Self {
        Self {
            flow_id: flow.flow_id,
            flow_kind: flow.flow_kind.clone(),
            principal_id: flow.principal_id.clone(),
            correlation_id: flow.correlation_id.clone(),
            status: flow.status,
            current_step_name: flow.current_step_name.clone(),
            created_at: flow.created_at,
            completed_at: flow.completed_at,
            pause_reason: flow.pause.as_ref().map(|p| p.reason.clone()),
            last_error: flow.last_error.as_ref().map(|e| e.summary()),
            last_updated_at: flow.last_updated_at,
        }
    }
}

/// A single page of query results.
#[derive(Debug, Clone, Serialize)]
pub struct PagedResult<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total: u64,
}

/// One entry in a flow's timeline view.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub at: DateTime<Utc>,
    pub event_type: FlowEventType,
    pub description: String,
}

/// Human-oriented view of a flow's event history.
#[derive(Debug, Clone, Serialize)]
pub struct Timeline {
    pub flow_id: Uuid,
    pub flow_kind: String,
    pub status: FlowStatus,
    pub entries: Vec<TimelineEntry>,
}

/// Engine health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub running: u64,
    pub paused: u64,
    pub recent_failures: u64,
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,
}

/// Aggregate statistics over flows created within a window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlowStatistics {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub running: u64,
    pub paused: u64,
    pub cancelled: u64,
    pub success_rate: f64,
    pub by_kind: HashMap<String, u64>,
    pub failures_by_reason: HashMap<String, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_execution_ms: Option<f64>,
}
