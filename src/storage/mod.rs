pub mod document_store;
pub mod memory_store;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::engine::types::{
    FlowState, FlowStatus, FlowSummary, PagedResult, QueryCriteria, ResumeConditionRecord,
};

/// Errors raised by state-store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("flow {0} not found")]
    NotFound(Uuid),

    #[error("flow {flow_id} was modified concurrently (expected version {expected})")]
    ConcurrencyConflict { flow_id: Uuid, expected: u64 },

    #[error("flow {flow_id} is terminal and immutable")]
    TerminalFlow { flow_id: Uuid },

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Trait for durable flow persistence.
///
/// Invariants every implementation must preserve: version is strictly
/// monotonic per flow id, at most one snapshot per flow id, terminal
/// snapshots are immutable except by administrative purge.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Atomic upsert by flow id. `state.version` is the expected stored
    /// version: 0 inserts, otherwise the store conditionally replaces and
    /// bumps. Returns the new version; the caller must adopt it.
    async fn save(&self, state: &FlowState) -> Result<u64, StoreError>;

    /// Load the full snapshot.
    async fn load(&self, flow_id: Uuid) -> Result<FlowState, StoreError>;

    /// All flows in any of the given statuses. Used by the recovery
    /// service and the pause/resume controller.
    async fn load_by_statuses(
        &self,
        statuses: &[FlowStatus],
    ) -> Result<Vec<FlowState>, StoreError>;

    /// Paged summaries matching the criteria, most recent first.
    /// `page` is zero-based.
    async fn query(
        &self,
        criteria: &QueryCriteria,
        page: usize,
        page_size: usize,
    ) -> Result<PagedResult<FlowSummary>, StoreError>;

    /// Purge terminal flows whose completion is older than `now - age`.
    /// Returns the number of deleted snapshots.
    async fn delete_terminal_older_than(&self, age: Duration) -> Result<u64, StoreError>;

    async fn save_resume_condition(
        &self,
        condition: &ResumeConditionRecord,
    ) -> Result<(), StoreError>;

    async fn delete_resume_condition(&self, flow_id: Uuid) -> Result<(), StoreError>;

    /// Resume conditions whose `next_check` is due at `now`.
    async fn due_resume_conditions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ResumeConditionRecord>, StoreError>;
}
