use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::engine::types::{
    FlowState, FlowStatus, FlowSummary, PagedResult, QueryCriteria, ResumeConditionRecord,
};
use crate::storage::{StateStore, StoreError};

/// In-memory state store for tests and embedded hosts.
/// Preserves the same versioning contract as the document store.
pub struct MemoryStore {
    flows: Mutex<HashMap<Uuid, FlowState>>,
    resume_conditions: Mutex<HashMap<Uuid, ResumeConditionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            flows: Mutex::new(HashMap::new()),
            resume_conditions: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save(&self, state: &FlowState) -> Result<u64, StoreError> {
        let mut flows = self.flows.lock().unwrap();

        match flows.get(&state.flow_id) {
            None => {
                if state.version != 0 {
                    return Err(StoreError::NotFound(state.flow_id));
                }
            }
            Some(existing) => {
                if existing.status.is_terminal() {
                    return Err(StoreError::TerminalFlow {
                        flow_id: state.flow_id,
                    });
                }
                if existing.version != state.version {
                    return Err(StoreError::ConcurrencyConflict {
                        flow_id: state.flow_id,
                        expected: state.version,
                    });
                }
            }
        }

        let mut stored = state.clone();
        stored.version = state.version + 1;
        stored.last_updated_at = Utc::now();
        let new_version = stored.version;
        flows.insert(state.flow_id, stored);
        Ok(new_version)
    }

    async fn load(&self, flow_id: Uuid) -> Result<FlowState, StoreError> {
        self.flows
            .lock()
            .unwrap()
            .get(&flow_id)
            .cloned()
            .ok_or(StoreError::NotFound(flow_id))
    }

    async fn load_by_statuses(
        &self,
        statuses: &[FlowStatus],
    ) -> Result<Vec<FlowState>, StoreError> {
        let flows = self.flows.lock().unwrap();
        let mut out: Vec<FlowState> = flows
            .values()
            .filter(|f| statuses.contains(&f.status))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn query(
        &self,
        criteria: &QueryCriteria,
        page: usize,
        page_size: usize,
    ) -> Result<PagedResult<FlowSummary>, StoreError> {
        let flows = self.flows.lock().unwrap();
        let mut matching: Vec<&FlowState> =
            flows.values().filter(|f| criteria.matches(f)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(page * page_size)
            .take(page_size)
            .map(FlowSummary::from)
            .collect();

        Ok(PagedResult {
            items,
            page,
            page_size,
            total,
        })
    }

    async fn delete_terminal_older_than(&self, age: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
        let mut flows = self.flows.lock().unwrap();
        let before = flows.len();
        flows.retain(|_, f| {
            !(f.status.is_terminal() && f.completed_at.is_some_and(|done| done < cutoff))
        });
        Ok((before - flows.len()) as u64)
    }

    async fn save_resume_condition(
        &self,
        condition: &ResumeConditionRecord,
    ) -> Result<(), StoreError> {
        self.resume_conditions
            .lock()
            .unwrap()
            .insert(condition.flow_id, condition.clone());
        Ok(())
    }

    async fn delete_resume_condition(&self, flow_id: Uuid) -> Result<(), StoreError> {
        self.resume_conditions.lock().unwrap().remove(&flow_id);
        Ok(())
    }

    async fn due_resume_conditions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ResumeConditionRecord>, StoreError> {
        let conditions = self.resume_conditions.lock().unwrap();
        let mut due: Vec<ResumeConditionRecord> = conditions
            .values()
            .filter(|c| c.next_check <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_check.cmp(&b.next_check));
        Ok(due)
    }
}
