//! Crash recovery: re-adopt flows whose owning process died.
//!
//! A flow stuck in Running whose snapshot has not been updated within the
//! threshold lost its executor. Recovery reloads the snapshot, rebinds the
//! non-persisted function fields from the flow-kind registry, and resumes
//! the executor from the current step. Idempotent steps replay their
//! persisted results instead of re-executing side effects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::error::EngineError;
use crate::engine::executor::FlowEngine;
use crate::engine::types::FlowStatus;

/// Per-sweep accounting.
#[derive(Debug, Default)]
pub struct RecoveryResult {
    pub checked: usize,
    pub recovered: usize,
    pub failed: usize,
    pub recovered_ids: Vec<Uuid>,
    pub failures: HashMap<Uuid, String>,
    pub duration: Duration,
}

pub struct RecoveryService {
    engine: Arc<FlowEngine>,
    threshold: Duration,
    interval: Duration,
}

impl RecoveryService {
    pub fn new(engine: Arc<FlowEngine>, threshold: Duration, interval: Duration) -> Self {
        Self {
            engine,
            threshold,
            interval,
        }
    }

    /// Sweep on startup and then periodically. Hosts spawn this as a
    /// background task.
    pub async fn run(&self) {
        loop {
            match self.recover_stalled().await {
                Ok(result) if result.checked > 0 => {
                    info!(
                        checked = result.checked,
                        recovered = result.recovered,
                        failed = result.failed,
                        elapsed_ms = result.duration.as_millis() as u64,
                        "Recovery sweep finished"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Recovery sweep failed"),
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One sweep: re-adopt every Running flow whose last update is older
    /// than the threshold.
    pub async fn recover_stalled(&self) -> Result<RecoveryResult, EngineError> {
        let started = Instant::now();
        let store = self.engine.store();
        let registry = self.engine.registry();

        let cutoff = Utc::now() - chrono::Duration::from_std(self.threshold).unwrap_or_else(|_| chrono::Duration::zero());
        let running = store.load_by_statuses(&[FlowStatus::Running]).await?;

        let mut result = RecoveryResult::default();

        for state in running {
            if state.last_updated_at >= cutoff {
                continue;
            }
            if self.engine.is_live(state.flow_id) {
                // Still owned by this process; the snapshot is just stale.
                continue;
            }
            result.checked += 1;
            let flow_id = state.flow_id;

            let definition = match registry.definition(&state.flow_kind) {
                Ok(d) => d,
                Err(e) => {
                    warn!(flow_id = %flow_id, error = %e, "Cannot rebind stalled flow");
                    result.failed += 1;
                    result.failures.insert(flow_id, e.to_string());
                    continue;
                }
            };

            // The persisted step list must still match the registered
            // definition; drift means the host changed the flow shape.
            let drifted = state
                .steps
                .iter()
                .any(|s| definition.step_index(&s.name).is_none());
            if drifted {
                let detail = "persisted steps no longer match the registered definition";
                warn!(flow_id = %flow_id, "{}", detail);
                result.failed += 1;
                result.failures.insert(flow_id, detail.to_string());
                continue;
            }

            info!(
                flow_id = %flow_id,
                flow_kind = %state.flow_kind,
                step = %state.current_step_name,
                "Recovering stalled flow"
            );

            match self.engine.run_recovered(state, definition).await {
                Ok(()) => {
                    result.recovered += 1;
                    result.recovered_ids.push(flow_id);
                }
                Err(e) => {
                    result.failed += 1;
                    result.failures.insert(flow_id, e.to_string());
                }
            }
        }

        result.duration = started.elapsed();
        Ok(result)
    }
}
