//! Pause/resume controller: the polling half.
//!
//! Event- and manual-triggered resumes go through
//! [`FlowEngine::publish_event`] and [`FlowEngine::resume`]; this
//! controller owns the third trigger kind, polled predicates. It scans the
//! resume-condition records whose `next_check` is due, re-evaluates each
//! flow's predicate against the loaded snapshot, and either resumes the
//! flow, reschedules the check, or fails the flow once the retry budget is
//! exhausted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::engine::error::EngineError;
use crate::engine::executor::FlowEngine;
use crate::engine::types::{FlowEventType, FlowStatus};
use crate::engine::value::SafeValue;

pub struct ResumeController {
    engine: Arc<FlowEngine>,
    poll_interval: Duration,
}

impl ResumeController {
    pub fn new(engine: Arc<FlowEngine>, poll_interval: Duration) -> Self {
        Self {
            engine,
            poll_interval,
        }
    }

    /// Poll forever. Hosts spawn this as a background task.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = self.poll_once().await {
                error!(error = %e, "Resume-condition poll failed");
            }
        }
    }

    /// Evaluate every due resume condition once. Returns the number of
    /// flows resumed.
    pub async fn poll_once(&self) -> Result<usize, EngineError> {
        let store = self.engine.store();
        let now = Utc::now();
        let due = store.due_resume_conditions(now).await?;
        let mut resumed = 0;

        for mut condition in due {
            let flow_id = condition.flow_id;

            let state = match store.load(flow_id).await {
                Ok(state) => state,
                Err(_) => {
                    // The flow is gone; drop the orphaned condition.
                    store.delete_resume_condition(flow_id).await?;
                    continue;
                }
            };

            if state.status != FlowStatus::Paused {
                store.delete_resume_condition(flow_id).await?;
                continue;
            }

            let definition = match self.engine.registry().definition(&state.flow_kind) {
                Ok(d) => d,
                Err(e) => {
                    warn!(flow_id = %flow_id, error = %e, "Cannot rebind paused flow");
                    continue;
                }
            };

            let Some(polled) = definition
                .steps
                .iter()
                .find(|s| s.name == state.current_step_name)
                .and_then(|s| s.resume.as_ref())
                .and_then(|r| r.predicate.as_ref())
                .cloned()
            else {
                store.delete_resume_condition(flow_id).await?;
                continue;
            };

            if (polled.check)(&state).await {
                let description = "Resumed by polled condition".to_string();
                if self
                    .engine
                    .resume_internal(state, definition, description)
                    .await?
                {
                    resumed += 1;
                }
                continue;
            }

            condition.current_retries += 1;
            if condition.current_retries >= condition.max_retries {
                self.fail_exhausted(state, condition.current_retries).await?;
                store.delete_resume_condition(flow_id).await?;
                continue;
            }

            condition.next_check = Utc::now()
                + chrono::Duration::from_std(condition.check_interval).unwrap_or_else(|_| chrono::Duration::zero());
            store.save_resume_condition(&condition).await?;
        }

        Ok(resumed)
    }

    /// The predicate never held: the flow fails with a distinguished error.
    async fn fail_exhausted(
        &self,
        mut state: crate::engine::types::FlowState,
        retries: u32,
    ) -> Result<(), EngineError> {
        let message = EngineError::PausePredicateExhausted {
            flow_id: state.flow_id,
            retries,
        }
        .to_string();

        info!(flow_id = %state.flow_id, retries = retries, "Resume predicate exhausted");
        state.status = FlowStatus::Failed;
        state.completed_at = Some(Utc::now());
        state.pause = None;
        state.last_error = Some(SafeValue::Str(message.clone()));
        state.push_event(FlowEventType::FlowFailed, message);
        self.engine.store().save(&state).await?;
        Ok(())
    }
}
