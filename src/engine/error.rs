use thiserror::Error;
use uuid::Uuid;

use crate::engine::types::FlowStatus;
use crate::engine::value::ValueError;
use crate::storage::StoreError;

/// Errors surfaced by the engine's host-facing API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown flow kind '{0}'")]
    UnknownFlowKind(String),

    #[error("invalid flow definition '{kind}': {detail}")]
    InvalidDefinition { kind: String, detail: String },

    #[error("flow {0} not found")]
    NotFound(Uuid),

    #[error("flow {flow_id} is {actual}, expected {expected}")]
    InvalidStatus {
        flow_id: Uuid,
        actual: FlowStatus,
        expected: FlowStatus,
    },

    #[error("resume predicate for flow {flow_id} exhausted after {retries} checks")]
    PausePredicateExhausted { flow_id: Uuid, retries: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Value(#[from] ValueError),
}
