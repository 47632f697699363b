//! Per-run execution context handed to step bodies, predicates, and
//! middleware.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::types::{FlowState, FlowStatus};
use crate::engine::value::{self, SafeValue};

/// Host-provided lookup for business services consumed by step bodies.
/// Returned handles are type-erased; use [`ExecutionContext::service`] to
/// downcast.
pub trait ServiceProvider: Send + Sync {
    fn service(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// Provider with no services; the default for tests and pure flows.
pub struct NoServices;

impl ServiceProvider for NoServices {
    fn service(&self, _name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        None
    }
}

/// Carrier of live flow state during a single executor run.
///
/// Data-map values are always encoded through the safe value encoder
/// before persistence; runtime-only values never reach the store.
pub struct ExecutionContext {
    pub(crate) state: FlowState,
    pub(crate) current_step: String,
    cancel: CancellationToken,
    services: Arc<dyn ServiceProvider>,
    runtime: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ExecutionContext {
    pub fn new(
        state: FlowState,
        services: Arc<dyn ServiceProvider>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state,
            current_step: String::new(),
            cancel,
            services,
            runtime: HashMap::new(),
        }
    }

    pub fn flow_id(&self) -> Uuid {
        self.state.flow_id
    }

    pub fn flow_kind(&self) -> &str {
        &self.state.flow_kind
    }

    pub fn principal_id(&self) -> &str {
        &self.state.principal_id
    }

    pub fn status(&self) -> FlowStatus {
        self.state.status
    }

    pub fn current_step(&self) -> &str {
        &self.current_step
    }

    /// The live flow snapshot. Mutations outside the data setters are the
    /// executor's responsibility.
    pub fn flow(&self) -> &FlowState {
        &self.state
    }

    // --- Flow data map ---

    /// Decode a flow-scoped datum. Errors when the key is absent or the
    /// stored value does not decode as `T`, so bodies can propagate with
    /// `?` and have the executor record a typed failure.
    pub fn get_data<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let raw = self
            .state
            .data
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("missing data key '{}'", key))?;
        Ok(value::decode(raw)?)
    }

    /// Decode a flow-scoped datum, returning None on absence or mismatch.
    pub fn try_get_data<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.state.data.get(key).and_then(|v| value::decode(v).ok())
    }

    pub fn set_data<T: Serialize>(&mut self, key: &str, v: &T) {
        self.state.data.insert(key.to_string(), value::encode_as(v));
    }

    pub fn set_data_raw(&mut self, key: &str, v: SafeValue) {
        self.state.data.insert(key.to_string(), v);
    }

    pub fn has_data(&self, key: &str) -> bool {
        self.state.data.contains_key(key)
    }

    // --- Runtime-only store ---

    /// Fetch a non-serializable handle (live clients, open connections).
    /// These never appear in snapshots and are discarded with the run.
    pub fn get_runtime<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.runtime
            .get(key)
            .and_then(|v| v.clone().downcast::<T>().ok())
    }

    pub fn set_runtime<T: Any + Send + Sync>(&mut self, key: &str, v: T) {
        self.runtime.insert(key.to_string(), Arc::new(v));
    }

    // --- Services and cancellation ---

    /// Look up a host service by name and downcast it.
    pub fn service<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.services
            .service(name)
            .and_then(|s| s.downcast::<T>().ok())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token for cancellation-aware bodies to select on during long I/O.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fork a context for a parallel sub-step: same services and
    /// cancellation, a snapshot of the flow state, a fresh runtime store.
    pub(crate) fn fork(&self) -> Self {
        Self {
            state: self.state.clone(),
            current_step: self.current_step.clone(),
            cancel: self.cancel.clone(),
            services: self.services.clone(),
            runtime: HashMap::new(),
        }
    }

    /// Merge a parallel sub-step's data writes back into this context.
    pub(crate) fn absorb_data(&mut self, other: ExecutionContext) {
        for (k, v) in other.state.data {
            self.state.data.insert(k, v);
        }
    }
}
