//! Flow-kind registry.
//!
//! Step bodies, predicates, and factories are not serializable, so
//! snapshots carry only a flow-kind tag. The host registers one
//! [`FlowKind`] per tag; the executor, resume controller, and recovery
//! service rebind fresh definitions from here when they load a snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::definition::FlowDefinition;
use crate::engine::error::EngineError;

/// Trait all flow kinds must implement.
pub trait FlowKind: Send + Sync {
    /// Kind tag stored on every snapshot (e.g. "user_onboarding").
    fn kind(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Build a fresh definition. Called on submit and on every rebind.
    fn define(&self) -> FlowDefinition;
}

/// Flow kind backed by a plain constructor function. Convenient for tests
/// and small hosts.
pub struct FnFlowKind {
    kind: String,
    description: String,
    define: Box<dyn Fn() -> FlowDefinition + Send + Sync>,
}

impl FlowKind for FnFlowKind {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn define(&self) -> FlowDefinition {
        (self.define)()
    }
}

/// Registry of available flow kinds.
#[derive(Default)]
pub struct FlowKindRegistry {
    kinds: HashMap<String, Arc<dyn FlowKind>>,
}

impl FlowKindRegistry {
    pub fn new() -> Self {
        Self {
            kinds: HashMap::new(),
        }
    }

    /// Register a flow kind. The definition is validated once here so
    /// malformed graphs fail at startup, not mid-flow.
    pub fn register(&mut self, flow_kind: Arc<dyn FlowKind>) -> Result<(), EngineError> {
        let definition = flow_kind.define();
        definition
            .validate()
            .map_err(|detail| EngineError::InvalidDefinition {
                kind: flow_kind.kind().to_string(),
                detail,
            })?;
        self.kinds.insert(flow_kind.kind().to_string(), flow_kind);
        Ok(())
    }

    /// Register a constructor function as a flow kind.
    pub fn register_fn<F>(&mut self, kind: &str, define: F) -> Result<(), EngineError>
    where
        F: Fn() -> FlowDefinition + Send + Sync + 'static,
    {
        self.register(Arc::new(FnFlowKind {
            kind: kind.to_string(),
            description: String::new(),
            define: Box::new(define),
        }))
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn FlowKind>> {
        self.kinds.get(kind).cloned()
    }

    /// Rebind a fresh definition for the given kind tag.
    pub fn definition(&self, kind: &str) -> Result<FlowDefinition, EngineError> {
        self.kinds
            .get(kind)
            .map(|k| k.define())
            .ok_or_else(|| EngineError::UnknownFlowKind(kind.to_string()))
    }

    /// List all registered kinds with descriptions.
    pub fn list(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<(&str, &str)> = self
            .kinds
            .values()
            .map(|k| (k.kind(), k.description()))
            .collect();
        entries.sort_by_key(|(name, _)| *name);
        entries
    }
}
