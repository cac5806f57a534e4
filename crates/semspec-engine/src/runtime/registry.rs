//! Workflow registry
//!
//! Holds workflow definitions by id with duplicate rejection, plus the
//! result-type decoder table used only by the legacy `PublishAsync` path.
//! The registry is sealed when the engine starts; later registrations are
//! rejected so the shared tables stay effectively immutable at runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::info;

use semspec_messages::{AnyPayload, Payload, PayloadError, PayloadRegistry, SchemaTag};

use crate::rules::WorkflowDefinition;

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A definition with this id is already registered
    #[error("workflow already registered: {0}")]
    DuplicateWorkflow(String),

    /// Registration attempted after the engine started
    #[error("registry is sealed; registrations after engine start are rejected")]
    Sealed,

    /// No definition with this id
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// Result-type table failure
    #[error("result type error: {0}")]
    ResultType(#[from] PayloadError),
}

/// Registry of workflow definitions and async result types
pub struct WorkflowRegistry {
    definitions: RwLock<Vec<Arc<WorkflowDefinition>>>,
    result_types: PayloadRegistry,
    sealed: AtomicBool,
}

impl WorkflowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            definitions: RwLock::new(Vec::new()),
            result_types: PayloadRegistry::new(),
            sealed: AtomicBool::new(false),
        }
    }

    /// Register a workflow definition
    pub fn register(&self, definition: WorkflowDefinition) -> Result<(), RegistryError> {
        if self.is_sealed() {
            return Err(RegistryError::Sealed);
        }

        let mut definitions = self.definitions.write();
        if definitions.iter().any(|d| d.id == definition.id) {
            return Err(RegistryError::DuplicateWorkflow(definition.id));
        }

        info!(workflow = %definition.id, rules = definition.rules.len(), "registered workflow");
        definitions.push(Arc::new(definition));
        Ok(())
    }

    /// Register a result payload type for `PublishAsync` reply decoding
    pub fn register_result_type<P>(&self) -> Result<(), RegistryError>
    where
        P: Payload + DeserializeOwned,
    {
        if self.is_sealed() {
            return Err(RegistryError::Sealed);
        }
        self.result_types.register::<P>()?;
        Ok(())
    }

    /// Decode an async reply's output under its result schema
    pub fn decode_result(
        &self,
        schema: &SchemaTag,
        output: &Value,
    ) -> Result<Box<dyn AnyPayload>, RegistryError> {
        Ok(self.result_types.decode(schema, output)?)
    }

    /// Freeze the registry; called when the engine starts
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    /// Whether the registry is frozen
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Look up a definition by id
    pub fn get(&self, id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.read().iter().find(|d| d.id == id).cloned()
    }

    /// All registered definitions, in registration order
    pub fn definitions(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.definitions.read().clone()
    }

    /// Number of registered workflows
    pub fn len(&self) -> usize {
        self.definitions.read().len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.definitions.read().is_empty()
    }
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}
