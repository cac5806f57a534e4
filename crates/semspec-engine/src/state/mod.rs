//! Execution state model
//!
//! Every per-execution KV value starts with the same base fields
//! ([`ExecutionState`]); workflows extend it with their own fields by
//! embedding the base struct with `#[serde(flatten)]`. The engine works
//! with the type-erased [`AnyState`] form and never downcasts; workflow
//! mutators recover their concrete type once, at their boundary.

pub mod manager;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::bus::KvError;

pub use manager::{StateManager, StateManagerConfig};

/// Errors from state operations
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying KV failure
    #[error("kv error: {0}")]
    Kv(#[from] KvError),

    /// State document could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// CAS loop gave up after the configured number of attempts
    #[error("cas retries exhausted for {key} after {attempts} attempts")]
    CasExhausted { key: String, attempts: u32 },

    /// The execution is terminal; transitions are frozen
    #[error("execution {key} is terminal ({status}); refusing transition")]
    Terminal { key: String, status: ExecutionStatus },

    /// A mutator violated a base-state invariant
    #[error("invariant violation on {key}: {detail}")]
    InvariantViolation { key: String, detail: String },

    /// A mutator failed
    #[error("mutator failed: {0}")]
    Mutator(String),

    /// The caller abandoned the transition before writing
    #[error("transition aborted")]
    Aborted,

    /// The stored state is not of the expected concrete type
    #[error("state type mismatch: {0}")]
    TypeMismatch(String),

    /// No state stored under the key
    #[error("execution not found: {0}")]
    NotFound(String),
}

/// Lifecycle status of an execution; terminal once not `Running`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Escalated,
    TimedOut,
}

impl ExecutionStatus {
    /// Whether this status freezes further transitions
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Escalated => write!(f, "escalated"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Base fields shared by every execution state document
///
/// `id` and `workflow_id` are write-once; `iteration` never decreases;
/// a terminal `status` freezes the document. The [`StateManager`] enforces
/// all three without knowing the workflow-specific extensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    /// KV key of this execution
    pub id: String,

    /// Identifier of the owning workflow definition
    pub workflow_id: String,

    /// State-machine phase driving rule selection
    #[serde(default)]
    pub phase: String,

    #[serde(default)]
    pub status: ExecutionStatus,

    /// Completed loop passes; monotonically non-decreasing
    #[serde(default)]
    pub iteration: u32,

    /// In-flight async request slot (legacy callback path only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_task_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionState {
    /// Create a fresh running execution
    pub fn new(id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            phase: String::new(),
            status: ExecutionStatus::Running,
            iteration: 0,
            pending_task_id: None,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    /// Whether the execution is still running
    pub fn is_running(&self) -> bool {
        self.status == ExecutionStatus::Running
    }
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self::new("", "")
    }
}

/// Accessor capability every workflow state struct implements
pub trait HasExecutionState {
    fn execution(&self) -> &ExecutionState;
    fn execution_mut(&mut self) -> &mut ExecutionState;
}

impl HasExecutionState for ExecutionState {
    fn execution(&self) -> &ExecutionState {
        self
    }

    fn execution_mut(&mut self) -> &mut ExecutionState {
        self
    }
}

/// Type-erased state interface used by the engine
///
/// Blanket-implemented for every serializable state struct carrying the
/// base fields, so workflow code only implements [`HasExecutionState`].
pub trait AnyState: Send + Sync + 'static {
    /// The base execution fields
    fn base(&self) -> &ExecutionState;

    /// Mutable access to the base execution fields
    fn base_mut(&mut self) -> &mut ExecutionState;

    /// Serialize the full document (base + extensions)
    fn to_json(&self) -> Result<serde_json::Value, StateError>;

    /// Access the concrete value for downcasting
    fn as_any(&self) -> &dyn Any;

    /// Mutable access to the concrete value for downcasting
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<S> AnyState for S
where
    S: HasExecutionState + Serialize + Send + Sync + 'static,
{
    fn base(&self) -> &ExecutionState {
        self.execution()
    }

    fn base_mut(&mut self) -> &mut ExecutionState {
        self.execution_mut()
    }

    fn to_json(&self) -> Result<serde_json::Value, StateError> {
        Ok(serde_json::to_value(self)?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Factory + decoder pair crossing the type-erasure boundary
///
/// Mirrors how workflow definitions carry a state factory: the engine can
/// create and decode state documents without the concrete type.
#[derive(Clone)]
pub struct StateCodec {
    new_state: Arc<dyn Fn() -> Box<dyn AnyState> + Send + Sync>,
    decode: Arc<dyn Fn(&[u8]) -> Result<Box<dyn AnyState>, StateError> + Send + Sync>,
}

impl StateCodec {
    /// Codec for a concrete state type
    pub fn of<S>() -> Self
    where
        S: HasExecutionState + Default + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        Self {
            new_state: Arc::new(|| Box::new(S::default())),
            decode: Arc::new(|bytes| {
                let state: S = serde_json::from_slice(bytes)?;
                Ok(Box::new(state))
            }),
        }
    }

    /// Create a fresh state value
    pub fn new_state(&self) -> Box<dyn AnyState> {
        (self.new_state)()
    }

    /// Decode a stored state document
    pub fn decode(&self, bytes: &[u8]) -> Result<Box<dyn AnyState>, StateError> {
        (self.decode)(bytes)
    }

    /// Codec whose fresh states are pre-seeded with the execution identity
    ///
    /// The engine seeds `id` and `workflow_id` at creation so workflow
    /// mutators never touch the write-once fields.
    pub fn seeded(&self, key: &str, workflow_id: &str) -> Self {
        let inner = self.new_state.clone();
        let key = key.to_string();
        let workflow_id = workflow_id.to_string();
        Self {
            new_state: Arc::new(move || {
                let mut state = inner();
                let base = state.base_mut();
                base.id = key.clone();
                base.workflow_id = workflow_id.clone();
                state
            }),
            decode: self.decode.clone(),
        }
    }
}

impl fmt::Debug for StateCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StateCodec")
    }
}
