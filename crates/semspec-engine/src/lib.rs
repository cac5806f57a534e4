//! # Reactive Workflow Engine
//!
//! A declarative rule/state-machine runtime layered over a durable
//! publish-subscribe bus with a key-value store. Workflow definitions are
//! ordered rule lists over a typed state value; the engine runs many
//! concurrent executions of those definitions, each keyed by a stable
//! identifier, durably persisted, and advanced by incoming messages or by
//! state changes observed in the KV store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Watcher Layer                          │
//! │  (subject subscriptions + KV change streams per workflow)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Rule Evaluator                         │
//! │  (first matching rule wins; actions mutate and/or publish)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      State Manager                          │
//! │  (per-key optimistic CAS over one KV bucket)                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Dispatch follows the Participant pattern: a rule publishes a request,
//! advances the phase to a `*-dispatched` variant, and the downstream
//! component re-enters the workflow by writing a completion phase into the
//! same KV cell. The dispatched-phase condition is what makes at-least-once
//! publication safe.
//!
//! ## Example
//!
//! ```ignore
//! use semspec_engine::prelude::*;
//!
//! let bus = Arc::new(InMemoryBus::new());
//! let payloads = Arc::new(PayloadRegistry::new());
//! let workflows = Arc::new(WorkflowRegistry::new());
//! workflows.register(my_workflow())?;
//!
//! let engine = WorkflowEngine::new(bus, payloads, workflows, EngineConfig::default()).await?;
//! engine.start().await?;
//! ```

pub mod bus;
pub mod rules;
pub mod runtime;
pub mod state;

/// Prelude for common imports
pub mod prelude {
    pub use crate::bus::{InMemoryBus, KvBucket, MessageBus, MemoryBusConfig};
    pub use crate::rules::{
        build_from_state, mutate_on_result, mutate_state, Action, Condition, Rule, RuleContext,
        Trigger, WorkflowDefinition,
    };
    pub use crate::runtime::{
        Dispatcher, EngineConfig, EngineError, WorkflowEngine, WorkflowRegistry,
    };
    pub use crate::state::{
        AnyState, ExecutionState, ExecutionStatus, HasExecutionState, StateCodec, StateManager,
        StateManagerConfig,
    };
}

// Re-export key types at crate root
pub use bus::{
    BusError, Delivery, InMemoryBus, KvBucket, KvEntry, KvError, KvWatch, MemoryBusConfig,
    MessageBus, Subscription,
};
pub use rules::{
    build_from_state, mutate_on_result, mutate_state, Action, ActionError, BuildFn, Condition,
    MutateFn, ResultMutateFn, Rule, RuleContext, StateKeyFn, Trigger, WorkflowDefinition,
};
pub use runtime::{
    DispatchError, Dispatcher, EngineConfig, EngineError, RegistryError, WorkflowEngine,
    WorkflowRegistry, MUTATOR_FAILED_PHASE,
};
pub use state::{
    AnyState, ExecutionState, ExecutionStatus, HasExecutionState, StateCodec, StateError,
    StateManager, StateManagerConfig,
};
