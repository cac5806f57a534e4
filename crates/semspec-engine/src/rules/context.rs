//! Rule evaluation context

use serde_json::Value;

use semspec_messages::AnyPayload;

use crate::state::{AnyState, ExecutionStatus, StateError};

/// Read-only view of an execution handed to conditions and builders
///
/// Carries the loaded state, a serialized snapshot of it for field-level
/// predicates, and the triggering message when the event came off a
/// subject (KV-change events carry no message).
pub struct RuleContext<'a> {
    state: &'a dyn AnyState,
    state_json: Value,
    message: Option<&'a dyn AnyPayload>,
}

impl<'a> RuleContext<'a> {
    /// Build a context, snapshotting the state document once
    pub fn new(
        state: &'a dyn AnyState,
        message: Option<&'a dyn AnyPayload>,
    ) -> Result<Self, StateError> {
        let state_json = state.to_json()?;
        Ok(Self {
            state,
            state_json,
            message,
        })
    }

    /// The erased state
    pub fn state(&self) -> &dyn AnyState {
        self.state
    }

    /// Current phase
    pub fn phase(&self) -> &str {
        &self.state.base().phase
    }

    /// Current iteration
    pub fn iteration(&self) -> u32 {
        self.state.base().iteration
    }

    /// Current status
    pub fn status(&self) -> ExecutionStatus {
        self.state.base().status
    }

    /// Top-level field of the serialized state document
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.state_json.get(name)
    }

    /// The triggering message, if any
    pub fn message(&self) -> Option<&dyn AnyPayload> {
        self.message
    }

    /// Downcast the state to its concrete type
    pub fn state_as<S: 'static>(&self) -> Option<&S> {
        self.state.as_any().downcast_ref::<S>()
    }

    /// Downcast the message to its concrete type
    pub fn message_as<M: 'static>(&self) -> Option<&M> {
        self.message.and_then(|m| m.as_any().downcast_ref::<M>())
    }
}
