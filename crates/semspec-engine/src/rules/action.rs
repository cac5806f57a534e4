//! Rule actions
//!
//! An action is a sum type with an explicit discriminator; the engine
//! switches on the tag. Mutations always run inside the state manager's
//! CAS loop; publications happen exactly once per successful commit.

use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use semspec_messages::{erase, AnyPayload, AsyncStepResult, Payload, PayloadError, SchemaTag};

use super::context::RuleContext;
use crate::state::{AnyState, StateError};

/// Errors from action execution
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// State was not of the concrete type the mutator expected
    #[error("mutator type mismatch: expected {0}")]
    TypeMismatch(String),

    /// A subject-triggered mutator ran without its message
    #[error("missing trigger message")]
    MissingMessage,

    /// Payload builder failed
    #[error("payload build failed: {0}")]
    Build(String),

    /// Payload-layer failure
    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),

    /// State-layer failure
    #[error("state error: {0}")]
    State(#[from] StateError),
}

impl From<ActionError> for StateError {
    fn from(err: ActionError) -> Self {
        match err {
            ActionError::State(inner) => inner,
            other => StateError::Mutator(other.to_string()),
        }
    }
}

/// Mutator run inside the CAS loop; must not publish
pub type MutateFn =
    Arc<dyn Fn(&mut dyn AnyState, Option<&dyn AnyPayload>) -> Result<(), ActionError> + Send + Sync>;

/// Payload builder over the rule context
pub type BuildFn =
    Arc<dyn Fn(&RuleContext<'_>) -> Result<Box<dyn AnyPayload>, ActionError> + Send + Sync>;

/// Result mutator for the legacy async-callback path
pub type ResultMutateFn = Arc<
    dyn Fn(&mut dyn AnyState, &AsyncStepResult, Option<&dyn AnyPayload>) -> Result<(), ActionError>
        + Send
        + Sync,
>;

/// What a rule does when it fires
#[derive(Clone)]
pub enum Action {
    /// Mutate state inside the CAS loop
    Mutate(MutateFn),

    /// Build a payload and publish it; no state change
    Publish { subject: String, build: BuildFn },

    /// Commit a mutation, then publish once per successful commit
    PublishWithMutation {
        subject: String,
        build: BuildFn,
        mutate: MutateFn,
    },

    /// Publish a final event and mark the execution completed
    CompleteWithEvent { subject: String, build: BuildFn },

    /// Legacy callback dispatch: publish with injected callback metadata,
    /// reserve `pending_task_id`, and run the result mutator when the
    /// reply arrives
    PublishAsync {
        subject: String,
        build: BuildFn,
        result_schema: SchemaTag,
        on_result: ResultMutateFn,
    },
}

impl Action {
    /// Create a mutate action
    pub fn mutate(mutate: MutateFn) -> Self {
        Self::Mutate(mutate)
    }

    /// Create a publish action
    pub fn publish(subject: impl Into<String>, build: BuildFn) -> Self {
        Self::Publish {
            subject: subject.into(),
            build,
        }
    }

    /// Create a publish-with-mutation action
    pub fn publish_with_mutation(
        subject: impl Into<String>,
        build: BuildFn,
        mutate: MutateFn,
    ) -> Self {
        Self::PublishWithMutation {
            subject: subject.into(),
            build,
            mutate,
        }
    }

    /// Create a complete-with-event action
    pub fn complete_with_event(subject: impl Into<String>, build: BuildFn) -> Self {
        Self::CompleteWithEvent {
            subject: subject.into(),
            build,
        }
    }

    /// Create a legacy async-callback action
    pub fn publish_async(
        subject: impl Into<String>,
        build: BuildFn,
        result_schema: SchemaTag,
        on_result: ResultMutateFn,
    ) -> Self {
        Self::PublishAsync {
            subject: subject.into(),
            build,
            result_schema,
            on_result,
        }
    }

    /// Discriminator name, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Mutate(_) => "mutate",
            Self::Publish { .. } => "publish",
            Self::PublishWithMutation { .. } => "publish_with_mutation",
            Self::CompleteWithEvent { .. } => "complete_with_event",
            Self::PublishAsync { .. } => "publish_async",
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Publish { subject, .. }
            | Self::PublishWithMutation { subject, .. }
            | Self::CompleteWithEvent { subject, .. }
            | Self::PublishAsync { subject, .. } => {
                write!(f, "{}({subject})", self.kind())
            }
            Self::Mutate(_) => write!(f, "mutate"),
        }
    }
}

/// Typed mutator wrapper; owns the downcast at the workflow boundary
pub fn mutate_state<S, F>(f: F) -> MutateFn
where
    S: 'static,
    F: Fn(&mut S, Option<&dyn AnyPayload>) -> Result<(), ActionError> + Send + Sync + 'static,
{
    Arc::new(move |state, message| {
        let typed = state
            .as_any_mut()
            .downcast_mut::<S>()
            .ok_or_else(|| ActionError::TypeMismatch(type_name::<S>().to_string()))?;
        f(typed, message)
    })
}

/// Typed payload builder over the concrete state
pub fn build_from_state<S, P, F>(f: F) -> BuildFn
where
    S: 'static,
    P: Payload,
    F: Fn(&S) -> Result<P, ActionError> + Send + Sync + 'static,
{
    Arc::new(move |ctx| {
        let typed = ctx
            .state_as::<S>()
            .ok_or_else(|| ActionError::TypeMismatch(type_name::<S>().to_string()))?;
        Ok(erase(f(typed)?))
    })
}

/// Typed result mutator for the legacy async path
pub fn mutate_on_result<S, F>(f: F) -> ResultMutateFn
where
    S: 'static,
    F: Fn(&mut S, &AsyncStepResult, Option<&dyn AnyPayload>) -> Result<(), ActionError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(move |state, result, decoded| {
        let typed = state
            .as_any_mut()
            .downcast_mut::<S>()
            .ok_or_else(|| ActionError::TypeMismatch(type_name::<S>().to_string()))?;
        f(typed, result, decoded)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ExecutionState, HasExecutionState};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct DemoState {
        #[serde(flatten)]
        execution: ExecutionState,
        counter: u32,
    }

    impl HasExecutionState for DemoState {
        fn execution(&self) -> &ExecutionState {
            &self.execution
        }

        fn execution_mut(&mut self) -> &mut ExecutionState {
            &mut self.execution
        }
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct OtherState {
        #[serde(flatten)]
        execution: ExecutionState,
    }

    impl HasExecutionState for OtherState {
        fn execution(&self) -> &ExecutionState {
            &self.execution
        }

        fn execution_mut(&mut self) -> &mut ExecutionState {
            &mut self.execution
        }
    }

    #[test]
    fn test_typed_mutator_applies() {
        let mutate = mutate_state::<DemoState, _>(|state, _msg| {
            state.counter += 1;
            Ok(())
        });

        let mut state = DemoState::default();
        mutate(&mut state, None).unwrap();
        assert_eq!(state.counter, 1);
    }

    #[test]
    fn test_typed_mutator_rejects_wrong_type() {
        let mutate = mutate_state::<DemoState, _>(|_state, _msg| Ok(()));

        let mut state = OtherState::default();
        let result = mutate(&mut state, None);
        assert!(matches!(result, Err(ActionError::TypeMismatch(_))));
    }

    #[test]
    fn test_action_kind_names() {
        let mutate = Action::mutate(mutate_state::<DemoState, _>(|_s, _m| Ok(())));
        assert_eq!(mutate.kind(), "mutate");
        assert_eq!(format!("{mutate:?}"), "mutate");
    }
}
