//! Rule evaluation and action execution
//!
//! For each triggering event the evaluator loads the execution, walks the
//! workflow's rules in declared order, and runs the first rule whose
//! trigger matches the event and whose conditions all pass. Mutations run
//! inside the state manager's CAS loop; outbound payloads are built from
//! the state observed by the attempt that commits, and published exactly
//! once per commit. A publish failure after the commit is logged and left
//! to the next KV tick (Participant dispatch is at-least-once, guarded by
//! the dispatched-phase condition).

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use semspec_messages::{AnyPayload, AsyncStepResult, CallbackMeta, SchemaTag};

use crate::rules::{
    Action, ActionError, Condition, ResultMutateFn, Rule, RuleContext, WorkflowDefinition,
};
use crate::state::{AnyState, ExecutionStatus, StateCodec, StateError, StateManager};

use super::dispatcher::Dispatcher;
use super::registry::WorkflowRegistry;
use super::EngineError;

/// Phase the engine routes to when a mutator cannot run at all
///
/// Workflow `handle-error` rules include it in their failure-phase lists.
pub const MUTATOR_FAILED_PHASE: &str = "mutator_failed";

/// In-flight async request awaiting its callback reply
pub(crate) struct PendingCallback {
    pub def: Arc<WorkflowDefinition>,
    pub state_key: String,
    pub result_schema: SchemaTag,
    pub on_result: ResultMutateFn,
}

/// The event being evaluated
#[derive(Clone, Copy)]
pub(crate) enum EventRef<'a> {
    Message {
        subject: &'a str,
        payload: &'a dyn AnyPayload,
    },
    KvChange {
        key: &'a str,
    },
}

/// Drives rule selection and action execution
pub(crate) struct Evaluator {
    state: Arc<StateManager>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<WorkflowRegistry>,
    pending: DashMap<String, PendingCallback>,
    callback_subject: String,
}

impl Evaluator {
    pub fn new(
        state: Arc<StateManager>,
        dispatcher: Arc<Dispatcher>,
        registry: Arc<WorkflowRegistry>,
        callback_subject: String,
    ) -> Self {
        Self {
            state,
            dispatcher,
            registry,
            pending: DashMap::new(),
            callback_subject,
        }
    }

    /// Handle an inbound subject message; `Err` means nack/redeliver
    pub async fn on_message(
        &self,
        def: &Arc<WorkflowDefinition>,
        subject: &str,
        payload: &dyn AnyPayload,
        key: &str,
    ) -> Result<(), EngineError> {
        self.evaluate(def, key, EventRef::Message { subject, payload })
            .await
    }

    /// Handle a KV revision under a watched prefix
    pub async fn on_kv_change(
        &self,
        def: &Arc<WorkflowDefinition>,
        key: &str,
    ) -> Result<(), EngineError> {
        self.evaluate(def, key, EventRef::KvChange { key }).await
    }

    async fn evaluate(
        &self,
        def: &Arc<WorkflowDefinition>,
        key: &str,
        event: EventRef<'_>,
    ) -> Result<(), EngineError> {
        let codec = def.codec.seeded(key, &def.id);

        // Load the execution; subject triggers create it on first contact
        let state: Box<dyn AnyState> = match self.state.load(key, &codec).await? {
            Some((state, _revision)) => state,
            None => match event {
                EventRef::Message { .. } => codec.new_state(),
                EventRef::KvChange { .. } => {
                    debug!(key, "state gone before evaluation; skipping");
                    return Ok(());
                }
            },
        };

        // Engine backstop: a runaway iteration count escalates without a rule
        {
            let base = state.base();
            if base.is_running() && base.iteration > def.max_iterations {
                warn!(
                    workflow = %def.id,
                    key,
                    iteration = base.iteration,
                    cap = def.max_iterations,
                    "iteration cap exceeded; synthesizing escalation"
                );
                self.synthesize_escalation(def, &codec, key).await;
                return Ok(());
            }
        }

        let message = match event {
            EventRef::Message { payload, .. } => Some(payload),
            EventRef::KvChange { .. } => None,
        };

        let selected: Option<Rule> = {
            let ctx = RuleContext::new(state.as_ref(), message)?;
            def.rules
                .iter()
                .find(|rule| {
                    let triggered = match event {
                        EventRef::Message { subject, .. } => rule.trigger.matches_subject(subject),
                        EventRef::KvChange { key } => rule.trigger.matches_key(key),
                    };
                    triggered && rule.conditions.iter().all(|c| c.evaluate(&ctx))
                })
                .cloned()
        };

        let Some(rule) = selected else {
            trace!(workflow = %def.id, key, "no rule matched");
            return Ok(());
        };

        debug!(
            workflow = %def.id,
            rule = %rule.id,
            key,
            action = rule.action.kind(),
            phase = %state.base().phase,
            "rule selected"
        );

        self.execute(def, &codec, key, &rule, state.as_ref(), message)
            .await
    }

    async fn execute(
        &self,
        def: &Arc<WorkflowDefinition>,
        codec: &StateCodec,
        key: &str,
        rule: &Rule,
        state: &dyn AnyState,
        message: Option<&dyn AnyPayload>,
    ) -> Result<(), EngineError> {
        let conditions = rule.conditions.as_slice();
        match &rule.action {
            Action::Mutate(mutate) => {
                let mutate = mutate.clone();
                self.commit(codec, key, conditions, message, |state| {
                    mutate(state, message)
                })
                .await?;
                Ok(())
            }

            Action::Publish { subject, build } => {
                let payload = {
                    let ctx = RuleContext::new(state, message)?;
                    build(&ctx).map_err(EngineError::from)?
                };
                self.dispatcher.publish(subject, payload.as_ref()).await?;
                Ok(())
            }

            Action::PublishWithMutation {
                subject,
                build,
                mutate,
            } => {
                let build = build.clone();
                let mutate = mutate.clone();
                let committed = self
                    .commit(codec, key, conditions, message, |state| {
                        let payload = {
                            let ctx = RuleContext::new(&*state, message)?;
                            build(&ctx)?
                        };
                        mutate(state, message)?;
                        Ok(payload)
                    })
                    .await?;

                if let Some(payload) = committed {
                    self.publish_after_commit(subject, payload.as_ref(), key).await;
                }
                Ok(())
            }

            Action::CompleteWithEvent { subject, build } => {
                let build = build.clone();
                let committed = self
                    .commit(codec, key, conditions, message, |state| {
                        let payload = {
                            let ctx = RuleContext::new(&*state, message)?;
                            build(&ctx)?
                        };
                        state.base_mut().status = ExecutionStatus::Completed;
                        Ok(payload)
                    })
                    .await?;

                if let Some(payload) = committed {
                    self.publish_after_commit(subject, payload.as_ref(), key).await;
                    debug!(workflow = %def.id, key, "execution completed");
                }
                Ok(())
            }

            Action::PublishAsync {
                subject,
                build,
                result_schema,
                on_result,
            } => {
                let task_id = Uuid::now_v7().to_string();
                let build = build.clone();
                let reserved_task_id = task_id.clone();
                let committed = self
                    .commit(codec, key, conditions, message, move |state| {
                        let payload = {
                            let ctx = RuleContext::new(&*state, message)?;
                            build(&ctx)?
                        };
                        state.base_mut().pending_task_id = Some(reserved_task_id.clone());
                        Ok(payload)
                    })
                    .await?;

                let Some(mut payload) = committed else {
                    return Ok(());
                };

                self.pending.insert(
                    task_id.clone(),
                    PendingCallback {
                        def: def.clone(),
                        state_key: key.to_string(),
                        result_schema: result_schema.clone(),
                        on_result: on_result.clone(),
                    },
                );

                let meta = CallbackMeta {
                    task_id,
                    callback_subject: self.callback_subject.clone(),
                    execution_id: key.to_string(),
                };
                if let Err(err) = self
                    .dispatcher
                    .publish_with_callback(subject, &mut payload, &meta)
                    .await
                {
                    warn!(subject, key, %err, "async dispatch failed after commit");
                }
                Ok(())
            }
        }
    }

    /// Handle a reply on the callback subject
    pub async fn on_callback(&self, result: AsyncStepResult) -> Result<(), EngineError> {
        let Some((_, pending)) = self.pending.remove(&result.task_id) else {
            warn!(task_id = %result.task_id, "callback for unknown task id; dropping");
            return Ok(());
        };

        let decoded: Option<Box<dyn AnyPayload>> = if result.is_success() {
            match self
                .registry
                .decode_result(&pending.result_schema, &result.output)
            {
                Ok(payload) => Some(payload),
                Err(err) => {
                    warn!(
                        task_id = %result.task_id,
                        schema = %pending.result_schema,
                        %err,
                        "undecodable async result; dropping"
                    );
                    return Ok(());
                }
            }
        } else {
            None
        };

        let codec = pending.def.codec.seeded(&pending.state_key, &pending.def.id);
        let on_result = pending.on_result.clone();
        let task_id = result.task_id.clone();

        self.commit(&codec, &pending.state_key, &[], None, |state| {
            on_result(state, &result, decoded.as_deref())?;
            let base = state.base_mut();
            if base.pending_task_id.as_deref() == Some(task_id.as_str()) {
                base.pending_task_id = None;
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Run a mutation-bearing step inside the CAS loop
    ///
    /// The rule's conditions are re-verified against the state each CAS
    /// attempt observes: a conflicting writer may have advanced the phase,
    /// and a retry must not stomp that transition. When the conditions no
    /// longer hold the action aborts as a no-op (`Ok(None)`); the same is
    /// returned when the mutator cannot run against the stored state type,
    /// after routing the execution to the mutator-failure phase.
    async fn commit<R>(
        &self,
        codec: &StateCodec,
        key: &str,
        conditions: &[Condition],
        message: Option<&dyn AnyPayload>,
        mut f: impl FnMut(&mut dyn AnyState) -> Result<R, ActionError>,
    ) -> Result<Option<R>, EngineError> {
        let mut mismatch: Option<String> = None;

        let result = self
            .state
            .transition_with(key, codec, |state| {
                {
                    let ctx = RuleContext::new(&*state, message)?;
                    if !conditions.iter().all(|c| c.evaluate(&ctx)) {
                        return Err(StateError::Aborted);
                    }
                }
                f(state).map_err(|err| match err {
                    ActionError::TypeMismatch(expected) => {
                        let detail = format!("mutator type mismatch: expected {expected}");
                        mismatch = Some(detail.clone());
                        StateError::Mutator(detail)
                    }
                    other => StateError::from(other),
                })
            })
            .await;

        match result {
            Ok((_state, output)) => Ok(Some(output)),
            Err(StateError::Aborted) => {
                trace!(key, "conditions no longer hold; skipping action");
                Ok(None)
            }
            // A concurrent writer reached a terminal status first; the
            // freeze invariant turns the action into a no-op
            Err(StateError::Terminal { .. }) => {
                trace!(key, "execution became terminal; skipping action");
                Ok(None)
            }
            Err(_) if mismatch.is_some() => {
                let detail = mismatch.unwrap_or_default();
                error!(key, %detail, "routing execution to mutator failure phase");
                self.route_to_failure(codec, key, detail).await;
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Record a mutator failure as a failure phase for `handle-error` rules
    async fn route_to_failure(&self, codec: &StateCodec, key: &str, detail: String) {
        let result = self
            .state
            .transition(key, codec, |state| {
                let base = state.base_mut();
                base.error = Some(detail.clone());
                base.phase = MUTATOR_FAILED_PHASE.to_string();
                Ok(())
            })
            .await;

        if let Err(err) = result {
            error!(key, %err, "could not record mutator failure");
        }
    }

    /// Publish after a successful commit; failures rely on the next KV tick
    async fn publish_after_commit(&self, subject: &str, payload: &dyn AnyPayload, key: &str) {
        if let Err(err) = self.dispatcher.publish(subject, payload).await {
            warn!(
                subject,
                key,
                %err,
                "publish failed after commit; dispatched-phase guard covers the retry"
            );
        }
    }

    /// Backstop escalation when the iteration cap is exceeded
    async fn synthesize_escalation(
        &self,
        def: &Arc<WorkflowDefinition>,
        codec: &StateCodec,
        key: &str,
    ) {
        let cap = def.max_iterations;
        let result = self
            .state
            .transition(key, codec, |state| {
                let base = state.base_mut();
                base.status = ExecutionStatus::Escalated;
                base.error = Some(format!("iteration exceeded workflow cap of {cap}"));
                Ok(())
            })
            .await;

        match result {
            Ok(_) => {}
            Err(StateError::Terminal { .. }) => {}
            Err(err) => error!(workflow = %def.id, key, %err, "backstop escalation failed"),
        }
    }

}
