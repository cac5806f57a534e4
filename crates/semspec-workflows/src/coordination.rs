//! Coordination workflow: focus -> N parallel planners -> synthesis
//!
//! The only non-review workflow, and the only place the engine consumes
//! result messages itself: planner results arrive on
//! `workflow.result.coordination-planner.*` and are merged into state by
//! the engine, making it the single KV writer for planner results (no CAS
//! contention between parallel planners). The focus and synthesis
//! handlers are Participant components that advance the phase in the KV
//! cell like every other component.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use semspec_engine::rules::{
    build_from_state, mutate_state, Action, ActionError, Condition, Rule, StateKeyFn, Trigger,
    WorkflowDefinition,
};
use semspec_engine::runtime::MUTATOR_FAILED_PHASE;
use semspec_engine::state::{ExecutionState, ExecutionStatus, HasExecutionState, StateCodec};
use semspec_messages::payloads::{
    CoordinationCompletedEvent, CoordinationPlannerResult, CoordinationSynthesisRequest,
    CoordinationTrigger, Focus, PlanCoordinatorRequest, UserErrorSignal,
};

use crate::subjects;

/// Coordination phases
pub mod phases {
    pub const FOCUSING: &str = "focusing";
    pub const FOCUS_DISPATCHED: &str = "focus-dispatched";
    pub const PLANNERS_DISPATCHED: &str = "planners-dispatched";
    pub const SYNTHESIZING: &str = "synthesizing";
    pub const SYNTHESIS_DISPATCHED: &str = "synthesis-dispatched";
    pub const SYNTHESIZED: &str = "synthesized";
    pub const FOCUS_FAILED: &str = "focus_failed";
    pub const PLANNERS_FAILED: &str = "planners_failed";
    pub const SYNTHESIS_FAILED: &str = "synthesis_failed";
}

/// Planner result status recorded as completed
pub const PLANNER_COMPLETED: &str = "completed";

/// One planner's recorded outcome
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlannerOutcome {
    pub status: String,

    #[serde(default)]
    pub result: Value,

    #[serde(default)]
    pub error: String,

    #[serde(default)]
    pub llm_request_id: String,
}

impl PlannerOutcome {
    /// Whether this planner completed successfully
    pub fn is_success(&self) -> bool {
        self.status == PLANNER_COMPLETED
    }
}

/// Per-execution state of the coordination workflow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinationState {
    #[serde(flatten)]
    pub execution: ExecutionState,

    #[serde(default)]
    pub slug: String,

    #[serde(default)]
    pub objective: String,

    #[serde(default)]
    pub focus_areas: Vec<String>,

    #[serde(default)]
    pub max_planners: u32,

    /// Focus assignments the coordinator component wrote
    #[serde(default)]
    pub focuses: Vec<Focus>,

    /// How many planners were dispatched; written by the focus handler
    #[serde(default)]
    pub planner_count: u32,

    /// Planner outcomes keyed by planner id; merged by the engine only
    #[serde(default)]
    pub planner_results: BTreeMap<String, PlannerOutcome>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesized_plan: Option<Value>,
}

impl CoordinationState {
    /// All planners reported
    pub fn all_reported(&self) -> bool {
        self.planner_count > 0 && self.planner_results.len() as u32 >= self.planner_count
    }

    /// At least one planner succeeded
    pub fn any_succeeded(&self) -> bool {
        self.planner_results.values().any(PlannerOutcome::is_success)
    }

    /// Non-empty LLM request ids across all planner results
    pub fn llm_request_ids(&self) -> Vec<String> {
        self.planner_results
            .values()
            .filter(|outcome| !outcome.llm_request_id.is_empty())
            .map(|outcome| outcome.llm_request_id.clone())
            .collect()
    }
}

impl HasExecutionState for CoordinationState {
    fn execution(&self) -> &ExecutionState {
        &self.execution
    }

    fn execution_mut(&mut self) -> &mut ExecutionState {
        &mut self.execution
    }
}

/// The coordination workflow definition
pub fn coordination_workflow() -> WorkflowDefinition {
    let bucket = subjects::STATE_BUCKET;
    let prefix = "coordination";
    let kv_prefix = format!("{prefix}.");
    let kv = || Trigger::watch_kv(bucket, kv_prefix.as_str());

    let trigger_key: StateKeyFn = Arc::new(|message| {
        let trigger = message
            .as_any()
            .downcast_ref::<CoordinationTrigger>()
            .ok_or(ActionError::MissingMessage)?;
        Ok(format!("coordination.{}", trigger.slug))
    });

    let accept_trigger = Rule::new(
        "accept-trigger",
        Trigger::on_subject(
            subjects::STREAM_WORKFLOW,
            subjects::TRIGGER_COORDINATION,
            trigger_key,
        ),
        vec![Condition::phase_is("")],
        Action::mutate(mutate_state::<CoordinationState, _>(|state, message| {
            let trigger = message
                .and_then(|m| m.as_any().downcast_ref::<CoordinationTrigger>())
                .ok_or(ActionError::MissingMessage)?;
            state.slug = trigger.slug.clone();
            state.objective = trigger.objective.clone();
            state.focus_areas = trigger.focus_areas.clone();
            state.max_planners = trigger.max_planners;
            state.execution.phase = phases::FOCUSING.to_string();
            Ok(())
        })),
    );

    let dispatch_focus = Rule::new(
        "dispatch-focus",
        kv(),
        vec![
            Condition::phase_is(phases::FOCUSING),
            Condition::NotCompleted,
        ],
        Action::publish_with_mutation(
            subjects::ASYNC_PLAN_COORDINATOR,
            build_from_state::<CoordinationState, PlanCoordinatorRequest, _>(|state| {
                Ok(PlanCoordinatorRequest {
                    execution_id: state.execution.id.clone(),
                    objective: state.objective.clone(),
                    focus_areas: state.focus_areas.clone(),
                    max_planners: state.max_planners,
                    ..Default::default()
                })
            }),
            mutate_state::<CoordinationState, _>(|state, _message| {
                state.execution.phase = phases::FOCUS_DISPATCHED.to_string();
                Ok(())
            }),
        ),
    )
    .with_description("the focus handler fans out planners and sets planner_count");

    // Engine-side merge: the fan-in point. The planner-result consumer is
    // the single writer for planner_results, so parallel planners never
    // contend on the KV cell.
    let result_key: StateKeyFn = Arc::new(|message| {
        let result = message
            .as_any()
            .downcast_ref::<CoordinationPlannerResult>()
            .ok_or(ActionError::MissingMessage)?;
        Ok(result.execution_id.clone())
    });
    let planner_result = Rule::new(
        "planner-result",
        Trigger::on_subject(
            subjects::STREAM_WORKFLOW,
            subjects::COORDINATION_RESULTS,
            result_key,
        ),
        vec![
            Condition::phase_is(phases::PLANNERS_DISPATCHED),
            Condition::NotCompleted,
        ],
        Action::mutate(mutate_state::<CoordinationState, _>(|state, message| {
            let result = message
                .and_then(|m| m.as_any().downcast_ref::<CoordinationPlannerResult>())
                .ok_or(ActionError::MissingMessage)?;

            let known = state.planner_results.contains_key(&result.planner_id);
            if !known && state.all_reported() {
                // Late straggler beyond planner_count; keep the invariant
                return Ok(());
            }

            state.planner_results.insert(
                result.planner_id.clone(),
                PlannerOutcome {
                    status: result.status.clone(),
                    result: result.result.clone(),
                    error: result.error.clone(),
                    llm_request_id: result.llm_request_id.clone(),
                },
            );

            if state.all_reported() {
                state.execution.phase = if state.any_succeeded() {
                    phases::SYNTHESIZING.to_string()
                } else {
                    phases::PLANNERS_FAILED.to_string()
                };
            }
            Ok(())
        })),
    )
    .with_description("merge one planner's result; last report picks the next phase");

    let dispatch_synthesis = Rule::new(
        "dispatch-synthesis",
        kv(),
        vec![
            Condition::phase_is(phases::SYNTHESIZING),
            Condition::NotCompleted,
        ],
        Action::publish_with_mutation(
            subjects::ASYNC_COORDINATION_SYNTHESIS,
            build_from_state::<CoordinationState, CoordinationSynthesisRequest, _>(|state| {
                Ok(CoordinationSynthesisRequest {
                    execution_id: state.execution.id.clone(),
                    objective: state.objective.clone(),
                    planner_results: serde_json::to_value(&state.planner_results)
                        .map_err(|e| ActionError::Build(e.to_string()))?,
                })
            }),
            mutate_state::<CoordinationState, _>(|state, _message| {
                state.execution.phase = phases::SYNTHESIS_DISPATCHED.to_string();
                Ok(())
            }),
        ),
    );

    let coordination_complete = Rule::new(
        "coordination-complete",
        kv(),
        vec![
            Condition::phase_is(phases::SYNTHESIZED),
            Condition::NotCompleted,
        ],
        Action::complete_with_event(
            subjects::EVENTS_COORDINATION_COMPLETED,
            build_from_state::<CoordinationState, CoordinationCompletedEvent, _>(|state| {
                Ok(CoordinationCompletedEvent {
                    execution_id: state.execution.id.clone(),
                    planner_count: state.planner_count,
                    llm_request_ids: state.llm_request_ids(),
                    synthesized_plan: state.synthesized_plan.clone().unwrap_or(Value::Null),
                })
            }),
        ),
    );

    let handle_error = Rule::new(
        "handle-error",
        kv(),
        vec![
            Condition::phase_in([
                phases::FOCUS_FAILED,
                phases::PLANNERS_FAILED,
                phases::SYNTHESIS_FAILED,
                MUTATOR_FAILED_PHASE,
            ]),
            Condition::NotCompleted,
        ],
        Action::publish_with_mutation(
            subjects::USER_ERROR,
            build_from_state::<CoordinationState, UserErrorSignal, _>(|state| {
                Ok(UserErrorSignal {
                    execution_id: state.execution.id.clone(),
                    workflow_id: state.execution.workflow_id.clone(),
                    error: state
                        .execution
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("coordination failed in phase {}", state.execution.phase)),
                })
            }),
            mutate_state::<CoordinationState, _>(|state, _message| {
                state.execution.status = ExecutionStatus::Failed;
                if state.execution.error.is_none() {
                    state.execution.error = Some(format!(
                        "coordination failed in phase {}",
                        state.execution.phase
                    ));
                }
                Ok(())
            }),
        ),
    );

    WorkflowDefinition::new(
        "coordination",
        bucket,
        prefix,
        StateCodec::of::<CoordinationState>(),
    )
    .with_description("fan-out planning with engine-side fan-in")
    .with_timeout(Duration::from_secs(30 * 60))
    .with_rules([
        accept_trigger,
        dispatch_focus,
        planner_result,
        dispatch_synthesis,
        coordination_complete,
        handle_error,
    ])
}
