//! Task execution workflow
//!
//! A 3-stage develop -> validate -> review pipeline over one execution per
//! task, keyed `task-execution.<slug>.<task_id>`. One shared retry budget
//! covers both structural-validation failures and fixable review
//! rejections; each retry routes back to the developer with a revision
//! prompt that quotes the previous attempt and the failure context.
//!
//! Terminal routes: approved tasks complete, misscoped/architectural
//! rejections trigger plan refinement, oversized tasks trigger task
//! decomposition, unknown rejections and exhausted budgets escalate, and
//! component-declared failure phases surface a user error signal.

use std::fmt::Write as _;
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
    CodeReviewRequest, DeveloperRequest, EscalationSignal, PlanRefinementTrigger,
    RejectionCategorizedEvent, StructuralValidationRequest, TaskCompleteEvent,
    TaskDecompositionTrigger, TaskExecutionTrigger, UserErrorSignal, ValidationPassedEvent,
};

use crate::subjects;

/// Shared retry budget across validation failures and fixable rejections
pub const MAX_RETRIES: u32 = 3;

/// Pipeline phases
pub mod phases {
    pub const DEVELOPING: &str = "developing";
    pub const DEVELOPING_DISPATCHED: &str = "developing-dispatched";
    pub const DEVELOPED: &str = "developed";
    pub const VALIDATING: &str = "validating";
    pub const VALIDATING_DISPATCHED: &str = "validating-dispatched";
    pub const VALIDATED: &str = "validated";
    pub const VALIDATION_CHECKED: &str = "validation-checked";
    pub const REVIEWING: &str = "reviewing";
    pub const REVIEWING_DISPATCHED: &str = "reviewing-dispatched";
    pub const REVIEWED: &str = "reviewed";
    pub const EVALUATED: &str = "evaluated";
    pub const DEVELOPMENT_FAILED: &str = "development_failed";
    pub const VALIDATION_ERROR: &str = "validation_error";
    pub const REVIEW_FAILED: &str = "review_failed";
}

/// Reviewer rejection categories
pub mod rejection {
    pub const FIXABLE: &str = "fixable";
    pub const MISSCOPED: &str = "misscoped";
    pub const ARCHITECTURAL: &str = "architectural";
    pub const TOO_BIG: &str = "too_big";
}

/// Which stage sent the task back to the developer
pub mod revision_source {
    pub const VALIDATION: &str = "validation";
    pub const REVIEW: &str = "review";
}

/// One structural check outcome written by the validator component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check: String,
    pub passed: bool,

    #[serde(default)]
    pub message: String,
}

/// Per-execution state of the task execution pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskExecutionState {
    #[serde(flatten)]
    pub execution: ExecutionState,

    #[serde(default)]
    pub slug: String,

    #[serde(default)]
    pub title: String,

    /// Original task prompt from the trigger
    #[serde(default)]
    pub prompt: String,

    #[serde(default)]
    pub task_id: String,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub context_request_id: String,

    #[serde(default)]
    pub files_modified: Vec<String>,

    /// Previous developer response, stored as the raw JSON string the
    /// developer component produced
    #[serde(default)]
    pub developer_output: String,

    /// Set by the validator component; cleared before a retry pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_passed: Option<bool>,

    #[serde(default)]
    pub checks_run: u32,

    /// Kept across a validation retry so the revision prompt can quote it
    #[serde(default)]
    pub check_results: Vec<CheckResult>,

    #[serde(default)]
    pub verdict: String,

    #[serde(default)]
    pub rejection_type: String,

    #[serde(default)]
    pub feedback: String,

    #[serde(default)]
    pub revision_source: String,

    #[serde(default)]
    pub llm_request_id: String,
}

impl HasExecutionState for TaskExecutionState {
    fn execution(&self) -> &ExecutionState {
        &self.execution
    }

    fn execution_mut(&mut self) -> &mut ExecutionState {
        &mut self.execution
    }
}

/// Assemble the developer prompt; revision passes embed the prior attempt
fn developer_prompt(state: &TaskExecutionState) -> String {
    if state.revision_source.is_empty() {
        return state.prompt.clone();
    }

    let mut prompt = String::new();
    let _ = writeln!(prompt, "## Task");
    let _ = writeln!(prompt, "{}", state.prompt);
    let _ = writeln!(prompt);

    let _ = writeln!(prompt, "## Previous attempt");
    let _ = writeln!(prompt, "{}", decode_developer_output(&state.developer_output));
    if !state.files_modified.is_empty() {
        let _ = writeln!(prompt);
        let _ = writeln!(prompt, "Files modified:");
        for file in &state.files_modified {
            let _ = writeln!(prompt, "- {file}");
        }
    }
    let _ = writeln!(prompt);

    match state.revision_source.as_str() {
        revision_source::VALIDATION => {
            let _ = writeln!(prompt, "## Structural check failures");
            let _ = writeln!(
                prompt,
                "The automated structural checks rejected the previous attempt. \
                 Fix these failures:"
            );
            for check in state.check_results.iter().filter(|c| !c.passed) {
                let _ = writeln!(prompt, "- {}: {}", check.check, check.message);
            }
        }
        _ => {
            let _ = writeln!(prompt, "## Reviewer feedback");
            let _ = writeln!(prompt, "Address this feedback from code review:");
            let _ = writeln!(prompt, "{}", state.feedback);
        }
    }
    let _ = writeln!(prompt);
    let _ = writeln!(
        prompt,
        "Apply the smallest change that resolves the issues above."
    );
    prompt
}

/// The stored developer output is a JSON document; unwrap plain strings,
/// pretty-print anything structured, fall back to the raw text
fn decode_developer_output(raw: &str) -> String {
    if raw.is_empty() {
        return "(no previous output recorded)".to_string();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::String(text)) => text,
        Ok(other) => serde_json::to_string_pretty(&other).unwrap_or_else(|_| raw.to_string()),
        Err(_) => raw.to_string(),
    }
}

fn escalate_action(reason: &'static str, last_verdict_from_state: bool) -> Action {
    Action::publish_with_mutation(
        subjects::USER_ESCALATE,
        build_from_state::<TaskExecutionState, EscalationSignal, _>(move |state| {
            Ok(EscalationSignal {
                reason: reason.to_string(),
                iteration: state.execution.iteration,
                last_verdict: if last_verdict_from_state {
                    state.verdict.clone()
                } else {
                    "validation_failed".to_string()
                },
                execution_id: state.execution.id.clone(),
            })
        }),
        mutate_state::<TaskExecutionState, _>(move |state, _message| {
            state.execution.status = ExecutionStatus::Escalated;
            state.execution.error = Some(reason.to_string());
            Ok(())
        }),
    )
}

/// The task execution workflow definition (17 rules)
pub fn task_execution_workflow() -> WorkflowDefinition {
    let bucket = subjects::STATE_BUCKET;
    let prefix = "task-execution";
    let kv_prefix = format!("{prefix}.");
    let kv = || Trigger::watch_kv(bucket, kv_prefix.as_str());

    let trigger_key: StateKeyFn = Arc::new(|message| {
        let trigger = message
            .as_any()
            .downcast_ref::<TaskExecutionTrigger>()
            .ok_or(ActionError::MissingMessage)?;
        let task_id = trigger
            .task_id()
            .ok_or_else(|| ActionError::Build("trigger data is missing task_id".into()))?;
        Ok(format!("task-execution.{}.{}", trigger.slug, task_id))
    });

    let accept_trigger = Rule::new(
        "accept-trigger",
        Trigger::on_subject(
            subjects::STREAM_WORKFLOW,
            subjects::TRIGGER_TASK_EXECUTION,
            trigger_key,
        ),
        vec![Condition::phase_is("")],
        Action::mutate(mutate_state::<TaskExecutionState, _>(|state, message| {
            let trigger = message
                .and_then(|m| m.as_any().downcast_ref::<TaskExecutionTrigger>())
                .ok_or(ActionError::MissingMessage)?;
            state.slug = trigger.slug.clone();
            state.title = trigger.title.clone();
            state.prompt = trigger.prompt.clone();
            state.task_id = trigger.task_id().unwrap_or_default().to_string();
            state.model = trigger.model().unwrap_or_default().to_string();
            state.context_request_id = trigger.context_request_id().unwrap_or_default().to_string();
            state.execution.phase = phases::DEVELOPING.to_string();
            Ok(())
        })),
    );

    let dispatch_develop = Rule::new(
        "dispatch-develop",
        kv(),
        vec![
            Condition::phase_is(phases::DEVELOPING),
            Condition::NotCompleted,
        ],
        Action::publish_with_mutation(
            subjects::AGENT_TASK_DEVELOPMENT,
            build_from_state::<TaskExecutionState, DeveloperRequest, _>(|state| {
                Ok(DeveloperRequest {
                    execution_id: state.execution.id.clone(),
                    task_id: state.task_id.clone(),
                    slug: state.slug.clone(),
                    prompt: developer_prompt(state),
                    model: state.model.clone(),
                    iteration: state.execution.iteration,
                    revision_source: state.revision_source.clone(),
                })
            }),
            mutate_state::<TaskExecutionState, _>(|state, _message| {
                state.execution.phase = phases::DEVELOPING_DISPATCHED.to_string();
                Ok(())
            }),
        ),
    );

    let develop_completed = Rule::new(
        "develop-completed",
        kv(),
        vec![
            Condition::phase_is(phases::DEVELOPED),
            Condition::NotCompleted,
        ],
        Action::mutate(mutate_state::<TaskExecutionState, _>(|state, _message| {
            state.execution.phase = phases::VALIDATING.to_string();
            Ok(())
        })),
    );

    let dispatch_validate = Rule::new(
        "dispatch-validate",
        kv(),
        vec![
            Condition::phase_is(phases::VALIDATING),
            Condition::NotCompleted,
        ],
        Action::publish_with_mutation(
            subjects::ASYNC_STRUCTURAL_VALIDATOR,
            build_from_state::<TaskExecutionState, StructuralValidationRequest, _>(|state| {
                Ok(StructuralValidationRequest {
                    execution_id: state.execution.id.clone(),
                    task_id: state.task_id.clone(),
                    slug: state.slug.clone(),
                    files_modified: state.files_modified.clone(),
                    iteration: state.execution.iteration,
                })
            }),
            mutate_state::<TaskExecutionState, _>(|state, _message| {
                state.execution.phase = phases::VALIDATING_DISPATCHED.to_string();
                Ok(())
            }),
        ),
    );

    let validate_completed = Rule::new(
        "validate-completed",
        kv(),
        vec![
            Condition::phase_is(phases::VALIDATED),
            Condition::NotCompleted,
        ],
        Action::mutate(mutate_state::<TaskExecutionState, _>(|state, _message| {
            state.execution.phase = phases::VALIDATION_CHECKED.to_string();
            Ok(())
        })),
    );

    let validation_passed = Rule::new(
        "validation-passed",
        kv(),
        vec![
            Condition::phase_is(phases::VALIDATION_CHECKED),
            Condition::field_equals("validation_passed", true),
            Condition::NotCompleted,
        ],
        Action::publish_with_mutation(
            subjects::EVENTS_TASK_VALIDATION_PASSED,
            build_from_state::<TaskExecutionState, ValidationPassedEvent, _>(|state| {
                Ok(ValidationPassedEvent {
                    task_id: state.task_id.clone(),
                    slug: state.slug.clone(),
                    checks_run: state.checks_run,
                })
            }),
            mutate_state::<TaskExecutionState, _>(|state, _message| {
                state.execution.phase = phases::REVIEWING.to_string();
                Ok(())
            }),
        ),
    );

    let validation_failed_retry = Rule::new(
        "validation-failed-retry",
        kv(),
        vec![
            Condition::phase_is(phases::VALIDATION_CHECKED),
            Condition::field_equals("validation_passed", false),
            Condition::iteration_less_than(MAX_RETRIES),
            Condition::NotCompleted,
        ],
        Action::mutate(mutate_state::<TaskExecutionState, _>(|state, _message| {
            state.execution.iteration += 1;
            state.revision_source = revision_source::VALIDATION.to_string();
            state.validation_passed = None;
            state.checks_run = 0;
            state.execution.phase = phases::DEVELOPING.to_string();
            Ok(())
        })),
    )
    .with_description("send the task back to the developer with the failing checks");

    let validation_failed_escalate = Rule::new(
        "validation-failed-escalate",
        kv(),
        vec![
            Condition::phase_is(phases::VALIDATION_CHECKED),
            Condition::field_equals("validation_passed", false),
            Condition::iteration_less_than(MAX_RETRIES).negate(),
            Condition::NotCompleted,
        ],
        escalate_action("max task execution retries exceeded", false),
    );

    let dispatch_review = Rule::new(
        "dispatch-review",
        kv(),
        vec![
            Condition::phase_is(phases::REVIEWING),
            Condition::NotCompleted,
        ],
        Action::publish_with_mutation(
            subjects::AGENT_TASK_REVIEW,
            build_from_state::<TaskExecutionState, CodeReviewRequest, _>(|state| {
                Ok(CodeReviewRequest {
                    execution_id: state.execution.id.clone(),
                    task_id: state.task_id.clone(),
                    slug: state.slug.clone(),
                    prompt: state.prompt.clone(),
                    developer_output: state.developer_output.clone(),
                    files_modified: state.files_modified.clone(),
                    iteration: state.execution.iteration,
                })
            }),
            mutate_state::<TaskExecutionState, _>(|state, _message| {
                state.execution.phase = phases::REVIEWING_DISPATCHED.to_string();
                Ok(())
            }),
        ),
    );

    let review_completed = Rule::new(
        "review-completed",
        kv(),
        vec![
            Condition::phase_is(phases::REVIEWED),
            Condition::NotCompleted,
        ],
        Action::mutate(mutate_state::<TaskExecutionState, _>(|state, _message| {
            state.execution.phase = phases::EVALUATED.to_string();
            Ok(())
        })),
    );

    let handle_approved = Rule::new(
        "handle-approved",
        kv(),
        vec![
            Condition::phase_is(phases::EVALUATED),
            Condition::field_equals("verdict", "approved"),
            Condition::NotCompleted,
        ],
        Action::complete_with_event(
            subjects::TASK_COMPLETE,
            build_from_state::<TaskExecutionState, TaskCompleteEvent, _>(|state| {
                Ok(TaskCompleteEvent {
                    task_id: state.task_id.clone(),
                    slug: state.slug.clone(),
                    iterations: state.execution.iteration,
                })
            }),
        ),
    );

    let handle_fixable_retry = Rule::new(
        "handle-fixable-retry",
        kv(),
        vec![
            Condition::phase_is(phases::EVALUATED),
            Condition::field_not_equals("verdict", "approved"),
            Condition::field_equals("rejection_type", rejection::FIXABLE),
            Condition::iteration_less_than(MAX_RETRIES),
            Condition::NotCompleted,
        ],
        Action::publish_with_mutation(
            subjects::EVENTS_TASK_REJECTION,
            build_from_state::<TaskExecutionState, RejectionCategorizedEvent, _>(|state| {
                Ok(RejectionCategorizedEvent {
                    task_id: state.task_id.clone(),
                    slug: state.slug.clone(),
                    rejection_type: state.rejection_type.clone(),
                    feedback: state.feedback.clone(),
                    iteration: state.execution.iteration,
                })
            }),
            // Feedback is preserved for the next developer prompt
            mutate_state::<TaskExecutionState, _>(|state, _message| {
                state.execution.iteration += 1;
                state.revision_source = revision_source::REVIEW.to_string();
                state.verdict.clear();
                state.rejection_type.clear();
                state.execution.phase = phases::DEVELOPING.to_string();
                Ok(())
            }),
        ),
    );

    let handle_max_retries = Rule::new(
        "handle-max-retries",
        kv(),
        vec![
            Condition::phase_is(phases::EVALUATED),
            Condition::field_not_equals("verdict", "approved"),
            Condition::field_equals("rejection_type", rejection::FIXABLE),
            Condition::iteration_less_than(MAX_RETRIES).negate(),
            Condition::NotCompleted,
        ],
        escalate_action("max task execution retries exceeded", true),
    );

    let handle_misscoped = Rule::new(
        "handle-misscoped",
        kv(),
        vec![
            Condition::phase_is(phases::EVALUATED),
            Condition::field_not_equals("verdict", "approved"),
            Condition::Or(vec![
                Condition::field_equals("rejection_type", rejection::MISSCOPED),
                Condition::field_equals("rejection_type", rejection::ARCHITECTURAL),
            ]),
            Condition::NotCompleted,
        ],
        Action::complete_with_event(
            subjects::TRIGGER_PLAN_REFINEMENT,
            build_from_state::<TaskExecutionState, PlanRefinementTrigger, _>(|state| {
                Ok(PlanRefinementTrigger {
                    original_task_id: state.task_id.clone(),
                    plan_slug: state.slug.clone(),
                    feedback: state.feedback.clone(),
                })
            }),
        ),
    )
    .with_description("route scope problems back to plan refinement");

    let handle_too_big = Rule::new(
        "handle-too-big",
        kv(),
        vec![
            Condition::phase_is(phases::EVALUATED),
            Condition::field_not_equals("verdict", "approved"),
            Condition::field_equals("rejection_type", rejection::TOO_BIG),
            Condition::NotCompleted,
        ],
        Action::complete_with_event(
            subjects::TRIGGER_TASK_DECOMPOSITION,
            build_from_state::<TaskExecutionState, TaskDecompositionTrigger, _>(|state| {
                Ok(TaskDecompositionTrigger {
                    original_task_id: state.task_id.clone(),
                    plan_slug: state.slug.clone(),
                    feedback: state.feedback.clone(),
                })
            }),
        ),
    );

    let handle_unknown_rejection = Rule::new(
        "handle-unknown-rejection",
        kv(),
        vec![
            Condition::phase_is(phases::EVALUATED),
            Condition::field_not_equals("verdict", "approved"),
            Condition::NotCompleted,
        ],
        escalate_action("unknown rejection type", true),
    )
    .with_description("catch-all after the known rejection routes");

    let handle_error = Rule::new(
        "handle-error",
        kv(),
        vec![
            Condition::phase_in([
                phases::DEVELOPMENT_FAILED,
                phases::VALIDATION_ERROR,
                phases::REVIEW_FAILED,
                MUTATOR_FAILED_PHASE,
            ]),
            Condition::NotCompleted,
        ],
        Action::publish_with_mutation(
            subjects::USER_ERROR,
            build_from_state::<TaskExecutionState, UserErrorSignal, _>(|state| {
                Ok(UserErrorSignal {
                    execution_id: state.execution.id.clone(),
                    workflow_id: state.execution.workflow_id.clone(),
                    error: state
                        .execution
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("component failed in phase {}", state.execution.phase)),
                })
            }),
            mutate_state::<TaskExecutionState, _>(|state, _message| {
                state.execution.status = ExecutionStatus::Failed;
                if state.execution.error.is_none() {
                    state.execution.error =
                        Some(format!("component failed in phase {}", state.execution.phase));
                }
                Ok(())
            }),
        ),
    );

    WorkflowDefinition::new(
        "task-execution",
        bucket,
        prefix,
        StateCodec::of::<TaskExecutionState>(),
    )
    .with_description("develop/validate/review pipeline for one task")
    .with_max_iterations(MAX_RETRIES + 2)
    .with_timeout(Duration::from_secs(60 * 60))
    .with_rules([
        accept_trigger,
        dispatch_develop,
        develop_completed,
        dispatch_validate,
        validate_completed,
        validation_passed,
        validation_failed_retry,
        validation_failed_escalate,
        dispatch_review,
        review_completed,
        handle_approved,
        handle_fixable_retry,
        handle_max_retries,
        handle_misscoped,
        handle_too_big,
        handle_unknown_rejection,
        handle_error,
    ])
}
