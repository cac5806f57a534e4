//! Generic OODA review loop
//!
//! The nine-rule generator/reviewer/evaluator template shared by the plan,
//! phase, and task review workflows. A loop accepts a trigger, dispatches
//! the generator, waits for the Participant component to write its
//! completion phase, dispatches the reviewer the same way, and then routes
//! on the verdict: approve, send back for revision, or escalate once the
//! revision budget is spent.
//!
//! Revision passes synthesize a `REVISION REQUEST` prompt carrying the
//! original request, the previous reviewer summary, and the formatted
//! findings, instructing the generator to fix only the flagged issues.

pub mod phase;
pub mod plan;
pub mod task;

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use semspec_engine::rules::{
    build_from_state, mutate_state, Action, ActionError, BuildFn, Condition, Rule, StateKeyFn,
    Trigger, WorkflowDefinition,
};
use semspec_engine::runtime::MUTATOR_FAILED_PHASE;
use semspec_engine::state::{ExecutionStatus, HasExecutionState, StateCodec};
use semspec_messages::payloads::{
    ApprovedEvent, EscalationSignal, Finding, ReviewTrigger, RevisionRequestedEvent,
    UserErrorSignal,
};
use semspec_messages::AnyPayload;

use crate::subjects;

pub use phase::{phase_review_workflow, PhaseReviewState};
pub use plan::{plan_review_workflow, PlanReviewState};
pub use task::{task_review_workflow, TaskReviewState};

/// Verdict value that completes a loop
pub const VERDICT_APPROVED: &str = "approved";

/// Phases shared by every review loop
pub mod phases {
    pub const GENERATING: &str = "generating";
    pub const GENERATING_DISPATCHED: &str = "generating-dispatched";
    pub const REVIEWING: &str = "reviewing";
    pub const REVIEWING_DISPATCHED: &str = "reviewing-dispatched";
    pub const EVALUATED: &str = "evaluated";
    pub const GENERATOR_FAILED: &str = "generator_failed";
    pub const REVIEWER_FAILED: &str = "reviewer_failed";
}

/// State contract the three concrete review states implement
pub trait ReviewLoopState:
    HasExecutionState + Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Populate the workflow state from the trigger message
    fn apply_trigger(&mut self, trigger: &ReviewTrigger);

    fn slug(&self) -> &str;
    fn title(&self) -> &str;
    fn description(&self) -> &str;

    /// The original request prompt from the trigger
    fn request_prompt(&self) -> &str;

    /// Generator output, once the component has written it
    fn content(&self) -> Option<&Value>;

    fn verdict(&self) -> &str;
    fn review_summary(&self) -> &str;
    fn findings(&self) -> &[Finding];

    /// Drop stale generator output and the verdict before a revision pass
    ///
    /// Reviewer summary and findings survive: the next generator dispatch
    /// quotes them in the revision prompt.
    fn clear_round(&mut self);
}

/// Parameters of one concrete review loop
#[derive(Debug, Clone)]
pub struct ReviewLoopConfig {
    pub workflow_id: String,
    pub description: String,
    pub state_bucket: String,
    pub state_prefix: String,
    pub trigger_stream: String,
    pub trigger_subject: String,
    pub generator_subject: String,
    pub reviewer_subject: String,
    pub approved_subject: String,
    pub revision_subject: String,

    /// Phase the generator component writes when it finishes
    pub generator_completed_phase: String,

    /// Phase the reviewer component writes when it finishes
    pub reviewer_completed_phase: String,

    /// Revision passes allowed before escalation
    pub max_revisions: u32,
    pub timeout: Duration,
    pub escalation_reason: String,
}

impl ReviewLoopConfig {
    /// Create a config with the shared defaults
    pub fn new(workflow_id: impl Into<String>, state_prefix: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            description: String::new(),
            state_bucket: subjects::STATE_BUCKET.to_string(),
            state_prefix: state_prefix.into(),
            trigger_stream: subjects::STREAM_WORKFLOW.to_string(),
            trigger_subject: String::new(),
            generator_subject: String::new(),
            reviewer_subject: String::new(),
            approved_subject: String::new(),
            revision_subject: String::new(),
            generator_completed_phase: "generated".to_string(),
            reviewer_completed_phase: "reviewed".to_string(),
            max_revisions: 2,
            timeout: Duration::from_secs(30 * 60),
            escalation_reason: "max review iterations exceeded".to_string(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_trigger(mut self, stream: impl Into<String>, subject: impl Into<String>) -> Self {
        self.trigger_stream = stream.into();
        self.trigger_subject = subject.into();
        self
    }

    pub fn with_generator_subject(mut self, subject: impl Into<String>) -> Self {
        self.generator_subject = subject.into();
        self
    }

    pub fn with_reviewer_subject(mut self, subject: impl Into<String>) -> Self {
        self.reviewer_subject = subject.into();
        self
    }

    pub fn with_events(
        mut self,
        approved: impl Into<String>,
        revision: impl Into<String>,
    ) -> Self {
        self.approved_subject = approved.into();
        self.revision_subject = revision.into();
        self
    }

    pub fn with_completed_phases(
        mut self,
        generator: impl Into<String>,
        reviewer: impl Into<String>,
    ) -> Self {
        self.generator_completed_phase = generator.into();
        self.reviewer_completed_phase = reviewer.into();
        self
    }

    pub fn with_max_revisions(mut self, max: u32) -> Self {
        self.max_revisions = max;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_escalation_reason(mut self, reason: impl Into<String>) -> Self {
        self.escalation_reason = reason.into();
        self
    }
}

/// Builder producing the nine-rule review loop for one state type
pub struct ReviewLoop<S: ReviewLoopState> {
    config: ReviewLoopConfig,
    build_generator: Arc<dyn Fn(&S, String) -> Box<dyn AnyPayload> + Send + Sync>,
    build_reviewer: Arc<dyn Fn(&S) -> Box<dyn AnyPayload> + Send + Sync>,
}

impl<S: ReviewLoopState> ReviewLoop<S> {
    /// Create a loop from its config and the per-loop request builders
    ///
    /// `build_generator` receives the prompt to send (original on the
    /// first pass, synthesized revision prompt afterwards).
    pub fn new(
        config: ReviewLoopConfig,
        build_generator: impl Fn(&S, String) -> Box<dyn AnyPayload> + Send + Sync + 'static,
        build_reviewer: impl Fn(&S) -> Box<dyn AnyPayload> + Send + Sync + 'static,
    ) -> Self {
        Self {
            config,
            build_generator: Arc::new(build_generator),
            build_reviewer: Arc::new(build_reviewer),
        }
    }

    /// Produce the workflow definition
    pub fn build(self) -> WorkflowDefinition {
        let config = self.config;
        let kv_prefix = format!("{}.", config.state_prefix);
        let kv = || Trigger::watch_kv(config.state_bucket.as_str(), kv_prefix.as_str());

        let state_prefix = config.state_prefix.clone();
        let trigger_key: StateKeyFn = Arc::new(move |message| {
            let trigger = message
                .as_any()
                .downcast_ref::<ReviewTrigger>()
                .ok_or(ActionError::MissingMessage)?;
            Ok(format!("{}.{}", state_prefix, trigger.slug))
        });

        let accept_trigger = Rule::new(
            "accept-trigger",
            Trigger::on_subject(&config.trigger_stream, &config.trigger_subject, trigger_key),
            vec![Condition::phase_is("")],
            Action::mutate(mutate_state::<S, _>(|state, message| {
                let trigger = message
                    .and_then(|m| m.as_any().downcast_ref::<ReviewTrigger>())
                    .ok_or(ActionError::MissingMessage)?;
                state.apply_trigger(trigger);
                state.execution_mut().phase = phases::GENERATING.to_string();
                Ok(())
            })),
        )
        .with_description("populate state from the trigger and start generating");

        let build_generator = self.build_generator.clone();
        let generator_build: BuildFn = Arc::new(move |ctx| {
            let state = ctx
                .state_as::<S>()
                .ok_or_else(|| ActionError::TypeMismatch(std::any::type_name::<S>().into()))?;
            let prompt = if state.execution().iteration == 0 {
                state.request_prompt().to_string()
            } else {
                revision_prompt(state)
            };
            Ok(build_generator(state, prompt))
        });
        let dispatch_generator = Rule::new(
            "dispatch-generator",
            kv(),
            vec![
                Condition::phase_is(phases::GENERATING),
                Condition::NotCompleted,
            ],
            Action::publish_with_mutation(
                &config.generator_subject,
                generator_build,
                mutate_state::<S, _>(|state, _message| {
                    state.execution_mut().phase = phases::GENERATING_DISPATCHED.to_string();
                    Ok(())
                }),
            ),
        )
        .with_description("dispatch the generator component exactly once per pass");

        let generator_completed = Rule::new(
            "generator-completed",
            kv(),
            vec![
                Condition::phase_is(&config.generator_completed_phase),
                Condition::NotCompleted,
            ],
            Action::mutate(mutate_state::<S, _>(|state, _message| {
                state.execution_mut().phase = phases::REVIEWING.to_string();
                Ok(())
            })),
        );

        let build_reviewer = self.build_reviewer.clone();
        let reviewer_build: BuildFn = Arc::new(move |ctx| {
            let state = ctx
                .state_as::<S>()
                .ok_or_else(|| ActionError::TypeMismatch(std::any::type_name::<S>().into()))?;
            Ok(build_reviewer(state))
        });
        let dispatch_reviewer = Rule::new(
            "dispatch-reviewer",
            kv(),
            vec![
                Condition::phase_is(phases::REVIEWING),
                Condition::NotCompleted,
            ],
            Action::publish_with_mutation(
                &config.reviewer_subject,
                reviewer_build,
                mutate_state::<S, _>(|state, _message| {
                    state.execution_mut().phase = phases::REVIEWING_DISPATCHED.to_string();
                    Ok(())
                }),
            ),
        );

        let reviewer_completed = Rule::new(
            "reviewer-completed",
            kv(),
            vec![
                Condition::phase_is(&config.reviewer_completed_phase),
                Condition::NotCompleted,
            ],
            Action::mutate(mutate_state::<S, _>(|state, _message| {
                state.execution_mut().phase = phases::EVALUATED.to_string();
                Ok(())
            })),
        );

        let handle_approved = Rule::new(
            "handle-approved",
            kv(),
            vec![
                Condition::phase_is(phases::EVALUATED),
                Condition::field_equals("verdict", VERDICT_APPROVED),
                Condition::NotCompleted,
            ],
            Action::complete_with_event(
                &config.approved_subject,
                build_from_state::<S, ApprovedEvent, _>(|state| {
                    Ok(ApprovedEvent {
                        slug: state.slug().to_string(),
                        verdict: state.verdict().to_string(),
                        summary: state.review_summary().to_string(),
                    })
                }),
            ),
        );

        let handle_revision = Rule::new(
            "handle-revision",
            kv(),
            vec![
                Condition::phase_is(phases::EVALUATED),
                Condition::field_not_equals("verdict", VERDICT_APPROVED),
                Condition::iteration_less_than(config.max_revisions),
                Condition::NotCompleted,
            ],
            Action::publish_with_mutation(
                &config.revision_subject,
                build_from_state::<S, RevisionRequestedEvent, _>(|state| {
                    Ok(RevisionRequestedEvent {
                        slug: state.slug().to_string(),
                        iteration: state.execution().iteration + 1,
                        summary: state.review_summary().to_string(),
                        findings: state.findings().to_vec(),
                    })
                }),
                mutate_state::<S, _>(|state, _message| {
                    state.execution_mut().iteration += 1;
                    state.clear_round();
                    state.execution_mut().phase = phases::GENERATING.to_string();
                    Ok(())
                }),
            ),
        )
        .with_description("send the content back for another generator pass");

        let escalation_reason = config.escalation_reason.clone();
        let escalation_reason_for_mutate = config.escalation_reason.clone();
        let handle_escalation = Rule::new(
            "handle-escalation",
            kv(),
            vec![
                Condition::phase_is(phases::EVALUATED),
                Condition::field_not_equals("verdict", VERDICT_APPROVED),
                Condition::iteration_less_than(config.max_revisions).negate(),
                Condition::NotCompleted,
            ],
            Action::publish_with_mutation(
                subjects::USER_ESCALATE,
                build_from_state::<S, EscalationSignal, _>(move |state| {
                    Ok(EscalationSignal {
                        reason: escalation_reason.clone(),
                        iteration: state.execution().iteration + 1,
                        last_verdict: state.verdict().to_string(),
                        execution_id: state.execution().id.clone(),
                    })
                }),
                mutate_state::<S, _>(move |state, _message| {
                    let base = state.execution_mut();
                    base.iteration += 1;
                    base.status = ExecutionStatus::Escalated;
                    base.error = Some(escalation_reason_for_mutate.clone());
                    Ok(())
                }),
            ),
        );

        let handle_error = Rule::new(
            "handle-error",
            kv(),
            vec![
                Condition::phase_in([
                    phases::GENERATOR_FAILED,
                    phases::REVIEWER_FAILED,
                    MUTATOR_FAILED_PHASE,
                ]),
                Condition::NotCompleted,
            ],
            Action::publish_with_mutation(
                subjects::USER_ERROR,
                build_from_state::<S, UserErrorSignal, _>(|state| {
                    let base = state.execution();
                    Ok(UserErrorSignal {
                        execution_id: base.id.clone(),
                        workflow_id: base.workflow_id.clone(),
                        error: base
                            .error
                            .clone()
                            .unwrap_or_else(|| format!("component failed in phase {}", base.phase)),
                    })
                }),
                mutate_state::<S, _>(|state, _message| {
                    let base = state.execution_mut();
                    base.status = ExecutionStatus::Failed;
                    if base.error.is_none() {
                        base.error = Some(format!("component failed in phase {}", base.phase));
                    }
                    Ok(())
                }),
            ),
        );

        WorkflowDefinition::new(
            &config.workflow_id,
            &config.state_bucket,
            &config.state_prefix,
            StateCodec::of::<S>(),
        )
        .with_description(&config.description)
        .with_max_iterations(config.max_revisions + 2)
        .with_timeout(config.timeout)
        .with_rules([
            accept_trigger,
            dispatch_generator,
            generator_completed,
            dispatch_reviewer,
            reviewer_completed,
            handle_approved,
            handle_revision,
            handle_escalation,
            handle_error,
        ])
    }
}

/// Synthesize the prompt for a revision pass
fn revision_prompt<S: ReviewLoopState>(state: &S) -> String {
    let mut prompt = String::new();
    let _ = writeln!(
        prompt,
        "REVISION REQUEST (iteration {})",
        state.execution().iteration
    );
    let _ = writeln!(prompt);
    let _ = writeln!(
        prompt,
        "The previous submission was reviewed and needs changes. Fix only the \
         flagged issues; keep everything the reviewer did not mention."
    );
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "## Original request");
    if !state.title().is_empty() {
        let _ = writeln!(prompt, "Title: {}", state.title());
    }
    if !state.description().is_empty() {
        let _ = writeln!(prompt, "{}", state.description());
    }
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "{}", state.request_prompt());
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "## Reviewer summary");
    let _ = writeln!(prompt, "{}", state.review_summary());
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "## Findings to address");
    for finding in state.findings() {
        let mut line = format!("- {}", finding.issue);
        if let Some(severity) = &finding.severity {
            let _ = write!(line, " [{severity}]");
        }
        if let Some(suggestion) = &finding.suggestion {
            let _ = write!(line, " (suggestion: {suggestion})");
        }
        let _ = writeln!(prompt, "{line}");
    }
    prompt
}
