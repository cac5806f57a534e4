//! Plan review loop
//!
//! Generator is the planner component (writes phase `planned`), reviewer
//! is the plan reviewer (writes phase `reviewed`). Executions live under
//! `plan-review.<slug>`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use semspec_engine::rules::WorkflowDefinition;
use semspec_engine::state::{ExecutionState, HasExecutionState};
use semspec_messages::payloads::{Finding, PlanReviewRequest, PlannerRequest, ReviewTrigger};
use semspec_messages::erase;

use crate::subjects;

use super::{ReviewLoop, ReviewLoopConfig, ReviewLoopState};

/// Per-execution state of the plan review loop
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanReviewState {
    #[serde(flatten)]
    pub execution: ExecutionState,

    #[serde(default)]
    pub slug: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub prompt: String,

    #[serde(default)]
    pub role: String,

    #[serde(default)]
    pub scope_patterns: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    /// Raw plan document the planner component wrote
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_content: Option<Value>,

    #[serde(default)]
    pub step_count: u32,

    #[serde(default)]
    pub llm_request_id: String,

    #[serde(default)]
    pub verdict: String,

    #[serde(default)]
    pub review_summary: String,

    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl HasExecutionState for PlanReviewState {
    fn execution(&self) -> &ExecutionState {
        &self.execution
    }

    fn execution_mut(&mut self) -> &mut ExecutionState {
        &mut self.execution
    }
}

impl ReviewLoopState for PlanReviewState {
    fn apply_trigger(&mut self, trigger: &ReviewTrigger) {
        self.slug = trigger.slug.clone();
        self.title = trigger.title.clone();
        self.description = trigger.description.clone();
        self.prompt = trigger.prompt.clone();
        self.role = trigger.role.clone();
        self.scope_patterns = trigger.scope_patterns.clone();
        self.trace_id = trigger.trace_id.clone();
    }

    fn slug(&self) -> &str {
        &self.slug
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn request_prompt(&self) -> &str {
        &self.prompt
    }

    fn content(&self) -> Option<&Value> {
        self.plan_content.as_ref()
    }

    fn verdict(&self) -> &str {
        &self.verdict
    }

    fn review_summary(&self) -> &str {
        &self.review_summary
    }

    fn findings(&self) -> &[Finding] {
        &self.findings
    }

    fn clear_round(&mut self) {
        self.plan_content = None;
        self.step_count = 0;
        self.llm_request_id.clear();
        self.verdict.clear();
    }
}

/// The plan review workflow definition
pub fn plan_review_workflow() -> WorkflowDefinition {
    let config = ReviewLoopConfig::new("plan-review-loop", "plan-review")
        .with_description("OODA review loop for plan generation")
        .with_trigger(subjects::STREAM_WORKFLOW, subjects::TRIGGER_PLAN_REVIEW)
        .with_generator_subject(subjects::ASYNC_PLANNER)
        .with_reviewer_subject(subjects::ASYNC_PLAN_REVIEWER)
        .with_events(subjects::EVENTS_PLAN_APPROVED, subjects::EVENTS_PLAN_REVISION)
        .with_completed_phases("planned", "reviewed")
        .with_timeout(Duration::from_secs(30 * 60))
        .with_escalation_reason("max plan review iterations exceeded");

    ReviewLoop::new(
        config,
        |state: &PlanReviewState, prompt| {
            erase(PlannerRequest {
                execution_id: state.execution.id.clone(),
                slug: state.slug.clone(),
                title: state.title.clone(),
                description: state.description.clone(),
                prompt,
                iteration: state.execution.iteration,
            })
        },
        |state: &PlanReviewState| {
            erase(PlanReviewRequest {
                execution_id: state.execution.id.clone(),
                slug: state.slug.clone(),
                content: state.plan_content.clone().unwrap_or(Value::Null),
                iteration: state.execution.iteration,
            })
        },
    )
    .build()
}
