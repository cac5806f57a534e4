//! Phase review loop
//!
//! Breaks an approved plan into phases. The phase generator writes phase
//! `generated`, the phase reviewer writes `reviewed`. Executions live
//! under `phase-review.<slug>`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use semspec_engine::rules::WorkflowDefinition;
use semspec_engine::state::{ExecutionState, HasExecutionState};
use semspec_messages::erase;
use semspec_messages::payloads::{Finding, PhaseGeneratorRequest, PhaseReviewRequest, ReviewTrigger};

use crate::subjects;

use super::{ReviewLoop, ReviewLoopConfig, ReviewLoopState};

/// Per-execution state of the phase review loop
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseReviewState {
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

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    /// Upstream request data (the approved plan rides in here)
    #[serde(default)]
    pub request_data: Value,

    /// Raw phase breakdown the generator component wrote
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases_content: Option<Value>,

    #[serde(default)]
    pub phase_count: u32,

    #[serde(default)]
    pub llm_request_id: String,

    #[serde(default)]
    pub verdict: String,

    #[serde(default)]
    pub review_summary: String,

    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl HasExecutionState for PhaseReviewState {
    fn execution(&self) -> &ExecutionState {
        &self.execution
    }

    fn execution_mut(&mut self) -> &mut ExecutionState {
        &mut self.execution
    }
}

impl ReviewLoopState for PhaseReviewState {
    fn apply_trigger(&mut self, trigger: &ReviewTrigger) {
        self.slug = trigger.slug.clone();
        self.title = trigger.title.clone();
        self.description = trigger.description.clone();
        self.prompt = trigger.prompt.clone();
        self.trace_id = trigger.trace_id.clone();
        self.request_data = trigger.data.clone();
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
        self.phases_content.as_ref()
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
        self.phases_content = None;
        self.phase_count = 0;
        self.llm_request_id.clear();
        self.verdict.clear();
    }
}

/// The phase review workflow definition
pub fn phase_review_workflow() -> WorkflowDefinition {
    let config = ReviewLoopConfig::new("phase-review-loop", "phase-review")
        .with_description("OODA review loop for phase breakdown")
        .with_trigger(subjects::STREAM_WORKFLOW, subjects::TRIGGER_PHASE_REVIEW)
        .with_generator_subject(subjects::ASYNC_PHASE_GENERATOR)
        .with_reviewer_subject(subjects::ASYNC_PHASE_REVIEWER)
        .with_events(
            subjects::EVENTS_PHASES_APPROVED,
            subjects::EVENTS_PHASES_REVISION,
        )
        .with_completed_phases("generated", "reviewed")
        .with_timeout(Duration::from_secs(30 * 60))
        .with_escalation_reason("max phase review iterations exceeded");

    ReviewLoop::new(
        config,
        |state: &PhaseReviewState, prompt| {
            erase(PhaseGeneratorRequest {
                execution_id: state.execution.id.clone(),
                slug: state.slug.clone(),
                title: state.title.clone(),
                description: state.description.clone(),
                prompt,
                iteration: state.execution.iteration,
            })
        },
        |state: &PhaseReviewState| {
            erase(PhaseReviewRequest {
                execution_id: state.execution.id.clone(),
                slug: state.slug.clone(),
                content: state.phases_content.clone().unwrap_or(Value::Null),
                iteration: state.execution.iteration,
            })
        },
    )
    .build()
}
