//! Task review loop
//!
//! Generates executable tasks for one phase of an approved plan. The task
//! generator writes phase `generated`, the task reviewer writes
//! `reviewed`. Executions live under `task-review.<slug>`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use semspec_engine::rules::WorkflowDefinition;
use semspec_engine::state::{ExecutionState, HasExecutionState};
use semspec_messages::erase;
use semspec_messages::payloads::{Finding, ReviewTrigger, TaskGeneratorRequest, TaskReviewRequest};

use crate::subjects;

use super::{ReviewLoop, ReviewLoopConfig, ReviewLoopState};

/// Per-execution state of the task review loop
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskReviewState {
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

    /// Upstream request data (plan and phase context)
    #[serde(default)]
    pub request_data: Value,

    /// Raw task list the generator component wrote
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks_content: Option<Value>,

    #[serde(default)]
    pub task_count: u32,

    #[serde(default)]
    pub llm_request_id: String,

    #[serde(default)]
    pub verdict: String,

    #[serde(default)]
    pub review_summary: String,

    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl HasExecutionState for TaskReviewState {
    fn execution(&self) -> &ExecutionState {
        &self.execution
    }

    fn execution_mut(&mut self) -> &mut ExecutionState {
        &mut self.execution
    }
}

impl ReviewLoopState for TaskReviewState {
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
        self.tasks_content.as_ref()
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
        self.tasks_content = None;
        self.task_count = 0;
        self.llm_request_id.clear();
        self.verdict.clear();
    }
}

/// The task review workflow definition
pub fn task_review_workflow() -> WorkflowDefinition {
    let config = ReviewLoopConfig::new("task-review-loop", "task-review")
        .with_description("OODA review loop for task generation")
        .with_trigger(subjects::STREAM_WORKFLOW, subjects::TRIGGER_TASK_REVIEW)
        .with_generator_subject(subjects::ASYNC_TASK_GENERATOR)
        .with_reviewer_subject(subjects::ASYNC_TASK_REVIEWER)
        .with_events(
            subjects::EVENTS_TASKS_APPROVED,
            subjects::EVENTS_TASKS_REVISION,
        )
        .with_completed_phases("generated", "reviewed")
        .with_timeout(Duration::from_secs(30 * 60))
        .with_escalation_reason("max task review iterations exceeded");

    ReviewLoop::new(
        config,
        |state: &TaskReviewState, prompt| {
            erase(TaskGeneratorRequest {
                execution_id: state.execution.id.clone(),
                slug: state.slug.clone(),
                title: state.title.clone(),
                description: state.description.clone(),
                prompt,
                iteration: state.execution.iteration,
            })
        },
        |state: &TaskReviewState| {
            erase(TaskReviewRequest {
                execution_id: state.execution.id.clone(),
                slug: state.slug.clone(),
                content: state.tasks_content.clone().unwrap_or(Value::Null),
                iteration: state.execution.iteration,
            })
        },
    )
    .build()
}
