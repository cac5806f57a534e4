//! Task-execution pipeline wire payloads

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{Payload, PayloadError};

/// Trigger for the develop -> validate -> review pipeline
///
/// Task identity and model selection ride in the opaque `data` blob the
/// task generator emitted; the accessors below pull out the known keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionTrigger {
    pub slug: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub prompt: String,

    #[serde(default)]
    pub data: Value,
}

impl TaskExecutionTrigger {
    /// Task id carried in the trigger data
    pub fn task_id(&self) -> Option<&str> {
        self.data.get("task_id").and_then(Value::as_str)
    }

    /// Model identifier carried in the trigger data
    pub fn model(&self) -> Option<&str> {
        self.data.get("model").and_then(Value::as_str)
    }

    /// Context-assembly request id carried in the trigger data
    pub fn context_request_id(&self) -> Option<&str> {
        self.data.get("context_request_id").and_then(Value::as_str)
    }
}

impl Payload for TaskExecutionTrigger {
    const DOMAIN: &'static str = "workflow";
    const CATEGORY: &'static str = "task-execution-trigger";
    const VERSION: &'static str = "v1";

    fn validate(&self) -> Result<(), PayloadError> {
        if self.slug.is_empty() {
            return Err(PayloadError::Validation(
                "task execution trigger requires a slug".into(),
            ));
        }
        if self.task_id().is_none() {
            return Err(PayloadError::Validation(
                "task execution trigger requires data.task_id".into(),
            ));
        }
        Ok(())
    }
}

/// Request dispatched to the developer agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeveloperRequest {
    pub execution_id: String,
    pub task_id: String,
    pub slug: String,

    /// Full prompt; on revision passes it embeds the previous attempt
    pub prompt: String,
    pub model: String,
    pub iteration: u32,

    /// `validation` or `review` when this is a revision pass
    #[serde(default)]
    pub revision_source: String,
}

impl Payload for DeveloperRequest {
    const DOMAIN: &'static str = "agent";
    const CATEGORY: &'static str = "developer-request";
    const VERSION: &'static str = "v1";
}

/// Request dispatched to the structural validator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuralValidationRequest {
    pub execution_id: String,
    pub task_id: String,
    pub slug: String,
    pub files_modified: Vec<String>,
    pub iteration: u32,
}

impl Payload for StructuralValidationRequest {
    const DOMAIN: &'static str = "workflow";
    const CATEGORY: &'static str = "validation-request";
    const VERSION: &'static str = "v1";
}

/// Request dispatched to the code review agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeReviewRequest {
    pub execution_id: String,
    pub task_id: String,
    pub slug: String,
    pub prompt: String,
    pub developer_output: String,
    pub files_modified: Vec<String>,
    pub iteration: u32,
}

impl Payload for CodeReviewRequest {
    const DOMAIN: &'static str = "agent";
    const CATEGORY: &'static str = "code-review-request";
    const VERSION: &'static str = "v1";
}

/// Published when structural validation passes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationPassedEvent {
    pub task_id: String,
    pub slug: String,
    pub checks_run: u32,
}

impl Payload for ValidationPassedEvent {
    const DOMAIN: &'static str = "workflow";
    const CATEGORY: &'static str = "validation-passed";
    const VERSION: &'static str = "v1";
}

/// Published when a review rejection has been categorised
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RejectionCategorizedEvent {
    pub task_id: String,
    pub slug: String,
    pub rejection_type: String,
    pub feedback: String,
    pub iteration: u32,
}

impl Payload for RejectionCategorizedEvent {
    const DOMAIN: &'static str = "workflow";
    const CATEGORY: &'static str = "rejection-categorized";
    const VERSION: &'static str = "v1";
}

/// Published when a task completes the full pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskCompleteEvent {
    pub task_id: String,
    pub slug: String,

    /// Retry passes consumed before approval
    pub iterations: u32,
}

impl Payload for TaskCompleteEvent {
    const DOMAIN: &'static str = "workflow";
    const CATEGORY: &'static str = "task-complete";
    const VERSION: &'static str = "v1";
}

/// Routed to the plan-refinement trigger on misscoped/architectural rejections
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanRefinementTrigger {
    pub original_task_id: String,
    pub plan_slug: String,
    pub feedback: String,
}

impl Payload for PlanRefinementTrigger {
    const DOMAIN: &'static str = "workflow";
    const CATEGORY: &'static str = "plan-refinement-trigger";
    const VERSION: &'static str = "v1";
}

/// Routed to the task-decomposition trigger on too_big rejections
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDecompositionTrigger {
    pub original_task_id: String,
    pub plan_slug: String,
    pub feedback: String,
}

impl Payload for TaskDecompositionTrigger {
    const DOMAIN: &'static str = "workflow";
    const CATEGORY: &'static str = "task-decomposition-trigger";
    const VERSION: &'static str = "v1";
}
