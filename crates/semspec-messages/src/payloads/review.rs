//! Review-loop wire payloads (plan, phases, tasks)
//!
//! All three review loops accept the same trigger shape; the generator and
//! reviewer requests are per-loop types so each participant component gets
//! its own schema tag.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{Payload, PayloadError};

/// Trigger accepted by the plan, phase, and task review loops
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewTrigger {
    /// Stable slug identifying the work item; becomes part of the KV key
    pub slug: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub description: String,

    /// The request given to the generator on the first pass
    #[serde(default)]
    pub prompt: String,

    #[serde(default)]
    pub role: String,

    #[serde(default)]
    pub scope_patterns: Vec<String>,

    /// Trace correlator carried through dispatches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    /// Opaque upstream data (e.g. the plan content a phase loop reads)
    #[serde(default)]
    pub data: Value,
}

impl Payload for ReviewTrigger {
    const DOMAIN: &'static str = "workflow";
    const CATEGORY: &'static str = "review-trigger";
    const VERSION: &'static str = "v1";

    fn validate(&self) -> Result<(), PayloadError> {
        if self.slug.is_empty() {
            return Err(PayloadError::Validation(
                "review trigger requires a slug".into(),
            ));
        }
        Ok(())
    }
}

/// Request dispatched to the planner component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlannerRequest {
    /// KV key of the owning execution; the planner writes its result there
    pub execution_id: String,
    pub slug: String,
    pub title: String,
    pub description: String,
    pub prompt: String,
    pub iteration: u32,
}

impl Payload for PlannerRequest {
    const DOMAIN: &'static str = "workflow";
    const CATEGORY: &'static str = "planner-request";
    const VERSION: &'static str = "v1";
}

/// Request dispatched to the phase generator component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseGeneratorRequest {
    pub execution_id: String,
    pub slug: String,
    pub title: String,
    pub description: String,
    pub prompt: String,
    pub iteration: u32,
}

impl Payload for PhaseGeneratorRequest {
    const DOMAIN: &'static str = "workflow";
    const CATEGORY: &'static str = "phase-generator-request";
    const VERSION: &'static str = "v1";
}

/// Request dispatched to the task generator component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskGeneratorRequest {
    pub execution_id: String,
    pub slug: String,
    pub title: String,
    pub description: String,
    pub prompt: String,
    pub iteration: u32,
}

impl Payload for TaskGeneratorRequest {
    const DOMAIN: &'static str = "workflow";
    const CATEGORY: &'static str = "task-generator-request";
    const VERSION: &'static str = "v1";
}

/// Request dispatched to the plan reviewer component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanReviewRequest {
    pub execution_id: String,
    pub slug: String,

    /// The generator output under review
    pub content: Value,
    pub iteration: u32,
}

impl Payload for PlanReviewRequest {
    const DOMAIN: &'static str = "workflow";
    const CATEGORY: &'static str = "plan-review-request";
    const VERSION: &'static str = "v1";
}

/// Request dispatched to the phase reviewer component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseReviewRequest {
    pub execution_id: String,
    pub slug: String,
    pub content: Value,
    pub iteration: u32,
}

impl Payload for PhaseReviewRequest {
    const DOMAIN: &'static str = "workflow";
    const CATEGORY: &'static str = "phase-review-request";
    const VERSION: &'static str = "v1";
}

/// Request dispatched to the task reviewer component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskReviewRequest {
    pub execution_id: String,
    pub slug: String,
    pub content: Value,
    pub iteration: u32,
}

impl Payload for TaskReviewRequest {
    const DOMAIN: &'static str = "workflow";
    const CATEGORY: &'static str = "task-review-request";
    const VERSION: &'static str = "v1";
}
