//! Coordination (fan-out/fan-in) wire payloads

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::CallbackMeta;
use crate::schema::{Payload, PayloadError};

/// Trigger for the coordinated fan-out planning workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationTrigger {
    pub slug: String,

    #[serde(default)]
    pub objective: String,

    #[serde(default)]
    pub focus_areas: Vec<String>,

    #[serde(default = "default_max_planners")]
    pub max_planners: u32,
}

fn default_max_planners() -> u32 {
    3
}

impl Default for CoordinationTrigger {
    fn default() -> Self {
        Self {
            slug: String::new(),
            objective: String::new(),
            focus_areas: Vec::new(),
            max_planners: default_max_planners(),
        }
    }
}

impl Payload for CoordinationTrigger {
    const DOMAIN: &'static str = "workflow";
    const CATEGORY: &'static str = "coordination-trigger";
    const VERSION: &'static str = "v1";

    fn validate(&self) -> Result<(), PayloadError> {
        if self.slug.is_empty() {
            return Err(PayloadError::Validation(
                "coordination trigger requires a slug".into(),
            ));
        }
        Ok(())
    }
}

/// A focus area the coordinator assigns to one planner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Focus {
    pub area: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub hints: Vec<String>,
}

/// Request dispatched to the focus handler
///
/// Carries optional callback fields so the legacy async path can address
/// its reply; Participant deployments ignore them and write the
/// execution's KV cell instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanCoordinatorRequest {
    pub execution_id: String,
    pub objective: String,
    pub focus_areas: Vec<String>,
    pub max_planners: u32,

    /// Set at dispatch time on the legacy async path
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task_id: String,

    /// Reply subject for the legacy async path
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub callback_subject: String,
}

impl Payload for PlanCoordinatorRequest {
    const DOMAIN: &'static str = "workflow";
    const CATEGORY: &'static str = "plan-coordinator-request";
    const VERSION: &'static str = "v1";

    fn inject_callback(&mut self, meta: &CallbackMeta) {
        self.task_id = meta.task_id.clone();
        self.callback_subject = meta.callback_subject.clone();
        self.execution_id = meta.execution_id.clone();
    }
}

/// Result published by one planner on `workflow.result.coordination-planner.<id>`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinationPlannerResult {
    /// KV key of the owning coordination execution
    pub execution_id: String,
    pub planner_id: String,

    /// `completed` or `failed`
    pub status: String,

    #[serde(default)]
    pub result: Value,

    #[serde(default)]
    pub error: String,

    #[serde(default)]
    pub llm_request_id: String,
}

impl CoordinationPlannerResult {
    /// Whether this planner completed successfully
    pub fn is_success(&self) -> bool {
        self.status == "completed"
    }
}

impl Payload for CoordinationPlannerResult {
    const DOMAIN: &'static str = "workflow";
    const CATEGORY: &'static str = "coordination-planner-result";
    const VERSION: &'static str = "v1";

    fn validate(&self) -> Result<(), PayloadError> {
        if self.execution_id.is_empty() {
            return Err(PayloadError::Validation(
                "planner result requires an execution_id".into(),
            ));
        }
        if self.planner_id.is_empty() {
            return Err(PayloadError::Validation(
                "planner result requires a planner_id".into(),
            ));
        }
        Ok(())
    }
}

/// Request dispatched to the synthesis handler once all planners reported
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinationSynthesisRequest {
    pub execution_id: String,
    pub objective: String,

    /// All planner outcomes, keyed by planner id
    pub planner_results: Value,
}

impl Payload for CoordinationSynthesisRequest {
    const DOMAIN: &'static str = "workflow";
    const CATEGORY: &'static str = "coordination-synthesis-request";
    const VERSION: &'static str = "v1";
}

/// Published when the coordination workflow completes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinationCompletedEvent {
    pub execution_id: String,
    pub planner_count: u32,

    /// LLM request ids collected from the planner results (non-empty only)
    pub llm_request_ids: Vec<String>,

    #[serde(default)]
    pub synthesized_plan: Value,
}

impl Payload for CoordinationCompletedEvent {
    const DOMAIN: &'static str = "workflow";
    const CATEGORY: &'static str = "coordination-completed";
    const VERSION: &'static str = "v1";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trigger_defaults_max_planners() {
        let trigger: CoordinationTrigger =
            serde_json::from_value(json!({"slug": "demo"})).unwrap();
        assert_eq!(trigger.max_planners, 3);
    }

    #[test]
    fn test_callback_injection() {
        let mut request = PlanCoordinatorRequest {
            execution_id: "coordination.demo".to_string(),
            objective: "plan it".to_string(),
            ..Default::default()
        };

        // Plain Participant dispatch carries no callback fields
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("task_id").is_none());

        request.inject_callback(&CallbackMeta {
            task_id: "task-1".to_string(),
            callback_subject: "workflow.callback.engine".to_string(),
            execution_id: "coordination.demo".to_string(),
        });

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["task_id"], "task-1");
        assert_eq!(value["callback_subject"], "workflow.callback.engine");
        assert_eq!(value["execution_id"], "coordination.demo");

        let parsed: PlanCoordinatorRequest = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_planner_result_validation() {
        let result = CoordinationPlannerResult {
            execution_id: "coordination.demo".to_string(),
            planner_id: "p1".to_string(),
            status: "completed".to_string(),
            ..Default::default()
        };
        assert!(result.validate().is_ok());
        assert!(result.is_success());

        let missing = CoordinationPlannerResult::default();
        assert!(missing.validate().is_err());
    }
}
