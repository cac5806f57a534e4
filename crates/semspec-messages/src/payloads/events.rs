//! Domain events and user signals published by the engine

use serde::{Deserialize, Serialize};

use crate::schema::Payload;

/// A single reviewer finding
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub issue: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl Finding {
    /// Create a finding with just an issue description
    pub fn new(issue: impl Into<String>) -> Self {
        Self {
            issue: issue.into(),
            severity: None,
            suggestion: None,
        }
    }
}

/// Published when a review loop approves the generated content
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovedEvent {
    pub slug: String,
    pub verdict: String,
    pub summary: String,
}

impl Payload for ApprovedEvent {
    const DOMAIN: &'static str = "workflow";
    const CATEGORY: &'static str = "review-approved";
    const VERSION: &'static str = "v1";
}

/// Published when a review loop sends the content back for revision
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RevisionRequestedEvent {
    pub slug: String,

    /// The pass that was reviewed and rejected
    pub iteration: u32,
    pub summary: String,
    pub findings: Vec<Finding>,
}

impl Payload for RevisionRequestedEvent {
    const DOMAIN: &'static str = "workflow";
    const CATEGORY: &'static str = "review-revision";
    const VERSION: &'static str = "v1";
}

/// Published on `user.signal.escalate` when a budget is exhausted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EscalationSignal {
    pub reason: String,
    pub iteration: u32,

    #[serde(default)]
    pub last_verdict: String,

    #[serde(default)]
    pub execution_id: String,
}

impl Payload for EscalationSignal {
    const DOMAIN: &'static str = "workflow";
    const CATEGORY: &'static str = "escalation";
    const VERSION: &'static str = "v1";
}

/// Published on `user.signal.error` when a component declares failure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserErrorSignal {
    pub execution_id: String,
    pub workflow_id: String,
    pub error: String,
}

impl Payload for UserErrorSignal {
    const DOMAIN: &'static str = "workflow";
    const CATEGORY: &'static str = "user-error";
    const VERSION: &'static str = "v1";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_approved_event_wire_shape() {
        let event = ApprovedEvent {
            slug: "add-auth".to_string(),
            verdict: "approved".to_string(),
            summary: "LGTM".to_string(),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"slug": "add-auth", "verdict": "approved", "summary": "LGTM"})
        );
    }

    #[test]
    fn test_finding_skips_empty_optionals() {
        let finding = Finding::new("no error handling");
        let value = serde_json::to_value(&finding).unwrap();
        assert_eq!(value, json!({"issue": "no error handling"}));
    }

    #[test]
    fn test_revision_event_round_trip() {
        let event = RevisionRequestedEvent {
            slug: "add-auth".to_string(),
            iteration: 1,
            summary: "needs work".to_string(),
            findings: vec![Finding::new("no error handling")],
        };

        let json = serde_json::to_string(&event).unwrap();
        let parsed: RevisionRequestedEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }
}
