//! Workflow definitions: rules, triggers, conditions, actions
//!
//! A definition is an ordered rule list over a typed state value. Each
//! rule names the event that can activate it (a bus subject or a KV key
//! prefix), the conditions that must hold, and the action to run. The
//! engine picks the first rule whose trigger matches the event and whose
//! conditions all pass.

pub mod action;
pub mod condition;
pub mod context;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use semspec_messages::AnyPayload;

use crate::bus::subject::subject_matches;
use crate::state::StateCodec;

pub use action::{
    build_from_state, mutate_on_result, mutate_state, Action, ActionError, BuildFn, MutateFn,
    ResultMutateFn,
};
pub use condition::Condition;
pub use context::RuleContext;

/// Maps a decoded trigger message to the KV key of its execution
pub type StateKeyFn = Arc<dyn Fn(&dyn AnyPayload) -> Result<String, ActionError> + Send + Sync>;

/// What activates a rule
#[derive(Clone)]
pub enum Trigger {
    /// Fire on each inbound message matching the subject pattern
    OnSubject {
        stream: String,
        subject: String,
        state_key: StateKeyFn,
    },

    /// Re-evaluate on each KV revision under the key prefix
    WatchKv { bucket: String, key_prefix: String },
}

impl Trigger {
    /// Subject trigger
    pub fn on_subject(
        stream: impl Into<String>,
        subject: impl Into<String>,
        state_key: StateKeyFn,
    ) -> Self {
        Self::OnSubject {
            stream: stream.into(),
            subject: subject.into(),
            state_key,
        }
    }

    /// KV-watch trigger
    pub fn watch_kv(bucket: impl Into<String>, key_prefix: impl Into<String>) -> Self {
        Self::WatchKv {
            bucket: bucket.into(),
            key_prefix: key_prefix.into(),
        }
    }

    /// Whether this trigger fires for a message on the given subject
    pub fn matches_subject(&self, subject: &str) -> bool {
        match self {
            Self::OnSubject { subject: pattern, .. } => subject_matches(pattern, subject),
            Self::WatchKv { .. } => false,
        }
    }

    /// Whether this trigger fires for a revision on the given key
    pub fn matches_key(&self, key: &str) -> bool {
        match self {
            Self::WatchKv { key_prefix, .. } => key.starts_with(key_prefix.as_str()),
            Self::OnSubject { .. } => false,
        }
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnSubject { stream, subject, .. } => {
                write!(f, "OnSubject({stream}, {subject})")
            }
            Self::WatchKv { bucket, key_prefix } => write!(f, "WatchKv({bucket}, {key_prefix})"),
        }
    }
}

/// One declarative rule
#[derive(Clone)]
pub struct Rule {
    pub id: String,
    pub description: String,
    pub trigger: Trigger,
    pub conditions: Vec<Condition>,
    pub action: Action,
}

impl Rule {
    /// Create a rule
    pub fn new(
        id: impl Into<String>,
        trigger: Trigger,
        conditions: Vec<Condition>,
        action: Action,
    ) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            trigger,
            conditions,
            action,
        }
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("trigger", &self.trigger)
            .field("conditions", &self.conditions)
            .field("action", &self.action)
            .finish()
    }
}

/// A workflow definition: ordered rules over a typed state value
#[derive(Clone)]
pub struct WorkflowDefinition {
    pub id: String,
    pub description: String,

    /// KV bucket holding this workflow's executions
    pub state_bucket: String,

    /// Key prefix of this workflow's executions, without trailing dot
    pub state_prefix: String,

    /// Factory/decoder for the workflow's state struct
    pub codec: StateCodec,

    /// Engine backstop; exceeding it synthesizes an escalation
    pub max_iterations: u32,

    /// Stale executions older than this are timed out by the sweeper
    pub timeout: Duration,

    pub rules: Vec<Rule>,
}

impl WorkflowDefinition {
    /// Create a definition with default budgets and no rules
    pub fn new(
        id: impl Into<String>,
        state_bucket: impl Into<String>,
        state_prefix: impl Into<String>,
        codec: StateCodec,
    ) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            state_bucket: state_bucket.into(),
            state_prefix: state_prefix.into(),
            codec,
            max_iterations: 10,
            timeout: Duration::from_secs(30 * 60),
            rules: Vec::new(),
        }
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the iteration backstop
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// Set the execution timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Append a rule
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Append many rules
    pub fn with_rules(mut self, rules: impl IntoIterator<Item = Rule>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// Key prefix including the separating dot
    pub fn key_prefix(&self) -> String {
        format!("{}.", self.state_prefix)
    }

    /// Distinct `(stream, subject)` pairs this workflow subscribes to
    pub fn subject_triggers(&self) -> Vec<(String, String)> {
        let mut seen = Vec::new();
        for rule in &self.rules {
            if let Trigger::OnSubject { stream, subject, .. } = &rule.trigger {
                let pair = (stream.clone(), subject.clone());
                if !seen.contains(&pair) {
                    seen.push(pair);
                }
            }
        }
        seen
    }

    /// Distinct `(bucket, key_prefix)` pairs this workflow watches
    pub fn kv_watches(&self) -> Vec<(String, String)> {
        let mut seen = Vec::new();
        for rule in &self.rules {
            if let Trigger::WatchKv { bucket, key_prefix } = &rule.trigger {
                let pair = (bucket.clone(), key_prefix.clone());
                if !seen.contains(&pair) {
                    seen.push(pair);
                }
            }
        }
        seen
    }

    /// Resolve the state key for a message on a subject
    ///
    /// Rules sharing a subject share the lookup: the first matching
    /// trigger's key function is used.
    pub fn state_key_for(
        &self,
        subject: &str,
        message: &dyn AnyPayload,
    ) -> Option<Result<String, ActionError>> {
        for rule in &self.rules {
            if let Trigger::OnSubject {
                subject: pattern,
                state_key,
                ..
            } = &rule.trigger
            {
                if subject_matches(pattern, subject) {
                    return Some(state_key(message));
                }
            }
        }
        None
    }
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("id", &self.id)
            .field("state_bucket", &self.state_bucket)
            .field("state_prefix", &self.state_prefix)
            .field("max_iterations", &self.max_iterations)
            .field("timeout", &self.timeout)
            .field("rules", &self.rules.iter().map(|r| &r.id).collect::<Vec<_>>())
            .finish()
    }
}
