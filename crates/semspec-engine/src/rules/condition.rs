//! Rule conditions
//!
//! Conditions are pure predicates over a [`RuleContext`]. The engine
//! evaluates a rule's conditions in declared order; all must hold for the
//! action to run. Authors achieve rule exclusivity through phase and
//! verdict conditions, not through the engine.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::context::RuleContext;

/// A predicate over the rule context
#[derive(Clone)]
pub enum Condition {
    /// Always true
    Always,

    /// Phase equals the given value
    PhaseIs(String),

    /// Phase is one of the given values
    PhaseIn(Vec<String>),

    /// Iteration is strictly below the bound
    IterationLessThan(u32),

    /// Status is still `running`; false once terminal
    NotCompleted,

    /// Negation
    Not(Box<Condition>),

    /// All of
    And(Vec<Condition>),

    /// Any of
    Or(Vec<Condition>),

    /// Top-level state field equals the given JSON value
    ///
    /// A missing field compares equal to `null`.
    StateFieldEquals { field: String, value: Value },

    /// Top-level state field differs from the given JSON value
    StateFieldNotEquals { field: String, value: Value },

    /// Escape hatch for conditions the primitives cannot express
    Predicate(Arc<dyn Fn(&RuleContext<'_>) -> bool + Send + Sync>),
}

impl Condition {
    /// `PhaseIs` from anything string-like
    pub fn phase_is(phase: impl Into<String>) -> Self {
        Self::PhaseIs(phase.into())
    }

    /// `PhaseIn` from an iterator of phases
    pub fn phase_in<I, S>(phases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::PhaseIn(phases.into_iter().map(Into::into).collect())
    }

    /// `IterationLessThan`
    pub fn iteration_less_than(bound: u32) -> Self {
        Self::IterationLessThan(bound)
    }

    /// `StateFieldEquals`
    pub fn field_equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::StateFieldEquals {
            field: field.into(),
            value: value.into(),
        }
    }

    /// `StateFieldNotEquals`
    pub fn field_not_equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::StateFieldNotEquals {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Custom predicate
    pub fn predicate(f: impl Fn(&RuleContext<'_>) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }

    /// Wrap in a negation
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Evaluate against a context
    pub fn evaluate(&self, ctx: &RuleContext<'_>) -> bool {
        match self {
            Self::Always => true,
            Self::PhaseIs(phase) => ctx.phase() == phase,
            Self::PhaseIn(phases) => phases.iter().any(|p| ctx.phase() == p),
            Self::IterationLessThan(bound) => ctx.iteration() < *bound,
            Self::NotCompleted => !ctx.status().is_terminal(),
            Self::Not(inner) => !inner.evaluate(ctx),
            Self::And(all) => all.iter().all(|c| c.evaluate(ctx)),
            Self::Or(any) => any.iter().any(|c| c.evaluate(ctx)),
            Self::StateFieldEquals { field, value } => match ctx.field(field) {
                Some(actual) => actual == value,
                None => value.is_null(),
            },
            Self::StateFieldNotEquals { field, value } => match ctx.field(field) {
                Some(actual) => actual != value,
                None => !value.is_null(),
            },
            Self::Predicate(f) => f(ctx),
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => write!(f, "Always"),
            Self::PhaseIs(p) => write!(f, "PhaseIs({p})"),
            Self::PhaseIn(ps) => write!(f, "PhaseIn({ps:?})"),
            Self::IterationLessThan(n) => write!(f, "IterationLessThan({n})"),
            Self::NotCompleted => write!(f, "NotCompleted"),
            Self::Not(inner) => write!(f, "Not({inner:?})"),
            Self::And(cs) => write!(f, "And({cs:?})"),
            Self::Or(cs) => write!(f, "Or({cs:?})"),
            Self::StateFieldEquals { field, value } => write!(f, "StateFieldEquals({field} == {value})"),
            Self::StateFieldNotEquals { field, value } => {
                write!(f, "StateFieldNotEquals({field} != {value})")
            }
            Self::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}
