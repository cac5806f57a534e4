//! # Semspec Workflows
//!
//! The workflow definitions that drive semspec's multi-stage agent
//! pipelines, built on the reactive workflow engine:
//!
//! - three OODA review loops (plan, phase breakdown, task generation)
//!   instantiated from one nine-rule builder,
//! - the 3-stage task-execution pipeline (develop -> validate -> review)
//!   with typed rejection routing and a shared retry budget,
//! - the coordination fan-out/fan-in workflow with engine-side merging of
//!   planner results,
//! - the bootstrap that registers payloads and workflows at startup.
//!
//! Participant components (planners, reviewers, validators, developer
//! agents) consume the dispatch subjects in [`subjects`] and re-enter a
//! workflow by writing their completion phase into the execution's KV
//! cell through the engine's `StateManager`.

pub mod bootstrap;
pub mod coordination;
pub mod execution;
pub mod review;
pub mod subjects;

pub use bootstrap::{register_payloads, register_workflows, start_engine};
pub use coordination::{coordination_workflow, CoordinationState, PlannerOutcome};
pub use execution::{task_execution_workflow, CheckResult, TaskExecutionState};
pub use review::{
    phase_review_workflow, plan_review_workflow, task_review_workflow, PhaseReviewState,
    PlanReviewState, ReviewLoop, ReviewLoopConfig, ReviewLoopState, TaskReviewState,
};
