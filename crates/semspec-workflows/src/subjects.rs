//! Bus subjects and streams used by the shipped workflows

/// Stream carrying `workflow.>` subjects
pub const STREAM_WORKFLOW: &str = "WORKFLOW";

/// Stream carrying `agent.>` subjects
pub const STREAM_AGENT: &str = "AGENT";

/// Stream carrying `user.>` subjects
pub const STREAM_USER: &str = "USER";

// Inbound triggers
pub const TRIGGER_PLAN_REVIEW: &str = "workflow.trigger.plan-review-loop";
pub const TRIGGER_PHASE_REVIEW: &str = "workflow.trigger.phase-review-loop";
pub const TRIGGER_TASK_REVIEW: &str = "workflow.trigger.task-review-loop";
pub const TRIGGER_TASK_EXECUTION: &str = "workflow.trigger.task-execution";
pub const TRIGGER_COORDINATION: &str = "workflow.trigger.coordination";
pub const TRIGGER_PLAN_REFINEMENT: &str = "workflow.trigger.plan-refinement";
pub const TRIGGER_TASK_DECOMPOSITION: &str = "workflow.trigger.task-decomposition";

// Participant dispatches
pub const ASYNC_PLANNER: &str = "workflow.async.planner";
pub const ASYNC_PLAN_REVIEWER: &str = "workflow.async.plan-reviewer";
pub const ASYNC_PHASE_GENERATOR: &str = "workflow.async.phase-generator";
pub const ASYNC_PHASE_REVIEWER: &str = "workflow.async.phase-reviewer";
pub const ASYNC_TASK_GENERATOR: &str = "workflow.async.task-generator";
pub const ASYNC_TASK_REVIEWER: &str = "workflow.async.task-reviewer";
pub const ASYNC_STRUCTURAL_VALIDATOR: &str = "workflow.async.structural-validator";
pub const ASYNC_PLAN_COORDINATOR: &str = "workflow.async.plan-coordinator";
pub const ASYNC_COORDINATION_SYNTHESIS: &str = "workflow.async.coordination-synthesis";
pub const AGENT_TASK_DEVELOPMENT: &str = "agent.task.development";
pub const AGENT_TASK_REVIEW: &str = "agent.task.review";

// Outbound events
pub const EVENTS_PLAN_APPROVED: &str = "workflow.events.plan.approved";
pub const EVENTS_PLAN_REVISION: &str = "workflow.events.plan.revision_needed";
pub const EVENTS_PHASES_APPROVED: &str = "workflow.events.phases.approved";
pub const EVENTS_PHASES_REVISION: &str = "workflow.events.phases.revision_needed";
pub const EVENTS_TASKS_APPROVED: &str = "workflow.events.tasks.approved";
pub const EVENTS_TASKS_REVISION: &str = "workflow.events.tasks.revision_needed";
pub const EVENTS_TASK_VALIDATION_PASSED: &str = "workflow.events.task.validation_passed";
pub const EVENTS_TASK_REJECTION: &str = "workflow.events.task.rejection_categorized";
pub const EVENTS_COORDINATION_COMPLETED: &str = "workflow.events.coordination.completed";
pub const TASK_COMPLETE: &str = "workflow.task.complete";

// User signals
pub const USER_ESCALATE: &str = "user.signal.escalate";
pub const USER_ERROR: &str = "user.signal.error";

// Coordination fan-in results
pub const COORDINATION_RESULTS: &str = "workflow.result.coordination-planner.*";

/// KV bucket shared by every workflow's executions
pub const STATE_BUCKET: &str = "semspec-workflows";
