//! Startup registration
//!
//! Registers every payload type and workflow definition, then builds and
//! starts the engine. Callers treat registration errors as fatal startup
//! failures.

use std::sync::Arc;

use tracing::info;

use semspec_engine::bus::MessageBus;
use semspec_engine::runtime::{EngineConfig, EngineError, RegistryError, WorkflowEngine, WorkflowRegistry};
use semspec_messages::payloads::{
    ApprovedEvent, CodeReviewRequest, CoordinationCompletedEvent, CoordinationPlannerResult,
    CoordinationSynthesisRequest, CoordinationTrigger, DeveloperRequest, EscalationSignal,
    PhaseGeneratorRequest, PhaseReviewRequest, PlanCoordinatorRequest, PlanRefinementTrigger,
    PlanReviewRequest, PlannerRequest, RejectionCategorizedEvent, ReviewTrigger,
    RevisionRequestedEvent, StructuralValidationRequest, TaskCompleteEvent,
    TaskDecompositionTrigger, TaskExecutionTrigger, TaskGeneratorRequest, TaskReviewRequest,
    UserErrorSignal, ValidationPassedEvent,
};
use semspec_messages::{PayloadError, PayloadRegistry};

use crate::coordination::coordination_workflow;
use crate::execution::task_execution_workflow;
use crate::review::{phase_review_workflow, plan_review_workflow, task_review_workflow};

/// Register every wire payload the shipped workflows use
pub fn register_payloads(registry: &PayloadRegistry) -> Result<(), PayloadError> {
    // Review loops
    registry.register::<ReviewTrigger>()?;
    registry.register::<PlannerRequest>()?;
    registry.register::<PhaseGeneratorRequest>()?;
    registry.register::<TaskGeneratorRequest>()?;
    registry.register::<PlanReviewRequest>()?;
    registry.register::<PhaseReviewRequest>()?;
    registry.register::<TaskReviewRequest>()?;

    // Events and user signals
    registry.register::<ApprovedEvent>()?;
    registry.register::<RevisionRequestedEvent>()?;
    registry.register::<EscalationSignal>()?;
    registry.register::<UserErrorSignal>()?;

    // Task execution
    registry.register::<TaskExecutionTrigger>()?;
    registry.register::<DeveloperRequest>()?;
    registry.register::<StructuralValidationRequest>()?;
    registry.register::<CodeReviewRequest>()?;
    registry.register::<ValidationPassedEvent>()?;
    registry.register::<RejectionCategorizedEvent>()?;
    registry.register::<TaskCompleteEvent>()?;
    registry.register::<PlanRefinementTrigger>()?;
    registry.register::<TaskDecompositionTrigger>()?;

    // Coordination
    registry.register::<CoordinationTrigger>()?;
    registry.register::<PlanCoordinatorRequest>()?;
    registry.register::<CoordinationPlannerResult>()?;
    registry.register::<CoordinationSynthesisRequest>()?;
    registry.register::<CoordinationCompletedEvent>()?;

    Ok(())
}

/// Register every workflow definition and async result type
pub fn register_workflows(registry: &WorkflowRegistry) -> Result<(), RegistryError> {
    registry.register(plan_review_workflow())?;
    registry.register(phase_review_workflow())?;
    registry.register(task_review_workflow())?;
    registry.register(task_execution_workflow())?;
    registry.register(coordination_workflow())?;

    // Reply decoding for the legacy async-callback path. No shipped rule
    // dispatches with PublishAsync; the shipped coordination workflow merges
    // planner results from the result subject instead. Registered so a
    // deployment that routes planner replies through the callback subject
    // can still decode them.
    registry.register_result_type::<CoordinationPlannerResult>()?;

    Ok(())
}

/// Build the registries, construct the engine, and start it
pub async fn start_engine(
    bus: Arc<dyn MessageBus>,
    config: EngineConfig,
) -> Result<WorkflowEngine, EngineError> {
    let payloads = Arc::new(PayloadRegistry::new());
    register_payloads(&payloads)?;

    let workflows = Arc::new(WorkflowRegistry::new());
    register_workflows(&workflows)?;

    let engine = WorkflowEngine::new(bus, payloads, workflows, config).await?;
    engine.start().await?;

    info!("semspec workflows registered and running");
    Ok(engine)
}
