//! Concrete wire payloads, grouped by the workflow that owns them

pub mod coordination;
pub mod events;
pub mod execution;
pub mod review;

pub use coordination::{
    CoordinationCompletedEvent, CoordinationPlannerResult, CoordinationSynthesisRequest,
    CoordinationTrigger, Focus, PlanCoordinatorRequest,
};
pub use events::{
    ApprovedEvent, EscalationSignal, Finding, RevisionRequestedEvent, UserErrorSignal,
};
pub use execution::{
    CodeReviewRequest, DeveloperRequest, PlanRefinementTrigger, RejectionCategorizedEvent,
    StructuralValidationRequest, TaskCompleteEvent, TaskDecompositionTrigger,
    TaskExecutionTrigger, ValidationPassedEvent,
};
pub use review::{
    PhaseGeneratorRequest, PhaseReviewRequest, PlanReviewRequest, PlannerRequest, ReviewTrigger,
    TaskGeneratorRequest, TaskReviewRequest,
};
