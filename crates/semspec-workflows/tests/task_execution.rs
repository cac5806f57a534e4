//! End-to-end task execution pipeline scenarios over the in-memory bus

mod support;

use serde_json::json;

use semspec_engine::state::ExecutionStatus;
use semspec_messages::payloads::{
    CodeReviewRequest, DeveloperRequest, StructuralValidationRequest, TaskCompleteEvent,
    TaskDecompositionTrigger, TaskExecutionTrigger, ValidationPassedEvent,
};
use semspec_workflows::execution::{phases, rejection, revision_source, CheckResult};
use semspec_workflows::{subjects, TaskExecutionState};

use support::Harness;

const KEY: &str = "task-execution.add-auth.t-1";

async fn send_trigger(harness: &Harness) {
    harness
        .publish(
            subjects::TRIGGER_TASK_EXECUTION,
            TaskExecutionTrigger {
                slug: "add-auth".to_string(),
                title: "Implement login".to_string(),
                prompt: "Implement the login endpoint".to_string(),
                data: json!({"task_id": "t-1", "model": "m", "context_request_id": "c"}),
            },
        )
        .await;
}

/// Simulate the developer agent finishing pass `iteration`
async fn complete_developer(harness: &Harness, iteration: u32, output: &str, files: &[&str]) {
    harness
        .wait_for::<TaskExecutionState, _>(KEY, |s| {
            s.execution.phase == phases::DEVELOPING_DISPATCHED && s.execution.iteration == iteration
        })
        .await;

    let output = output.to_string();
    let files: Vec<String> = files.iter().map(|f| f.to_string()).collect();
    harness
        .state()
        .update::<TaskExecutionState, _>(KEY, |s| {
            s.developer_output = output.clone();
            s.files_modified = files.clone();
            s.execution.phase = phases::DEVELOPED.to_string();
        })
        .await
        .expect("developer write should succeed");
}

/// Simulate the structural validator reporting for pass `iteration`
async fn complete_validator(
    harness: &Harness,
    iteration: u32,
    passed: bool,
    checks_run: u32,
    results: Vec<CheckResult>,
) {
    harness
        .wait_for::<TaskExecutionState, _>(KEY, |s| {
            s.execution.phase == phases::VALIDATING_DISPATCHED && s.execution.iteration == iteration
        })
        .await;

    harness
        .state()
        .update::<TaskExecutionState, _>(KEY, |s| {
            s.validation_passed = Some(passed);
            s.checks_run = checks_run;
            s.check_results = results.clone();
            s.execution.phase = phases::VALIDATED.to_string();
        })
        .await
        .expect("validator write should succeed");
}

/// Simulate the code reviewer for pass `iteration`
async fn complete_reviewer(
    harness: &Harness,
    iteration: u32,
    verdict: &str,
    rejection_type: &str,
    feedback: &str,
) {
    harness
        .wait_for::<TaskExecutionState, _>(KEY, |s| {
            s.execution.phase == phases::REVIEWING_DISPATCHED && s.execution.iteration == iteration
        })
        .await;

    let verdict = verdict.to_string();
    let rejection_type = rejection_type.to_string();
    let feedback = feedback.to_string();
    harness
        .state()
        .update::<TaskExecutionState, _>(KEY, |s| {
            s.verdict = verdict.clone();
            s.rejection_type = rejection_type.clone();
            s.feedback = feedback.clone();
            s.execution.phase = phases::REVIEWED.to_string();
        })
        .await
        .expect("reviewer write should succeed");
}

#[tokio::test]
async fn validation_failure_then_success() {
    let harness = Harness::start().await;
    let mut develop_sub = harness.subscribe(subjects::AGENT_TASK_DEVELOPMENT).await;
    let mut validate_sub = harness
        .subscribe(subjects::ASYNC_STRUCTURAL_VALIDATOR)
        .await;
    let mut review_sub = harness.subscribe(subjects::AGENT_TASK_REVIEW).await;
    let mut passed_sub = harness
        .subscribe(subjects::EVENTS_TASK_VALIDATION_PASSED)
        .await;
    let mut complete_sub = harness.subscribe(subjects::TASK_COMPLETE).await;

    send_trigger(&harness).await;

    // First developer pass carries the original prompt
    let message = harness.expect_message(&mut develop_sub).await;
    let request = message.payload.as_any().downcast_ref::<DeveloperRequest>().unwrap();
    assert_eq!(request.task_id, "t-1");
    assert_eq!(request.model, "m");
    assert_eq!(request.prompt, "Implement the login endpoint");
    assert!(request.revision_source.is_empty());

    complete_developer(&harness, 0, "\"added login handler\"", &["src/auth.rs"]).await;

    let message = harness.expect_message(&mut validate_sub).await;
    let request = message
        .payload
        .as_any()
        .downcast_ref::<StructuralValidationRequest>()
        .unwrap();
    assert_eq!(request.files_modified, vec!["src/auth.rs"]);

    // Validation fails: retry routes back to the developer
    complete_validator(
        &harness,
        0,
        false,
        1,
        vec![CheckResult {
            check: "compile".to_string(),
            passed: false,
            message: "undefined foo".to_string(),
        }],
    )
    .await;

    let state = harness
        .wait_for::<TaskExecutionState, _>(KEY, |s| s.execution.iteration == 1)
        .await;
    assert_eq!(state.revision_source, revision_source::VALIDATION);

    // The retry dispatch embeds the failing check and the original prompt
    let message = harness.expect_message(&mut develop_sub).await;
    let request = message.payload.as_any().downcast_ref::<DeveloperRequest>().unwrap();
    assert_eq!(request.iteration, 1);
    assert_eq!(request.revision_source, revision_source::VALIDATION);
    assert!(request.prompt.contains("undefined foo"));
    assert!(request.prompt.contains("Implement the login endpoint"));
    assert!(request.prompt.contains("added login handler"));

    complete_developer(&harness, 1, "\"fixed foo\"", &["src/auth.rs"]).await;
    harness.expect_message(&mut validate_sub).await;
    complete_validator(
        &harness,
        1,
        true,
        4,
        vec![CheckResult {
            check: "compile".to_string(),
            passed: true,
            message: String::new(),
        }],
    )
    .await;

    // Validation passing is announced before review
    let message = harness.expect_message(&mut passed_sub).await;
    let event = message
        .payload
        .as_any()
        .downcast_ref::<ValidationPassedEvent>()
        .unwrap();
    assert_eq!(event.checks_run, 4);

    let message = harness.expect_message(&mut review_sub).await;
    let request = message.payload.as_any().downcast_ref::<CodeReviewRequest>().unwrap();
    assert_eq!(request.developer_output, "\"fixed foo\"");

    complete_reviewer(&harness, 1, "approved", "", "").await;

    let message = harness.expect_message(&mut complete_sub).await;
    let event = message.payload.as_any().downcast_ref::<TaskCompleteEvent>().unwrap();
    assert_eq!(event.task_id, "t-1");
    assert_eq!(event.iterations, 1);
    assert_eq!(
        message.payload.to_json().unwrap(),
        json!({"task_id": "t-1", "slug": "add-auth", "iterations": 1})
    );

    let final_state = harness
        .wait_for::<TaskExecutionState, _>(KEY, |s| s.execution.status.is_terminal())
        .await;
    assert_eq!(final_state.execution.status, ExecutionStatus::Completed);

    harness.engine.shutdown().await;
}

#[tokio::test]
async fn too_big_rejection_routes_to_decomposition() {
    let harness = Harness::start().await;
    let mut develop_sub = harness.subscribe(subjects::AGENT_TASK_DEVELOPMENT).await;
    let mut validate_sub = harness
        .subscribe(subjects::ASYNC_STRUCTURAL_VALIDATOR)
        .await;
    let mut review_sub = harness.subscribe(subjects::AGENT_TASK_REVIEW).await;
    let mut decomposition_sub = harness
        .subscribe(subjects::TRIGGER_TASK_DECOMPOSITION)
        .await;

    send_trigger(&harness).await;

    harness.expect_message(&mut develop_sub).await;
    complete_developer(&harness, 0, "\"huge change\"", &["src/a.rs", "src/b.rs"]).await;
    harness.expect_message(&mut validate_sub).await;
    complete_validator(&harness, 0, true, 2, vec![]).await;
    harness.expect_message(&mut review_sub).await;

    complete_reviewer(
        &harness,
        0,
        "rejected",
        rejection::TOO_BIG,
        "Split into auth and profile sub-tasks",
    )
    .await;

    // Exactly one decomposition trigger with the reviewer's feedback
    let message = harness.expect_message(&mut decomposition_sub).await;
    let trigger = message
        .payload
        .as_any()
        .downcast_ref::<TaskDecompositionTrigger>()
        .unwrap();
    assert_eq!(trigger.original_task_id, "t-1");
    assert_eq!(trigger.plan_slug, "add-auth");
    assert_eq!(trigger.feedback, "Split into auth and profile sub-tasks");
    assert_eq!(
        message.payload.to_json().unwrap(),
        json!({
            "original_task_id": "t-1",
            "plan_slug": "add-auth",
            "feedback": "Split into auth and profile sub-tasks"
        })
    );

    // The execution froze; no further developer dispatch
    let final_state = harness
        .wait_for::<TaskExecutionState, _>(KEY, |s| s.execution.status.is_terminal())
        .await;
    assert!(final_state.execution.status.is_terminal());
    harness.expect_quiet(&mut develop_sub).await;
    harness.expect_quiet(&mut decomposition_sub).await;

    harness.engine.shutdown().await;
}

#[tokio::test]
async fn component_failure_surfaces_user_error() {
    let harness = Harness::start().await;
    let mut develop_sub = harness.subscribe(subjects::AGENT_TASK_DEVELOPMENT).await;
    let mut error_sub = harness.subscribe(subjects::USER_ERROR).await;

    send_trigger(&harness).await;
    harness.expect_message(&mut develop_sub).await;

    // The developer component declares failure instead of completing
    harness
        .wait_for::<TaskExecutionState, _>(KEY, |s| {
            s.execution.phase == phases::DEVELOPING_DISPATCHED
        })
        .await;
    harness
        .state()
        .update::<TaskExecutionState, _>(KEY, |s| {
            s.execution.phase = phases::DEVELOPMENT_FAILED.to_string();
            s.execution.error = Some("model refused the request".to_string());
        })
        .await
        .expect("component write should succeed");

    let message = harness.expect_message(&mut error_sub).await;
    let raw = message.payload.to_json().unwrap();
    assert_eq!(raw["execution_id"], KEY);
    assert_eq!(raw["error"], "model refused the request");

    let final_state = harness
        .wait_for::<TaskExecutionState, _>(KEY, |s| s.execution.status.is_terminal())
        .await;
    assert_eq!(final_state.execution.status, ExecutionStatus::Failed);

    harness.engine.shutdown().await;
}
