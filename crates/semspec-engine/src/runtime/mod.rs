//! Engine assembly
//!
//! The [`WorkflowEngine`] wires the payload and workflow registries, the
//! state manager, the dispatcher, and the watcher set over one bus
//! connection. `start` seals the registries and spawns one watcher task
//! per subject trigger and KV prefix plus the timeout sweeper; `shutdown`
//! flips the shutdown signal and joins every task after it drains its
//! in-flight event.

pub mod dispatcher;
pub mod evaluator;
pub mod registry;
pub mod sweeper;
pub mod watcher;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use semspec_messages::{EnvelopeCodec, PayloadError, PayloadRegistry, DEFAULT_SOURCE};

use crate::bus::{BusError, KvError, MessageBus};
use crate::rules::{Action, ActionError};
use crate::state::{StateError, StateManager, StateManagerConfig};

pub use dispatcher::{DispatchError, Dispatcher};
pub use evaluator::MUTATOR_FAILED_PHASE;
pub use registry::{RegistryError, WorkflowRegistry};

use evaluator::Evaluator;

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Bus failure
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// KV failure
    #[error("kv error: {0}")]
    Kv(#[from] KvError),

    /// State failure
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Payload failure
    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),

    /// Action failure
    #[error("action error: {0}")]
    Action(#[from] ActionError),

    /// Registry failure
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Dispatch failure
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// `start` called twice
    #[error("engine already started")]
    AlreadyStarted,

    /// Internal error
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Configuration for the workflow engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// KV bucket holding all execution state
    pub state_bucket: String,

    /// Envelope source name for engine-published messages
    pub source: String,

    /// Stream of the callback subject
    pub callback_stream: String,

    /// Private reply subject for the legacy async path
    pub callback_subject: String,

    /// Subject for sweeper escalations
    pub escalation_subject: String,

    /// Cadence of the timeout sweep
    pub sweep_interval: Duration,

    /// State manager tuning (CAS attempts, backoff)
    pub state: StateManagerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_bucket: "semspec-workflows".to_string(),
            source: DEFAULT_SOURCE.to_string(),
            callback_stream: "WORKFLOW".to_string(),
            callback_subject: "workflow.callback.engine".to_string(),
            escalation_subject: "user.signal.escalate".to_string(),
            sweep_interval: Duration::from_secs(30),
            state: StateManagerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Set the state bucket
    pub fn with_state_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.state_bucket = bucket.into();
        self
    }

    /// Set the envelope source
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Set the sweep cadence
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the state manager tuning
    pub fn with_state_config(mut self, state: StateManagerConfig) -> Self {
        self.state = state;
        self
    }
}

/// The reactive workflow engine
///
/// Holds process-wide registries (write-once at startup), one state
/// manager over the shared KV bucket, and the watcher task set.
pub struct WorkflowEngine {
    bus: Arc<dyn MessageBus>,
    payloads: Arc<PayloadRegistry>,
    registry: Arc<WorkflowRegistry>,
    state: Arc<StateManager>,
    dispatcher: Arc<Dispatcher>,
    evaluator: Arc<Evaluator>,
    config: EngineConfig,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl WorkflowEngine {
    /// Create an engine over the given bus and registries
    pub async fn new(
        bus: Arc<dyn MessageBus>,
        payloads: Arc<PayloadRegistry>,
        registry: Arc<WorkflowRegistry>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let bucket = bus.kv_bucket(&config.state_bucket).await?;
        let state = Arc::new(StateManager::with_config(bucket, config.state.clone()));
        let codec = EnvelopeCodec::new(payloads.clone(), config.source.clone());
        let dispatcher = Arc::new(Dispatcher::new(bus.clone(), codec));
        let evaluator = Arc::new(Evaluator::new(
            state.clone(),
            dispatcher.clone(),
            registry.clone(),
            config.callback_subject.clone(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            bus,
            payloads,
            registry,
            state,
            dispatcher,
            evaluator,
            config,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// The shared state manager
    pub fn state_manager(&self) -> Arc<StateManager> {
        self.state.clone()
    }

    /// The dispatcher (also handy for publishing triggers in tests)
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// The workflow registry
    pub fn registry(&self) -> Arc<WorkflowRegistry> {
        self.registry.clone()
    }

    /// The payload registry
    pub fn payloads(&self) -> Arc<PayloadRegistry> {
        self.payloads.clone()
    }

    /// The engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Seal the registries and spawn all watchers
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), EngineError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted);
        }

        self.registry.seal();
        let definitions = self.registry.definitions();
        let mut handles = Vec::new();

        let uses_callbacks = definitions.iter().any(|def| {
            def.rules
                .iter()
                .any(|rule| matches!(rule.action, Action::PublishAsync { .. }))
        });

        for def in &definitions {
            for (stream, subject) in def.subject_triggers() {
                let durable = durable_name(&def.id, &subject);
                let subscription = self.bus.subscribe(&stream, &subject, &durable).await?;
                handles.push(tokio::spawn(watcher::run_subject_watch(
                    self.evaluator.clone(),
                    self.dispatcher.codec().clone(),
                    def.clone(),
                    subscription,
                    subject,
                    self.shutdown_tx.subscribe(),
                )));
            }

            for (bucket, prefix) in def.kv_watches() {
                let kv = self.bus.kv_bucket(&bucket).await?;
                let stream = kv.watch(&prefix).await?;
                handles.push(tokio::spawn(watcher::run_kv_watch(
                    self.evaluator.clone(),
                    def.clone(),
                    stream,
                    self.shutdown_tx.subscribe(),
                )));
            }

            info!(workflow = %def.id, rules = def.rules.len(), "watching workflow");
        }

        if uses_callbacks {
            let subscription = self
                .bus
                .subscribe(
                    &self.config.callback_stream,
                    &self.config.callback_subject,
                    "engine-callbacks",
                )
                .await?;
            handles.push(tokio::spawn(watcher::run_callback_watch(
                self.evaluator.clone(),
                self.dispatcher.codec().clone(),
                subscription,
                self.shutdown_tx.subscribe(),
            )));
        }

        handles.push(tokio::spawn(sweeper::run_sweeper(
            self.state.clone(),
            self.dispatcher.clone(),
            self.registry.clone(),
            self.config.escalation_subject.clone(),
            self.config.sweep_interval,
            self.shutdown_tx.subscribe(),
        )));

        *self.handles.lock() = handles;
        info!(workflows = definitions.len(), "engine started");
        Ok(())
    }

    /// Signal shutdown and wait for every watcher to drain and exit
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock();
            std::mem::take(&mut *guard)
        };
        futures::future::join_all(handles).await;
        info!("engine stopped");
    }
}

fn durable_name(workflow_id: &str, subject: &str) -> String {
    format!("{}-{}", workflow_id, subject.replace(['.', '*', '>'], "-"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::rules::{
        build_from_state, mutate_on_result, mutate_state, Action, Condition, Rule, Trigger,
        WorkflowDefinition,
    };
    use crate::state::{ExecutionState, ExecutionStatus, HasExecutionState, StateCodec};
    use semspec_messages::{erase, AsyncStepResult, CallbackMeta, Payload};
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct ToyState {
        #[serde(flatten)]
        execution: ExecutionState,
        input: String,
        result: String,
    }

    impl HasExecutionState for ToyState {
        fn execution(&self) -> &ExecutionState {
            &self.execution
        }

        fn execution_mut(&mut self) -> &mut ExecutionState {
            &mut self.execution
        }
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct ToyTrigger {
        name: String,
        input: String,
    }

    impl Payload for ToyTrigger {
        const DOMAIN: &'static str = "test";
        const CATEGORY: &'static str = "toy-trigger";
        const VERSION: &'static str = "v1";
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct WorkRequest {
        execution_id: String,
        input: String,

        #[serde(default, skip_serializing_if = "String::is_empty")]
        task_id: String,

        #[serde(default, skip_serializing_if = "String::is_empty")]
        callback_subject: String,
    }

    impl Payload for WorkRequest {
        const DOMAIN: &'static str = "test";
        const CATEGORY: &'static str = "toy-work";
        const VERSION: &'static str = "v1";

        fn inject_callback(&mut self, meta: &CallbackMeta) {
            self.task_id = meta.task_id.clone();
            self.callback_subject = meta.callback_subject.clone();
            self.execution_id = meta.execution_id.clone();
        }
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct DoneEvent {
        name: String,
        result: String,
    }

    impl Payload for DoneEvent {
        const DOMAIN: &'static str = "test";
        const CATEGORY: &'static str = "toy-done";
        const VERSION: &'static str = "v1";
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct WorkResult {
        value: String,
    }

    impl Payload for WorkResult {
        const DOMAIN: &'static str = "test";
        const CATEGORY: &'static str = "toy-work-result";
        const VERSION: &'static str = "v1";
    }

    fn trigger_key() -> crate::rules::StateKeyFn {
        Arc::new(|message| {
            let trigger = message
                .as_any()
                .downcast_ref::<ToyTrigger>()
                .ok_or(ActionError::MissingMessage)?;
            Ok(format!("toy.{}", trigger.name))
        })
    }

    fn participant_workflow(bucket: &str) -> WorkflowDefinition {
        WorkflowDefinition::new("toy", bucket, "toy", StateCodec::of::<ToyState>())
            .with_description("toy participant workflow")
            .with_rule(Rule::new(
                "accept-trigger",
                Trigger::on_subject("TEST", "test.trigger", trigger_key()),
                vec![Condition::phase_is("")],
                Action::mutate(mutate_state::<ToyState, _>(|state, message| {
                    let message = message.ok_or(ActionError::MissingMessage)?;
                    let trigger = message
                        .as_any()
                        .downcast_ref::<ToyTrigger>()
                        .ok_or(ActionError::MissingMessage)?;
                    state.input = trigger.input.clone();
                    state.execution.phase = "pending".to_string();
                    Ok(())
                })),
            ))
            .with_rule(Rule::new(
                "dispatch-work",
                Trigger::watch_kv(bucket, "toy."),
                vec![Condition::phase_is("pending"), Condition::NotCompleted],
                Action::publish_with_mutation(
                    "test.work",
                    build_from_state::<ToyState, WorkRequest, _>(|state| {
                        Ok(WorkRequest {
                            execution_id: state.execution.id.clone(),
                            input: state.input.clone(),
                            ..Default::default()
                        })
                    }),
                    mutate_state::<ToyState, _>(|state, _message| {
                        state.execution.phase = "dispatched".to_string();
                        Ok(())
                    }),
                ),
            ))
            .with_rule(Rule::new(
                "work-done",
                Trigger::watch_kv(bucket, "toy."),
                vec![Condition::phase_is("done"), Condition::NotCompleted],
                Action::complete_with_event(
                    "test.events.done",
                    build_from_state::<ToyState, DoneEvent, _>(|state| {
                        Ok(DoneEvent {
                            name: state.execution.id.clone(),
                            result: state.result.clone(),
                        })
                    }),
                ),
            ))
    }

    async fn engine_with(
        definition: WorkflowDefinition,
        result_types: bool,
    ) -> (Arc<InMemoryBus>, WorkflowEngine) {
        let bus = Arc::new(InMemoryBus::new());
        let payloads = Arc::new(PayloadRegistry::new());
        payloads.register::<ToyTrigger>().unwrap();
        payloads.register::<WorkRequest>().unwrap();
        payloads.register::<DoneEvent>().unwrap();

        let registry = Arc::new(WorkflowRegistry::new());
        registry.register(definition).unwrap();
        if result_types {
            registry.register_result_type::<WorkResult>().unwrap();
        }

        let engine = WorkflowEngine::new(
            bus.clone(),
            payloads,
            registry,
            EngineConfig::default().with_state_bucket("toy-bucket"),
        )
        .await
        .unwrap();

        (bus, engine)
    }

    async fn wait_for_state(
        state: &StateManager,
        key: &str,
        predicate: impl Fn(&ToyState) -> bool,
    ) -> ToyState {
        for _ in 0..200 {
            if let Some(entry) = state.get_raw(key).await.unwrap() {
                let parsed: ToyState = serde_json::from_slice(&entry.value).unwrap();
                if predicate(&parsed) {
                    return parsed;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for state condition on {key}");
    }

    #[tokio::test]
    async fn test_participant_round_trip() {
        let (bus, engine) = engine_with(participant_workflow("toy-bucket"), false).await;
        let mut work_sub = bus.subscribe("TEST", "test.work", "t").await.unwrap();
        let mut done_sub = bus.subscribe("TEST", "test.events.done", "t").await.unwrap();

        engine.start().await.unwrap();

        engine
            .dispatcher()
            .publish(
                "test.trigger",
                erase(ToyTrigger {
                    name: "demo".to_string(),
                    input: "payload".to_string(),
                })
                .as_ref(),
            )
            .await
            .unwrap();

        // Trigger creates the execution, the KV tick dispatches work
        let manager = engine.state_manager();
        wait_for_state(&manager, "toy.demo", |s| s.execution.phase == "dispatched").await;

        let delivery = work_sub.next().await.unwrap();
        let decoded = engine.dispatcher().codec().decode(&delivery.payload).unwrap();
        let request = decoded.payload.as_any().downcast_ref::<WorkRequest>().unwrap();
        assert_eq!(request.execution_id, "toy.demo");
        assert_eq!(request.input, "payload");

        // Simulate the participant component writing its completion phase
        manager
            .update::<ToyState, _>("toy.demo", |s| {
                s.result = "ok".to_string();
                s.execution.phase = "done".to_string();
            })
            .await
            .unwrap();

        let delivery = done_sub.next().await.unwrap();
        let decoded = engine.dispatcher().codec().decode(&delivery.payload).unwrap();
        let event = decoded.payload.as_any().downcast_ref::<DoneEvent>().unwrap();
        assert_eq!(event.result, "ok");

        let final_state =
            wait_for_state(&manager, "toy.demo", |s| s.execution.status.is_terminal()).await;
        assert_eq!(final_state.execution.status, ExecutionStatus::Completed);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_redelivered_trigger_does_not_redispatch() {
        let (bus, engine) = engine_with(participant_workflow("toy-bucket"), false).await;
        let mut work_sub = bus.subscribe("TEST", "test.work", "t").await.unwrap();

        engine.start().await.unwrap();

        let trigger = ToyTrigger {
            name: "demo".to_string(),
            input: "payload".to_string(),
        };
        engine
            .dispatcher()
            .publish("test.trigger", erase(trigger.clone()).as_ref())
            .await
            .unwrap();

        let manager = engine.state_manager();
        wait_for_state(&manager, "toy.demo", |s| s.execution.phase == "dispatched").await;
        let first = work_sub.next().await.unwrap();
        drop(first);

        // Redeliver the trigger: the phase guard makes it a no-op
        engine
            .dispatcher()
            .publish("test.trigger", erase(trigger).as_ref())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::select! {
            _ = work_sub.next() => panic!("re-dispatch should not happen"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }

        engine.shutdown().await;
    }

    fn async_workflow(bucket: &str) -> WorkflowDefinition {
        WorkflowDefinition::new("toy-async", bucket, "toy", StateCodec::of::<ToyState>())
            .with_rule(Rule::new(
                "accept-trigger",
                Trigger::on_subject("TEST", "test.trigger", trigger_key()),
                vec![Condition::phase_is("")],
                Action::mutate(mutate_state::<ToyState, _>(|state, _message| {
                    state.execution.phase = "asking".to_string();
                    Ok(())
                })),
            ))
            .with_rule(Rule::new(
                "ask",
                Trigger::watch_kv(bucket, "toy."),
                vec![Condition::phase_is("asking"), Condition::NotCompleted],
                Action::publish_async(
                    "test.work",
                    build_from_state::<ToyState, WorkRequest, _>(|state| {
                        Ok(WorkRequest {
                            execution_id: state.execution.id.clone(),
                            input: state.input.clone(),
                            ..Default::default()
                        })
                    }),
                    WorkResult::schema(),
                    mutate_on_result::<ToyState, _>(|state, result, decoded| {
                        if result.is_success() {
                            let value = decoded
                                .and_then(|d| d.as_any().downcast_ref::<WorkResult>())
                                .map(|r| r.value.clone())
                                .unwrap_or_default();
                            state.result = value;
                            state.execution.phase = "done".to_string();
                        } else {
                            state.execution.phase = "ask_failed".to_string();
                            state.execution.error = Some(result.error.clone());
                        }
                        Ok(())
                    }),
                ),
            ))
            .with_rule(Rule::new(
                "work-done",
                Trigger::watch_kv(bucket, "toy."),
                vec![Condition::phase_is("done"), Condition::NotCompleted],
                Action::complete_with_event(
                    "test.events.done",
                    build_from_state::<ToyState, DoneEvent, _>(|state| {
                        Ok(DoneEvent {
                            name: state.execution.id.clone(),
                            result: state.result.clone(),
                        })
                    }),
                ),
            ))
    }

    #[tokio::test]
    async fn test_async_callback_round_trip() {
        let (bus, engine) = engine_with(async_workflow("toy-bucket"), true).await;
        let mut work_sub = bus.subscribe("TEST", "test.work", "t").await.unwrap();

        engine.start().await.unwrap();

        engine
            .dispatcher()
            .publish(
                "test.trigger",
                erase(ToyTrigger {
                    name: "demo".to_string(),
                    input: "payload".to_string(),
                })
                .as_ref(),
            )
            .await
            .unwrap();

        // The dispatched request carries the injected callback metadata
        let delivery = work_sub.next().await.unwrap();
        let raw: Value = serde_json::from_slice(&delivery.payload).unwrap();
        let task_id = raw["payload"]["task_id"].as_str().unwrap().to_string();
        let callback_subject = raw["payload"]["callback_subject"].as_str().unwrap().to_string();
        assert_eq!(raw["payload"]["execution_id"], "toy.demo");

        let manager = engine.state_manager();
        let pending =
            wait_for_state(&manager, "toy.demo", |s| s.execution.pending_task_id.is_some()).await;
        assert_eq!(pending.execution.pending_task_id.as_deref(), Some(task_id.as_str()));

        // Post the reply on the callback subject
        let reply = AsyncStepResult::success(&task_id, "toy.demo", json!({"value": "forty-two"}));
        let bytes = engine.dispatcher().codec().encode_result(&reply).unwrap();
        bus.publish(&callback_subject, bytes).await.unwrap();

        let final_state =
            wait_for_state(&manager, "toy.demo", |s| s.execution.status.is_terminal()).await;
        assert_eq!(final_state.execution.status, ExecutionStatus::Completed);
        assert_eq!(final_state.result, "forty-two");
        assert!(final_state.execution.pending_task_id.is_none());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweeper_times_out_stale_executions() {
        let definition = participant_workflow("toy-bucket").with_timeout(Duration::from_millis(20));
        let (bus, engine) = engine_with(definition, false).await;
        let mut escalations = bus
            .subscribe("USER", "user.signal.escalate", "t")
            .await
            .unwrap();

        // Create a running execution directly, without starting the watchers
        let manager = engine.state_manager();
        let def = engine.registry().get("toy").unwrap();
        let codec = def.codec.seeded("toy.stale", &def.id);
        manager
            .transition("toy.stale", &codec, |state| {
                state.base_mut().phase = "pending".to_string();
                Ok(())
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        sweeper::sweep_once(
            &manager,
            &engine.dispatcher(),
            &engine.registry(),
            "user.signal.escalate",
        )
        .await;

        let state = wait_for_state(&manager, "toy.stale", |s| s.execution.status.is_terminal()).await;
        assert_eq!(state.execution.status, ExecutionStatus::TimedOut);

        let delivery = escalations.next().await.unwrap();
        let raw: Value = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(raw["payload"]["execution_id"], "toy.stale");
    }
}
