//! Shared harness for the workflow integration tests
//!
//! Runs the full engine over the in-memory bus and simulates Participant
//! components by writing completion phases through the state manager,
//! the way real components do over the remote bus.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use semspec_engine::bus::{InMemoryBus, MessageBus, Subscription};
use semspec_engine::runtime::{EngineConfig, WorkflowEngine};
use semspec_engine::state::StateManager;
use semspec_messages::{erase, DecodedMessage, EnvelopeCodec, Payload};
use semspec_workflows::start_engine;

pub struct Harness {
    pub bus: Arc<InMemoryBus>,
    pub engine: WorkflowEngine,
}

impl Harness {
    /// Boot the full workflow set over a fresh in-memory bus
    pub async fn start() -> Self {
        let bus = Arc::new(InMemoryBus::new());
        let engine = start_engine(bus.clone(), EngineConfig::default())
            .await
            .expect("engine should start");
        Self { bus, engine }
    }

    pub fn codec(&self) -> EnvelopeCodec {
        self.engine.dispatcher().codec().clone()
    }

    pub fn state(&self) -> Arc<StateManager> {
        self.engine.state_manager()
    }

    /// Subscribe like an external consumer
    pub async fn subscribe(&self, subject: &str) -> Subscription {
        self.bus
            .subscribe("TEST", subject, "test-consumer")
            .await
            .expect("subscribe should succeed")
    }

    /// Publish an enveloped payload, as upstream producers do
    pub async fn publish<P: Payload>(&self, subject: &str, payload: P) {
        self.engine
            .dispatcher()
            .publish(subject, erase(payload).as_ref())
            .await
            .expect("publish should succeed");
    }

    /// Receive and decode the next message, with a timeout
    pub async fn expect_message(&self, subscription: &mut Subscription) -> DecodedMessage {
        let delivery = tokio::time::timeout(Duration::from_secs(2), subscription.next())
            .await
            .expect("timed out waiting for a message")
            .expect("subscription closed");
        self.codec()
            .decode(&delivery.payload)
            .expect("message should decode")
    }

    /// Assert that no message arrives within a grace period
    pub async fn expect_quiet(&self, subscription: &mut Subscription) {
        tokio::select! {
            delivery = subscription.next() => {
                let subject = delivery.map(|d| d.subject).unwrap_or_default();
                panic!("unexpected message on {subject}");
            }
            _ = tokio::time::sleep(Duration::from_millis(120)) => {}
        }
    }

    /// Poll the KV cell until the typed state satisfies the predicate
    pub async fn wait_for<S, F>(&self, key: &str, predicate: F) -> S
    where
        S: DeserializeOwned,
        F: Fn(&S) -> bool,
    {
        let manager = self.state();
        for _ in 0..300 {
            if let Some(entry) = manager.get_raw(key).await.expect("kv get should succeed") {
                if let Ok(state) = serde_json::from_slice::<S>(&entry.value) {
                    if predicate(&state) {
                        return state;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for state condition on {key}");
    }
}
