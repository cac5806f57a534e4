//! Timeout sweeper
//!
//! Periodically scans every workflow's key prefix and times out running
//! executions whose `updated_at` is older than the workflow timeout. Each
//! timeout is recorded through the normal CAS path and surfaced as an
//! escalation signal.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use semspec_messages::{erase, payloads::EscalationSignal};

use crate::rules::WorkflowDefinition;
use crate::state::{ExecutionStatus, StateError, StateManager};

use super::dispatcher::Dispatcher;
use super::registry::WorkflowRegistry;

/// Run the sweep loop until shutdown
pub(crate) async fn run_sweeper(
    state: Arc<StateManager>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<WorkflowRegistry>,
    escalation_subject: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so a fresh engine does not
    // sweep executions it has not seen yet.
    ticker.tick().await;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                sweep_once(&state, &dispatcher, &registry, &escalation_subject).await;
            }
        }
    }
    debug!("sweeper stopped");
}

/// One full sweep over all registered workflows
pub(crate) async fn sweep_once(
    state: &StateManager,
    dispatcher: &Dispatcher,
    registry: &WorkflowRegistry,
    escalation_subject: &str,
) {
    for def in registry.definitions() {
        let keys = match state.keys(&def.key_prefix()).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(workflow = %def.id, %err, "sweep could not list keys");
                continue;
            }
        };

        for key in keys {
            sweep_key(state, dispatcher, &def, &key, escalation_subject).await;
        }
    }
}

async fn sweep_key(
    state: &StateManager,
    dispatcher: &Dispatcher,
    def: &Arc<WorkflowDefinition>,
    key: &str,
    escalation_subject: &str,
) {
    let codec = def.codec.seeded(key, &def.id);

    let loaded = match state.load(key, &codec).await {
        Ok(Some((loaded, _revision))) => loaded,
        Ok(None) => return,
        Err(err) => {
            warn!(key, %err, "sweep could not load state");
            return;
        }
    };

    let base = loaded.base();
    if !base.is_running() {
        return;
    }

    let timeout = match chrono::Duration::from_std(def.timeout) {
        Ok(timeout) => timeout,
        Err(_) => return,
    };
    if Utc::now() - base.updated_at < timeout {
        return;
    }

    let result = state
        .transition(key, &codec, |state| {
            let base = state.base_mut();
            base.status = ExecutionStatus::TimedOut;
            base.error = Some("execution timed out".to_string());
            Ok(())
        })
        .await;

    match result {
        Ok(committed) => {
            info!(workflow = %def.id, key, "execution timed out");
            let signal = EscalationSignal {
                reason: format!("workflow {} timed out", def.id),
                iteration: committed.base().iteration,
                last_verdict: String::new(),
                execution_id: key.to_string(),
            };
            if let Err(err) = dispatcher
                .publish(escalation_subject, erase(signal).as_ref())
                .await
            {
                warn!(key, %err, "could not publish timeout escalation");
            }
        }
        // Raced with a terminal transition; nothing to do
        Err(StateError::Terminal { .. }) => {}
        Err(err) => warn!(key, %err, "could not time out execution"),
    }
}
