//! Watcher loops turning bus and KV events into rule activations
//!
//! One loop runs per distinct `OnSubject` (stream, subject) and per
//! distinct `WatchKv` prefix of each workflow, plus one callback consumer
//! for the legacy async path. All loops drain their current event and exit
//! when the shutdown signal flips.
//!
//! Ack policy: decode/validation failures ack-drop (poison pill), action
//! failures nack for redelivery, unmatched events ack.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use semspec_messages::EnvelopeCodec;

use crate::bus::{Delivery, KvWatch, Subscription};
use crate::rules::WorkflowDefinition;

use super::evaluator::Evaluator;

/// Consume a subject subscription for one workflow
pub(crate) async fn run_subject_watch(
    evaluator: Arc<Evaluator>,
    codec: EnvelopeCodec,
    def: Arc<WorkflowDefinition>,
    mut subscription: Subscription,
    subject: String,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            maybe = subscription.next() => {
                let Some(delivery) = maybe else { break };
                handle_delivery(&evaluator, &codec, &def, delivery).await;
            }
        }
    }
    debug!(workflow = %def.id, subject, "subject watcher stopped");
}

async fn handle_delivery(
    evaluator: &Evaluator,
    codec: &EnvelopeCodec,
    def: &Arc<WorkflowDefinition>,
    delivery: Delivery,
) {
    let decoded = match codec.decode(&delivery.payload) {
        Ok(decoded) => decoded,
        Err(err) => {
            warn!(subject = %delivery.subject, %err, "dropping undecodable message");
            delivery.ack().await;
            return;
        }
    };

    let key = match def.state_key_for(&delivery.subject, decoded.payload.as_ref()) {
        Some(Ok(key)) => key,
        Some(Err(err)) => {
            warn!(subject = %delivery.subject, %err, "dropping message without a state key");
            delivery.ack().await;
            return;
        }
        None => {
            delivery.ack().await;
            return;
        }
    };

    match evaluator
        .on_message(def, &delivery.subject, decoded.payload.as_ref(), &key)
        .await
    {
        Ok(()) => delivery.ack().await,
        Err(err) => {
            warn!(
                workflow = %def.id,
                key,
                %err,
                delivery_count = delivery.delivery_count,
                "rule evaluation failed; redelivering"
            );
            delivery.nack().await;
        }
    }
}

/// Consume a KV change stream for one workflow
pub(crate) async fn run_kv_watch(
    evaluator: Arc<Evaluator>,
    def: Arc<WorkflowDefinition>,
    mut stream: KvWatch,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            maybe = stream.next() => {
                let Some(entry) = maybe else { break };
                if let Err(err) = evaluator.on_kv_change(&def, &entry.key).await {
                    warn!(workflow = %def.id, key = %entry.key, %err, "kv rule evaluation failed");
                }
            }
        }
    }
    debug!(workflow = %def.id, "kv watcher stopped");
}

/// Consume the callback subject for the legacy async path
pub(crate) async fn run_callback_watch(
    evaluator: Arc<Evaluator>,
    codec: EnvelopeCodec,
    mut subscription: Subscription,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            maybe = subscription.next() => {
                let Some(delivery) = maybe else { break };
                match codec.decode_result(&delivery.payload) {
                    Ok(result) => match evaluator.on_callback(result).await {
                        Ok(()) => delivery.ack().await,
                        Err(err) => {
                            warn!(%err, "callback handling failed; redelivering");
                            delivery.nack().await;
                        }
                    },
                    Err(err) => {
                        warn!(%err, "dropping undecodable callback envelope");
                        delivery.ack().await;
                    }
                }
            }
        }
    }
    debug!("callback watcher stopped");
}
