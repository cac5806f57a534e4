//! Dispatcher: enveloped publication to bus subjects
//!
//! Participant dispatch is fire-and-forget: the payload is enveloped under
//! its schema and published once. Re-dispatch protection comes from the
//! dispatched-phase condition on the publishing rule, not from the bus.

use std::sync::Arc;

use tracing::debug;

use semspec_messages::{AnyPayload, CallbackMeta, EnvelopeCodec, PayloadError};

use crate::bus::{BusError, MessageBus};

/// Errors from dispatch operations
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Payload could not be enveloped
    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),

    /// Bus publish failed
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

/// Publishes typed payloads as enveloped bus messages
pub struct Dispatcher {
    bus: Arc<dyn MessageBus>,
    codec: EnvelopeCodec,
}

impl Dispatcher {
    /// Create a dispatcher over the given bus and codec
    pub fn new(bus: Arc<dyn MessageBus>, codec: EnvelopeCodec) -> Self {
        Self { bus, codec }
    }

    /// The envelope codec used for encoding
    pub fn codec(&self) -> &EnvelopeCodec {
        &self.codec
    }

    /// Envelope and publish a payload on a subject
    pub async fn publish(
        &self,
        subject: &str,
        payload: &dyn AnyPayload,
    ) -> Result<(), DispatchError> {
        let bytes = self.codec.encode(payload)?;
        self.bus.publish(subject, bytes).await?;
        debug!(subject, schema = %payload.schema_tag(), "dispatched payload");
        Ok(())
    }

    /// Inject callback metadata, then publish (legacy async path)
    pub async fn publish_with_callback(
        &self,
        subject: &str,
        payload: &mut Box<dyn AnyPayload>,
        meta: &CallbackMeta,
    ) -> Result<(), DispatchError> {
        payload.inject_callback(meta);
        self.publish(subject, payload.as_ref()).await
    }
}
