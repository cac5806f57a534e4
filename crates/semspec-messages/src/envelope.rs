//! On-wire envelopes
//!
//! `BaseMessage` is the single envelope every bus subject carries: the
//! schema tag, the raw payload document, and the publishing source. The
//! codec pairs it with the payload registry so decoding yields a typed,
//! validated value.
//!
//! `AsyncStepResult` is a second, smaller envelope that exists only for the
//! legacy async-callback path retained by the coordination workflow.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::PayloadRegistry;
use crate::schema::{AnyPayload, PayloadError, SchemaTag};

/// Default envelope source for engine-published messages
pub const DEFAULT_SOURCE: &str = "reactive-workflow";

/// The wire envelope carried on every subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseMessage {
    /// Schema tag identifying the payload type
    #[serde(rename = "type")]
    pub schema: SchemaTag,

    /// The payload document, serialized separately by the caller
    pub payload: Value,

    /// Publishing component, e.g. `reactive-workflow`
    pub source: String,
}

/// Callback metadata injected into a payload at dispatch time
///
/// Only the legacy async path uses this; Participant dispatches carry the
/// execution id inside the payload itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallbackMeta {
    pub task_id: String,
    pub callback_subject: String,
    pub execution_id: String,
}

/// Outcome of an async step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
}

/// Reply envelope for the legacy async-callback path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncStepResult {
    /// Matches the `task_id` injected at dispatch time
    pub task_id: String,

    /// KV key of the owning execution
    pub execution_id: String,

    /// Whether the step succeeded
    pub status: StepStatus,

    /// Raw result document; decoded via the workflow's result-type table
    #[serde(default)]
    pub output: Value,

    /// Error description when `status` is `failed`
    #[serde(default)]
    pub error: String,
}

impl AsyncStepResult {
    /// Create a success result
    pub fn success(
        task_id: impl Into<String>,
        execution_id: impl Into<String>,
        output: Value,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            execution_id: execution_id.into(),
            status: StepStatus::Success,
            output,
            error: String::new(),
        }
    }

    /// Create a failed result
    pub fn failed(
        task_id: impl Into<String>,
        execution_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            execution_id: execution_id.into(),
            status: StepStatus::Failed,
            output: Value::Null,
            error: error.into(),
        }
    }

    /// Check whether the step succeeded
    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

/// A decoded inbound envelope
pub struct DecodedMessage {
    pub schema: SchemaTag,
    pub source: String,
    pub payload: Box<dyn AnyPayload>,
}

/// Marshals and unmarshals `BaseMessage` envelopes
#[derive(Clone)]
pub struct EnvelopeCodec {
    registry: Arc<PayloadRegistry>,
    source: String,
}

impl EnvelopeCodec {
    /// Create a codec publishing under the given source name
    pub fn new(registry: Arc<PayloadRegistry>, source: impl Into<String>) -> Self {
        Self {
            registry,
            source: source.into(),
        }
    }

    /// The payload registry backing this codec
    pub fn registry(&self) -> &Arc<PayloadRegistry> {
        &self.registry
    }

    /// Envelope and serialize an outbound payload
    pub fn encode(&self, payload: &dyn AnyPayload) -> Result<Vec<u8>, PayloadError> {
        let message = BaseMessage {
            schema: payload.schema_tag(),
            payload: payload.to_json()?,
            source: self.source.clone(),
        };
        Ok(serde_json::to_vec(&message)?)
    }

    /// Parse an inbound envelope, decode its payload, and validate it
    pub fn decode(&self, bytes: &[u8]) -> Result<DecodedMessage, PayloadError> {
        let base: BaseMessage = serde_json::from_slice(bytes)
            .map_err(|e| PayloadError::MalformedEnvelope(e.to_string()))?;

        let payload = self.registry.decode(&base.schema, &base.payload)?;
        payload.validate()?;

        Ok(DecodedMessage {
            schema: base.schema,
            source: base.source,
            payload,
        })
    }

    /// Serialize an async-result envelope
    pub fn encode_result(&self, result: &AsyncStepResult) -> Result<Vec<u8>, PayloadError> {
        Ok(serde_json::to_vec(result)?)
    }

    /// Parse an async-result envelope
    pub fn decode_result(&self, bytes: &[u8]) -> Result<AsyncStepResult, PayloadError> {
        serde_json::from_slice(bytes).map_err(|e| PayloadError::MalformedEnvelope(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{erase, Payload};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        message: String,
    }

    impl Payload for Ping {
        const DOMAIN: &'static str = "test";
        const CATEGORY: &'static str = "ping";
        const VERSION: &'static str = "v1";

        fn validate(&self) -> Result<(), PayloadError> {
            if self.message.is_empty() {
                return Err(PayloadError::Validation("message must not be empty".into()));
            }
            Ok(())
        }
    }

    fn codec() -> EnvelopeCodec {
        let registry = Arc::new(PayloadRegistry::new());
        registry.register::<Ping>().unwrap();
        EnvelopeCodec::new(registry, "test-source")
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let codec = codec();
        let bytes = codec
            .encode(erase(Ping {
                message: "hello".to_string(),
            })
            .as_ref())
            .unwrap();

        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.schema, Ping::schema());
        assert_eq!(decoded.source, "test-source");

        let typed = decoded.payload.as_any().downcast_ref::<Ping>().unwrap();
        assert_eq!(typed.message, "hello");
    }

    #[test]
    fn test_envelope_shape_on_wire() {
        let codec = codec();
        let bytes = codec
            .encode(erase(Ping {
                message: "hello".to_string(),
            })
            .as_ref())
            .unwrap();

        let raw: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            raw["type"],
            json!({"domain": "test", "category": "ping", "version": "v1"})
        );
        assert_eq!(raw["payload"], json!({"message": "hello"}));
        assert_eq!(raw["source"], "test-source");
    }

    #[test]
    fn test_decode_rejects_invalid_payload() {
        let codec = codec();
        let bytes = codec
            .encode(erase(Ping {
                message: String::new(),
            })
            .as_ref())
            .unwrap();

        let result = codec.decode(&bytes);
        assert!(matches!(result, Err(PayloadError::Validation(_))));
    }

    #[test]
    fn test_decode_rejects_malformed_envelope() {
        let codec = codec();
        let result = codec.decode(b"not json at all");
        assert!(matches!(result, Err(PayloadError::MalformedEnvelope(_))));
    }

    #[test]
    fn test_async_result_round_trip() {
        let codec = codec();
        let result = AsyncStepResult::success("task-1", "coordination.demo", json!({"ok": true}));

        let bytes = codec.encode_result(&result).unwrap();
        let parsed = codec.decode_result(&bytes).unwrap();

        assert_eq!(parsed, result);
        assert!(parsed.is_success());
    }

    #[test]
    fn test_failed_result() {
        let result = AsyncStepResult::failed("task-1", "coordination.demo", "boom");
        assert!(!result.is_success());
        assert_eq!(result.error, "boom");
        assert_eq!(result.output, Value::Null);
    }
}
