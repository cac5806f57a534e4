//! Schema tags and the payload trait family
//!
//! A payload is any value that travels inside a [`BaseMessage`] envelope.
//! Typed code implements [`Payload`]; the engine works with the type-erased
//! [`AnyPayload`] object form and downcasts once, at the workflow boundary.
//!
//! [`BaseMessage`]: crate::envelope::BaseMessage

use std::any::Any;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::envelope::CallbackMeta;

/// Identifies a payload type on the wire.
///
/// Tags are compared structurally; two payload types may never share a tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaTag {
    pub domain: String,
    pub category: String,
    pub version: String,
}

impl SchemaTag {
    /// Create a new schema tag
    pub fn new(
        domain: impl Into<String>,
        category: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            category: category.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for SchemaTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.domain, self.category, self.version)
    }
}

/// Errors from payload registration, decoding, and validation
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// No decoder registered for the schema tag
    #[error("schema not registered: {0}")]
    SchemaNotRegistered(SchemaTag),

    /// The tag is already bound to a different payload type
    #[error("schema {0} already registered with a different payload type")]
    DuplicateRegistration(SchemaTag),

    /// Payload-level validation rejected the value
    #[error("payload validation failed: {0}")]
    Validation(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The envelope itself could not be parsed
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
}

/// A typed wire payload.
///
/// The schema tag is carried as associated constants so the tag is known
/// without an instance (registration, dispatch tables). `validate` runs on
/// every decode; `inject_callback` is a hook for the legacy async dispatch
/// path and is a no-op for everything else.
pub trait Payload: Serialize + Send + Sync + 'static {
    /// Schema domain, e.g. `workflow`
    const DOMAIN: &'static str;

    /// Schema category, e.g. `planner-request`
    const CATEGORY: &'static str;

    /// Schema version, e.g. `v1`
    const VERSION: &'static str;

    /// The schema tag for this payload type
    fn schema() -> SchemaTag {
        SchemaTag::new(Self::DOMAIN, Self::CATEGORY, Self::VERSION)
    }

    /// Validate a decoded value before it reaches rule code
    fn validate(&self) -> Result<(), PayloadError> {
        Ok(())
    }

    /// Accept callback metadata at dispatch time (legacy async path only)
    fn inject_callback(&mut self, _meta: &CallbackMeta) {}
}

/// Type-erased payload interface
///
/// The engine moves payloads around as `Box<dyn AnyPayload>`; workflow
/// mutators and builders recover the concrete type through `as_any`.
pub trait AnyPayload: Send + Sync {
    /// Schema tag of the wrapped value
    fn schema_tag(&self) -> SchemaTag;

    /// Run the payload's own validation
    fn validate(&self) -> Result<(), PayloadError>;

    /// Serialize the wrapped value to JSON
    fn to_json(&self) -> Result<serde_json::Value, PayloadError>;

    /// Forward callback metadata to the wrapped value
    fn inject_callback(&mut self, meta: &CallbackMeta);

    /// Access the wrapped value for downcasting
    fn as_any(&self) -> &dyn Any;
}

/// Wrapper implementing [`AnyPayload`] for any [`Payload`]
struct PayloadWrapper<P: Payload> {
    inner: P,
}

impl<P: Payload> AnyPayload for PayloadWrapper<P> {
    fn schema_tag(&self) -> SchemaTag {
        P::schema()
    }

    fn validate(&self) -> Result<(), PayloadError> {
        self.inner.validate()
    }

    fn to_json(&self) -> Result<serde_json::Value, PayloadError> {
        Ok(serde_json::to_value(&self.inner)?)
    }

    fn inject_callback(&mut self, meta: &CallbackMeta) {
        self.inner.inject_callback(meta);
    }

    fn as_any(&self) -> &dyn Any {
        &self.inner
    }
}

/// Erase a typed payload into the engine-facing object form
pub fn erase<P: Payload>(payload: P) -> Box<dyn AnyPayload> {
    Box::new(PayloadWrapper { inner: payload })
}

/// Decode a JSON value into an erased payload of a known type
pub(crate) fn decode_erased<P>(value: &serde_json::Value) -> Result<Box<dyn AnyPayload>, PayloadError>
where
    P: Payload + DeserializeOwned,
{
    let inner: P = serde_json::from_value(value.clone())?;
    Ok(Box::new(PayloadWrapper { inner }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        message: String,
    }

    impl Payload for Ping {
        const DOMAIN: &'static str = "test";
        const CATEGORY: &'static str = "ping";
        const VERSION: &'static str = "v1";
    }

    #[test]
    fn test_schema_tag_display() {
        let tag = SchemaTag::new("workflow", "planner-request", "v1");
        assert_eq!(tag.to_string(), "workflow/planner-request@v1");
    }

    #[test]
    fn test_schema_tag_round_trip() {
        let tag = SchemaTag::new("workflow", "planner-request", "v1");
        let json = serde_json::to_string(&tag).unwrap();
        let parsed: SchemaTag = serde_json::from_str(&json).unwrap();
        assert_eq!(tag, parsed);
    }

    #[test]
    fn test_erased_payload_reports_schema() {
        let erased = erase(Ping {
            message: "hi".to_string(),
        });
        assert_eq!(erased.schema_tag(), Ping::schema());
        assert_eq!(erased.to_json().unwrap(), json!({"message": "hi"}));
    }

    #[test]
    fn test_downcast_through_as_any() {
        let erased = erase(Ping {
            message: "hi".to_string(),
        });
        let typed = erased.as_any().downcast_ref::<Ping>().expect("should downcast");
        assert_eq!(typed.message, "hi");
    }
}
