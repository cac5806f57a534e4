//! Payload registry for type-erased payload decoding
//!
//! Maps a schema tag to a decoder that produces a typed payload value
//! without the caller knowing the concrete type at runtime. Registrations
//! happen once at startup; re-registering the same type under the same tag
//! is idempotent, binding a tag to a second type is an error.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::schema::{decode_erased, AnyPayload, Payload, PayloadError, SchemaTag};

/// Decoder function type producing an erased payload from raw JSON
type DecodeFn = Arc<dyn Fn(&Value) -> Result<Box<dyn AnyPayload>, PayloadError> + Send + Sync>;

struct RegistryEntry {
    type_id: TypeId,
    decode: DecodeFn,
}

/// Registry of payload decoders keyed by schema tag
///
/// Process-wide and write-once at startup: the engine holds it behind an
/// `Arc` and only reads after boot.
pub struct PayloadRegistry {
    entries: RwLock<HashMap<SchemaTag, RegistryEntry>>,
}

impl PayloadRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register a payload type under its schema tag
    ///
    /// Registering the same type twice is a no-op; registering a different
    /// type under an already-bound tag fails.
    pub fn register<P>(&self) -> Result<(), PayloadError>
    where
        P: Payload + DeserializeOwned,
    {
        let tag = P::schema();
        let mut entries = self.entries.write();

        if let Some(existing) = entries.get(&tag) {
            if existing.type_id == TypeId::of::<P>() {
                return Ok(());
            }
            return Err(PayloadError::DuplicateRegistration(tag));
        }

        entries.insert(
            tag,
            RegistryEntry {
                type_id: TypeId::of::<P>(),
                decode: Arc::new(decode_erased::<P>),
            },
        );
        Ok(())
    }

    /// Check whether a schema tag is registered
    pub fn contains(&self, tag: &SchemaTag) -> bool {
        self.entries.read().contains_key(tag)
    }

    /// Decode a raw JSON payload under the given schema tag
    pub fn decode(&self, tag: &SchemaTag, payload: &Value) -> Result<Box<dyn AnyPayload>, PayloadError> {
        let decode = self
            .entries
            .read()
            .get(tag)
            .map(|entry| entry.decode.clone())
            .ok_or_else(|| PayloadError::SchemaNotRegistered(tag.clone()))?;

        decode(payload)
    }

    /// Number of registered schema tags
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for PayloadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PayloadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read();
        f.debug_struct("PayloadRegistry")
            .field("schemas", &entries.keys().collect::<Vec<_>>())
            .finish()
    }
}
