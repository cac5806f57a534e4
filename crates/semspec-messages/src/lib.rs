//! # Semspec Wire Contracts
//!
//! Schema-tagged payload types and the envelope codec used on the message
//! bus. Every payload carries a `(domain, category, version)` schema tag;
//! the [`PayloadRegistry`] maps tags to decoders so inbound envelopes can be
//! turned back into typed values without the caller knowing the concrete
//! type up front.
//!
//! The crate has three layers:
//!
//! - [`schema`]: the [`Payload`] trait family and [`SchemaTag`]
//! - [`registry`]: the process-wide tag -> decoder map
//! - [`envelope`]: the `BaseMessage` wire format and the async-result
//!   envelope retained for the legacy callback path
//!
//! Concrete payloads live under [`payloads`], grouped by the workflow that
//! owns them.

pub mod envelope;
pub mod payloads;
pub mod registry;
pub mod schema;

pub use envelope::{
    AsyncStepResult, BaseMessage, CallbackMeta, DecodedMessage, EnvelopeCodec, StepStatus,
    DEFAULT_SOURCE,
};
pub use registry::PayloadRegistry;
pub use schema::{erase, AnyPayload, Payload, PayloadError, SchemaTag};
