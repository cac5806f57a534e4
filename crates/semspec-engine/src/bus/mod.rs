//! Bus and KV contracts
//!
//! The engine talks to a durable, subject-addressed pub-sub with a KV
//! bucket. This module defines that contract as traits plus the delivery
//! and watch stream types shared by all implementations; the in-memory
//! implementation in [`memory`] backs the test suites and embedded use.
//!
//! Guarantees required of implementations:
//! - per-subject FIFO delivery to each subscription
//! - monotonic per-key KV revisions with compare-and-swap `put`
//! - watch streams that emit every committed revision under a key prefix
//!   (coalescing under lag is acceptable; consumers reload current state)

pub mod memory;
pub mod subject;

use std::collections::VecDeque;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

pub use memory::{InMemoryBus, MemoryBusConfig};
pub use subject::subject_matches;

/// Errors from bus operations
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Publish failed
    #[error("publish failed on {subject}: {reason}")]
    PublishFailed { subject: String, reason: String },

    /// Subscribe failed
    #[error("subscribe failed on {subject}: {reason}")]
    SubscribeFailed { subject: String, reason: String },

    /// Bucket access failed
    #[error("kv bucket {bucket} unavailable: {reason}")]
    BucketUnavailable { bucket: String, reason: String },

    /// Connection closed
    #[error("bus connection closed")]
    Closed,
}

/// Errors from KV operations
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// Key not found
    #[error("key not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency conflict
    #[error("revision conflict on {key}: expected {expected}, found {found}")]
    Conflict {
        key: String,
        expected: u64,
        found: u64,
    },

    /// Bucket-level failure
    #[error("kv bucket error: {0}")]
    Bucket(String),
}

/// Acknowledgement handle attached to a delivery
#[async_trait]
pub trait AckHandle: Send + Sync {
    /// Acknowledge successful processing
    async fn ack(self: Box<Self>);

    /// Negative-acknowledge; the bus redelivers up to its limit
    async fn nack(self: Box<Self>);
}

/// A message delivered to a subscription
pub struct Delivery {
    pub subject: String,
    pub payload: Vec<u8>,

    /// 1-based delivery attempt
    pub delivery_count: u32,

    ack: Option<Box<dyn AckHandle>>,
}

impl Delivery {
    /// Create a delivery; implementations attach their ack handle
    pub fn new(
        subject: String,
        payload: Vec<u8>,
        delivery_count: u32,
        ack: Option<Box<dyn AckHandle>>,
    ) -> Self {
        Self {
            subject,
            payload,
            delivery_count,
            ack,
        }
    }

    /// Acknowledge successful processing
    pub async fn ack(mut self) {
        if let Some(handle) = self.ack.take() {
            handle.ack().await;
        }
    }

    /// Request redelivery
    pub async fn nack(mut self) {
        if let Some(handle) = self.ack.take() {
            handle.nack().await;
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

/// A durable subscription pulling deliveries in FIFO order
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    /// Create a subscription fed by the given channel
    pub fn new(rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { rx }
    }

    /// Receive the next delivery; `None` when the bus side is gone
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

/// A committed KV revision
#[derive(Debug, Clone, PartialEq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,

    /// Bucket-wide monotonic sequence; strictly increasing per key
    pub revision: u64,
}

/// A change stream over a key prefix
///
/// Backed by a broadcast channel; lagged receivers skip revisions, which
/// the rule layer tolerates by reloading current state per event.
pub struct KvWatch {
    prefix: String,
    backlog: VecDeque<KvEntry>,
    rx: broadcast::Receiver<KvEntry>,
    last_revision: u64,
}

impl KvWatch {
    /// Create a watch; `backlog` replays history for cursor restarts
    pub fn new(
        prefix: String,
        backlog: VecDeque<KvEntry>,
        rx: broadcast::Receiver<KvEntry>,
        after_revision: u64,
    ) -> Self {
        Self {
            prefix,
            backlog,
            rx,
            last_revision: after_revision,
        }
    }

    /// Next matching revision; `None` when the bucket is gone
    pub async fn next(&mut self) -> Option<KvEntry> {
        while let Some(entry) = self.backlog.pop_front() {
            if self.accepts(&entry) {
                self.last_revision = entry.revision;
                return Some(entry);
            }
        }

        loop {
            match self.rx.recv().await {
                Ok(entry) => {
                    if self.accepts(&entry) {
                        self.last_revision = entry.revision;
                        return Some(entry);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(prefix = %self.prefix, skipped, "kv watch lagged; coalescing");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn accepts(&self, entry: &KvEntry) -> bool {
        entry.revision > self.last_revision && entry.key.starts_with(&self.prefix)
    }
}

/// One KV bucket with per-key revisions and CAS writes
#[async_trait]
pub trait KvBucket: Send + Sync + 'static {
    /// Get the current entry for a key
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, KvError>;

    /// Conditional write
    ///
    /// `expected_revision` 0 creates the key (fails if it exists);
    /// otherwise the write succeeds only if the stored revision matches.
    /// Returns the new revision.
    async fn put(&self, key: &str, value: Vec<u8>, expected_revision: u64) -> Result<u64, KvError>;

    /// List keys under a prefix
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, KvError>;

    /// Watch all committed revisions under a prefix from now on
    async fn watch(&self, prefix: &str) -> Result<KvWatch, KvError>;

    /// Watch from a revision cursor, replaying history after it
    async fn watch_from(&self, prefix: &str, after_revision: u64) -> Result<KvWatch, KvError>;
}

/// The bus contract: durable pub-sub plus named KV buckets
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Publish a message on a subject
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Create a durable subscription on a subject pattern
    async fn subscribe(
        &self,
        stream: &str,
        subject: &str,
        durable_name: &str,
    ) -> Result<Subscription, BusError>;

    /// Open (or create) a named KV bucket
    async fn kv_bucket(&self, bucket: &str) -> Result<Arc<dyn KvBucket>, BusError>;
}
