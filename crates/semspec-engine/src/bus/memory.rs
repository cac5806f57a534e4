//! In-memory bus and KV implementation
//!
//! Backs the test suites and embedded deployments. Semantics mirror the
//! remote bus contract: per-subject FIFO to each subscription, bounded
//! redelivery on nack, bucket-wide monotonic KV revisions with CAS, and
//! broadcast-backed watch streams with history replay for cursor restarts.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, trace};

use super::subject::subject_matches;
use super::{
    AckHandle, BusError, Delivery, KvBucket, KvEntry, KvError, KvWatch, MessageBus, Subscription,
};

/// Configuration for the in-memory bus
#[derive(Debug, Clone)]
pub struct MemoryBusConfig {
    /// Deliveries per message before it is dropped as poison
    pub max_deliveries: u32,

    /// Broadcast capacity of each bucket's watch channel
    pub watch_capacity: usize,
}

impl Default for MemoryBusConfig {
    fn default() -> Self {
        Self {
            max_deliveries: 5,
            watch_capacity: 1024,
        }
    }
}

impl MemoryBusConfig {
    /// Set the redelivery limit
    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = max.max(1);
        self
    }

    /// Set the watch channel capacity
    pub fn with_watch_capacity(mut self, capacity: usize) -> Self {
        self.watch_capacity = capacity.max(16);
        self
    }
}

struct SubscriptionEntry {
    pattern: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

/// In-memory implementation of [`MessageBus`]
pub struct InMemoryBus {
    subscriptions: RwLock<Vec<SubscriptionEntry>>,
    buckets: RwLock<HashMap<String, Arc<InMemoryKvBucket>>>,
    config: MemoryBusConfig,
}

impl InMemoryBus {
    /// Create a bus with default configuration
    pub fn new() -> Self {
        Self::with_config(MemoryBusConfig::default())
    }

    /// Create a bus with custom configuration
    pub fn with_config(config: MemoryBusConfig) -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            buckets: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Number of live subscriptions (for tests)
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let subscriptions = self.subscriptions.read();
        let mut delivered = 0;

        for entry in subscriptions.iter() {
            if !subject_matches(&entry.pattern, subject) {
                continue;
            }

            let ack = MemoryAck {
                subject: subject.to_string(),
                payload: payload.clone(),
                delivery_count: 1,
                tx: entry.tx.clone(),
                max_deliveries: self.config.max_deliveries,
            };
            let delivery = Delivery::new(
                subject.to_string(),
                payload.clone(),
                1,
                Some(Box::new(ack)),
            );

            // A closed receiver just means the subscriber is gone
            if entry.tx.send(delivery).is_ok() {
                delivered += 1;
            }
        }

        trace!(subject, delivered, "published message");
        Ok(())
    }

    async fn subscribe(
        &self,
        _stream: &str,
        subject: &str,
        durable_name: &str,
    ) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.write().push(SubscriptionEntry {
            pattern: subject.to_string(),
            tx,
        });

        debug!(subject, durable_name, "created subscription");
        Ok(Subscription::new(rx))
    }

    async fn kv_bucket(&self, bucket: &str) -> Result<Arc<dyn KvBucket>, BusError> {
        let mut buckets = self.buckets.write();
        let bucket = buckets
            .entry(bucket.to_string())
            .or_insert_with(|| Arc::new(InMemoryKvBucket::new(bucket, self.config.watch_capacity)))
            .clone();
        Ok(bucket)
    }
}

/// Ack handle that redelivers through the subscription channel on nack
struct MemoryAck {
    subject: String,
    payload: Vec<u8>,
    delivery_count: u32,
    tx: mpsc::UnboundedSender<Delivery>,
    max_deliveries: u32,
}

#[async_trait]
impl AckHandle for MemoryAck {
    async fn ack(self: Box<Self>) {}

    async fn nack(self: Box<Self>) {
        let next = self.delivery_count + 1;
        if next > self.max_deliveries {
            error!(
                subject = %self.subject,
                deliveries = self.delivery_count,
                "dropping message after redelivery limit"
            );
            return;
        }

        let tx = self.tx.clone();
        let ack = MemoryAck {
            subject: self.subject.clone(),
            payload: self.payload.clone(),
            delivery_count: next,
            tx: self.tx.clone(),
            max_deliveries: self.max_deliveries,
        };
        let delivery = Delivery::new(self.subject, self.payload, next, Some(Box::new(ack)));

        // A closed receiver just means the subscriber is gone
        let _ = tx.send(delivery);
    }
}

struct KvInner {
    entries: HashMap<String, KvEntry>,
    history: Vec<KvEntry>,
    sequence: u64,
}

/// In-memory implementation of [`KvBucket`]
pub struct InMemoryKvBucket {
    name: String,
    inner: RwLock<KvInner>,
    watch_tx: broadcast::Sender<KvEntry>,
}

impl InMemoryKvBucket {
    fn new(name: &str, watch_capacity: usize) -> Self {
        let (watch_tx, _) = broadcast::channel(watch_capacity);
        Self {
            name: name.to_string(),
            inner: RwLock::new(KvInner {
                entries: HashMap::new(),
                history: Vec::new(),
                sequence: 0,
            }),
            watch_tx,
        }
    }

    /// Bucket name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of live keys (for tests)
    pub fn key_count(&self) -> usize {
        self.inner.read().entries.len()
    }
}

#[async_trait]
impl KvBucket for InMemoryKvBucket {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, KvError> {
        Ok(self.inner.read().entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>, expected_revision: u64) -> Result<u64, KvError> {
        let entry = {
            let mut inner = self.inner.write();
            let found = inner.entries.get(key).map(|e| e.revision).unwrap_or(0);
            if found != expected_revision {
                return Err(KvError::Conflict {
                    key: key.to_string(),
                    expected: expected_revision,
                    found,
                });
            }

            inner.sequence += 1;
            let entry = KvEntry {
                key: key.to_string(),
                value,
                revision: inner.sequence,
            };
            inner.entries.insert(key.to_string(), entry.clone());
            inner.history.push(entry.clone());
            entry
        };

        let revision = entry.revision;
        // Nobody watching is fine
        let _ = self.watch_tx.send(entry);
        Ok(revision)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let inner = self.inner.read();
        let mut keys: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn watch(&self, prefix: &str) -> Result<KvWatch, KvError> {
        let rx = self.watch_tx.subscribe();
        Ok(KvWatch::new(prefix.to_string(), VecDeque::new(), rx, 0))
    }

    async fn watch_from(&self, prefix: &str, after_revision: u64) -> Result<KvWatch, KvError> {
        // Subscribe before snapshotting so no revision falls in the gap;
        // KvWatch dedupes the overlap by revision.
        let rx = self.watch_tx.subscribe();
        let backlog: VecDeque<KvEntry> = {
            let inner = self.inner.read();
            inner
                .history
                .iter()
                .filter(|e| e.revision > after_revision && e.key.starts_with(prefix))
                .cloned()
                .collect()
        };
        Ok(KvWatch::new(prefix.to_string(), backlog, rx, after_revision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_routes_by_pattern() {
        let bus = InMemoryBus::new();
        let mut exact = bus.subscribe("S", "a.b", "d1").await.unwrap();
        let mut wild = bus.subscribe("S", "a.*", "d2").await.unwrap();
        let mut other = bus.subscribe("S", "x.y", "d3").await.unwrap();

        bus.publish("a.b", b"hello".to_vec()).await.unwrap();

        let d1 = exact.next().await.unwrap();
        assert_eq!(d1.payload, b"hello");
        let d2 = wild.next().await.unwrap();
        assert_eq!(d2.subject, "a.b");

        // The unrelated subscription sees nothing
        tokio::select! {
            _ = other.next() => panic!("unexpected delivery"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {}
        }
    }

    #[tokio::test]
    async fn test_fifo_per_subject() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("S", "a.b", "d").await.unwrap();

        for i in 0..5u8 {
            bus.publish("a.b", vec![i]).await.unwrap();
        }
        for i in 0..5u8 {
            let delivery = sub.next().await.unwrap();
            assert_eq!(delivery.payload, vec![i]);
        }
    }

    #[tokio::test]
    async fn test_nack_redelivers_until_limit() {
        let config = MemoryBusConfig::default().with_max_deliveries(3);
        let bus = InMemoryBus::with_config(config);
        let mut sub = bus.subscribe("S", "a.b", "d").await.unwrap();

        bus.publish("a.b", b"poison".to_vec()).await.unwrap();

        for expected_count in 1..=3u32 {
            let delivery = sub.next().await.unwrap();
            assert_eq!(delivery.delivery_count, expected_count);
            delivery.nack().await;
        }

        // Fourth delivery never arrives
        tokio::select! {
            _ = sub.next() => panic!("message should have been dropped"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {}
        }
    }

    #[tokio::test]
    async fn test_kv_create_and_cas() {
        let bus = InMemoryBus::new();
        let kv = bus.kv_bucket("test").await.unwrap();

        let rev1 = kv.put("k", b"v1".to_vec(), 0).await.unwrap();
        assert!(rev1 > 0);

        // Create again fails
        let conflict = kv.put("k", b"v2".to_vec(), 0).await;
        assert!(matches!(conflict, Err(KvError::Conflict { .. })));

        // CAS with the right revision succeeds
        let rev2 = kv.put("k", b"v2".to_vec(), rev1).await.unwrap();
        assert!(rev2 > rev1);

        // Stale CAS fails
        let stale = kv.put("k", b"v3".to_vec(), rev1).await;
        assert!(matches!(stale, Err(KvError::Conflict { .. })));

        let entry = kv.get("k").await.unwrap().unwrap();
        assert_eq!(entry.value, b"v2");
        assert_eq!(entry.revision, rev2);
    }

    #[tokio::test]
    async fn test_kv_keys_by_prefix() {
        let bus = InMemoryBus::new();
        let kv = bus.kv_bucket("test").await.unwrap();

        kv.put("plan-review.a", b"1".to_vec(), 0).await.unwrap();
        kv.put("plan-review.b", b"2".to_vec(), 0).await.unwrap();
        kv.put("task-review.c", b"3".to_vec(), 0).await.unwrap();

        let keys = kv.keys("plan-review.").await.unwrap();
        assert_eq!(keys, vec!["plan-review.a", "plan-review.b"]);
    }

    #[tokio::test]
    async fn test_watch_sees_committed_revisions() {
        let bus = InMemoryBus::new();
        let kv = bus.kv_bucket("test").await.unwrap();

        let mut watch = kv.watch("plan-review.").await.unwrap();

        kv.put("plan-review.a", b"1".to_vec(), 0).await.unwrap();
        kv.put("other.b", b"x".to_vec(), 0).await.unwrap();
        let rev = kv.put("plan-review.a", b"2".to_vec(), 1).await.unwrap();

        let first = watch.next().await.unwrap();
        assert_eq!(first.value, b"1");
        let second = watch.next().await.unwrap();
        assert_eq!(second.value, b"2");
        assert_eq!(second.revision, rev);
    }

    #[tokio::test]
    async fn test_watch_from_replays_history() {
        let bus = InMemoryBus::new();
        let kv = bus.kv_bucket("test").await.unwrap();

        let rev1 = kv.put("c.a", b"1".to_vec(), 0).await.unwrap();
        kv.put("c.a", b"2".to_vec(), rev1).await.unwrap();

        let mut watch = kv.watch_from("c.", rev1).await.unwrap();
        let entry = watch.next().await.unwrap();
        assert_eq!(entry.value, b"2");

        // Live updates keep flowing after the replay
        kv.put("c.b", b"3".to_vec(), 0).await.unwrap();
        let live = watch.next().await.unwrap();
        assert_eq!(live.value, b"3");
    }
}
