//! State manager: atomic read-modify-write over KV cells
//!
//! Wraps one KV bucket per engine instance. All higher-level operations
//! are built from a get/modify/compare-and-put loop; the KV's per-key CAS
//! is the sole concurrency control primitive, the manager adds no locking.
//!
//! The manager enforces the base-state invariants on every transition:
//! write-once `id`/`workflow_id`, monotone `iteration`, and the terminal
//! freeze. It stamps `created_at` on first write and bumps `updated_at`
//! on every commit.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

use crate::bus::{KvBucket, KvEntry, KvError, KvWatch};

use super::{AnyState, ExecutionState, HasExecutionState, StateCodec, StateError};

/// Configuration for the state manager
#[derive(Debug, Clone)]
pub struct StateManagerConfig {
    /// CAS attempts before a transition gives up
    pub max_cas_attempts: u32,

    /// Base delay between conflicting attempts (jittered)
    pub retry_backoff: Duration,
}

impl Default for StateManagerConfig {
    fn default() -> Self {
        Self {
            max_cas_attempts: 8,
            retry_backoff: Duration::from_millis(5),
        }
    }
}

impl StateManagerConfig {
    /// Set the CAS attempt bound
    pub fn with_max_cas_attempts(mut self, attempts: u32) -> Self {
        self.max_cas_attempts = attempts.max(1);
        self
    }

    /// Set the base retry backoff
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

/// Per-execution state accessor over one KV bucket
pub struct StateManager {
    bucket: Arc<dyn KvBucket>,
    config: StateManagerConfig,
}

impl StateManager {
    /// Create a manager with default configuration
    pub fn new(bucket: Arc<dyn KvBucket>) -> Self {
        Self::with_config(bucket, StateManagerConfig::default())
    }

    /// Create a manager with custom configuration
    pub fn with_config(bucket: Arc<dyn KvBucket>, config: StateManagerConfig) -> Self {
        Self { bucket, config }
    }

    /// The underlying bucket
    pub fn bucket(&self) -> &Arc<dyn KvBucket> {
        &self.bucket
    }

    /// Raw read of a state cell
    pub async fn get_raw(&self, key: &str) -> Result<Option<KvEntry>, StateError> {
        Ok(self.bucket.get(key).await?)
    }

    /// Raw conditional write; this is the external-rewrite escape hatch
    /// and bypasses invariant enforcement
    pub async fn put_raw(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_revision: u64,
    ) -> Result<u64, StateError> {
        Ok(self.bucket.put(key, value, expected_revision).await?)
    }

    /// Load and decode the state under a key
    pub async fn load(
        &self,
        key: &str,
        codec: &StateCodec,
    ) -> Result<Option<(Box<dyn AnyState>, u64)>, StateError> {
        match self.bucket.get(key).await? {
            Some(entry) => {
                let state = codec.decode(&entry.value)?;
                Ok(Some((state, entry.revision)))
            }
            None => Ok(None),
        }
    }

    /// Atomic transition returning only the committed state
    pub async fn transition(
        &self,
        key: &str,
        codec: &StateCodec,
        mut mutator: impl FnMut(&mut dyn AnyState) -> Result<(), StateError>,
    ) -> Result<Box<dyn AnyState>, StateError> {
        let (state, ()) = self
            .transition_with(key, codec, |state| mutator(state))
            .await?;
        Ok(state)
    }

    /// Atomic transition with an extra output from the successful attempt
    ///
    /// Loads (or creates, via the codec factory) the state, runs `f`, and
    /// writes back with optimistic CAS; on conflict the state is reloaded
    /// and `f` re-runs, up to the configured attempt bound. `f` must be
    /// deterministic on the observed state. The output of the attempt that
    /// commits is returned alongside the committed state.
    pub async fn transition_with<R>(
        &self,
        key: &str,
        codec: &StateCodec,
        f: impl FnMut(&mut dyn AnyState) -> Result<R, StateError>,
    ) -> Result<(Box<dyn AnyState>, R), StateError> {
        self.transition_inner(key, codec, false, f).await
    }

    /// Typed transition over an existing execution
    ///
    /// This is the accessor Participant components and tests use: the
    /// concrete state type is known, the execution must already exist.
    pub async fn update<S, F>(&self, key: &str, mut f: F) -> Result<S, StateError>
    where
        S: HasExecutionState + Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnMut(&mut S),
    {
        let codec = StateCodec::of::<S>();
        let (state, ()) = self
            .transition_inner(key, &codec, true, |state| {
                let typed = state
                    .as_any_mut()
                    .downcast_mut::<S>()
                    .ok_or_else(|| StateError::TypeMismatch(std::any::type_name::<S>().into()))?;
                f(typed);
                Ok(())
            })
            .await?;

        state
            .as_any()
            .downcast_ref::<S>()
            .cloned()
            .ok_or_else(|| StateError::TypeMismatch(std::any::type_name::<S>().into()))
    }

    /// Watch every committed revision under a key prefix
    pub async fn watch(&self, prefix: &str) -> Result<KvWatch, StateError> {
        Ok(self.bucket.watch(prefix).await?)
    }

    /// List execution keys under a prefix
    pub async fn keys(&self, prefix: &str) -> Result<Vec<String>, StateError> {
        Ok(self.bucket.keys(prefix).await?)
    }

    async fn transition_inner<R>(
        &self,
        key: &str,
        codec: &StateCodec,
        require_existing: bool,
        mut f: impl FnMut(&mut dyn AnyState) -> Result<R, StateError>,
    ) -> Result<(Box<dyn AnyState>, R), StateError> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            let (mut state, revision) = match self.bucket.get(key).await? {
                Some(entry) => (codec.decode(&entry.value)?, entry.revision),
                None if require_existing => return Err(StateError::NotFound(key.to_string())),
                None => (codec.new_state(), 0),
            };

            let before = state.base().clone();
            if before.status.is_terminal() {
                return Err(StateError::Terminal {
                    key: key.to_string(),
                    status: before.status,
                });
            }

            let output = f(&mut *state)?;
            enforce_invariants(key, &before, state.base())?;

            let now = Utc::now();
            {
                let base = state.base_mut();
                if revision == 0 {
                    base.created_at = now;
                }
                base.updated_at = now;
            }

            let bytes = serde_json::to_vec(&state.to_json()?)?;
            match self.bucket.put(key, bytes, revision).await {
                Ok(new_revision) => {
                    trace!(key, revision = new_revision, attempts, "state transition committed");
                    return Ok((state, output));
                }
                Err(KvError::Conflict { .. }) if attempts < self.config.max_cas_attempts => {
                    debug!(key, attempts, "cas conflict, retrying");
                    self.backoff().await;
                }
                Err(KvError::Conflict { .. }) => {
                    return Err(StateError::CasExhausted {
                        key: key.to_string(),
                        attempts,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn backoff(&self) {
        let jitter = rand::random::<u64>() % 16;
        let delay = self.config.retry_backoff + Duration::from_millis(jitter);
        tokio::time::sleep(delay).await;
    }
}

/// Base-state invariants checked after every mutator run
fn enforce_invariants(
    key: &str,
    before: &ExecutionState,
    after: &ExecutionState,
) -> Result<(), StateError> {
    if !before.id.is_empty() && after.id != before.id {
        return Err(StateError::InvariantViolation {
            key: key.to_string(),
            detail: format!("id is write-once ({} -> {})", before.id, after.id),
        });
    }
    if !before.workflow_id.is_empty() && after.workflow_id != before.workflow_id {
        return Err(StateError::InvariantViolation {
            key: key.to_string(),
            detail: format!(
                "workflow_id is write-once ({} -> {})",
                before.workflow_id, after.workflow_id
            ),
        });
    }
    if after.iteration < before.iteration {
        return Err(StateError::InvariantViolation {
            key: key.to_string(),
            detail: format!(
                "iteration must not decrease ({} -> {})",
                before.iteration, after.iteration
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBus, MessageBus};
    use crate::state::ExecutionStatus;
    use async_trait::async_trait;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct DemoState {
        #[serde(flatten)]
        execution: ExecutionState,
        counter: u32,
    }

    impl HasExecutionState for DemoState {
        fn execution(&self) -> &ExecutionState {
            &self.execution
        }

        fn execution_mut(&mut self) -> &mut ExecutionState {
            &mut self.execution
        }
    }

    async fn manager() -> StateManager {
        let bus = InMemoryBus::new();
        let bucket = bus.kv_bucket("test").await.unwrap();
        StateManager::new(bucket)
    }

    fn codec() -> StateCodec {
        StateCodec::of::<DemoState>().seeded("demo.k", "demo-workflow")
    }

    #[tokio::test]
    async fn test_transition_creates_on_first_write() {
        let manager = manager().await;
        let state = manager
            .transition("demo.k", &codec(), |state| {
                state.base_mut().phase = "generating".to_string();
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(state.base().id, "demo.k");
        assert_eq!(state.base().workflow_id, "demo-workflow");
        assert_eq!(state.base().phase, "generating");

        let entry = manager.get_raw("demo.k").await.unwrap().unwrap();
        assert!(entry.revision > 0);
    }

    #[tokio::test]
    async fn test_update_requires_existing() {
        let manager = manager().await;
        let result = manager
            .update::<DemoState, _>("missing.key", |_s| {})
            .await;
        assert!(matches!(result, Err(StateError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_round_trips_typed_state() {
        let manager = manager().await;
        manager
            .transition("demo.k", &codec(), |_s| Ok(()))
            .await
            .unwrap();

        let state = manager
            .update::<DemoState, _>("demo.k", |s| {
                s.counter = 7;
                s.execution.phase = "planned".to_string();
            })
            .await
            .unwrap();

        assert_eq!(state.counter, 7);
        assert_eq!(state.execution.phase, "planned");
    }

    #[tokio::test]
    async fn test_terminal_state_freezes_transitions() {
        let manager = manager().await;
        manager
            .transition("demo.k", &codec(), |state| {
                state.base_mut().status = ExecutionStatus::Completed;
                Ok(())
            })
            .await
            .unwrap();

        let result = manager
            .transition("demo.k", &codec(), |state| {
                state.base_mut().phase = "again".to_string();
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(StateError::Terminal { .. })));
    }

    #[tokio::test]
    async fn test_write_once_id_enforced() {
        let manager = manager().await;
        manager
            .transition("demo.k", &codec(), |_s| Ok(()))
            .await
            .unwrap();

        let result = manager
            .transition("demo.k", &codec(), |state| {
                state.base_mut().id = "other".to_string();
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(StateError::InvariantViolation { .. })));
    }

    #[tokio::test]
    async fn test_iteration_must_not_decrease() {
        let manager = manager().await;
        manager
            .transition("demo.k", &codec(), |state| {
                state.base_mut().iteration = 2;
                Ok(())
            })
            .await
            .unwrap();

        let result = manager
            .transition("demo.k", &codec(), |state| {
                state.base_mut().iteration = 1;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(StateError::InvariantViolation { .. })));
    }

    #[tokio::test]
    async fn test_updated_at_bumped_on_commit() {
        let manager = manager().await;
        let first = manager
            .transition("demo.k", &codec(), |_s| Ok(()))
            .await
            .unwrap();
        let created = first.base().created_at;

        tokio::time::sleep(Duration::from_millis(5)).await;

        let second = manager
            .transition("demo.k", &codec(), |state| {
                state.base_mut().phase = "next".to_string();
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(second.base().created_at, created);
        assert!(second.base().updated_at > created);
    }

    #[tokio::test]
    async fn test_concurrent_transitions_serialize() {
        let bus = Arc::new(InMemoryBus::new());
        let bucket = bus.kv_bucket("test").await.unwrap();
        let manager = Arc::new(StateManager::new(bucket));

        manager
            .transition("demo.k", &codec(), |_s| Ok(()))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .update::<DemoState, _>("demo.k", |s| s.counter += 1)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let state = manager
            .update::<DemoState, _>("demo.k", |_s| {})
            .await
            .unwrap();
        assert_eq!(state.counter, 8);
    }

    /// Bucket that always conflicts on put, to exhaust the CAS loop
    struct AlwaysConflict;

    #[async_trait]
    impl KvBucket for AlwaysConflict {
        async fn get(&self, _key: &str) -> Result<Option<KvEntry>, KvError> {
            Ok(None)
        }

        async fn put(&self, key: &str, _value: Vec<u8>, expected: u64) -> Result<u64, KvError> {
            Err(KvError::Conflict {
                key: key.to_string(),
                expected,
                found: expected + 1,
            })
        }

        async fn keys(&self, _prefix: &str) -> Result<Vec<String>, KvError> {
            Ok(vec![])
        }

        async fn watch(&self, _prefix: &str) -> Result<KvWatch, KvError> {
            Err(KvError::Bucket("unsupported".into()))
        }

        async fn watch_from(&self, _prefix: &str, _after: u64) -> Result<KvWatch, KvError> {
            Err(KvError::Bucket("unsupported".into()))
        }
    }

    #[tokio::test]
    async fn test_cas_exhaustion() {
        let config = StateManagerConfig::default()
            .with_max_cas_attempts(3)
            .with_retry_backoff(Duration::from_millis(1));
        let manager = StateManager::with_config(Arc::new(AlwaysConflict), config);

        let result = manager
            .transition("demo.k", &codec(), |_s| Ok(()))
            .await;

        match result {
            Err(StateError::CasExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected CasExhausted, got {:?}", other.map(|_| ())),
        }
    }
}
