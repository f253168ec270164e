//! # Engine Outcome Scenarios
//!
//! Drives single objects through the delivery pipeline against the in-memory
//! store: happy path, exhausted retries, suspension, retry scheduling,
//! unlock idempotence and store failures during claim and unlock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use processing_engine::config::EngineConfig;
use processing_engine::error::{ProcessingError, Result};
use processing_engine::models::{timestamp_now, NewProcessableObject, ProcessableObject};
use processing_engine::orchestration::{BackgroundProcessingEngine, ObjectProcessor};
use processing_engine::state_machine::{ProcessingPhase, Status};
use processing_engine::store::{
    ClaimRequest, InMemoryObjectStore, ProcessableObjectStore, StaleLockRequest, StatusSummary,
    UnlockOutcome, UnlockRequest,
};
use processing_engine::test_helpers::{
    drive_until_idle, test_engine_config, wait_until_idle, CountingObserver, Script,
    ScriptedProcessor, DELIVERY_OBJECT_TYPE,
};

const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    store: Arc<InMemoryObjectStore>,
    processor: Arc<ScriptedProcessor>,
    observer: Arc<CountingObserver>,
    engine: BackgroundProcessingEngine<ScriptedProcessor, InMemoryObjectStore>,
}

fn harness(script: Script, config: EngineConfig) -> Harness {
    let store = Arc::new(InMemoryObjectStore::new());
    let processor = Arc::new(ScriptedProcessor::new(script).unwrap());
    let observer = Arc::new(CountingObserver::new());
    let engine = BackgroundProcessingEngine::new(processor.clone(), store.clone(), config)
        .unwrap()
        .with_observer(observer.clone());
    Harness {
        store,
        processor,
        observer,
        engine,
    }
}

impl Harness {
    async fn insert_new(&self) -> uuid::Uuid {
        let initial = self.processor.status_model().initial_status().clone();
        self.store
            .insert(NewProcessableObject::new(DELIVERY_OBJECT_TYPE, initial))
            .await
            .unwrap()
            .id
    }
}

#[tokio::test]
async fn test_happy_path_reaches_completed_status() {
    let h = harness(Script::Succeed, test_engine_config());
    let initial = h.processor.status_model().initial_status().clone();
    assert_eq!(initial.phase(), ProcessingPhase::Pending);
    let id = h.insert_new().await;

    let dispatched = drive_until_idle(&h.engine, 10, IDLE_TIMEOUT).await.unwrap();

    let object = h.store.find(id).await.unwrap().unwrap();
    assert_eq!(dispatched, 2);
    assert_eq!(object.status.code(), "sent");
    assert_eq!(object.status.phase(), ProcessingPhase::Completed);
    assert_eq!(object.processing_attempts, 1);
    assert!(object.next_processed.is_none());
    assert!(object.lock_owner.is_none());
    assert!(object.last_processed.is_some());
    assert!(h.observer.successes() > 0);
    assert_eq!(h.observer.permanent_failures(), 0);
    assert_eq!(
        h.processor
            .processed()
            .into_iter()
            .map(|(_, status)| status)
            .collect::<Vec<_>>(),
        vec!["rendering".to_string(), "sending".to_string()]
    );
}

#[tokio::test]
async fn test_always_failing_object_ends_in_failed_status() {
    let h = harness(Script::AlwaysFail, test_engine_config());
    let id = h.insert_new().await;

    drive_until_idle(&h.engine, 10, IDLE_TIMEOUT).await.unwrap();

    let object = h.store.find(id).await.unwrap().unwrap();
    assert_eq!(object.status.code(), "failed");
    assert_eq!(object.status.phase(), ProcessingPhase::Failed);
    assert_eq!(object.processing_attempts, 3);
    assert!(object.next_processed.is_none());
    assert!(object.lock_owner.is_none());
    assert_eq!(h.processor.calls(), 3);
    assert!(h.observer.permanent_failures() > 0);
    assert!(h
        .observer
        .last_failure()
        .is_some_and(|message| message.contains("scripted failure")));

    // Terminal objects are never claimed again
    assert_eq!(h.engine.process_objects().await.unwrap(), 0);
    assert_eq!(h.processor.calls(), 3);

    let metrics = h.engine.status().metrics;
    assert_eq!(metrics.retried, 2);
    assert_eq!(metrics.permanently_failed, 1);
}

#[tokio::test]
async fn test_processor_attempt_budget_overrides_config() {
    let store = Arc::new(InMemoryObjectStore::new());
    let processor = Arc::new(
        ScriptedProcessor::new(Script::AlwaysFail)
            .unwrap()
            .with_max_attempts(1),
    );
    let engine =
        BackgroundProcessingEngine::new(processor.clone(), store.clone(), test_engine_config())
            .unwrap();
    let id = store
        .insert(NewProcessableObject::new(DELIVERY_OBJECT_TYPE, Status::pending("new")))
        .await
        .unwrap()
        .id;

    drive_until_idle(&engine, 10, IDLE_TIMEOUT).await.unwrap();

    let object = store.find(id).await.unwrap().unwrap();
    assert_eq!(object.status.code(), "failed");
    assert_eq!(object.processing_attempts, 1);
    assert_eq!(processor.calls(), 1);
}

#[tokio::test]
async fn test_suspended_object_is_never_claimed() {
    let h = harness(Script::Succeed, test_engine_config());
    let initial = h.processor.status_model().initial_status().clone();
    let id = h
        .store
        .insert(NewProcessableObject::new(DELIVERY_OBJECT_TYPE, initial).suspended())
        .await
        .unwrap()
        .id;

    for _ in 0..5 {
        assert_eq!(h.engine.process_objects().await.unwrap(), 0);
        wait_until_idle(&h.engine, IDLE_TIMEOUT).await.unwrap();
    }

    let object = h.store.find(id).await.unwrap().unwrap();
    assert_eq!(object.status.code(), "new");
    assert_eq!(object.processing_attempts, 0);
    assert_eq!(h.processor.calls(), 0);

    // Resumed objects are picked up again
    assert!(h.store.set_suspended(id, false).await.unwrap());
    drive_until_idle(&h.engine, 10, IDLE_TIMEOUT).await.unwrap();
    let object = h.store.find(id).await.unwrap().unwrap();
    assert_eq!(object.status.code(), "sent");
}

#[tokio::test]
async fn test_delayed_retry_schedules_next_processed() {
    let mut config = test_engine_config();
    config.backoff.base_delay_ms = 60_000;
    config.backoff.max_delay_ms = 600_000;
    let h = harness(Script::FailTimes(1), config);
    let id = h.insert_new().await;

    let before = timestamp_now();
    assert_eq!(h.engine.process_objects().await.unwrap(), 1);
    wait_until_idle(&h.engine, IDLE_TIMEOUT).await.unwrap();
    let after = timestamp_now();

    let object = h.store.find(id).await.unwrap().unwrap();
    assert_eq!(object.status.code(), "new");
    assert_eq!(object.processing_attempts, 1, "retries keep the attempt count");
    let due = object.next_processed.expect("delayed retry sets next_processed");
    assert!(due >= before + chrono::Duration::seconds(60));
    assert!(due <= after + chrono::Duration::seconds(60));

    // Not due yet, so nothing is claimable
    assert_eq!(h.engine.process_objects().await.unwrap(), 0);
    assert!(!object.is_claimable(timestamp_now()));
    assert!(object.is_claimable(due));
}

#[tokio::test]
async fn test_immediate_retry_is_reclaimable_next_cycle() {
    let h = harness(Script::FailTimes(1), test_engine_config());
    let id = h.insert_new().await;

    assert_eq!(h.engine.process_objects().await.unwrap(), 1);
    wait_until_idle(&h.engine, IDLE_TIMEOUT).await.unwrap();

    let object = h.store.find(id).await.unwrap().unwrap();
    assert_eq!(object.status.code(), "new");
    assert!(object.next_processed.is_none());
    assert!(object.is_claimable(timestamp_now()));

    drive_until_idle(&h.engine, 10, IDLE_TIMEOUT).await.unwrap();
    let object = h.store.find(id).await.unwrap().unwrap();
    assert_eq!(object.status.code(), "sent");
    assert_eq!(h.observer.successes(), 1);
}

#[tokio::test]
async fn test_explicit_step_delay_defers_next_step() {
    let store = Arc::new(InMemoryObjectStore::new());
    let processor = Arc::new(
        ScriptedProcessor::new(Script::Succeed)
            .unwrap()
            .with_step_delay(Duration::from_secs(120)),
    );
    let engine =
        BackgroundProcessingEngine::new(processor.clone(), store.clone(), test_engine_config())
            .unwrap();
    let id = store
        .insert(NewProcessableObject::new(DELIVERY_OBJECT_TYPE, Status::pending("new")))
        .await
        .unwrap()
        .id;

    drive_until_idle(&engine, 10, IDLE_TIMEOUT).await.unwrap();

    let object = store.find(id).await.unwrap().unwrap();
    assert_eq!(object.status.code(), "rendered");
    assert_eq!(object.processing_attempts, 0, "pending steps start a fresh budget");
    assert!(object.next_processed.is_some());
    assert_eq!(processor.calls(), 1);
}

#[tokio::test]
async fn test_second_unlock_does_not_double_count_processing_time() {
    let h = harness(Script::Succeed, test_engine_config());
    let id = h.insert_new().await;

    let claimed = h
        .engine
        .binding()
        .claim_next_processable_object()
        .await
        .unwrap()
        .expect("object is claimable");
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.processing_attempts, 1);
    assert!(claimed.lock_owner.is_some() && claimed.locked_at.is_some());

    let rendered = Status::pending("rendered");
    let first = h
        .engine
        .binding()
        .unlock_processable_object(&claimed, &rendered, Duration::from_millis(250), None, true)
        .await
        .unwrap();
    assert!(first.is_unlocked());

    let second = h
        .engine
        .binding()
        .unlock_processable_object(&claimed, &rendered, Duration::from_millis(250), None, true)
        .await
        .unwrap();
    assert_eq!(second, UnlockOutcome::AlreadyUnlocked);

    let object = h.store.find(id).await.unwrap().unwrap();
    assert_eq!(object.processing_time_accumulated_ms, 250);
    assert_eq!(object.processing_attempts, 0);
    assert!(object.lock_owner.is_none() && object.locked_at.is_none());
}

#[tokio::test]
async fn test_status_summary_counts_objects_per_status() {
    let h = harness(Script::Succeed, test_engine_config());
    for _ in 0..3 {
        h.insert_new().await;
    }
    let suspended = h.insert_new().await;
    h.store.set_suspended(suspended, true).await.unwrap();

    drive_until_idle(&h.engine, 10, IDLE_TIMEOUT).await.unwrap();

    let summary = h.engine.binding().status_summary().await.unwrap();
    assert_eq!(summary.count("sent"), 3);
    assert_eq!(summary.count("new"), 1);
    assert_eq!(summary.total(), 4);
}

#[tokio::test]
async fn test_engines_only_claim_their_own_object_type() {
    let store = Arc::new(InMemoryObjectStore::new());
    let delivery_id = uuid::Uuid::new_v4();
    let digest_id = uuid::Uuid::new_v4();
    store
        .insert(
            NewProcessableObject::new(DELIVERY_OBJECT_TYPE, Status::pending("new"))
                .with_id(delivery_id),
        )
        .await
        .unwrap();
    store
        .insert(NewProcessableObject::new("digest", Status::pending("new")).with_id(digest_id))
        .await
        .unwrap();

    // Re-inserting an existing id is rejected
    assert!(store
        .insert(NewProcessableObject::new("digest", Status::pending("new")).with_id(digest_id))
        .await
        .is_err());

    let digest_processor = Arc::new(
        ScriptedProcessor::new(Script::Succeed)
            .unwrap()
            .with_object_type("digest"),
    );
    let digest_engine = BackgroundProcessingEngine::new(
        digest_processor.clone(),
        store.clone(),
        test_engine_config(),
    )
    .unwrap();

    drive_until_idle(&digest_engine, 10, IDLE_TIMEOUT).await.unwrap();

    let digest = store.find(digest_id).await.unwrap().unwrap();
    assert_eq!(digest.status.code(), "sent");
    let delivery = store.find(delivery_id).await.unwrap().unwrap();
    assert_eq!(delivery.status.code(), "new");
    assert_eq!(delivery.processing_attempts, 0);
    assert!(digest_processor
        .processed()
        .iter()
        .all(|(id, _)| *id == digest_id));
}

/// In-memory store whose claim and unlock calls can be made to fail
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryObjectStore,
    fail_claims: AtomicBool,
    fail_unlocks: AtomicBool,
}

#[async_trait]
impl ProcessableObjectStore for FlakyStore {
    async fn insert(&self, new_object: NewProcessableObject) -> Result<ProcessableObject> {
        self.inner.insert(new_object).await
    }

    async fn find(&self, id: Uuid) -> Result<Option<ProcessableObject>> {
        self.inner.find(id).await
    }

    async fn claim_next(&self, request: &ClaimRequest) -> Result<Option<ProcessableObject>> {
        if self.fail_claims.load(Ordering::SeqCst) {
            return Err(ProcessingError::StoreError("connection reset during claim".to_string()));
        }
        self.inner.claim_next(request).await
    }

    async fn unlock(&self, request: &UnlockRequest) -> Result<UnlockOutcome> {
        if self.fail_unlocks.load(Ordering::SeqCst) {
            return Err(ProcessingError::StoreError("connection reset during unlock".to_string()));
        }
        self.inner.unlock(request).await
    }

    async fn reset_stale_locks(&self, request: &StaleLockRequest) -> Result<u64> {
        self.inner.reset_stale_locks(request).await
    }

    async fn set_suspended(&self, id: Uuid, suspended: bool) -> Result<bool> {
        self.inner.set_suspended(id, suspended).await
    }

    async fn status_summary(&self, object_type: &str) -> Result<StatusSummary> {
        self.inner.status_summary(object_type).await
    }
}

fn flaky_engine() -> (
    Arc<FlakyStore>,
    BackgroundProcessingEngine<ScriptedProcessor, FlakyStore>,
) {
    let store = Arc::new(FlakyStore::default());
    let processor = Arc::new(ScriptedProcessor::new(Script::Succeed).unwrap());
    let engine =
        BackgroundProcessingEngine::new(processor, store.clone(), test_engine_config()).unwrap();
    (store, engine)
}

#[tokio::test]
async fn test_claim_failure_reaches_caller_and_releases_slot() {
    let (store, engine) = flaky_engine();
    let id = store
        .insert(NewProcessableObject::new(DELIVERY_OBJECT_TYPE, Status::pending("new")))
        .await
        .unwrap()
        .id;
    store.fail_claims.store(true, Ordering::SeqCst);

    let result = engine.process_objects().await;
    assert!(matches!(result, Err(ProcessingError::StoreError(_))));

    let object = store.find(id).await.unwrap().unwrap();
    assert_eq!(object.status.code(), "new");
    assert_eq!(object.processing_attempts, 0);
    assert!(object.lock_owner.is_none());

    let status = engine.status();
    assert_eq!(status.metrics.claim_errors, 1);
    assert_eq!(status.metrics.claimed, 0);
    assert_eq!(status.queued, 0);
    assert!(!engine.has_queued_or_active_objects());

    // The next cycle claims normally once the store recovers
    store.fail_claims.store(false, Ordering::SeqCst);
    drive_until_idle(&engine, 10, IDLE_TIMEOUT).await.unwrap();
    assert_eq!(store.find(id).await.unwrap().unwrap().status.code(), "sent");
}

#[tokio::test]
async fn test_unlock_failure_leaves_lock_for_the_sweep() {
    let (store, engine) = flaky_engine();
    let id = store
        .insert(NewProcessableObject::new(DELIVERY_OBJECT_TYPE, Status::pending("new")))
        .await
        .unwrap()
        .id;
    store.fail_unlocks.store(true, Ordering::SeqCst);

    assert_eq!(engine.process_objects().await.unwrap(), 1);
    wait_until_idle(&engine, IDLE_TIMEOUT).await.unwrap();

    let object = store.find(id).await.unwrap().unwrap();
    assert_eq!(object.status.code(), "rendering");
    assert_eq!(object.status.phase(), ProcessingPhase::Processing);
    assert_eq!(object.lock_owner.as_deref(), Some(engine.lock_owner()));
    let metrics = engine.status().metrics;
    assert_eq!(metrics.unlock_failures, 1);
    assert_eq!(metrics.advanced, 0);
    assert_eq!(metrics.succeeded, 0);

    // Locked objects are not claimable again
    store.fail_unlocks.store(false, Ordering::SeqCst);
    assert_eq!(engine.process_objects().await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(engine.reset_stale_locks(Duration::ZERO).await.unwrap(), 1);
    let reverted = store.find(id).await.unwrap().unwrap();
    assert_eq!(reverted.status.code(), "new");
    assert!(reverted.lock_owner.is_none());

    drive_until_idle(&engine, 10, IDLE_TIMEOUT).await.unwrap();
    let object = store.find(id).await.unwrap().unwrap();
    assert_eq!(object.status.code(), "sent");
    assert!(object.lock_owner.is_none());
}
