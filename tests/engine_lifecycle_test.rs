//! # Engine Lifecycle and Recovery
//!
//! `start()` / `stop()` semantics (drain to completion, no cancellation) and
//! stale-lock recovery across engine instances sharing one store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use processing_engine::models::NewProcessableObject;
use processing_engine::orchestration::BackgroundProcessingEngine;
use processing_engine::state_machine::Status;
use processing_engine::store::{InMemoryObjectStore, ProcessableObjectStore, UnlockOutcome};
use processing_engine::test_helpers::{
    drive_until_idle, test_engine_config, wait_for_processing, Script, ScriptedProcessor,
    DELIVERY_OBJECT_TYPE,
};
use processing_engine::ProcessingError;

fn engine_over(
    store: &Arc<InMemoryObjectStore>,
    processor: ScriptedProcessor,
) -> BackgroundProcessingEngine<ScriptedProcessor, InMemoryObjectStore> {
    BackgroundProcessingEngine::new(Arc::new(processor), store.clone(), test_engine_config())
        .unwrap()
}

async fn insert_new(store: &InMemoryObjectStore) -> uuid::Uuid {
    store
        .insert(NewProcessableObject::new(DELIVERY_OBJECT_TYPE, Status::pending("new")))
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_started_engine_polls_until_all_objects_complete() {
    let store = Arc::new(InMemoryObjectStore::new());
    for _ in 0..10 {
        insert_new(&store).await;
    }
    let engine = engine_over(&store, ScriptedProcessor::new(Script::Succeed).unwrap());

    engine.start().await.unwrap();
    assert!(engine.is_running());

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let summary = store.status_summary(DELIVERY_OBJECT_TYPE).await.unwrap();
        if summary.count("sent") == 10 {
            break;
        }
        assert!(Instant::now() < deadline, "poll loop stalled: {summary:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    engine.stop(Duration::from_secs(5)).await.unwrap();
    assert!(!engine.is_running());
    assert!(!engine.has_queued_or_active_objects());

    let status = engine.status();
    assert_eq!(status.metrics.succeeded, 10);
    assert_eq!(status.metrics.advanced, 10);
    assert_eq!(status.metrics.claimed, 20);
}

#[tokio::test]
async fn test_engine_can_restart_after_stop() {
    let store = Arc::new(InMemoryObjectStore::new());
    let engine = engine_over(&store, ScriptedProcessor::new(Script::Succeed).unwrap());

    engine.start().await.unwrap();
    engine.stop(Duration::from_secs(5)).await.unwrap();
    engine.start().await.unwrap();
    assert!(engine.is_running());
    engine.shutdown().await.unwrap();
    assert!(!engine.is_running());

    // Stopping an idle, stopped engine is a no-op
    engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_stop_drains_in_flight_work_without_cancelling() {
    let store = Arc::new(InMemoryObjectStore::new());
    let id = insert_new(&store).await;
    let processor = ScriptedProcessor::new(Script::Succeed)
        .unwrap()
        .with_work_duration(Duration::from_millis(150));
    let engine = engine_over(&store, processor);

    assert_eq!(engine.process_objects().await.unwrap(), 1);
    engine.stop(Duration::from_secs(5)).await.unwrap();

    assert!(!engine.has_queued_or_active_objects());
    let object = store.find(id).await.unwrap().unwrap();
    assert_eq!(object.status.code(), "rendered");
    assert!(object.lock_owner.is_none());
    assert_eq!(engine.processor().calls(), 1);

    // No further claims after stop
    assert_eq!(engine.process_objects().await.unwrap(), 0);
}

#[tokio::test]
async fn test_stop_reports_timeout_while_work_is_in_flight() {
    let store = Arc::new(InMemoryObjectStore::new());
    let id = insert_new(&store).await;
    let processor = ScriptedProcessor::new(Script::Succeed)
        .unwrap()
        .with_work_duration(Duration::from_millis(400));
    let engine = engine_over(&store, processor);

    engine.process_objects().await.unwrap();
    let result = engine.stop(Duration::from_millis(50)).await;
    assert!(matches!(result, Err(ProcessingError::Timeout(_))));

    // The in-flight call still runs to completion and is persisted
    wait_for_processing(&engine).await.unwrap();
    let object = store.find(id).await.unwrap().unwrap();
    assert_eq!(object.status.code(), "rendered");
    assert!(object.lock_owner.is_none());
}

#[tokio::test]
async fn test_stale_lock_from_crashed_instance_is_recovered() {
    let store = Arc::new(InMemoryObjectStore::new());
    let id = insert_new(&store).await;

    // Instance A claims and "crashes" before processing
    let crashed = engine_over(&store, ScriptedProcessor::new(Script::Succeed).unwrap());
    let orphaned = crashed
        .binding()
        .claim_next_processable_object()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(orphaned.status.code(), "rendering");

    let survivor = engine_over(&store, ScriptedProcessor::new(Script::Succeed).unwrap());

    // A fresh lock is not stale
    assert_eq!(
        survivor
            .reset_stale_locks(Duration::from_secs(300))
            .await
            .unwrap(),
        0
    );

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(survivor.reset_stale_locks(Duration::ZERO).await.unwrap(), 1);
    assert_eq!(survivor.status().metrics.stale_locks_reset, 1);

    let reverted = store.find(id).await.unwrap().unwrap();
    assert_eq!(reverted.status.code(), "new");
    assert!(reverted.lock_owner.is_none() && reverted.locked_at.is_none());
    assert_eq!(reverted.processing_attempts, 1, "the orphaned attempt still counts");

    // A late unlock from the crashed instance is rejected
    let late = crashed
        .binding()
        .unlock_processable_object(
            &orphaned,
            &Status::pending("rendered"),
            Duration::from_millis(10),
            None,
            true,
        )
        .await
        .unwrap();
    assert_eq!(late, UnlockOutcome::AlreadyUnlocked);

    drive_until_idle(&survivor, 10, Duration::from_secs(5))
        .await
        .unwrap();
    let object = store.find(id).await.unwrap().unwrap();
    assert_eq!(object.status.code(), "sent");
    assert!(object.lock_owner.is_none());
}
