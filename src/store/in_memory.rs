//! In-process store: an arena of objects plus an id index, guarded by one mutex.
//!
//! Every operation runs inside a single critical section, which makes claim and
//! unlock linearizable for all callers sharing the store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    ClaimRequest, ProcessableObjectStore, StaleLockRequest, StatusSummary, UnlockOutcome,
    UnlockRequest,
};
use crate::error::{ProcessingError, Result};
use crate::models::{timestamp_now, NewProcessableObject, ProcessableObject};

#[derive(Debug, Default)]
struct Arena {
    objects: Vec<ProcessableObject>,
    index: HashMap<Uuid, usize>,
}

impl Arena {
    fn get_mut(&mut self, id: &Uuid) -> Option<&mut ProcessableObject> {
        let slot = *self.index.get(id)?;
        self.objects.get_mut(slot)
    }
}

/// Single-process store suitable for tests and embedded use
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    arena: Mutex<Arena>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.arena.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every stored object
    pub fn snapshot(&self) -> Vec<ProcessableObject> {
        self.arena.lock().objects.clone()
    }
}

#[async_trait]
impl ProcessableObjectStore for InMemoryObjectStore {
    async fn insert(&self, new_object: NewProcessableObject) -> Result<ProcessableObject> {
        let object = ProcessableObject::from_new(new_object, timestamp_now());
        let mut arena = self.arena.lock();
        if arena.index.contains_key(&object.id) {
            return Err(ProcessingError::StoreError(format!(
                "processable object {} already exists",
                object.id
            )));
        }
        let slot = arena.objects.len();
        arena.index.insert(object.id, slot);
        arena.objects.push(object.clone());
        Ok(object)
    }

    async fn find(&self, id: Uuid) -> Result<Option<ProcessableObject>> {
        let arena = self.arena.lock();
        Ok(arena
            .index
            .get(&id)
            .and_then(|slot| arena.objects.get(*slot))
            .cloned())
    }

    async fn claim_next(&self, request: &ClaimRequest) -> Result<Option<ProcessableObject>> {
        let mut arena = self.arena.lock();

        // Earliest due first (never-scheduled objects lead), then oldest.
        let candidate = arena
            .objects
            .iter()
            .enumerate()
            .filter(|(_, object)| {
                object.object_type == request.object_type
                    && object.is_claimable(request.now)
                    && request.processing_status_for(&object.status).is_some()
            })
            .min_by_key(|(_, object)| (object.next_processed, object.created_at))
            .map(|(slot, _)| slot);

        let Some(slot) = candidate else {
            return Ok(None);
        };

        let object = &mut arena.objects[slot];
        let processing = request
            .processing_status_for(&object.status)
            .cloned()
            .ok_or_else(|| ProcessingError::Internal("claim candidate lost its transition".into()))?;

        object.status = processing;
        object.lock_owner = Some(request.lock_owner.clone());
        object.locked_at = Some(request.now);
        object.processing_attempts += 1;
        object.updated_at = request.now;

        debug!(
            object_id = %object.id,
            status = %object.status,
            attempts = object.processing_attempts,
            "Claimed processable object"
        );

        Ok(Some(object.clone()))
    }

    async fn unlock(&self, request: &UnlockRequest) -> Result<UnlockOutcome> {
        let mut arena = self.arena.lock();
        let object = arena
            .get_mut(&request.id)
            .ok_or(ProcessingError::ObjectNotFound(request.id))?;

        let holds_claim = object.lock_owner.as_deref() == Some(request.lock.lock_owner.as_str())
            && object.locked_at == Some(request.lock.locked_at);
        if !holds_claim {
            warn!(
                object_id = %request.id,
                lock_owner = %request.lock.lock_owner,
                "Unlock rejected: claim already closed"
            );
            return Ok(UnlockOutcome::AlreadyUnlocked);
        }

        object.status = request.new_status.clone();
        object.lock_owner = None;
        object.locked_at = None;
        object.last_processed = Some(request.now);
        object.next_processed = request.next_processed;
        object.processing_time_accumulated_ms = object
            .processing_time_accumulated_ms
            .saturating_add(request.processing_duration_ms());
        if request.reset_attempts {
            object.processing_attempts = 0;
        }
        object.updated_at = request.now;

        Ok(UnlockOutcome::Unlocked(object.clone()))
    }

    async fn reset_stale_locks(&self, request: &StaleLockRequest) -> Result<u64> {
        let mut arena = self.arena.lock();
        let now = timestamp_now();
        let mut reverted = 0;

        for object in arena.objects.iter_mut().filter(|object| {
            object.object_type == request.object_type && object.has_stale_lock(request.locked_before)
        }) {
            let Some(pending) = request.pending_status_for(&object.status) else {
                warn!(
                    object_id = %object.id,
                    status = %object.status,
                    "Stale lock has no pending predecessor; leaving it in place"
                );
                continue;
            };
            object.status = pending.clone();
            object.lock_owner = None;
            object.locked_at = None;
            object.updated_at = now;
            reverted += 1;
        }

        Ok(reverted)
    }

    async fn set_suspended(&self, id: Uuid, suspended: bool) -> Result<bool> {
        let mut arena = self.arena.lock();
        match arena.get_mut(&id) {
            Some(object) => {
                object.processing_suspended = suspended;
                object.updated_at = timestamp_now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn status_summary(&self, object_type: &str) -> Result<StatusSummary> {
        let arena = self.arena.lock();
        let mut summary = StatusSummary {
            object_type: object_type.to_string(),
            counts: HashMap::new(),
        };
        for object in arena.objects.iter().filter(|o| o.object_type == object_type) {
            *summary
                .counts
                .entry(object.status.code().to_string())
                .or_insert(0) += 1;
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LockIdentity;
    use crate::state_machine::Status;
    use std::sync::Arc;
    use std::time::Duration;

    fn claim_request(now: chrono::DateTime<chrono::Utc>) -> ClaimRequest {
        ClaimRequest {
            object_type: "report".to_string(),
            claim_transitions: vec![(Status::pending("new"), Status::processing("working"))],
            lock_owner: "engine-a".to_string(),
            now,
        }
    }

    fn unlock_request(object: &ProcessableObject, status: Status) -> UnlockRequest {
        UnlockRequest {
            id: object.id,
            lock: object.lock_identity().unwrap(),
            new_status: status,
            processing_duration: Duration::from_millis(250),
            next_processed: None,
            reset_attempts: false,
            now: timestamp_now(),
        }
    }

    #[tokio::test]
    async fn test_claim_sets_lock_and_increments_attempts() {
        let store = InMemoryObjectStore::new();
        let created = store
            .insert(NewProcessableObject::new("report", Status::pending("new")))
            .await
            .unwrap();

        let now = timestamp_now();
        let claimed = store.claim_next(&claim_request(now)).await.unwrap().unwrap();
        assert_eq!(claimed.id, created.id);
        assert_eq!(claimed.status.code(), "working");
        assert_eq!(claimed.processing_attempts, 1);
        assert_eq!(claimed.lock_owner.as_deref(), Some("engine-a"));
        assert_eq!(claimed.locked_at, Some(now));

        assert!(store.claim_next(&claim_request(now)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_skips_other_types_suspended_and_future_objects() {
        let store = InMemoryObjectStore::new();
        let now = timestamp_now();
        store
            .insert(NewProcessableObject::new("sms", Status::pending("new")))
            .await
            .unwrap();
        store
            .insert(NewProcessableObject::new("report", Status::pending("new")).suspended())
            .await
            .unwrap();
        store
            .insert(
                NewProcessableObject::new("report", Status::pending("new"))
                    .due_at(now + chrono::Duration::minutes(5)),
            )
            .await
            .unwrap();

        assert!(store.claim_next(&claim_request(now)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_prefers_earliest_due() {
        let store = InMemoryObjectStore::new();
        let now = timestamp_now();
        let later = store
            .insert(
                NewProcessableObject::new("report", Status::pending("new"))
                    .due_at(now - chrono::Duration::seconds(1)),
            )
            .await
            .unwrap();
        let earlier = store
            .insert(
                NewProcessableObject::new("report", Status::pending("new"))
                    .due_at(now - chrono::Duration::seconds(60)),
            )
            .await
            .unwrap();

        let first = store.claim_next(&claim_request(now)).await.unwrap().unwrap();
        let second = store.claim_next(&claim_request(now)).await.unwrap().unwrap();
        assert_eq!(first.id, earlier.id);
        assert_eq!(second.id, later.id);
    }

    #[tokio::test]
    async fn test_unlock_is_rejected_the_second_time() {
        let store = InMemoryObjectStore::new();
        store
            .insert(NewProcessableObject::new("report", Status::pending("new")))
            .await
            .unwrap();
        let claimed = store
            .claim_next(&claim_request(timestamp_now()))
            .await
            .unwrap()
            .unwrap();

        let request = unlock_request(&claimed, Status::completed("done"));
        let first = store.unlock(&request).await.unwrap();
        let second = store.unlock(&request).await.unwrap();

        let UnlockOutcome::Unlocked(unlocked) = first else {
            panic!("first unlock should succeed");
        };
        assert_eq!(second, UnlockOutcome::AlreadyUnlocked);
        assert!(unlocked.lock_owner.is_none());
        assert!(unlocked.locked_at.is_none());

        let stored = store.find(claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.processing_time_accumulated_ms, 250);
        assert_eq!(stored.status.code(), "done");
    }

    #[tokio::test]
    async fn test_unlock_with_foreign_lock_identity_is_rejected() {
        let store = InMemoryObjectStore::new();
        store
            .insert(NewProcessableObject::new("report", Status::pending("new")))
            .await
            .unwrap();
        let claimed = store
            .claim_next(&claim_request(timestamp_now()))
            .await
            .unwrap()
            .unwrap();

        let mut request = unlock_request(&claimed, Status::completed("done"));
        request.lock = LockIdentity {
            lock_owner: "engine-b".to_string(),
            locked_at: claimed.locked_at.unwrap(),
        };
        assert_eq!(
            store.unlock(&request).await.unwrap(),
            UnlockOutcome::AlreadyUnlocked
        );
        assert!(store.find(claimed.id).await.unwrap().unwrap().is_locked());
    }

    #[tokio::test]
    async fn test_unlock_unknown_object_is_an_error() {
        let store = InMemoryObjectStore::new();
        let request = UnlockRequest {
            id: Uuid::new_v4(),
            lock: LockIdentity {
                lock_owner: "engine-a".to_string(),
                locked_at: timestamp_now(),
            },
            new_status: Status::completed("done"),
            processing_duration: Duration::ZERO,
            next_processed: None,
            reset_attempts: false,
            now: timestamp_now(),
        };
        assert!(matches!(
            store.unlock(&request).await,
            Err(ProcessingError::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_stale_locks_reverts_without_touching_attempts() {
        let store = InMemoryObjectStore::new();
        store
            .insert(NewProcessableObject::new("report", Status::pending("new")))
            .await
            .unwrap();
        let claimed_at = timestamp_now() - chrono::Duration::minutes(10);
        let claimed = store
            .claim_next(&claim_request(claimed_at))
            .await
            .unwrap()
            .unwrap();

        let request = StaleLockRequest {
            object_type: "report".to_string(),
            reversions: vec![(Status::processing("working"), Status::pending("new"))],
            locked_before: timestamp_now() - chrono::Duration::minutes(5),
        };
        assert_eq!(store.reset_stale_locks(&request).await.unwrap(), 1);

        let reverted = store.find(claimed.id).await.unwrap().unwrap();
        assert_eq!(reverted.status.code(), "new");
        assert_eq!(reverted.processing_attempts, 1);
        assert!(reverted.lock_owner.is_none());

        // The original claim can no longer be closed.
        let unlock = unlock_request(&claimed, Status::completed("done"));
        assert_eq!(
            store.unlock(&unlock).await.unwrap(),
            UnlockOutcome::AlreadyUnlocked
        );
    }

    #[tokio::test]
    async fn test_fresh_locks_survive_the_sweep() {
        let store = InMemoryObjectStore::new();
        store
            .insert(NewProcessableObject::new("report", Status::pending("new")))
            .await
            .unwrap();
        store
            .claim_next(&claim_request(timestamp_now()))
            .await
            .unwrap()
            .unwrap();

        let request = StaleLockRequest {
            object_type: "report".to_string(),
            reversions: vec![(Status::processing("working"), Status::pending("new"))],
            locked_before: timestamp_now() - chrono::Duration::minutes(5),
        };
        assert_eq!(store.reset_stale_locks(&request).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_are_exclusive() {
        let store = Arc::new(InMemoryObjectStore::new());
        store
            .insert(NewProcessableObject::new("report", Status::pending("new")))
            .await
            .unwrap();

        let now = timestamp_now();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.claim_next(&claim_request(now)).await })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_suspend_and_summary() {
        let store = InMemoryObjectStore::new();
        let object = store
            .insert(NewProcessableObject::new("report", Status::pending("new")))
            .await
            .unwrap();
        store
            .insert(NewProcessableObject::new("report", Status::completed("done")))
            .await
            .unwrap();

        assert!(store.set_suspended(object.id, true).await.unwrap());
        assert!(!store.set_suspended(Uuid::new_v4(), true).await.unwrap());
        assert!(store
            .claim_next(&claim_request(timestamp_now()))
            .await
            .unwrap()
            .is_none());

        let summary = store.status_summary("report").await.unwrap();
        assert_eq!(summary.count("new"), 1);
        assert_eq!(summary.count("done"), 1);
        assert_eq!(summary.total(), 2);
    }
}
