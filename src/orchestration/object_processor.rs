//! # Object Processor
//!
//! Strategy contract implemented once per domain. A processor names its object
//! type, owns the domain's [`StatusModel`] and performs one unit of work per
//! claim. Every decision the engine takes about an outcome goes through an
//! overridable method here, with defaults derived from the status model.
//!
//! [`ProcessorBinding`] ties a processor to a store and a lock owner and provides
//! the two store-backed operations of the contract: claim and unlock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument};

use crate::error::{ProcessingError, Result};
use crate::models::{timestamp_now, ProcessableObject};
use crate::state_machine::{Status, StatusModel};
use crate::store::{
    ClaimRequest, ProcessableObjectStore, StaleLockRequest, StatusSummary, UnlockOutcome,
    UnlockRequest,
};

use super::retry::{checked_before, saturating_after, BackoffPolicy, RetryDecision};

/// Outcome of one successful `process()` call
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingResult {
    /// Status to transition to next
    pub status: Status,
    /// Explicit delay before the object is due again; `None` means due immediately
    pub delay: Option<Duration>,
}

impl ProcessingResult {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            delay: None,
        }
    }

    pub fn after(status: Status, delay: Duration) -> Self {
        Self {
            status,
            delay: Some(delay),
        }
    }

    pub fn next_processed(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.delay.map(|delay| saturating_after(now, delay))
    }
}

/// Domain strategy driven by the background engine
#[async_trait]
pub trait ObjectProcessor: Send + Sync + 'static {
    /// Stable name of the object type this processor owns
    fn object_type(&self) -> &str;

    fn status_model(&self) -> &StatusModel;

    /// Execute one unit of work for the object's current processing status.
    ///
    /// Returning an error signals failure of this attempt. The error is only
    /// handed to [`determine_retry_handling`](Self::determine_retry_handling) and
    /// [`determine_failure_status`](Self::determine_failure_status).
    async fn process(&self, object: &ProcessableObject) -> anyhow::Result<ProcessingResult>;

    /// Attempt budget; `None` uses the engine configuration
    fn max_processing_attempts(&self) -> Option<i32> {
        None
    }

    /// Statuses this processor claims from
    fn get_pending_statuses(&self) -> HashSet<Status> {
        self.status_model().pending_statuses()
    }

    fn determine_processing_status_on_claim(&self, status: &Status) -> Result<Status> {
        self.status_model()
            .claim_transition(status)
            .cloned()
            .ok_or_else(|| {
                ProcessingError::InvalidStatusModel(format!(
                    "no claim transition from '{}'",
                    status.code()
                ))
            })
    }

    /// Terminal status assigned once attempts are exhausted
    fn determine_failure_status(
        &self,
        _object: &ProcessableObject,
        _status: &Status,
        _cause: &anyhow::Error,
    ) -> Status {
        self.status_model().default_failure_status().clone()
    }

    /// Decision for a transient failure with attempts remaining.
    ///
    /// `backoff` is the engine-configured policy; the default targets the retry
    /// transition of `status` after the backoff for the current attempt.
    fn determine_retry_handling(
        &self,
        object: &ProcessableObject,
        status: &Status,
        _cause: &anyhow::Error,
        backoff: &BackoffPolicy,
    ) -> Result<RetryDecision> {
        let model = self.status_model();
        let target = model
            .retry_transition(status)
            .or_else(|| model.pending_predecessor(status))
            .cloned()
            .ok_or_else(|| {
                ProcessingError::InvalidStatusModel(format!(
                    "no retry transition from '{}'",
                    status.code()
                ))
            })?;
        Ok(backoff.decide(target, object.processing_attempts))
    }

    /// Whether a successful transition from `from` to `to` resets the attempt counter
    fn reset_attempts_on_success(&self, _from: &Status, to: &Status) -> bool {
        to.is_pending()
    }
}

/// A processor bound to its store, lock owner and engine defaults
pub struct ProcessorBinding<P, S> {
    processor: Arc<P>,
    store: Arc<S>,
    lock_owner: String,
    default_max_attempts: i32,
    backoff: BackoffPolicy,
}

impl<P, S> std::fmt::Debug for ProcessorBinding<P, S>
where
    P: ObjectProcessor,
    S: ProcessableObjectStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorBinding")
            .field("object_type", &self.processor.object_type())
            .field("lock_owner", &self.lock_owner)
            .field("max_processing_attempts", &self.max_processing_attempts())
            .finish()
    }
}

impl<P, S> ProcessorBinding<P, S>
where
    P: ObjectProcessor,
    S: ProcessableObjectStore,
{
    pub fn new(
        processor: Arc<P>,
        store: Arc<S>,
        lock_owner: impl Into<String>,
        default_max_attempts: i32,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            processor,
            store,
            lock_owner: lock_owner.into(),
            default_max_attempts,
            backoff,
        }
    }

    pub fn processor(&self) -> &Arc<P> {
        &self.processor
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn lock_owner(&self) -> &str {
        &self.lock_owner
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub fn max_processing_attempts(&self) -> i32 {
        self.processor
            .max_processing_attempts()
            .unwrap_or(self.default_max_attempts)
    }

    /// Atomically claim the next claimable object of this processor's type
    #[instrument(skip(self), fields(object_type = %self.processor.object_type(), lock_owner = %self.lock_owner))]
    pub async fn claim_next_processable_object(&self) -> Result<Option<ProcessableObject>> {
        let claim_transitions = self
            .processor
            .get_pending_statuses()
            .into_iter()
            .map(|pending| {
                let processing = self.processor.determine_processing_status_on_claim(&pending)?;
                Ok((pending, processing))
            })
            .collect::<Result<Vec<_>>>()?;

        if claim_transitions.is_empty() {
            return Ok(None);
        }

        let request = ClaimRequest {
            object_type: self.processor.object_type().to_string(),
            claim_transitions,
            lock_owner: self.lock_owner.clone(),
            now: timestamp_now(),
        };

        let claimed = self.store.claim_next(&request).await.map_err(|e| {
            error!(error = %e, "Failed to claim next processable object");
            e
        })?;

        if let Some(object) = &claimed {
            debug!(
                object_id = %object.id,
                status = %object.status,
                attempts = object.processing_attempts,
                "Claimed processable object"
            );
        }

        Ok(claimed)
    }

    /// Persist the outcome of the claim held on `object` and release its lock.
    ///
    /// Guarded by the lock identity on `object`: once the claim is closed, any
    /// further call for it returns [`UnlockOutcome::AlreadyUnlocked`].
    #[instrument(skip(self, object), fields(object_id = %object.id, new_status = %new_status))]
    pub async fn unlock_processable_object(
        &self,
        object: &ProcessableObject,
        new_status: &Status,
        processing_duration: Duration,
        next_processed: Option<DateTime<Utc>>,
        reset_attempts: bool,
    ) -> Result<UnlockOutcome> {
        if !self.processor.status_model().contains(new_status) {
            return Err(ProcessingError::UnknownStatus(
                new_status.code().to_string(),
            ));
        }

        let Some(lock) = object.lock_identity() else {
            debug!("Object carries no lock identity; nothing to unlock");
            return Ok(UnlockOutcome::AlreadyUnlocked);
        };

        let request = UnlockRequest {
            id: object.id,
            lock,
            new_status: new_status.clone(),
            processing_duration,
            next_processed,
            reset_attempts,
            now: timestamp_now(),
        };

        let outcome = self.store.unlock(&request).await?;
        match &outcome {
            UnlockOutcome::Unlocked(updated) => debug!(
                attempts = updated.processing_attempts,
                next_processed = ?updated.next_processed,
                "Unlocked processable object"
            ),
            UnlockOutcome::AlreadyUnlocked => {
                debug!("Claim already closed; unlock ignored")
            }
        }
        Ok(outcome)
    }

    /// Revert processing locks older than `lock_timeout` to their pending predecessor
    #[instrument(skip(self), fields(object_type = %self.processor.object_type()))]
    pub async fn reset_stale_locks(&self, lock_timeout: Duration) -> Result<u64> {
        // A timeout reaching past the earliest instant cannot have expired
        let Some(locked_before) = checked_before(timestamp_now(), lock_timeout) else {
            debug!(?lock_timeout, "Lock timeout exceeds the representable range; nothing is stale");
            return Ok(0);
        };
        let request = StaleLockRequest {
            object_type: self.processor.object_type().to_string(),
            reversions: self.processor.status_model().reversion_pairs(),
            locked_before,
        };
        self.store.reset_stale_locks(&request).await
    }

    pub async fn status_summary(&self) -> Result<StatusSummary> {
        self.store
            .status_summary(self.processor.object_type())
            .await
    }
}
