//! # Processable Object Stores
//!
//! The engine reaches persistence only through [`ProcessableObjectStore`]. A store
//! provides three atomic operations the engine depends on:
//!
//! - **claim**: select one claimable object, move it to its processing status,
//!   take the lock and increment the attempt counter, all in one step
//! - **unlock**: persist the outcome of one claim and release the lock, guarded by
//!   the lock identity of that claim so a repeated unlock is rejected
//! - **sweep**: revert processing objects whose lock outlived a timeout
//!
//! Two implementations ship with the crate:
//!
//! - [`InMemoryObjectStore`]: arena + index behind a single mutex
//! - [`PostgresObjectStore`]: conditional updates with `FOR UPDATE SKIP LOCKED`

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{LockIdentity, NewProcessableObject, ProcessableObject};
use crate::state_machine::Status;

pub use in_memory::InMemoryObjectStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresObjectStore;

/// Parameters of one atomic claim
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub object_type: String,
    /// Claim table as `(pending, processing)` pairs; its keys are the claimable statuses
    pub claim_transitions: Vec<(Status, Status)>,
    pub lock_owner: String,
    pub now: DateTime<Utc>,
}

impl ClaimRequest {
    pub fn processing_status_for(&self, pending: &Status) -> Option<&Status> {
        self.claim_transitions
            .iter()
            .find(|(from, _)| from == pending)
            .map(|(_, to)| to)
    }
}

/// Parameters of one atomic unlock closing a claim
#[derive(Debug, Clone)]
pub struct UnlockRequest {
    pub id: Uuid,
    /// Identity of the claim being closed
    pub lock: LockIdentity,
    pub new_status: Status,
    pub processing_duration: Duration,
    pub next_processed: Option<DateTime<Utc>>,
    pub reset_attempts: bool,
    pub now: DateTime<Utc>,
}

impl UnlockRequest {
    pub fn processing_duration_ms(&self) -> i64 {
        i64::try_from(self.processing_duration.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Result of an unlock attempt
#[derive(Debug, Clone, PartialEq)]
pub enum UnlockOutcome {
    /// The claim was open and has been closed; carries the persisted object
    Unlocked(ProcessableObject),
    /// No open claim matched; nothing was written
    AlreadyUnlocked,
}

impl UnlockOutcome {
    pub fn is_unlocked(&self) -> bool {
        matches!(self, Self::Unlocked(_))
    }
}

/// Parameters of one stale-lock sweep
#[derive(Debug, Clone)]
pub struct StaleLockRequest {
    pub object_type: String,
    /// Reverse claim table as `(processing, pending)` pairs
    pub reversions: Vec<(Status, Status)>,
    /// Locks taken strictly before this instant are stale
    pub locked_before: DateTime<Utc>,
}

impl StaleLockRequest {
    pub fn pending_status_for(&self, processing: &Status) -> Option<&Status> {
        self.reversions
            .iter()
            .find(|(from, _)| from == processing)
            .map(|(_, to)| to)
    }
}

/// Count of objects per status code for one object type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub object_type: String,
    pub counts: HashMap<String, i64>,
}

impl StatusSummary {
    pub fn count(&self, status_code: &str) -> i64 {
        self.counts.get(status_code).copied().unwrap_or(0)
    }

    pub fn total(&self) -> i64 {
        self.counts.values().sum()
    }
}

/// Storage collaborator providing atomic claim, unlock and sweep over processable objects
#[async_trait]
pub trait ProcessableObjectStore: Send + Sync + 'static {
    /// Persist a newly produced object
    async fn insert(&self, new_object: NewProcessableObject) -> Result<ProcessableObject>;

    async fn find(&self, id: Uuid) -> Result<Option<ProcessableObject>>;

    /// Atomically claim one claimable object, or return `None` when none qualify.
    ///
    /// Two concurrent calls never return the same object.
    async fn claim_next(&self, request: &ClaimRequest) -> Result<Option<ProcessableObject>>;

    /// Atomically persist the outcome of a claim and release its lock
    async fn unlock(&self, request: &UnlockRequest) -> Result<UnlockOutcome>;

    /// Revert stale processing locks to their pending predecessor; returns how many
    async fn reset_stale_locks(&self, request: &StaleLockRequest) -> Result<u64>;

    /// Suspend or resume an object; returns false when the object does not exist
    async fn set_suspended(&self, id: Uuid, suspended: bool) -> Result<bool>;

    async fn status_summary(&self, object_type: &str) -> Result<StatusSummary>;
}
