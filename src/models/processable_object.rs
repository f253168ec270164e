//! # Processable Object Model
//!
//! A unit of long-lived, multi-step work driven by the background engine.
//!
//! ## Lock Fields
//!
//! `lock_owner` and `locked_at` are the sole concurrency-control resource for an
//! object. Both are set together by a claim and cleared together by the unlock
//! that closes the claim (or by the stale-lock sweep).
//!
//! ## Database Schema
//!
//! Maps to the `processable_objects` table:
//! ```sql
//! CREATE TABLE processable_objects (
//!   id UUID PRIMARY KEY,
//!   object_type TEXT NOT NULL,
//!   status TEXT NOT NULL,
//!   status_phase TEXT NOT NULL,
//!   processing_attempts INTEGER NOT NULL DEFAULT 0,
//!   lock_owner TEXT,
//!   locked_at TIMESTAMPTZ,
//!   next_processed TIMESTAMPTZ,
//!   processing_suspended BOOLEAN NOT NULL DEFAULT FALSE,
//!   -- ... bookkeeping fields
//! );
//! ```

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::state_machine::{ProcessingPhase, Status};

/// Current time truncated to microsecond precision.
///
/// PostgreSQL stores timestamps with microsecond resolution; every timestamp the
/// engine writes goes through here so lock identities compare equal across stores.
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// A record carrying a status, attempt counter, lock ownership and scheduling timestamps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessableObject {
    pub id: Uuid,
    /// Name of the processor (domain) responsible for this object
    pub object_type: String,
    pub status: Status,
    /// Domain data the processor works on
    pub payload: Value,
    /// Incremented on every claim
    pub processing_attempts: i32,
    pub lock_owner: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_processed: Option<DateTime<Utc>>,
    /// Due time for a retry or later work; `None` means due immediately
    pub next_processed: Option<DateTime<Utc>>,
    pub processing_time_accumulated_ms: i64,
    /// Excludes the object from claiming regardless of status or due time
    pub processing_suspended: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessableObject {
    /// Materialize a freshly produced object
    pub fn from_new(new_object: NewProcessableObject, now: DateTime<Utc>) -> Self {
        Self {
            id: new_object.id.unwrap_or_else(Uuid::new_v4),
            object_type: new_object.object_type,
            status: new_object.status,
            payload: new_object.payload,
            processing_attempts: 0,
            lock_owner: None,
            locked_at: None,
            last_processed: None,
            next_processed: new_object.next_processed,
            processing_time_accumulated_ms: 0,
            processing_suspended: new_object.processing_suspended,
            created_at: now,
            updated_at: now,
        }
    }

    /// Claimable iff pending, not suspended, unlocked and due
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status.phase() == ProcessingPhase::Pending
            && !self.processing_suspended
            && self.lock_owner.is_none()
            && self.next_processed.map_or(true, |due| due <= now)
    }

    pub fn is_locked(&self) -> bool {
        self.lock_owner.is_some()
    }

    /// Lock identity of the claim currently held on this object, if any
    pub fn lock_identity(&self) -> Option<LockIdentity> {
        match (&self.lock_owner, self.locked_at) {
            (Some(owner), Some(locked_at)) => Some(LockIdentity {
                lock_owner: owner.clone(),
                locked_at,
            }),
            _ => None,
        }
    }

    pub fn processing_time_accumulated(&self) -> Duration {
        Duration::from_millis(self.processing_time_accumulated_ms.max(0) as u64)
    }

    /// True for a processing object whose lock was taken strictly before `locked_before`
    pub fn has_stale_lock(&self, locked_before: DateTime<Utc>) -> bool {
        self.status.is_processing() && self.locked_at.is_some_and(|at| at < locked_before)
    }
}

/// Identifies one claim: the worker instance that holds it and when it was taken
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockIdentity {
    pub lock_owner: String,
    pub locked_at: DateTime<Utc>,
}

/// Producer-side description of an object to create
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProcessableObject {
    pub id: Option<Uuid>,
    pub object_type: String,
    pub status: Status,
    pub payload: Value,
    pub next_processed: Option<DateTime<Utc>>,
    pub processing_suspended: bool,
}

impl NewProcessableObject {
    pub fn new(object_type: impl Into<String>, initial_status: Status) -> Self {
        Self {
            id: None,
            object_type: object_type.into(),
            status: initial_status,
            payload: Value::Null,
            next_processed: None,
            processing_suspended: false,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn due_at(mut self, next_processed: DateTime<Utc>) -> Self {
        self.next_processed = Some(next_processed);
        self
    }

    pub fn suspended(mut self) -> Self {
        self.processing_suspended = true;
        self
    }
}
