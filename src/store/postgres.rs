//! # PostgreSQL Object Store
//!
//! ## Architecture: Conditional Updates with Row-Level Locking
//!
//! Several engine instances may share one `processable_objects` table. Mutual
//! exclusion comes entirely from the statements below; no instance talks to
//! another.
//!
//! - **Claim**: one `WITH candidate AS (SELECT … FOR UPDATE SKIP LOCKED LIMIT 1)
//!   UPDATE … RETURNING` statement. Rows locked by a concurrent claim are skipped,
//!   never waited on.
//! - **Unlock**: an `UPDATE` guarded by `(id, lock_owner, locked_at)`. Once the
//!   claim is closed (or swept) the guard no longer matches and the call becomes
//!   a no-op reported as [`UnlockOutcome::AlreadyUnlocked`].
//! - **Sweep**: one `UPDATE` reverting processing rows whose `locked_at` is older
//!   than the threshold to their pending predecessor.
//!
//! Claim transitions and reversions are passed as parallel `TEXT[]` arrays and
//! joined through `UNNEST`, so the same statements serve every domain.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::{
    ClaimRequest, ProcessableObjectStore, StaleLockRequest, StatusSummary, UnlockOutcome,
    UnlockRequest,
};
use crate::error::{ProcessingError, Result};
use crate::models::{timestamp_now, NewProcessableObject, ProcessableObject};
use crate::state_machine::{ProcessingPhase, Status};

const CLAIM_NEXT_SQL: &str = r#"
    WITH transitions AS (
        SELECT pending_status, processing_status
        FROM UNNEST($2::TEXT[], $3::TEXT[]) AS t(pending_status, processing_status)
    ),
    candidate AS (
        SELECT o.id, t.processing_status
        FROM processable_objects o
        JOIN transitions t ON t.pending_status = o.status
        WHERE o.object_type = $1
          AND o.status_phase = 'pending'
          AND o.processing_suspended = FALSE
          AND o.lock_owner IS NULL
          AND (o.next_processed IS NULL OR o.next_processed <= $5)
        ORDER BY o.next_processed ASC NULLS FIRST, o.created_at ASC
        LIMIT 1
        FOR UPDATE OF o SKIP LOCKED
    )
    UPDATE processable_objects o
    SET status = c.processing_status,
        status_phase = 'processing',
        lock_owner = $4,
        locked_at = $5,
        processing_attempts = o.processing_attempts + 1,
        updated_at = $5
    FROM candidate c
    WHERE o.id = c.id
    RETURNING o.*
"#;

const UNLOCK_SQL: &str = r#"
    UPDATE processable_objects
    SET status = $4,
        status_phase = $5,
        lock_owner = NULL,
        locked_at = NULL,
        last_processed = $6,
        next_processed = $7,
        processing_time_accumulated_ms = processing_time_accumulated_ms + $8,
        processing_attempts = CASE WHEN $9 THEN 0 ELSE processing_attempts END,
        updated_at = $6
    WHERE id = $1
      AND lock_owner = $2
      AND locked_at = $3
    RETURNING *
"#;

const RESET_STALE_LOCKS_SQL: &str = r#"
    WITH reversions AS (
        SELECT processing_status, pending_status
        FROM UNNEST($2::TEXT[], $3::TEXT[]) AS r(processing_status, pending_status)
    )
    UPDATE processable_objects o
    SET status = r.pending_status,
        status_phase = 'pending',
        lock_owner = NULL,
        locked_at = NULL,
        updated_at = $5
    FROM reversions r
    WHERE o.object_type = $1
      AND o.status_phase = 'processing'
      AND o.status = r.processing_status
      AND o.locked_at < $4
"#;

const INSERT_SQL: &str = r#"
    INSERT INTO processable_objects
        (id, object_type, status, status_phase, payload, next_processed,
         processing_suspended, created_at, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
    RETURNING *
"#;

/// Store backed by the `processable_objects` table
#[derive(Debug, Clone)]
pub struct PostgresObjectStore {
    pool: PgPool,
}

impl PostgresObjectStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn exists(&self, id: Uuid) -> Result<bool> {
        let row: (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM processable_objects WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }
}

#[async_trait]
impl ProcessableObjectStore for PostgresObjectStore {
    async fn insert(&self, new_object: NewProcessableObject) -> Result<ProcessableObject> {
        let now = timestamp_now();
        let row = sqlx::query_as::<_, ProcessableObjectRow>(INSERT_SQL)
            .bind(new_object.id.unwrap_or_else(Uuid::new_v4))
            .bind(&new_object.object_type)
            .bind(new_object.status.code())
            .bind(new_object.status.phase().as_str())
            .bind(&new_object.payload)
            .bind(new_object.next_processed)
            .bind(new_object.processing_suspended)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to insert processable object: {}", e);
                ProcessingError::DatabaseError(format!("Insert failed: {e}"))
            })?;

        row.try_into()
    }

    async fn find(&self, id: Uuid) -> Result<Option<ProcessableObject>> {
        sqlx::query_as::<_, ProcessableObjectRow>("SELECT * FROM processable_objects WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(ProcessableObject::try_from)
            .transpose()
    }

    #[instrument(skip(self, request), fields(object_type = %request.object_type, lock_owner = %request.lock_owner))]
    async fn claim_next(&self, request: &ClaimRequest) -> Result<Option<ProcessableObject>> {
        let (pending, processing): (Vec<String>, Vec<String>) = request
            .claim_transitions
            .iter()
            .map(|(from, to)| (from.code().to_string(), to.code().to_string()))
            .unzip();

        let row = sqlx::query_as::<_, ProcessableObjectRow>(CLAIM_NEXT_SQL)
            .bind(&request.object_type)
            .bind(&pending)
            .bind(&processing)
            .bind(&request.lock_owner)
            .bind(request.now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to claim processable object: {}", e);
                ProcessingError::DatabaseError(format!("Claim failed: {e}"))
            })?;

        match row {
            Some(row) => {
                let object = ProcessableObject::try_from(row)?;
                debug!(
                    object_id = %object.id,
                    status = %object.status,
                    attempts = object.processing_attempts,
                    "Claimed processable object"
                );
                Ok(Some(object))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, request), fields(object_id = %request.id, status = %request.new_status))]
    async fn unlock(&self, request: &UnlockRequest) -> Result<UnlockOutcome> {
        let row = sqlx::query_as::<_, ProcessableObjectRow>(UNLOCK_SQL)
            .bind(request.id)
            .bind(&request.lock.lock_owner)
            .bind(request.lock.locked_at)
            .bind(request.new_status.code())
            .bind(request.new_status.phase().as_str())
            .bind(request.now)
            .bind(request.next_processed)
            .bind(request.processing_duration_ms())
            .bind(request.reset_attempts)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to unlock processable object {}: {}", request.id, e);
                ProcessingError::DatabaseError(format!("Unlock failed: {e}"))
            })?;

        match row {
            Some(row) => Ok(UnlockOutcome::Unlocked(row.try_into()?)),
            None if self.exists(request.id).await? => {
                warn!(
                    object_id = %request.id,
                    lock_owner = %request.lock.lock_owner,
                    "Unlock rejected: claim already closed"
                );
                Ok(UnlockOutcome::AlreadyUnlocked)
            }
            None => Err(ProcessingError::ObjectNotFound(request.id)),
        }
    }

    #[instrument(skip(self, request), fields(object_type = %request.object_type))]
    async fn reset_stale_locks(&self, request: &StaleLockRequest) -> Result<u64> {
        let (processing, pending): (Vec<String>, Vec<String>) = request
            .reversions
            .iter()
            .map(|(from, to)| (from.code().to_string(), to.code().to_string()))
            .unzip();

        let result = sqlx::query(RESET_STALE_LOCKS_SQL)
            .bind(&request.object_type)
            .bind(&processing)
            .bind(&pending)
            .bind(request.locked_before)
            .bind(timestamp_now())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to reset stale locks: {}", e);
                ProcessingError::DatabaseError(format!("Stale lock reset failed: {e}"))
            })?;

        Ok(result.rows_affected())
    }

    async fn set_suspended(&self, id: Uuid, suspended: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE processable_objects SET processing_suspended = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(suspended)
        .bind(timestamp_now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn status_summary(&self, object_type: &str) -> Result<StatusSummary> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM processable_objects WHERE object_type = $1 GROUP BY status",
        )
        .bind(object_type)
        .fetch_all(&self.pool)
        .await?;

        Ok(StatusSummary {
            object_type: object_type.to_string(),
            counts: rows.into_iter().collect::<HashMap<_, _>>(),
        })
    }
}

/// Internal struct for SQL query results
#[derive(sqlx::FromRow)]
struct ProcessableObjectRow {
    id: Uuid,
    object_type: String,
    status: String,
    status_phase: String,
    payload: Value,
    processing_attempts: i32,
    lock_owner: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    last_processed: Option<DateTime<Utc>>,
    next_processed: Option<DateTime<Utc>>,
    processing_time_accumulated_ms: i64,
    processing_suspended: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ProcessableObjectRow> for ProcessableObject {
    type Error = ProcessingError;

    fn try_from(row: ProcessableObjectRow) -> Result<Self> {
        let phase: ProcessingPhase = row
            .status_phase
            .parse()
            .map_err(ProcessingError::StoreError)?;

        Ok(ProcessableObject {
            id: row.id,
            object_type: row.object_type,
            status: Status::new(row.status, phase),
            payload: row.payload,
            processing_attempts: row.processing_attempts,
            lock_owner: row.lock_owner,
            locked_at: row.locked_at,
            last_processed: row.last_processed,
            next_processed: row.next_processed,
            processing_time_accumulated_ms: row.processing_time_accumulated_ms,
            processing_suspended: row.processing_suspended,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
