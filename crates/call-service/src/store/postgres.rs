//! Postgres-backed call store.
//!
//! Queries are runtime-checked (`sqlx::query`) so the crate builds without a
//! live database. Patches read the row `FOR UPDATE`, apply the shared patch
//! rules and write the whole row back inside one transaction.

use super::{
    apply_call_patch, apply_participant_patch, CallFilter, CallParticipant, CallPatch,
    CallRecord, CallRecordStore, NewCall, ParticipantPatch, StoreError, CALL_HISTORY_PAGE_SIZE,
};
use crate::observability::metrics;
use call_protocol::{CallStatus, CallType, ParticipantStatus};
use common::secret::{ExposeSecret, SecretString};
use common::types::{CallId, GroupId, UserId};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Instant;
use tracing::instrument;

const CALL_COLUMNS: &str = "call_id, call_type, status, is_group_call, initiator_id, group_id, \
     started_at, answered_at, ended_at, duration_seconds, recording_url, quality_rating";

/// Call store over a Postgres pool.
#[derive(Clone)]
pub struct PgCallStore {
    pool: PgPool,
}

impl PgCallStore {
    /// Wrap an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool and run pending migrations.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if the connection or a migration fails.
    pub async fn connect(url: &SecretString, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url.expose_secret())
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(format!("migration failed: {e}")))?;

        Ok(Self { pool })
    }

    async fn fetch_call<'e, E: sqlx::PgExecutor<'e>>(
        executor: E,
        call_id: &CallId,
        lock: bool,
    ) -> Result<Option<CallRecord>, StoreError> {
        let sql = format!(
            "SELECT {CALL_COLUMNS} FROM calls WHERE call_id = $1{}",
            if lock { " FOR UPDATE" } else { "" }
        );
        let row = sqlx::query(&sql)
            .bind(call_id.as_str())
            .fetch_optional(executor)
            .await?;
        row.map(|r| map_row_to_call(&r)).transpose()
    }
}

/// Record store latency around a query future.
async fn timed<T>(
    operation: &'static str,
    fut: impl std::future::Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    let start = Instant::now();
    let result = fut.await;
    let status = if result.is_ok() { "success" } else { "error" };
    metrics::record_store_latency(operation, status, start.elapsed());
    result
}

#[async_trait::async_trait]
impl CallRecordStore for PgCallStore {
    #[instrument(skip_all, name = "cs.store.create_call", fields(call_id = %call.call_id))]
    async fn create_call(
        &self,
        call: NewCall,
        invitees: &[UserId],
    ) -> Result<CallRecord, StoreError> {
        timed("create_call", async {
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                r#"
                INSERT INTO calls (call_id, call_type, status, is_group_call, initiator_id, group_id, started_at)
                VALUES ($1, $2, 'initiated', $3, $4, $5, $6)
                "#,
            )
            .bind(call.call_id.as_str()) // $1
            .bind(call.call_type.as_str()) // $2
            .bind(call.is_group_call) // $3
            .bind(call.initiator_id.as_str()) // $4
            .bind(call.group_id.as_ref().map(GroupId::as_str)) // $5
            .bind(call.started_at) // $6
            .execute(&mut *tx)
            .await?;

            for user_id in invitees {
                sqlx::query(
                    r#"
                    INSERT INTO call_participants (call_id, user_id, status)
                    VALUES ($1, $2, 'invited')
                    ON CONFLICT (call_id, user_id) DO NOTHING
                    "#,
                )
                .bind(call.call_id.as_str())
                .bind(user_id.as_str())
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            Ok(CallRecord::from_new(&call))
        })
        .await
    }

    #[instrument(skip_all, name = "cs.store.patch_call", fields(call_id = %call_id))]
    async fn patch_call(
        &self,
        call_id: &CallId,
        patch: &CallPatch,
    ) -> Result<CallRecord, StoreError> {
        timed("patch_call", async {
            let mut tx = self.pool.begin().await?;

            let mut record = Self::fetch_call(&mut *tx, call_id, true)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("call {call_id}")))?;
            let before = record.clone();
            apply_call_patch(&mut record, patch)?;

            if record != before {
                let duration = record
                    .duration
                    .map(i64::try_from)
                    .transpose()
                    .map_err(|e| StoreError::InvalidPatch(format!("duration out of range: {e}")))?;

                sqlx::query(
                    r#"
                    UPDATE calls
                    SET status = $2, answered_at = $3, ended_at = $4, duration_seconds = $5,
                        recording_url = $6, quality_rating = $7
                    WHERE call_id = $1
                    "#,
                )
                .bind(call_id.as_str()) // $1
                .bind(record.status.as_str()) // $2
                .bind(record.answered_at) // $3
                .bind(record.ended_at) // $4
                .bind(duration) // $5
                .bind(record.recording_url.as_deref()) // $6
                .bind(record.quality_rating.map(i16::from)) // $7
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            Ok(record)
        })
        .await
    }

    #[instrument(skip_all, name = "cs.store.patch_participant", fields(call_id = %call_id))]
    async fn patch_participant(
        &self,
        call_id: &CallId,
        user_id: &UserId,
        patch: &ParticipantPatch,
    ) -> Result<CallParticipant, StoreError> {
        timed("patch_participant", async {
            let mut tx = self.pool.begin().await?;

            let row = sqlx::query(
                r#"
                SELECT call_id, user_id, status, joined_at, left_at
                FROM call_participants
                WHERE call_id = $1 AND user_id = $2
                FOR UPDATE
                "#,
            )
            .bind(call_id.as_str())
            .bind(user_id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("participant {user_id} in {call_id}")))?;

            let mut participant = map_row_to_participant(&row)?;
            apply_participant_patch(&mut participant, patch);

            sqlx::query(
                r#"
                UPDATE call_participants
                SET status = $3, joined_at = $4, left_at = $5
                WHERE call_id = $1 AND user_id = $2
                "#,
            )
            .bind(call_id.as_str())
            .bind(user_id.as_str())
            .bind(participant.status.as_str())
            .bind(participant.joined_at)
            .bind(participant.left_at)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(participant)
        })
        .await
    }

    #[instrument(skip_all, name = "cs.store.get_call", fields(call_id = %call_id))]
    async fn get_call(&self, call_id: &CallId) -> Result<Option<CallRecord>, StoreError> {
        timed("get_call", Self::fetch_call(&self.pool, call_id, false)).await
    }

    #[instrument(skip_all, name = "cs.store.list_participants", fields(call_id = %call_id))]
    async fn list_participants(
        &self,
        call_id: &CallId,
    ) -> Result<Vec<CallParticipant>, StoreError> {
        timed("list_participants", async {
            let rows = sqlx::query(
                r#"
                SELECT call_id, user_id, status, joined_at, left_at
                FROM call_participants
                WHERE call_id = $1
                ORDER BY user_id
                "#,
            )
            .bind(call_id.as_str())
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(map_row_to_participant).collect()
        })
        .await
    }

    #[instrument(skip_all, name = "cs.store.list_for_user")]
    async fn list_for_user(
        &self,
        user_id: &UserId,
        filter: &CallFilter,
    ) -> Result<Vec<CallRecord>, StoreError> {
        timed("list_for_user", async {
            let limit = i64::try_from(CALL_HISTORY_PAGE_SIZE).unwrap_or(i64::MAX);
            let sql = format!(
                r#"
                SELECT {CALL_COLUMNS}
                FROM calls c
                WHERE (c.initiator_id = $1
                       OR EXISTS (SELECT 1 FROM call_participants p
                                  WHERE p.call_id = c.call_id AND p.user_id = $1))
                  AND ($2::text IS NULL OR c.status = $2)
                  AND ($3::text IS NULL OR c.call_type = $3)
                  AND ($4::timestamptz IS NULL
                       OR c.started_at < $4
                       OR (c.started_at = $4 AND c.call_id COLLATE "C" < $6::text))
                ORDER BY c.started_at DESC, c.call_id COLLATE "C" DESC
                LIMIT $5
                "#
            );
            let rows = sqlx::query(&sql)
                .bind(user_id.as_str()) // $1
                .bind(filter.status.map(|s| s.as_str())) // $2
                .bind(filter.call_type.map(|t| t.as_str())) // $3
                .bind(filter.before) // $4
                .bind(limit) // $5
                .bind(filter.before_id.as_ref().map(CallId::as_str)) // $6
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(map_row_to_call).collect()
        })
        .await
    }
}

/// Map a `calls` row to a `CallRecord`.
fn map_row_to_call(row: &PgRow) -> Result<CallRecord, StoreError> {
    let call_type: String = row.try_get("call_type")?;
    let status: String = row.try_get("status")?;
    let duration: Option<i64> = row.try_get("duration_seconds")?;
    let rating: Option<i16> = row.try_get("quality_rating")?;
    let group_id: Option<String> = row.try_get("group_id")?;

    Ok(CallRecord {
        call_id: CallId(row.try_get("call_id")?),
        call_type: call_type
            .parse::<CallType>()
            .map_err(StoreError::Database)?,
        status: status.parse::<CallStatus>().map_err(StoreError::Database)?,
        is_group_call: row.try_get("is_group_call")?,
        initiator_id: UserId(row.try_get("initiator_id")?),
        group_id: group_id.map(GroupId),
        started_at: row.try_get("started_at")?,
        answered_at: row.try_get("answered_at")?,
        ended_at: row.try_get("ended_at")?,
        duration: duration.and_then(|d| u64::try_from(d).ok()),
        recording_url: row.try_get("recording_url")?,
        quality_rating: rating.and_then(|r| u8::try_from(r).ok()),
    })
}

/// Map a `call_participants` row to a `CallParticipant`.
fn map_row_to_participant(row: &PgRow) -> Result<CallParticipant, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(CallParticipant {
        call_id: CallId(row.try_get("call_id")?),
        user_id: UserId(row.try_get("user_id")?),
        status: status
            .parse::<ParticipantStatus>()
            .map_err(StoreError::Database)?,
        joined_at: row.try_get("joined_at")?,
        left_at: row.try_get("left_at")?,
    })
}
