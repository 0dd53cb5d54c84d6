//! Call Record Store.
//!
//! The durable source of truth for calls and their participants. The call
//! lifecycle actors are the only writers; the history API reads.
//!
//! Patches are idempotent: re-applying an identical patch yields the same
//! record, so callers may retry them. A patch that would change the status,
//! end time or duration of an already-settled record is refused with
//! [`StoreError::Conflict`].

pub mod memory;
pub mod postgres;

pub use memory::MemoryCallStore;
pub use postgres::PgCallStore;

use call_protocol::{CallStatus, CallType, ParticipantStatus};
use chrono::{DateTime, Utc};
use common::types::{CallId, GroupId, UserId};
use crate::observability::metrics;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Maximum records returned by one history query.
pub const CALL_HISTORY_PAGE_SIZE: usize = 50;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// The patch would leave the record violating its invariants.
    #[error("Invalid patch: {0}")]
    InvalidPatch(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Only backend failures are worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// Persisted call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub call_id: CallId,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub status: CallStatus,
    pub is_group_call: bool,
    pub initiator_id: UserId,
    pub group_id: Option<GroupId>,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Whole seconds; set iff the status is terminal.
    pub duration: Option<u64>,
    pub recording_url: Option<String>,
    /// 1 to 5.
    pub quality_rating: Option<u8>,
}

impl CallRecord {
    fn from_new(call: &NewCall) -> Self {
        Self {
            call_id: call.call_id.clone(),
            call_type: call.call_type,
            status: CallStatus::Initiated,
            is_group_call: call.is_group_call,
            initiator_id: call.initiator_id.clone(),
            group_id: call.group_id.clone(),
            started_at: call.started_at,
            answered_at: None,
            ended_at: None,
            duration: None,
            recording_url: None,
            quality_rating: None,
        }
    }
}

/// Persisted per-invitee row, unique per (call, user).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallParticipant {
    pub call_id: CallId,
    pub user_id: UserId,
    pub status: ParticipantStatus,
    pub joined_at: Option<DateTime<Utc>>,
    pub left_at: Option<DateTime<Utc>>,
}

/// Insert request for a new call.
#[derive(Debug, Clone)]
pub struct NewCall {
    pub call_id: CallId,
    pub call_type: CallType,
    pub is_group_call: bool,
    pub initiator_id: UserId,
    pub group_id: Option<GroupId>,
    pub started_at: DateTime<Utc>,
}

/// Partial update of a call. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallPatch {
    pub status: Option<CallStatus>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration: Option<u64>,
    pub recording_url: Option<String>,
    pub quality_rating: Option<u8>,
}

impl CallPatch {
    /// First acceptance.
    #[must_use]
    pub fn active(answered_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(CallStatus::Active),
            answered_at: Some(answered_at),
            ..Self::default()
        }
    }

    /// Terminal settlement.
    #[must_use]
    pub fn settled(status: CallStatus, ended_at: DateTime<Utc>, duration: u64) -> Self {
        Self {
            status: Some(status),
            ended_at: Some(ended_at),
            duration: Some(duration),
            ..Self::default()
        }
    }

    /// Bounded label for store metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self.status {
            Some(CallStatus::Active) => "activate",
            Some(CallStatus::Ended | CallStatus::Missed | CallStatus::Rejected) => "settle",
            _ => "annotate",
        }
    }
}

/// Partial update of a participant row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantPatch {
    pub status: ParticipantStatus,
    pub joined_at: Option<DateTime<Utc>>,
    pub left_at: Option<DateTime<Utc>>,
}

impl ParticipantPatch {
    #[must_use]
    pub fn joined(at: DateTime<Utc>) -> Self {
        Self {
            status: ParticipantStatus::Joined,
            joined_at: Some(at),
            left_at: None,
        }
    }

    #[must_use]
    pub fn left(at: DateTime<Utc>) -> Self {
        Self {
            status: ParticipantStatus::Left,
            joined_at: None,
            left_at: Some(at),
        }
    }

    #[must_use]
    pub fn rejected() -> Self {
        Self {
            status: ParticipantStatus::Rejected,
            joined_at: None,
            left_at: None,
        }
    }
}

/// History query filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallFilter {
    pub status: Option<CallStatus>,
    pub call_type: Option<CallType>,
    /// Only calls started strictly before this instant (paging cursor).
    pub before: Option<DateTime<Utc>>,
    /// Tie-breaker for `before`: calls started exactly at `before` are kept
    /// when their id sorts below this one.
    pub before_id: Option<CallId>,
}

impl CallFilter {
    #[must_use]
    pub fn matches(&self, record: &CallRecord) -> bool {
        self.status.map_or(true, |s| s == record.status)
            && self.call_type.map_or(true, |t| t == record.call_type)
            && self.before.map_or(true, |b| {
                record.started_at < b
                    || (record.started_at == b
                        && self
                            .before_id
                            .as_ref()
                            .is_some_and(|id| &record.call_id < id))
            })
    }
}

/// Persistence boundary for call records.
#[async_trait::async_trait]
pub trait CallRecordStore: Send + Sync {
    /// Insert a call (status `initiated`) with one `invited` row per invitee.
    async fn create_call(
        &self,
        call: NewCall,
        invitees: &[UserId],
    ) -> Result<CallRecord, StoreError>;

    /// Apply a patch to a call.
    async fn patch_call(&self, call_id: &CallId, patch: &CallPatch)
        -> Result<CallRecord, StoreError>;

    /// Apply a patch to one participant row.
    async fn patch_participant(
        &self,
        call_id: &CallId,
        user_id: &UserId,
        patch: &ParticipantPatch,
    ) -> Result<CallParticipant, StoreError>;

    async fn get_call(&self, call_id: &CallId) -> Result<Option<CallRecord>, StoreError>;

    async fn list_participants(&self, call_id: &CallId)
        -> Result<Vec<CallParticipant>, StoreError>;

    /// Calls the user initiated or was invited to, most recent first, at
    /// most [`CALL_HISTORY_PAGE_SIZE`].
    async fn list_for_user(
        &self,
        user_id: &UserId,
        filter: &CallFilter,
    ) -> Result<Vec<CallRecord>, StoreError>;
}

/// Status changes a call may undergo.
fn valid_transition(from: CallStatus, to: CallStatus) -> bool {
    from == to
        || matches!(
            (from, to),
            (
                CallStatus::Initiated,
                CallStatus::Active | CallStatus::Missed | CallStatus::Rejected
            ) | (CallStatus::Active, CallStatus::Ended)
        )
}

/// Apply `patch` to `record` in place, enforcing the record invariants.
///
/// # Errors
///
/// `Conflict` when the patch would change a settled record or make an
/// illegal status change; `InvalidPatch` when the result would break the
/// duration/status invariant.
pub fn apply_call_patch(record: &mut CallRecord, patch: &CallPatch) -> Result<(), StoreError> {
    if record.status.is_terminal() {
        let changes_settlement = patch.status.is_some_and(|s| s != record.status)
            || patch.duration.is_some_and(|d| record.duration != Some(d))
            || patch.ended_at.is_some_and(|t| record.ended_at != Some(t))
            || patch.answered_at.is_some_and(|t| record.answered_at != Some(t));
        if changes_settlement {
            return Err(StoreError::Conflict(format!(
                "call {} is already {}",
                record.call_id, record.status
            )));
        }
    } else if let Some(status) = patch.status {
        if !valid_transition(record.status, status) {
            return Err(StoreError::Conflict(format!(
                "call {} cannot move from {} to {status}",
                record.call_id, record.status
            )));
        }
    }

    if let Some(rating) = patch.quality_rating {
        if !(1..=5).contains(&rating) {
            return Err(StoreError::InvalidPatch(format!(
                "quality rating {rating} outside 1..=5"
            )));
        }
    }

    let mut next = record.clone();
    if let Some(status) = patch.status {
        next.status = status;
    }
    if patch.answered_at.is_some() {
        next.answered_at = patch.answered_at;
    }
    if patch.ended_at.is_some() {
        next.ended_at = patch.ended_at;
    }
    if patch.duration.is_some() {
        next.duration = patch.duration;
    }
    if patch.recording_url.is_some() {
        next.recording_url.clone_from(&patch.recording_url);
    }
    if patch.quality_rating.is_some() {
        next.quality_rating = patch.quality_rating;
    }

    if next.status.is_terminal() != next.duration.is_some() {
        return Err(StoreError::InvalidPatch(format!(
            "duration must be set exactly when the call is settled (status {})",
            next.status
        )));
    }
    if matches!(next.status, CallStatus::Missed | CallStatus::Rejected) && next.duration != Some(0)
    {
        return Err(StoreError::InvalidPatch(format!(
            "{} calls have zero duration",
            next.status
        )));
    }

    *record = next;
    Ok(())
}

/// Apply a participant patch in place.
pub fn apply_participant_patch(participant: &mut CallParticipant, patch: &ParticipantPatch) {
    participant.status = patch.status;
    if patch.joined_at.is_some() {
        participant.joined_at = patch.joined_at;
    }
    if patch.left_at.is_some() {
        participant.left_at = patch.left_at;
    }
}

/// Attempts made for an idempotent patch before giving up.
pub const PATCH_MAX_ATTEMPTS: u32 = 3;

/// Delay before the first retry; doubled after each failure.
const PATCH_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Run an idempotent store operation, retrying transient failures with
/// exponential backoff.
///
/// Only patches go through here. `create_call` is not idempotent and is
/// never retried.
///
/// # Errors
///
/// Returns the last error once attempts are exhausted, or the first
/// non-transient error immediately.
pub async fn with_retry<T, F, Fut>(operation: &'static str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut delay = PATCH_BACKOFF_BASE;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < PATCH_MAX_ATTEMPTS => {
                warn!(
                    target: "cs.store",
                    operation,
                    attempt,
                    error = %e,
                    "Store operation failed, will retry"
                );
                metrics::record_store_retry(operation);
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
