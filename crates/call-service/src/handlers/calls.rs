//! Call history handler.
//!
//! - `GET /api/v1/users/{user_id}/calls` - one page of the user's calls,
//!   most recent first
//!
//! # Query
//!
//! - `status` - `initiated`, `active`, `ended`, `missed` or `rejected`
//! - `type` - `audio` or `video`
//! - `before` - RFC 3339 cursor; only calls started strictly earlier
//! - `beforeId` - with `before`, also admits calls started at exactly that
//!   instant whose id sorts lower
//!
//! `nextBefore` and `nextBeforeId` are set when the page is full and more
//! calls may exist.

use crate::errors::CallError;
use crate::routes::AppState;
use crate::store::{CallFilter, CallRecord, CALL_HISTORY_PAGE_SIZE};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use call_protocol::{CallStatus, CallType};
use chrono::{DateTime, Utc};
use common::types::{CallId, UserId};
use serde::{Deserialize, Serialize};
use tracing::instrument;

#[derive(Debug, Default, Deserialize)]
pub struct CallHistoryQuery {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub call_type: Option<String>,
    pub before: Option<String>,
    #[serde(rename = "beforeId")]
    pub before_id: Option<String>,
}

impl CallHistoryQuery {
    fn into_filter(self) -> Result<CallFilter, CallError> {
        let status = self
            .status
            .map(|s| s.parse::<CallStatus>())
            .transpose()
            .map_err(CallError::InvalidRequest)?;
        let call_type = self
            .call_type
            .map(|t| t.parse::<CallType>())
            .transpose()
            .map_err(CallError::InvalidRequest)?;
        let before = self
            .before
            .map(|b| DateTime::parse_from_rfc3339(&b).map(|t| t.with_timezone(&Utc)))
            .transpose()
            .map_err(|e| CallError::InvalidRequest(format!("invalid before cursor: {e}")))?;
        if before.is_none() && self.before_id.is_some() {
            return Err(CallError::InvalidRequest(
                "beforeId requires before".to_string(),
            ));
        }

        Ok(CallFilter {
            status,
            call_type,
            before,
            before_id: self.before_id.map(CallId::from),
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallHistoryResponse {
    pub calls: Vec<CallRecord>,
    pub next_before: Option<DateTime<Utc>>,
    pub next_before_id: Option<CallId>,
}

/// Handler for `GET /api/v1/users/{user_id}/calls`.
///
/// # Response
///
/// - 200 OK: history page
/// - 400 Bad Request: unknown status or type, or malformed cursor
/// - 500 Internal Server Error: store failure
#[instrument(skip_all, name = "cs.api.history", fields(user_id = %user_id))]
pub async fn list_user_calls(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<CallHistoryQuery>,
) -> Result<Json<CallHistoryResponse>, CallError> {
    let filter = query.into_filter()?;
    let calls = state
        .store
        .list_for_user(&UserId::from(user_id), &filter)
        .await?;

    let (next_before, next_before_id) = match calls.last() {
        Some(last) if calls.len() == CALL_HISTORY_PAGE_SIZE => {
            (Some(last.started_at), Some(last.call_id.clone()))
        }
        _ => (None, None),
    };

    Ok(Json(CallHistoryResponse {
        calls,
        next_before,
        next_before_id,
    }))
}
