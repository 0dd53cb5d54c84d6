//! In-memory call store, used when no database is configured.

use super::{
    apply_call_patch, apply_participant_patch, CallFilter, CallParticipant, CallPatch,
    CallRecord, CallRecordStore, NewCall, ParticipantPatch, StoreError, CALL_HISTORY_PAGE_SIZE,
};
use call_protocol::ParticipantStatus;
use common::types::{CallId, UserId};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct MemoryInner {
    calls: HashMap<CallId, CallRecord>,
    participants: HashMap<CallId, Vec<CallParticipant>>,
}

/// Process-local call store. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryCallStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryCallStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored calls.
    pub async fn len(&self) -> usize {
        self.inner.read().await.calls.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.calls.is_empty()
    }
}

#[async_trait::async_trait]
impl CallRecordStore for MemoryCallStore {
    async fn create_call(
        &self,
        call: NewCall,
        invitees: &[UserId],
    ) -> Result<CallRecord, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.calls.contains_key(&call.call_id) {
            return Err(StoreError::Conflict(format!(
                "call {} already exists",
                call.call_id
            )));
        }

        let record = CallRecord::from_new(&call);
        let mut rows: Vec<CallParticipant> = Vec::with_capacity(invitees.len());
        for user_id in invitees {
            if rows.iter().any(|p| &p.user_id == user_id) {
                continue;
            }
            rows.push(CallParticipant {
                call_id: call.call_id.clone(),
                user_id: user_id.clone(),
                status: ParticipantStatus::Invited,
                joined_at: None,
                left_at: None,
            });
        }

        debug!(
            target: "cs.store",
            call_id = %call.call_id,
            participants = rows.len(),
            "Call created"
        );

        inner.participants.insert(call.call_id.clone(), rows);
        inner.calls.insert(call.call_id, record.clone());
        Ok(record)
    }

    async fn patch_call(
        &self,
        call_id: &CallId,
        patch: &CallPatch,
    ) -> Result<CallRecord, StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .calls
            .get_mut(call_id)
            .ok_or_else(|| StoreError::NotFound(format!("call {call_id}")))?;
        apply_call_patch(record, patch)?;
        Ok(record.clone())
    }

    async fn patch_participant(
        &self,
        call_id: &CallId,
        user_id: &UserId,
        patch: &ParticipantPatch,
    ) -> Result<CallParticipant, StoreError> {
        let mut inner = self.inner.write().await;
        let participant = inner
            .participants
            .get_mut(call_id)
            .and_then(|rows| rows.iter_mut().find(|p| &p.user_id == user_id))
            .ok_or_else(|| StoreError::NotFound(format!("participant {user_id} in {call_id}")))?;
        apply_participant_patch(participant, patch);
        Ok(participant.clone())
    }

    async fn get_call(&self, call_id: &CallId) -> Result<Option<CallRecord>, StoreError> {
        Ok(self.inner.read().await.calls.get(call_id).cloned())
    }

    async fn list_participants(
        &self,
        call_id: &CallId,
    ) -> Result<Vec<CallParticipant>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .participants
            .get(call_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_for_user(
        &self,
        user_id: &UserId,
        filter: &CallFilter,
    ) -> Result<Vec<CallRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut calls: Vec<CallRecord> = inner
            .calls
            .values()
            .filter(|record| {
                &record.initiator_id == user_id
                    || inner
                        .participants
                        .get(&record.call_id)
                        .is_some_and(|rows| rows.iter().any(|p| &p.user_id == user_id))
            })
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();

        calls.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.call_id.cmp(&a.call_id))
        });
        calls.truncate(CALL_HISTORY_PAGE_SIZE);
        Ok(calls)
    }
}
