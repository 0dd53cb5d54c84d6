//! Call record store wrapper that records patches and injects failures.

use call_service::store::{
    CallFilter, CallParticipant, CallPatch, CallRecord, CallRecordStore, MemoryCallStore,
    NewCall, ParticipantPatch, StoreError,
};
use common::types::{CallId, UserId};
use std::sync::{Arc, Mutex};

/// A patch that reached the store, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedPatch {
    Call {
        call_id: CallId,
        patch: CallPatch,
        applied: bool,
    },
    Participant {
        call_id: CallId,
        user_id: UserId,
        patch: ParticipantPatch,
        applied: bool,
    },
}

/// Which operations fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailMode {
    #[default]
    Never,
    /// Every `patch_call` fails with a transient database error.
    CallPatches,
    /// Every `create_call` fails with a transient database error.
    Creates,
}

/// [`MemoryCallStore`] plus a log of every patch attempt.
#[derive(Debug, Default)]
pub struct RecordingStore {
    inner: MemoryCallStore,
    patches: Mutex<Vec<RecordedPatch>>,
    fail: Mutex<FailMode>,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_with(&self, mode: FailMode) {
        *self.fail.lock().unwrap() = mode;
    }

    fn fail_mode(&self) -> FailMode {
        *self.fail.lock().unwrap()
    }

    /// Every patch attempt so far, in order.
    pub fn patches(&self) -> Vec<RecordedPatch> {
        self.patches.lock().unwrap().clone()
    }

    /// Applied call-level patches for `call_id`.
    pub fn applied_call_patches(&self, call_id: &str) -> Vec<CallPatch> {
        self.patches()
            .into_iter()
            .filter_map(|p| match p {
                RecordedPatch::Call {
                    call_id: id,
                    patch,
                    applied: true,
                } if id.as_str() == call_id => Some(patch),
                _ => None,
            })
            .collect()
    }

    /// The stored record; panics if the call is unknown.
    pub async fn record(&self, call_id: &str) -> CallRecord {
        self.inner
            .get_call(&CallId::from(call_id))
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("call {call_id} not stored"))
    }

    fn push(&self, patch: RecordedPatch) {
        self.patches.lock().unwrap().push(patch);
    }
}

#[async_trait::async_trait]
impl CallRecordStore for RecordingStore {
    async fn create_call(
        &self,
        call: NewCall,
        invitees: &[UserId],
    ) -> Result<CallRecord, StoreError> {
        if self.fail_mode() == FailMode::Creates {
            return Err(StoreError::Database("injected create failure".to_string()));
        }
        self.inner.create_call(call, invitees).await
    }

    async fn patch_call(
        &self,
        call_id: &CallId,
        patch: &CallPatch,
    ) -> Result<CallRecord, StoreError> {
        let result = if self.fail_mode() == FailMode::CallPatches {
            Err(StoreError::Database("injected patch failure".to_string()))
        } else {
            self.inner.patch_call(call_id, patch).await
        };
        self.push(RecordedPatch::Call {
            call_id: call_id.clone(),
            patch: patch.clone(),
            applied: result.is_ok(),
        });
        result
    }

    async fn patch_participant(
        &self,
        call_id: &CallId,
        user_id: &UserId,
        patch: &ParticipantPatch,
    ) -> Result<CallParticipant, StoreError> {
        let result = self.inner.patch_participant(call_id, user_id, patch).await;
        self.push(RecordedPatch::Participant {
            call_id: call_id.clone(),
            user_id: user_id.clone(),
            patch: patch.clone(),
            applied: result.is_ok(),
        });
        result
    }

    async fn get_call(&self, call_id: &CallId) -> Result<Option<CallRecord>, StoreError> {
        self.inner.get_call(call_id).await
    }

    async fn list_participants(
        &self,
        call_id: &CallId,
    ) -> Result<Vec<CallParticipant>, StoreError> {
        self.inner.list_participants(call_id).await
    }

    async fn list_for_user(
        &self,
        user_id: &UserId,
        filter: &CallFilter,
    ) -> Result<Vec<CallRecord>, StoreError> {
        self.inner.list_for_user(user_id, filter).await
    }
}
