//! Message types for actor communication.
//!
//! All inter-actor communication uses typed messages over `tokio::sync::mpsc`;
//! replies come back on `tokio::sync::oneshot`.

use super::call::CallActorHandle;
use crate::errors::CallError;
use call_protocol::{CallStatus, CallType, ParticipantStatus};
use chrono::{DateTime, Utc};
use common::types::{CallId, GroupId, SessionId, UserId};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::sync::oneshot;

/// Reply channel for every call transition.
pub type CallReply = oneshot::Sender<Result<CallSnapshot, CallError>>;

/// Messages sent to `CallSupervisorActor`.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Validate and spawn a call actor. The reply arrives once the call
    /// record is persisted and invitees were rung.
    StartCall {
        request: StartCall,
        respond_to: CallReply,
    },

    /// Look up the live actor for a call.
    GetCall {
        call_id: CallId,
        respond_to: oneshot::Sender<Option<CallActorHandle>>,
    },

    GetStatus {
        respond_to: oneshot::Sender<SupervisorStatus>,
    },

    /// Stop accepting calls and settle every live one.
    Shutdown {
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },
}

/// Messages sent to a `CallActor`.
#[derive(Debug)]
pub enum CallMessage {
    /// An invitee accepts from `session_id`.
    Accept {
        user_id: UserId,
        session_id: SessionId,
        respond_to: CallReply,
    },

    Reject {
        user_id: UserId,
        respond_to: CallReply,
    },

    /// The initiator withdraws a ringing call.
    Cancel {
        user_id: UserId,
        respond_to: CallReply,
    },

    /// Terminate the call for everyone.
    End {
        user_id: UserId,
        respond_to: CallReply,
    },

    /// One member leaves; the call may continue for the others.
    Leave {
        user_id: UserId,
        respond_to: CallReply,
    },

    /// A present member attaches another session to the call room.
    Join {
        user_id: UserId,
        session_id: SessionId,
        respond_to: CallReply,
    },

    GetState {
        respond_to: CallReply,
    },
}

/// Request to start a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartCall {
    pub call_id: CallId,
    pub call_type: CallType,
    pub initiator: UserId,
    /// Session the request came from; joined to the call room.
    pub initiator_session: Option<SessionId>,
    pub invitees: Vec<UserId>,
    pub group_id: Option<GroupId>,
}

/// Point-in-time view of a call actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub call_id: CallId,
    pub call_type: CallType,
    pub status: CallStatus,
    pub is_group_call: bool,
    pub initiator: UserId,
    pub group_id: Option<GroupId>,
    pub participants: BTreeMap<UserId, ParticipantStatus>,
    pub answered_at: Option<DateTime<Utc>>,
    /// Set once settled.
    pub duration: Option<u64>,
}

/// Published by each call actor for the supervisor's busy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSummary {
    pub status: CallStatus,
    /// Users still ringing or present in the call.
    pub engaged: BTreeSet<UserId>,
}

/// Supervisor status for health reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorStatus {
    /// Live call actors, including settled ones in retention.
    pub call_count: usize,
    /// Calls not yet settled.
    pub unsettled_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}
