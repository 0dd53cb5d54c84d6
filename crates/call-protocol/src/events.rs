//! Event enums for both directions of the signaling transport.

use crate::payloads::{
    CallConflict, CallEnded, CallErrorNotice, CallRef, ClientSignal, IncomingCall, InitiateCall,
    JoinUserRoom, LifecycleNotice, Relayed,
};
use serde::{Deserialize, Serialize};

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "join-user-room")]
    JoinUserRoom(JoinUserRoom),
    #[serde(rename = "initiate-call")]
    InitiateCall(InitiateCall),
    #[serde(rename = "accept-call")]
    AcceptCall(CallRef),
    #[serde(rename = "reject-call")]
    RejectCall(CallRef),
    #[serde(rename = "cancel-call")]
    CancelCall(CallRef),
    #[serde(rename = "end-call")]
    EndCall(CallRef),
    #[serde(rename = "call:join")]
    Join(CallRef),
    #[serde(rename = "call:leave")]
    Leave(CallRef),
    #[serde(rename = "call:offer")]
    Offer(ClientSignal),
    #[serde(rename = "call:answer")]
    Answer(ClientSignal),
    #[serde(rename = "call:ice-candidate")]
    IceCandidate(ClientSignal),
    #[serde(rename = "call:toggle-video")]
    ToggleVideo(ClientSignal),
    #[serde(rename = "call:toggle-audio")]
    ToggleAudio(ClientSignal),
}

impl ClientEvent {
    /// Wire name of the event, used as a bounded metric label.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinUserRoom(_) => "join-user-room",
            ClientEvent::InitiateCall(_) => "initiate-call",
            ClientEvent::AcceptCall(_) => "accept-call",
            ClientEvent::RejectCall(_) => "reject-call",
            ClientEvent::CancelCall(_) => "cancel-call",
            ClientEvent::EndCall(_) => "end-call",
            ClientEvent::Join(_) => "call:join",
            ClientEvent::Leave(_) => "call:leave",
            ClientEvent::Offer(_) => RelayKind::Offer.event_name(),
            ClientEvent::Answer(_) => RelayKind::Answer.event_name(),
            ClientEvent::IceCandidate(_) => RelayKind::IceCandidate.event_name(),
            ClientEvent::ToggleVideo(_) => RelayKind::ToggleVideo.event_name(),
            ClientEvent::ToggleAudio(_) => RelayKind::ToggleAudio.event_name(),
        }
    }

    /// Split a signaling frame into its relay kind and payload.
    #[must_use]
    pub fn into_signal(self) -> Option<(RelayKind, ClientSignal)> {
        match self {
            ClientEvent::Offer(s) => Some((RelayKind::Offer, s)),
            ClientEvent::Answer(s) => Some((RelayKind::Answer, s)),
            ClientEvent::IceCandidate(s) => Some((RelayKind::IceCandidate, s)),
            ClientEvent::ToggleVideo(s) => Some((RelayKind::ToggleVideo, s)),
            ClientEvent::ToggleAudio(s) => Some((RelayKind::ToggleAudio, s)),
            _ => None,
        }
    }
}

/// Frames the server may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "incoming-call")]
    IncomingCall(IncomingCall),
    #[serde(rename = "call-accepted")]
    CallAccepted(LifecycleNotice),
    #[serde(rename = "call-rejected")]
    CallRejected(LifecycleNotice),
    #[serde(rename = "call-cancelled")]
    CallCancelled(LifecycleNotice),
    #[serde(rename = "call-missed")]
    CallMissed(LifecycleNotice),
    #[serde(rename = "call-ended")]
    CallEnded(CallEnded),
    #[serde(rename = "call-conflict")]
    CallConflict(CallConflict),
    #[serde(rename = "call-error")]
    CallError(CallErrorNotice),
    #[serde(rename = "call:user-joined")]
    UserJoined(Relayed),
    #[serde(rename = "call:user-left")]
    UserLeft(Relayed),
    #[serde(rename = "call:offer")]
    Offer(Relayed),
    #[serde(rename = "call:answer")]
    Answer(Relayed),
    #[serde(rename = "call:ice-candidate")]
    IceCandidate(Relayed),
    #[serde(rename = "call:toggle-video")]
    ToggleVideo(Relayed),
    #[serde(rename = "call:toggle-audio")]
    ToggleAudio(Relayed),
}

impl ServerEvent {
    /// Wrap a relayed payload in the event matching `kind`.
    #[must_use]
    pub fn relayed(kind: RelayKind, payload: Relayed) -> Self {
        match kind {
            RelayKind::Offer => ServerEvent::Offer(payload),
            RelayKind::Answer => ServerEvent::Answer(payload),
            RelayKind::IceCandidate => ServerEvent::IceCandidate(payload),
            RelayKind::ToggleVideo => ServerEvent::ToggleVideo(payload),
            RelayKind::ToggleAudio => ServerEvent::ToggleAudio(payload),
            RelayKind::Join => ServerEvent::UserJoined(payload),
            RelayKind::Leave => ServerEvent::UserLeft(payload),
        }
    }

    /// Wire name of the event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ServerEvent::IncomingCall(_) => "incoming-call",
            ServerEvent::CallAccepted(_) => "call-accepted",
            ServerEvent::CallRejected(_) => "call-rejected",
            ServerEvent::CallCancelled(_) => "call-cancelled",
            ServerEvent::CallMissed(_) => "call-missed",
            ServerEvent::CallEnded(_) => "call-ended",
            ServerEvent::CallConflict(_) => "call-conflict",
            ServerEvent::CallError(_) => "call-error",
            ServerEvent::UserJoined(_) => RelayKind::Join.event_name(),
            ServerEvent::UserLeft(_) => RelayKind::Leave.event_name(),
            ServerEvent::Offer(_) => RelayKind::Offer.event_name(),
            ServerEvent::Answer(_) => RelayKind::Answer.event_name(),
            ServerEvent::IceCandidate(_) => RelayKind::IceCandidate.event_name(),
            ServerEvent::ToggleVideo(_) => RelayKind::ToggleVideo.event_name(),
            ServerEvent::ToggleAudio(_) => RelayKind::ToggleAudio.event_name(),
        }
    }
}

/// Kinds of payload the relay forwards without inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayKind {
    Offer,
    Answer,
    IceCandidate,
    ToggleVideo,
    ToggleAudio,
    Join,
    Leave,
}

impl RelayKind {
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            RelayKind::Offer => "call:offer",
            RelayKind::Answer => "call:answer",
            RelayKind::IceCandidate => "call:ice-candidate",
            RelayKind::ToggleVideo => "call:toggle-video",
            RelayKind::ToggleAudio => "call:toggle-audio",
            RelayKind::Join => "call:user-joined",
            RelayKind::Leave => "call:user-left",
        }
    }

    /// Bounded label for metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            RelayKind::Offer => "offer",
            RelayKind::Answer => "answer",
            RelayKind::IceCandidate => "ice-candidate",
            RelayKind::ToggleVideo => "toggle-video",
            RelayKind::ToggleAudio => "toggle-audio",
            RelayKind::Join => "join",
            RelayKind::Leave => "leave",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::payloads::{CallType, RelayTarget};
    use common::types::{CallId, UserId};
    use serde_json::json;

    #[test]
    fn test_initiate_call_frame() {
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "initiate-call",
            "data": {"callId": "c1", "type": "video", "invitees": ["bob"]}
        }))
        .unwrap();

        match event {
            ClientEvent::InitiateCall(ic) => {
                assert_eq!(ic.call_id, CallId::from("c1"));
                assert_eq!(ic.call_type, CallType::Video);
                assert_eq!(ic.invitees, vec![UserId::from("bob")]);
                assert!(ic.group_id.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_signal_without_target_defaults_to_room() {
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "call:toggle-audio",
            "data": {"callId": "c1", "enabled": false}
        }))
        .unwrap();

        let (kind, signal) = event.into_signal().unwrap();
        assert_eq!(kind, RelayKind::ToggleAudio);
        assert!(signal.to.is_none());
        assert_eq!(signal.body.get("enabled"), Some(&json!(false)));
    }

    #[test]
    fn test_signal_with_user_target() {
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "call:offer",
            "data": {
                "to": {"kind": "user", "id": "bob"},
                "callId": "c1",
                "type": "offer",
                "sdp": "v=0"
            }
        }))
        .unwrap();

        assert_eq!(event.name(), "call:offer");
        let (_, signal) = event.into_signal().unwrap();
        assert_eq!(signal.to, Some(RelayTarget::User(UserId::from("bob"))));
        assert!(!signal.body.contains_key("to"));
        assert!(!signal.body.contains_key("callId"));
    }

    #[test]
    fn test_lifecycle_event_names() {
        let notice = crate::payloads::LifecycleNotice {
            call_id: CallId::from("c1"),
            group_id: None,
            by_user_id: UserId::from("alice"),
        };
        let value = serde_json::to_value(ServerEvent::CallCancelled(notice)).unwrap();
        assert_eq!(value["event"], "call-cancelled");
        assert_eq!(value["data"]["byUserId"], "alice");
        assert!(value["data"].get("groupId").is_none());
    }

    #[test]
    fn test_unknown_event_rejected() {
        let result: Result<ClientEvent, _> =
            serde_json::from_value(json!({"event": "send-message", "data": {}}));
        assert!(result.is_err());
    }
}
