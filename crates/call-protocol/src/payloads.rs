//! Payload types carried in the `data` field of event frames.

use common::types::{CallId, GroupId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Media kind of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            CallType::Audio => "audio",
            CallType::Video => "video",
        }
    }
}

impl FromStr for CallType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(CallType::Audio),
            "video" => Ok(CallType::Video),
            other => Err(format!("unknown call type: {other}")),
        }
    }
}

/// Persisted lifecycle status of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Initiated,
    Active,
    Ended,
    Missed,
    Rejected,
}

impl CallStatus {
    /// Terminal statuses never change again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Ended | CallStatus::Missed | CallStatus::Rejected
        )
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Initiated => "initiated",
            CallStatus::Active => "active",
            CallStatus::Ended => "ended",
            CallStatus::Missed => "missed",
            CallStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(CallStatus::Initiated),
            "active" => Ok(CallStatus::Active),
            "ended" => Ok(CallStatus::Ended),
            "missed" => Ok(CallStatus::Missed),
            "rejected" => Ok(CallStatus::Rejected),
            other => Err(format!("unknown call status: {other}")),
        }
    }
}

/// Per-invitee status within a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    Invited,
    Joined,
    Left,
    Rejected,
}

impl ParticipantStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ParticipantStatus::Invited => "invited",
            ParticipantStatus::Joined => "joined",
            ParticipantStatus::Left => "left",
            ParticipantStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for ParticipantStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invited" => Ok(ParticipantStatus::Invited),
            "joined" => Ok(ParticipantStatus::Joined),
            "left" => Ok(ParticipantStatus::Left),
            "rejected" => Ok(ParticipantStatus::Rejected),
            other => Err(format!("unknown participant status: {other}")),
        }
    }
}

/// Destination of a relayed signaling payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum RelayTarget {
    User(UserId),
    Room(RoomId),
}

// ----------------------------------------------------------------------------
// Client -> server
// ----------------------------------------------------------------------------

/// `join-user-room`: bind the session to an authenticated user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinUserRoom {
    pub user_id: UserId,
}

/// `initiate-call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateCall {
    pub call_id: CallId,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub invitees: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
}

/// Payload naming a single call (accept, reject, cancel, end, join, leave).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRef {
    pub call_id: CallId,
}

/// Signaling payload sent by a client. A missing `to` means the call room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSignal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<RelayTarget>,
    pub call_id: CallId,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

// ----------------------------------------------------------------------------
// Server -> client
// ----------------------------------------------------------------------------

/// `incoming-call`, delivered to every invitee session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCall {
    pub call_id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub by_user_id: UserId,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub is_group_call: bool,
    pub invitees: Vec<UserId>,
}

/// Common shape of `call-accepted`, `call-rejected`, `call-cancelled` and `call-missed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleNotice {
    pub call_id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub by_user_id: UserId,
}

/// `call-ended`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnded {
    #[serde(flatten)]
    pub notice: LifecycleNotice,
    /// Whole seconds between acceptance and end.
    pub duration: u64,
}

/// `call-conflict`: the requested transition lost a race or targets a settled call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallConflict {
    pub call_id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CallStatus>,
    pub message: String,
}

/// `call-error`: request failed; delivered to the requesting session only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallErrorNotice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
    pub code: i32,
    pub message: String,
}

/// Relayed signaling payload: routing envelope plus an opaque body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relayed {
    pub from: UserId,
    pub to: RelayTarget,
    pub call_id: CallId,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Relayed {
    /// Decode the opaque body into a typed payload.
    ///
    /// # Errors
    ///
    /// Returns the serde error when the body does not match `T`.
    pub fn body_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.body.clone()))
    }
}

// ----------------------------------------------------------------------------
// Typed signaling bodies (never inspected by the server)
// ----------------------------------------------------------------------------

/// SDP offer or answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Trickled ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
}

/// Body of `call:toggle-audio` / `call:toggle-video`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaToggle {
    pub enabled: bool,
}

/// Body of `call:user-joined` / `call:user-left`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub user_id: UserId,
    /// Set on `call:user-joined`: whether the receiver should create the offer.
    #[serde(default)]
    pub should_offer: bool,
}

/// Serialize a typed body into the flattened map used by [`ClientSignal`] and [`Relayed`].
#[must_use]
pub fn body_map<T: Serialize>(body: &T) -> Map<String, Value> {
    match serde_json::to_value(body) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_status_terminal() {
        assert!(!CallStatus::Initiated.is_terminal());
        assert!(!CallStatus::Active.is_terminal());
        assert!(CallStatus::Ended.is_terminal());
        assert!(CallStatus::Missed.is_terminal());
        assert!(CallStatus::Rejected.is_terminal());
    }

    #[test]
    fn test_status_parses_from_wire_names() {
        assert_eq!("missed".parse::<CallStatus>(), Ok(CallStatus::Missed));
        assert!("ringing".parse::<CallStatus>().is_err());
        assert_eq!("video".parse::<CallType>(), Ok(CallType::Video));
    }

    #[test]
    fn test_relay_target_shape() {
        let target = RelayTarget::User(UserId::from("bob"));
        assert_eq!(
            serde_json::to_value(&target).unwrap(),
            json!({"kind": "user", "id": "bob"})
        );
    }

    #[test]
    fn test_relayed_keeps_body_opaque() {
        let relayed: Relayed = serde_json::from_value(json!({
            "from": "alice",
            "to": {"kind": "user", "id": "bob"},
            "callId": "c1",
            "type": "offer",
            "sdp": "v=0",
            "extra": [1, 2, 3]
        }))
        .unwrap();

        assert_eq!(relayed.body.get("extra"), Some(&json!([1, 2, 3])));
        let sdp: SessionDescription = relayed.body_as().unwrap();
        assert_eq!(sdp.sdp_type, SdpType::Offer);
        assert_eq!(sdp.sdp, "v=0");
    }

    #[test]
    fn test_ice_candidate_camel_case() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        };
        let map = body_map(&candidate);
        assert!(map.contains_key("sdpMid"));
        assert!(map.contains_key("sdpMLineIndex"));
    }
}
