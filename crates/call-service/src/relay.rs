//! Signaling Relay.
//!
//! Forwards WebRTC signaling (offer, answer, ICE candidates, media toggles,
//! presence) between call members without inspecting the body. There is no
//! buffering: a payload with no live target session is dropped.
//!
//! Ordering per (sender, receiver) pair follows from the transport: each
//! sender session is read by one task that relays in arrival order, and
//! each receiver session has one FIFO outbox.

use crate::observability::metrics;
use crate::registry::SessionRegistry;
use call_protocol::{RelayKind, RelayTarget, Relayed, ServerEvent};
use common::types::{CallId, RoomId, SessionId, UserId};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Result of one relay attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Queued on this many sessions.
    Delivered(usize),
    /// No live target session.
    Dropped,
}

#[derive(Debug, Clone)]
pub struct SignalingRelay {
    registry: Arc<SessionRegistry>,
}

impl SignalingRelay {
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Forward a signaling payload.
    ///
    /// A `User` target reaches the user's sessions joined to the call room,
    /// or all of the user's sessions before any has joined. A `Room` target
    /// reaches every session in the room except `from_session`.
    pub async fn relay(
        &self,
        kind: RelayKind,
        from_user: &UserId,
        from_session: Option<SessionId>,
        to: RelayTarget,
        call_id: CallId,
        body: Map<String, Value>,
    ) -> RelayOutcome {
        let call_room = RoomId::for_call(&call_id);
        let payload = Relayed {
            from: from_user.clone(),
            to: to.clone(),
            call_id,
            body,
        };
        let event = ServerEvent::relayed(kind, payload);

        let delivered = match &to {
            RelayTarget::User(user_id) => {
                self.registry
                    .deliver_to_user_in_room(user_id, &call_room, event)
                    .await
            }
            RelayTarget::Room(room_id) => {
                self.registry
                    .deliver_to_room(room_id, event, from_session)
                    .await
            }
        };

        if delivered == 0 {
            debug!(
                target: "cs.relay",
                kind = kind.as_str(),
                from = %from_user,
                room = %call_room,
                "No live target session, signal dropped"
            );
            metrics::record_signal_relayed(kind.as_str(), "dropped");
            RelayOutcome::Dropped
        } else {
            metrics::record_signal_relayed(kind.as_str(), "delivered");
            RelayOutcome::Delivered(delivered)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use call_protocol::{body_map, IceCandidate};
    use tokio::sync::mpsc;

    fn candidate(n: u16) -> Map<String, Value> {
        body_map(&IceCandidate {
            candidate: format!("candidate:{n}"),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(n),
        })
    }

    #[tokio::test]
    async fn test_relay_to_offline_user_is_dropped() {
        let registry = Arc::new(SessionRegistry::new());
        let relay = SignalingRelay::new(Arc::clone(&registry));

        let outcome = relay
            .relay(
                RelayKind::Offer,
                &UserId::from("alice"),
                None,
                RelayTarget::User(UserId::from("bob")),
                CallId::from("c1"),
                Map::new(),
            )
            .await;

        assert_eq!(outcome, RelayOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_relay_preserves_order_and_body() {
        let registry = Arc::new(SessionRegistry::new());
        let relay = SignalingRelay::new(Arc::clone(&registry));
        let (tx, mut rx) = mpsc::channel(16);
        let bob_session = registry.connect(tx).await;
        registry.register_user(bob_session, UserId::from("bob")).await;

        for n in 0..5 {
            let outcome = relay
                .relay(
                    RelayKind::IceCandidate,
                    &UserId::from("alice"),
                    None,
                    RelayTarget::User(UserId::from("bob")),
                    CallId::from("c1"),
                    candidate(n),
                )
                .await;
            assert_eq!(outcome, RelayOutcome::Delivered(1));
        }

        for n in 0..5 {
            match rx.try_recv().unwrap() {
                ServerEvent::IceCandidate(relayed) => {
                    assert_eq!(relayed.from, UserId::from("alice"));
                    assert_eq!(relayed.call_id, CallId::from("c1"));
                    let body: IceCandidate = relayed.body_as().unwrap();
                    assert_eq!(body.sdp_m_line_index, Some(n));
                }
                other => unreachable!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_room_relay_does_not_echo() {
        let registry = Arc::new(SessionRegistry::new());
        let relay = SignalingRelay::new(Arc::clone(&registry));
        let room = RoomId::for_call(&CallId::from("c1"));

        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let a = registry.connect(tx_a).await;
        let b = registry.connect(tx_b).await;
        registry.register_user(a, UserId::from("alice")).await;
        registry.register_user(b, UserId::from("bob")).await;
        registry.join_room(a, &room).await;
        registry.join_room(b, &room).await;

        let outcome = relay
            .relay(
                RelayKind::ToggleAudio,
                &UserId::from("alice"),
                Some(a),
                RelayTarget::Room(room),
                CallId::from("c1"),
                Map::new(),
            )
            .await;

        assert_eq!(outcome, RelayOutcome::Delivered(1));
        assert!(rx_a.try_recv().is_err());
        assert!(matches!(rx_b.try_recv(), Ok(ServerEvent::ToggleAudio(_))));
    }
}
