//! Session Registry.
//!
//! Tracks live transport sessions, the user bound to each one and the rooms
//! each session has joined. A user may hold several sessions at once (one
//! per device or tab); delivery to a user reaches all of them.
//!
//! Delivery is at-most-once. Each session owns a bounded outbox drained by
//! its transport writer; when the outbox is full or closed the event is
//! dropped, logged and counted. The registry lock is only held while
//! resolving targets, never while sending.

use crate::observability::metrics;
use call_protocol::ServerEvent;
use common::types::{RoomId, SessionId, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Sending half of a session outbox.
pub type Outbox = mpsc::Sender<ServerEvent>;

#[derive(Debug)]
struct SessionEntry {
    user_id: Option<UserId>,
    rooms: HashSet<RoomId>,
    outbox: Outbox,
}

#[derive(Debug, Default)]
struct RegistryInner {
    sessions: HashMap<SessionId, SessionEntry>,
    users: HashMap<UserId, HashSet<SessionId>>,
    rooms: HashMap<RoomId, HashSet<SessionId>>,
}

impl RegistryInner {
    fn add_to_room(&mut self, session_id: SessionId, room_id: &RoomId) -> bool {
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return false;
        };
        entry.rooms.insert(room_id.clone());
        self.rooms
            .entry(room_id.clone())
            .or_default()
            .insert(session_id)
    }

    fn remove_from_room(&mut self, session_id: SessionId, room_id: &RoomId) -> bool {
        if let Some(entry) = self.sessions.get_mut(&session_id) {
            entry.rooms.remove(room_id);
        }
        let Some(members) = self.rooms.get_mut(room_id) else {
            return false;
        };
        let removed = members.remove(&session_id);
        if members.is_empty() {
            self.rooms.remove(room_id);
        }
        removed
    }

    fn user_sessions(&self, user_id: &UserId) -> HashSet<SessionId> {
        self.users.get(user_id).cloned().unwrap_or_default()
    }

    fn outboxes<'a>(
        &self,
        sessions: impl IntoIterator<Item = &'a SessionId>,
    ) -> Vec<(SessionId, Outbox)> {
        sessions
            .into_iter()
            .filter_map(|id| self.sessions.get(id).map(|s| (*id, s.outbox.clone())))
            .collect()
    }
}

/// Session state returned when a transport disconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectedSession {
    pub session_id: SessionId,
    pub user_id: Option<UserId>,
    pub rooms: Vec<RoomId>,
}

/// Registry of live sessions. Shared as `Arc<SessionRegistry>`.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
    dropped_events: AtomicU64,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session for a newly connected transport.
    pub async fn connect(&self, outbox: Outbox) -> SessionId {
        let session_id = SessionId::new();
        let mut inner = self.inner.write().await;
        inner.sessions.insert(
            session_id,
            SessionEntry {
                user_id: None,
                rooms: HashSet::new(),
                outbox,
            },
        );
        metrics::set_sessions_active(inner.sessions.len());
        debug!(target: "cs.registry", session_id = %session_id, "Session connected");
        session_id
    }

    /// Bind `user_id` to a session and join it to the user's personal room.
    ///
    /// Re-binding a session to another user releases the previous binding.
    /// Returns `false` if the session is unknown.
    pub async fn register_user(&self, session_id: SessionId, user_id: UserId) -> bool {
        let mut inner = self.inner.write().await;
        let previous = match inner.sessions.get_mut(&session_id) {
            Some(entry) => entry.user_id.replace(user_id.clone()),
            None => return false,
        };

        if let Some(previous) = previous.filter(|p| p != &user_id) {
            if let Some(set) = inner.users.get_mut(&previous) {
                set.remove(&session_id);
                if set.is_empty() {
                    inner.users.remove(&previous);
                }
            }
            inner.remove_from_room(session_id, &RoomId::for_user(&previous));
        }

        inner
            .users
            .entry(user_id.clone())
            .or_default()
            .insert(session_id);
        inner.add_to_room(session_id, &RoomId::for_user(&user_id));

        info!(
            target: "cs.registry",
            session_id = %session_id,
            user_id = %user_id,
            user_sessions = inner.users.get(&user_id).map_or(0, HashSet::len),
            "User registered"
        );
        true
    }

    /// Returns `false` if the session is unknown or already in the room.
    pub async fn join_room(&self, session_id: SessionId, room_id: &RoomId) -> bool {
        self.inner.write().await.add_to_room(session_id, room_id)
    }

    /// Returns `false` if the session was not in the room.
    pub async fn leave_room(&self, session_id: SessionId, room_id: &RoomId) -> bool {
        self.inner.write().await.remove_from_room(session_id, room_id)
    }

    /// Remove every session of `user_id` from a room.
    pub async fn leave_room_all(&self, user_id: &UserId, room_id: &RoomId) {
        let mut inner = self.inner.write().await;
        for session_id in inner.user_sessions(user_id) {
            inner.remove_from_room(session_id, room_id);
        }
    }

    /// Drop a room and all memberships in it.
    pub async fn close_room(&self, room_id: &RoomId) {
        let mut inner = self.inner.write().await;
        if let Some(members) = inner.rooms.remove(room_id) {
            for session_id in members {
                if let Some(entry) = inner.sessions.get_mut(&session_id) {
                    entry.rooms.remove(room_id);
                }
            }
        }
    }

    pub async fn resolve_user_sessions(&self, user_id: &UserId) -> HashSet<SessionId> {
        self.inner.read().await.user_sessions(user_id)
    }

    pub async fn resolve_room_sessions(&self, room_id: &RoomId) -> HashSet<SessionId> {
        self.inner
            .read()
            .await
            .rooms
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Sessions of `user_id` currently joined to `room_id`.
    pub async fn user_sessions_in_room(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
    ) -> HashSet<SessionId> {
        let inner = self.inner.read().await;
        match inner.rooms.get(room_id) {
            Some(members) => inner
                .user_sessions(user_id)
                .into_iter()
                .filter(|id| members.contains(id))
                .collect(),
            None => HashSet::new(),
        }
    }

    pub async fn user_of(&self, session_id: SessionId) -> Option<UserId> {
        self.inner
            .read()
            .await
            .sessions
            .get(&session_id)
            .and_then(|s| s.user_id.clone())
    }

    /// Destroy a session, returning what the caller needs to clean up.
    pub async fn on_disconnect(&self, session_id: SessionId) -> Option<DisconnectedSession> {
        let mut inner = self.inner.write().await;
        let entry = inner.sessions.remove(&session_id)?;

        if let Some(user_id) = &entry.user_id {
            if let Some(set) = inner.users.get_mut(user_id) {
                set.remove(&session_id);
                if set.is_empty() {
                    inner.users.remove(user_id);
                }
            }
        }
        for room_id in &entry.rooms {
            if let Some(members) = inner.rooms.get_mut(room_id) {
                members.remove(&session_id);
                if members.is_empty() {
                    inner.rooms.remove(room_id);
                }
            }
        }
        metrics::set_sessions_active(inner.sessions.len());

        debug!(
            target: "cs.registry",
            session_id = %session_id,
            rooms = entry.rooms.len(),
            "Session disconnected"
        );

        Some(DisconnectedSession {
            session_id,
            user_id: entry.user_id,
            rooms: entry.rooms.into_iter().collect(),
        })
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Total events dropped on full or closed outboxes.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------------

    /// Returns the number of sessions the event was queued on.
    pub async fn deliver_to_session(&self, session_id: SessionId, event: ServerEvent) -> usize {
        let targets = self.inner.read().await.outboxes([&session_id]);
        self.send_all(targets, &event)
    }

    /// Deliver to every session of `user_id`.
    pub async fn deliver_to_user(&self, user_id: &UserId, event: ServerEvent) -> usize {
        let targets = {
            let inner = self.inner.read().await;
            let sessions = inner.user_sessions(user_id);
            inner.outboxes(&sessions)
        };
        self.send_all(targets, &event)
    }

    /// Deliver to the sessions of `user_id` joined to `room_id`, or to all of
    /// the user's sessions when none has joined.
    pub async fn deliver_to_user_in_room(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
        event: ServerEvent,
    ) -> usize {
        let targets = {
            let inner = self.inner.read().await;
            let sessions = inner.user_sessions(user_id);
            let in_room: Vec<SessionId> = match inner.rooms.get(room_id) {
                Some(members) => sessions
                    .iter()
                    .filter(|id| members.contains(id))
                    .copied()
                    .collect(),
                None => Vec::new(),
            };
            if in_room.is_empty() {
                inner.outboxes(&sessions)
            } else {
                inner.outboxes(&in_room)
            }
        };
        self.send_all(targets, &event)
    }

    /// Deliver to every session in a room except `except`.
    pub async fn deliver_to_room(
        &self,
        room_id: &RoomId,
        event: ServerEvent,
        except: Option<SessionId>,
    ) -> usize {
        let targets = {
            let inner = self.inner.read().await;
            match inner.rooms.get(room_id) {
                Some(members) => {
                    inner.outboxes(members.iter().filter(|id| Some(**id) != except))
                }
                None => Vec::new(),
            }
        };
        self.send_all(targets, &event)
    }

    fn send_all(&self, targets: Vec<(SessionId, Outbox)>, event: &ServerEvent) -> usize {
        let mut delivered = 0;
        for (session_id, outbox) in targets {
            match outbox.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    let reason = match e {
                        TrySendError::Full(_) => "outbox_full",
                        TrySendError::Closed(_) => "outbox_closed",
                    };
                    self.dropped_events.fetch_add(1, Ordering::Relaxed);
                    metrics::record_event_dropped(reason);
                    warn!(
                        target: "cs.registry",
                        session_id = %session_id,
                        event = event.name(),
                        reason,
                        "Dropped event for session"
                    );
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use call_protocol::{CallErrorNotice, ServerEvent};

    fn event(code: i32) -> ServerEvent {
        ServerEvent::CallError(CallErrorNotice {
            call_id: None,
            code,
            message: "test".to_string(),
        })
    }

    async fn session(
        registry: &SessionRegistry,
        user: Option<&str>,
    ) -> (SessionId, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(8);
        let id = registry.connect(tx).await;
        if let Some(user) = user {
            assert!(registry.register_user(id, UserId::from(user)).await);
        }
        (id, rx)
    }

    #[tokio::test]
    async fn test_user_delivery_reaches_every_session() {
        let registry = SessionRegistry::new();
        let (_a, mut rx_a) = session(&registry, Some("bob")).await;
        let (_b, mut rx_b) = session(&registry, Some("bob")).await;
        let (_c, mut rx_c) = session(&registry, Some("carol")).await;

        let delivered = registry.deliver_to_user(&UserId::from("bob"), event(1)).await;

        assert_eq!(delivered, 2);
        assert_eq!(rx_a.try_recv().unwrap(), event(1));
        assert_eq!(rx_b.try_recv().unwrap(), event(1));
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_register_joins_personal_room() {
        let registry = SessionRegistry::new();
        let (id, _rx) = session(&registry, Some("bob")).await;

        let members = registry
            .resolve_room_sessions(&RoomId::for_user(&UserId::from("bob")))
            .await;
        assert!(members.contains(&id));
        assert_eq!(registry.user_of(id).await, Some(UserId::from("bob")));
    }

    #[tokio::test]
    async fn test_rebinding_releases_previous_user() {
        let registry = SessionRegistry::new();
        let (id, _rx) = session(&registry, Some("bob")).await;

        assert!(registry.register_user(id, UserId::from("carol")).await);

        assert!(registry
            .resolve_user_sessions(&UserId::from("bob"))
            .await
            .is_empty());
        assert!(registry
            .resolve_room_sessions(&RoomId::for_user(&UserId::from("bob")))
            .await
            .is_empty());
        assert_eq!(registry.user_of(id).await, Some(UserId::from("carol")));
    }

    #[tokio::test]
    async fn test_room_delivery_skips_sender() {
        let registry = SessionRegistry::new();
        let room = RoomId::from("call:c1");
        let (a, mut rx_a) = session(&registry, Some("alice")).await;
        let (b, mut rx_b) = session(&registry, Some("bob")).await;
        registry.join_room(a, &room).await;
        registry.join_room(b, &room).await;

        let delivered = registry.deliver_to_room(&room, event(2), Some(a)).await;

        assert_eq!(delivered, 1);
        assert!(rx_a.try_recv().is_err(), "sender must not get an echo");
        assert_eq!(rx_b.try_recv().unwrap(), event(2));
    }

    #[tokio::test]
    async fn test_user_in_room_falls_back_to_all_sessions() {
        let registry = SessionRegistry::new();
        let room = RoomId::from("call:c1");
        let (phone, mut rx_phone) = session(&registry, Some("bob")).await;
        let (_laptop, mut rx_laptop) = session(&registry, Some("bob")).await;
        let bob = UserId::from("bob");

        // No session in the room yet: every session gets it.
        assert_eq!(registry.deliver_to_user_in_room(&bob, &room, event(3)).await, 2);
        rx_phone.try_recv().unwrap();
        rx_laptop.try_recv().unwrap();

        // Once one session joins, only that one does.
        registry.join_room(phone, &room).await;
        assert_eq!(registry.deliver_to_user_in_room(&bob, &room, event(4)).await, 1);
        assert_eq!(rx_phone.try_recv().unwrap(), event(4));
        assert!(rx_laptop.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_targets_are_empty_not_errors() {
        let registry = SessionRegistry::new();
        let nobody = UserId::from("nobody");

        assert!(registry.resolve_user_sessions(&nobody).await.is_empty());
        assert_eq!(registry.deliver_to_user(&nobody, event(1)).await, 0);
        assert_eq!(
            registry
                .deliver_to_room(&RoomId::from("call:none"), event(1), None)
                .await,
            0
        );
        assert!(registry.on_disconnect(SessionId::new()).await.is_none());
        assert!(!registry.register_user(SessionId::new(), nobody).await);
    }

    #[tokio::test]
    async fn test_full_outbox_drops_and_counts() {
        let registry = SessionRegistry::new();
        let (tx, mut rx) = mpsc::channel(1);
        let id = registry.connect(tx).await;
        registry.register_user(id, UserId::from("bob")).await;
        let bob = UserId::from("bob");

        assert_eq!(registry.deliver_to_user(&bob, event(1)).await, 1);
        assert_eq!(registry.deliver_to_user(&bob, event(2)).await, 0);
        assert_eq!(registry.dropped_events(), 1);

        // The first event is still there, the second never queued.
        assert_eq!(rx.try_recv().unwrap(), event(1));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_returns_rooms_and_cleans_up() {
        let registry = SessionRegistry::new();
        let room = RoomId::from("call:c1");
        let (id, _rx) = session(&registry, Some("bob")).await;
        registry.join_room(id, &room).await;

        let gone = registry.on_disconnect(id).await.unwrap();

        assert_eq!(gone.user_id, Some(UserId::from("bob")));
        assert!(gone.rooms.contains(&room));
        assert_eq!(registry.session_count().await, 0);
        assert!(registry.resolve_room_sessions(&room).await.is_empty());
        assert!(registry
            .resolve_user_sessions(&UserId::from("bob"))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_leave_room_all_and_close_room() {
        let registry = SessionRegistry::new();
        let room = RoomId::from("call:c1");
        let bob = UserId::from("bob");
        let (a, _ra) = session(&registry, Some("bob")).await;
        let (b, _rb) = session(&registry, Some("bob")).await;
        let (c, _rc) = session(&registry, Some("carol")).await;
        for id in [a, b, c] {
            registry.join_room(id, &room).await;
        }

        registry.leave_room_all(&bob, &room).await;
        assert!(registry.user_sessions_in_room(&bob, &room).await.is_empty());
        assert_eq!(registry.resolve_room_sessions(&room).await.len(), 1);

        registry.close_room(&room).await;
        assert!(registry.resolve_room_sessions(&room).await.is_empty());
    }
}
