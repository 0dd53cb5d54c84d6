//! Wired-up dispatcher and fake client sessions.

use crate::{RecordingNotifier, RecordingStore};
use call_protocol::{
    CallRef, CallType, ClientEvent, ClientSignal, InitiateCall, JoinUserRoom, RelayTarget,
    ServerEvent,
};
use call_service::actors::{ActorMetrics, CallContext, CallSettings, CallSupervisorHandle};
use call_service::dispatch::EventDispatcher;
use call_service::registry::SessionRegistry;
use call_service::relay::SignalingRelay;
use call_service::routes::{build_routes, AppState};
use call_service::store::CallRecordStore;
use common::types::{CallId, SessionId, UserId};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Outbox capacity of fake sessions.
const SESSION_OUTBOX: usize = 64;

/// How long [`TestSession::next`] waits for a frame.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A call service without transports: recording store, recording notifier,
/// registry, supervisor and dispatcher.
pub struct TestHarness {
    pub dispatcher: EventDispatcher,
    pub store: Arc<RecordingStore>,
    pub notifier: Arc<RecordingNotifier>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_settings(CallSettings::default(), 100)
    }

    pub fn with_settings(settings: CallSettings, max_active_calls: usize) -> Self {
        let store = RecordingStore::new();
        let notifier = RecordingNotifier::new();
        let registry = Arc::new(SessionRegistry::new());
        let ctx = CallContext {
            registry: Arc::clone(&registry),
            relay: SignalingRelay::new(Arc::clone(&registry)),
            store: store.clone(),
            notifier: notifier.clone(),
            metrics: ActorMetrics::new(),
            settings,
        };
        let supervisor = CallSupervisorHandle::new("cs-test".to_string(), ctx, max_active_calls);
        Self {
            dispatcher: EventDispatcher::new(registry, supervisor),
            store,
            notifier,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.dispatcher.registry()
    }

    pub fn supervisor(&self) -> &CallSupervisorHandle {
        self.dispatcher.supervisor()
    }

    /// Router over this harness, for history API tests.
    pub fn router(&self) -> axum::Router {
        let store: Arc<dyn CallRecordStore> = self.store.clone();
        build_routes(AppState {
            dispatcher: self.dispatcher.clone(),
            store,
            outbox_capacity: SESSION_OUTBOX,
        })
    }

    /// Connect a session and register it as `user`.
    pub async fn session(&self, user: &str) -> TestSession {
        let mut session = self.anonymous_session().await;
        session
            .send(ClientEvent::JoinUserRoom(JoinUserRoom {
                user_id: UserId::from(user),
            }))
            .await;
        session.user = Some(UserId::from(user));
        session
    }

    /// Connect a session without registering it.
    pub async fn anonymous_session(&self) -> TestSession {
        let (tx, rx) = mpsc::channel(SESSION_OUTBOX);
        let id = self.dispatcher.connect(tx).await;
        TestSession {
            id,
            user: None,
            rx,
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.dispatcher.supervisor().cancel();
    }
}

/// One fake client connection.
pub struct TestSession {
    pub id: SessionId,
    pub user: Option<UserId>,
    rx: mpsc::Receiver<ServerEvent>,
    dispatcher: EventDispatcher,
}

impl TestSession {
    pub async fn send(&mut self, event: ClientEvent) {
        self.dispatcher.handle(self.id, event).await;
    }

    pub async fn initiate(&mut self, call_id: &str, invitees: &[&str]) {
        self.initiate_typed(call_id, CallType::Video, invitees).await;
    }

    pub async fn initiate_typed(&mut self, call_id: &str, call_type: CallType, invitees: &[&str]) {
        self.send(ClientEvent::InitiateCall(InitiateCall {
            call_id: CallId::from(call_id),
            call_type,
            invitees: invitees.iter().map(|u| UserId::from(*u)).collect(),
            group_id: None,
        }))
        .await;
    }

    pub async fn accept(&mut self, call_id: &str) {
        self.send(ClientEvent::AcceptCall(call_ref(call_id))).await;
    }

    pub async fn reject(&mut self, call_id: &str) {
        self.send(ClientEvent::RejectCall(call_ref(call_id))).await;
    }

    pub async fn cancel(&mut self, call_id: &str) {
        self.send(ClientEvent::CancelCall(call_ref(call_id))).await;
    }

    pub async fn end(&mut self, call_id: &str) {
        self.send(ClientEvent::EndCall(call_ref(call_id))).await;
    }

    pub async fn join(&mut self, call_id: &str) {
        self.send(ClientEvent::Join(call_ref(call_id))).await;
    }

    pub async fn leave(&mut self, call_id: &str) {
        self.send(ClientEvent::Leave(call_ref(call_id))).await;
    }

    /// Send an ICE candidate carrying `n`.
    pub async fn ice(&mut self, call_id: &str, to: Option<&str>, n: u64) {
        let mut body = Map::new();
        body.insert("candidate".to_string(), Value::String(format!("candidate:{n}")));
        self.send(ClientEvent::IceCandidate(ClientSignal {
            to: to.map(|u| RelayTarget::User(UserId::from(u))),
            call_id: CallId::from(call_id),
            body,
        }))
        .await;
    }

    /// Next frame, panicking after [`RECV_TIMEOUT`].
    pub async fn next(&mut self) -> ServerEvent {
        tokio::time::timeout(RECV_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("session outbox closed")
    }

    /// Next frame already queued, if any.
    pub fn try_next(&mut self) -> Option<ServerEvent> {
        self.rx.try_recv().ok()
    }

    /// Discard queued frames and return their names.
    pub fn drain(&mut self) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            names.push(event.name());
        }
        names
    }

    /// Skip frames until one named `name` arrives.
    pub async fn expect(&mut self, name: &str) -> ServerEvent {
        loop {
            let event = self.next().await;
            if event.name() == name {
                return event;
            }
        }
    }

    pub async fn disconnect(self) {
        self.dispatcher.disconnect(self.id).await;
    }
}

fn call_ref(call_id: &str) -> CallRef {
    CallRef {
        call_id: CallId::from(call_id),
    }
}
