//! Client event dispatch.
//!
//! Turns decoded client frames into registry, relay and call actor
//! operations. Failures are reported to the requesting session only: a lost
//! race or settled call as `call-conflict`, anything else as `call-error`.

use crate::actors::{CallActorHandle, CallSnapshot, CallSupervisorHandle, StartCall};
use crate::errors::CallError;
use crate::observability::metrics;
use crate::registry::{Outbox, SessionRegistry};
use crate::relay::SignalingRelay;

use call_protocol::{
    CallConflict, CallErrorNotice, CallRef, ClientEvent, ClientSignal, InitiateCall, JoinUserRoom,
    ProtocolError, RelayKind, RelayTarget, ServerEvent,
};
use common::types::{CallId, RoomId, SessionId, UserId};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Routes client events for every transport session.
#[derive(Clone)]
pub struct EventDispatcher {
    registry: Arc<SessionRegistry>,
    relay: SignalingRelay,
    supervisor: CallSupervisorHandle,
}

impl EventDispatcher {
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, supervisor: CallSupervisorHandle) -> Self {
        Self {
            relay: SignalingRelay::new(Arc::clone(&registry)),
            registry,
            supervisor,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn supervisor(&self) -> &CallSupervisorHandle {
        &self.supervisor
    }

    /// Register a new transport session.
    pub async fn connect(&self, outbox: Outbox) -> SessionId {
        self.registry.connect(outbox).await
    }

    /// Handle one decoded frame from `session_id`.
    #[instrument(skip_all, name = "cs.dispatch", fields(session_id = %session_id, event = event.name()))]
    pub async fn handle(&self, session_id: SessionId, event: ClientEvent) {
        let name = event.name();
        metrics::record_client_event(name);
        let call_id = call_id_of(&event);

        if let Err(error) = self.dispatch(session_id, event).await {
            self.report(session_id, name, call_id, error).await;
        }
    }

    /// Answer a frame that could not be decoded.
    pub async fn reject_malformed(&self, session_id: SessionId, error: &ProtocolError) {
        debug!(
            target: "cs.transport",
            session_id = %session_id,
            error = %error,
            "Malformed frame"
        );
        self.report(
            session_id,
            "malformed",
            None,
            CallError::InvalidRequest("Malformed frame".to_string()),
        )
        .await;
    }

    /// Tear down a session. The user leaves every call they no longer have a
    /// session in.
    pub async fn disconnect(&self, session_id: SessionId) {
        let Some(gone) = self.registry.on_disconnect(session_id).await else {
            return;
        };
        let Some(user_id) = gone.user_id else {
            return;
        };

        for room_id in gone.rooms {
            let Some(call_id) = room_id.call_id() else {
                continue;
            };
            if !self
                .registry
                .user_sessions_in_room(&user_id, &room_id)
                .await
                .is_empty()
            {
                continue;
            }

            let result = match self.supervisor.get_call(&call_id).await {
                Ok(handle) => handle.leave(user_id.clone()).await.map(drop),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                debug!(
                    target: "cs.transport",
                    session_id = %session_id,
                    call_id = %call_id,
                    error = %e,
                    "Leave on disconnect had no effect"
                );
            }
        }
    }

    async fn dispatch(&self, session_id: SessionId, event: ClientEvent) -> Result<(), CallError> {
        if let ClientEvent::JoinUserRoom(JoinUserRoom { user_id }) = event {
            return self.join_user_room(session_id, user_id).await;
        }

        let user_id = self
            .registry
            .user_of(session_id)
            .await
            .ok_or(CallError::NotRegistered)?;

        match event {
            ClientEvent::InitiateCall(InitiateCall {
                call_id,
                call_type,
                invitees,
                group_id,
            }) => self
                .supervisor
                .start_call(StartCall {
                    call_id,
                    call_type,
                    initiator: user_id,
                    initiator_session: Some(session_id),
                    invitees,
                    group_id,
                })
                .await
                .map(drop),
            ClientEvent::AcceptCall(CallRef { call_id }) => {
                self.on_call(&call_id, |h| async move { h.accept(user_id, session_id).await })
                    .await
            }
            ClientEvent::RejectCall(CallRef { call_id }) => {
                self.on_call(&call_id, |h| async move { h.reject(user_id).await })
                    .await
            }
            ClientEvent::CancelCall(CallRef { call_id }) => {
                self.on_call(&call_id, |h| async move { h.cancel_call(user_id).await })
                    .await
            }
            ClientEvent::EndCall(CallRef { call_id }) => {
                self.on_call(&call_id, |h| async move { h.end(user_id).await })
                    .await
            }
            ClientEvent::Join(CallRef { call_id }) => {
                self.on_call(&call_id, |h| async move { h.join(user_id, session_id).await })
                    .await
            }
            ClientEvent::Leave(CallRef { call_id }) => {
                self.on_call(&call_id, |h| async move { h.leave(user_id).await })
                    .await
            }
            other => {
                if let Some((kind, signal)) = other.into_signal() {
                    self.relay_signal(kind, &user_id, session_id, signal).await;
                }
                Ok(())
            }
        }
    }

    async fn join_user_room(&self, session_id: SessionId, user_id: UserId) -> Result<(), CallError> {
        if user_id.as_str().is_empty() {
            return Err(CallError::InvalidRequest(
                "userId must not be empty".to_string(),
            ));
        }
        if self.registry.register_user(session_id, user_id).await {
            Ok(())
        } else {
            Err(CallError::Internal("session is not connected".to_string()))
        }
    }

    /// Run a transition on a call's actor. An actor that exits between lookup
    /// and delivery is resolved like a retired call.
    async fn on_call<F, Fut>(&self, call_id: &CallId, op: F) -> Result<(), CallError>
    where
        F: FnOnce(CallActorHandle) -> Fut,
        Fut: Future<Output = Result<CallSnapshot, CallError>>,
    {
        let handle = self.supervisor.get_call(call_id).await?;
        let actor = handle.clone();
        match op(handle).await {
            Ok(_) => Ok(()),
            Err(CallError::Internal(_)) if actor.is_closed() => {
                Err(self.supervisor.retired_call_error(call_id).await)
            }
            Err(e) => Err(e),
        }
    }

    /// A signal with no `to` goes to the call room.
    async fn relay_signal(
        &self,
        kind: RelayKind,
        user_id: &UserId,
        session_id: SessionId,
        signal: ClientSignal,
    ) {
        let to = signal
            .to
            .unwrap_or_else(|| RelayTarget::Room(RoomId::for_call(&signal.call_id)));
        self.relay
            .relay(kind, user_id, Some(session_id), to, signal.call_id, signal.body)
            .await;
    }

    async fn report(
        &self,
        session_id: SessionId,
        event: &'static str,
        call_id: Option<CallId>,
        error: CallError,
    ) {
        metrics::record_error(event, error.error_type_label(), error.error_code());

        match &error {
            CallError::Store(_) | CallError::Internal(_) => warn!(
                target: "cs.transport",
                session_id = %session_id,
                event,
                error = %error,
                "Request failed"
            ),
            _ => debug!(
                target: "cs.transport",
                session_id = %session_id,
                event,
                error = %error,
                "Request refused"
            ),
        }

        let frame = match (error, call_id) {
            (CallError::Conflict { status, message }, Some(call_id)) => {
                ServerEvent::CallConflict(CallConflict {
                    call_id,
                    status,
                    message,
                })
            }
            (error, call_id) => ServerEvent::CallError(CallErrorNotice {
                call_id,
                code: error.error_code(),
                message: error.client_message(),
            }),
        };
        self.registry.deliver_to_session(session_id, frame).await;
    }
}

fn call_id_of(event: &ClientEvent) -> Option<CallId> {
    match event {
        ClientEvent::JoinUserRoom(_) => None,
        ClientEvent::InitiateCall(InitiateCall { call_id, .. })
        | ClientEvent::AcceptCall(CallRef { call_id })
        | ClientEvent::RejectCall(CallRef { call_id })
        | ClientEvent::CancelCall(CallRef { call_id })
        | ClientEvent::EndCall(CallRef { call_id })
        | ClientEvent::Join(CallRef { call_id })
        | ClientEvent::Leave(CallRef { call_id })
        | ClientEvent::Offer(ClientSignal { call_id, .. })
        | ClientEvent::Answer(ClientSignal { call_id, .. })
        | ClientEvent::IceCandidate(ClientSignal { call_id, .. })
        | ClientEvent::ToggleVideo(ClientSignal { call_id, .. })
        | ClientEvent::ToggleAudio(ClientSignal { call_id, .. }) => Some(call_id.clone()),
    }
}
