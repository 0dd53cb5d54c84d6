//! Client Call Controller.
//!
//! One controller per call on each participant's device. It runs as a single
//! task and consumes every input (server frames, user intents, peer events)
//! through one dispatch function, so no state is shared with callbacks.
//!
//! # Negotiation
//!
//! The server tells members already present in the call to make the offer
//! (`call:user-joined` with `shouldOffer`), so exactly one side of every pair
//! offers and there is no glare.
//!
//! # Timers
//!
//! - Setup timeout: an outgoing call nobody accepts is cancelled
//! - ICE restart: a disconnected link gets one restart after a short delay
//!   before the UI sees `poor` and reconnecting

use crate::errors::ClientError;
use crate::media::{MediaDevices, MediaGuard, MediaTrack, TrackKind};
use crate::peer::{
    IceRestart, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSender, PeerEventSink,
    PeerLink,
};
use crate::quality::{ConnectionQuality, IceConnectionState};
use crate::signaling::SignalingSink;
use call_protocol::{
    body_map, CallRef, CallStatus, CallType, ClientEvent, ClientSignal, IceCandidate,
    IncomingCall, InitiateCall, MediaToggle, Presence, RelayTarget, Relayed, ServerEvent,
    SessionDescription,
};
use common::types::{CallId, GroupId, UserId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default wait before the one automatic ICE restart.
pub const DEFAULT_ICE_RESTART_DELAY: Duration = Duration::from_secs(2);

/// Default time an outgoing call may ring before it is withdrawn.
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(60);

/// After withdrawing a ringing call, how long to wait for the server to
/// confirm before giving up on reconciling a lost race.
const CANCEL_CONFIRM_LINGER: Duration = Duration::from_secs(5);

/// Channel buffer size for the controller mailbox.
const CONTROLLER_CHANNEL_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    pub ice_restart_delay: Duration,
    pub setup_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ice_restart_delay: DEFAULT_ICE_RESTART_DELAY,
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
        }
    }
}

/// Platform seams the controller drives.
#[derive(Clone)]
pub struct ControllerDeps {
    pub media: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub signaling: Arc<dyn SignalingSink>,
}

/// How the call starts on this device.
#[derive(Debug, Clone, PartialEq)]
pub enum CallSetup {
    /// Place a call.
    Outgoing {
        call_id: CallId,
        call_type: CallType,
        invitees: Vec<UserId>,
        group_id: Option<GroupId>,
    },
    /// Ring for an `incoming-call` frame.
    Incoming(IncomingCall),
}

/// Local phase of the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerPhase {
    /// Outgoing, nobody accepted yet.
    Dialing,
    /// Incoming, not answered on this device.
    Ringing,
    /// Accepted, no peer link connected yet.
    Connecting,
    /// At least one peer link carries media.
    Active,
    Ended(EndReason),
}

/// Why the call ended on this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// This user hung up or withdrew the call.
    HungUp,
    /// This user declined.
    Declined,
    RemoteEnded { by: UserId, duration: u64 },
    /// The caller withdrew before anyone answered.
    Cancelled,
    Missed,
    Rejected { by: UserId },
    /// Another device of this user took the call.
    AnsweredElsewhere,
    /// The call was settled before this device's transition applied.
    Conflict(Option<CallStatus>),
    SetupTimeout,
    MediaAccessDenied,
    /// Connectivity was lost and the ICE restart did not recover it.
    Dropped,
    /// The server refused the call.
    Failed { code: i32, message: String },
    /// The controller was cancelled.
    Shutdown,
}

/// A remote participant as the UI sees them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteView {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    /// `None` until a peer link exists.
    pub quality: Option<ConnectionQuality>,
    pub reconnecting: bool,
    /// The link was lost after its restart; a manual redial is needed.
    pub dropped: bool,
}

/// Render state published on every input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallView {
    pub call_id: CallId,
    pub call_type: CallType,
    pub is_group_call: bool,
    pub phase: ControllerPhase,
    pub local_audio: bool,
    pub local_video: bool,
    pub screen_sharing: bool,
    pub remotes: BTreeMap<UserId, RemoteView>,
    /// Worst quality across live links.
    pub quality: Option<ConnectionQuality>,
}

/// Something the user asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserIntent {
    Accept,
    Reject,
    HangUp,
    SetAudio(bool),
    SetVideo(bool),
    StartScreenShare,
    StopScreenShare,
}

/// Every input the controller consumes.
#[derive(Debug)]
pub enum ControllerInput {
    Server(ServerEvent),
    Intent {
        intent: UserIntent,
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
    /// Reply with the view once every earlier input is processed.
    GetView {
        respond_to: oneshot::Sender<CallView>,
    },
}

/// Handle to a running controller.
#[derive(Debug, Clone)]
pub struct CallControllerHandle {
    sender: mpsc::Sender<ControllerInput>,
    view: watch::Receiver<CallView>,
    cancel_token: CancellationToken,
    call_id: CallId,
}

impl CallControllerHandle {
    #[must_use]
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    async fn intent(&self, intent: UserIntent) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerInput::Intent {
                intent,
                respond_to: tx,
            })
            .await
            .map_err(|e| ClientError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| ClientError::Internal(format!("response receive failed: {e}")))?
    }

    /// Answer a ringing call. Opens the camera and microphone.
    pub async fn accept(&self) -> Result<(), ClientError> {
        self.intent(UserIntent::Accept).await
    }

    pub async fn reject(&self) -> Result<(), ClientError> {
        self.intent(UserIntent::Reject).await
    }

    /// Withdraw, decline, leave or end, depending on the phase.
    pub async fn hang_up(&self) -> Result<(), ClientError> {
        self.intent(UserIntent::HangUp).await
    }

    pub async fn set_audio(&self, enabled: bool) -> Result<(), ClientError> {
        self.intent(UserIntent::SetAudio(enabled)).await
    }

    pub async fn set_video(&self, enabled: bool) -> Result<(), ClientError> {
        self.intent(UserIntent::SetVideo(enabled)).await
    }

    pub async fn start_screen_share(&self) -> Result<(), ClientError> {
        self.intent(UserIntent::StartScreenShare).await
    }

    pub async fn stop_screen_share(&self) -> Result<(), ClientError> {
        self.intent(UserIntent::StopScreenShare).await
    }

    /// Hand a server frame for this call to the controller.
    pub async fn deliver(&self, event: ServerEvent) -> Result<(), ClientError> {
        self.sender
            .send(ControllerInput::Server(event))
            .await
            .map_err(|e| ClientError::Internal(format!("channel send failed: {e}")))
    }

    /// View after every input sent so far has been processed.
    pub async fn snapshot(&self) -> Result<CallView, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerInput::GetView { respond_to: tx })
            .await
            .map_err(|e| ClientError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| ClientError::Internal(format!("response receive failed: {e}")))
    }

    /// Subscribe to view updates.
    #[must_use]
    pub fn view(&self) -> watch::Receiver<CallView> {
        self.view.clone()
    }

    /// Latest published view.
    #[must_use]
    pub fn current(&self) -> CallView {
        self.view.borrow().clone()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

struct RemoteMedia {
    audio_enabled: bool,
    video_enabled: bool,
    dropped: bool,
}

/// The `CallController` implementation.
pub struct CallController {
    call_id: CallId,
    call_type: CallType,
    group_id: Option<GroupId>,
    is_group_call: bool,
    local_user: UserId,
    deps: ControllerDeps,
    config: ControllerConfig,
    receiver: mpsc::Receiver<ControllerInput>,
    /// Peer events travel apart from the bounded mailbox so none is shed.
    peer_tx: PeerEventSender,
    peer_rx: mpsc::UnboundedReceiver<(UserId, PeerEvent)>,
    view_tx: watch::Sender<CallView>,
    cancel_token: CancellationToken,
    phase: ControllerPhase,
    media: Option<MediaGuard>,
    screen: Option<MediaGuard>,
    links: BTreeMap<UserId, PeerLink>,
    remotes: BTreeMap<UserId, RemoteMedia>,
    local_audio: bool,
    local_video: bool,
    accepted_locally: bool,
    setup_deadline: Option<Instant>,
    /// Set after withdrawing a ringing call, until the server confirms.
    linger_until: Option<Instant>,
    done: bool,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl CallController {
    /// Spawn a controller for one call.
    pub fn spawn(
        setup: CallSetup,
        local_user: UserId,
        deps: ControllerDeps,
        config: ControllerConfig,
        cancel_token: CancellationToken,
    ) -> (CallControllerHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONTROLLER_CHANNEL_BUFFER);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        let (call_id, call_type, group_id, is_group_call, phase) = match &setup {
            CallSetup::Outgoing {
                call_id,
                call_type,
                invitees,
                group_id,
            } => (
                call_id.clone(),
                *call_type,
                group_id.clone(),
                group_id.is_some() || invitees.len() > 1,
                ControllerPhase::Dialing,
            ),
            CallSetup::Incoming(incoming) => (
                incoming.call_id.clone(),
                incoming.call_type,
                incoming.group_id.clone(),
                incoming.is_group_call,
                ControllerPhase::Ringing,
            ),
        };

        let mut remotes = BTreeMap::new();
        if let CallSetup::Incoming(incoming) = &setup {
            remotes.insert(
                incoming.by_user_id.clone(),
                RemoteMedia::for_call(call_type),
            );
        }

        let initial = CallView {
            call_id: call_id.clone(),
            call_type,
            is_group_call,
            phase: phase.clone(),
            local_audio: false,
            local_video: false,
            screen_sharing: false,
            remotes: BTreeMap::new(),
            quality: None,
        };
        let (view_tx, view_rx) = watch::channel(initial);

        let controller = Self {
            call_id: call_id.clone(),
            call_type,
            group_id,
            is_group_call,
            local_user,
            deps,
            config,
            receiver,
            peer_tx,
            peer_rx,
            view_tx,
            cancel_token: cancel_token.clone(),
            phase,
            media: None,
            screen: None,
            links: BTreeMap::new(),
            remotes,
            local_audio: false,
            local_video: false,
            accepted_locally: false,
            setup_deadline: None,
            linger_until: None,
            done: false,
        };

        let task_handle = tokio::spawn(controller.run(setup));

        let handle = CallControllerHandle {
            sender,
            view: view_rx,
            cancel_token,
            call_id,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "cc.controller", fields(call_id = %self.call_id, user_id = %self.local_user))]
    async fn run(mut self, setup: CallSetup) {
        if let CallSetup::Outgoing {
            invitees, group_id, ..
        } = setup
        {
            self.place_call(invitees, group_id).await;
        }
        self.publish();

        while !self.done {
            let restart_at = self.links.values().filter_map(PeerLink::restart_deadline).min();

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(target: "cc.controller", "Controller cancelled");
                    self.finish(EndReason::Shutdown).await;
                    self.done = true;
                }

                () = sleep_until_opt(self.setup_deadline) => {
                    self.handle_setup_timeout().await;
                }

                () = sleep_until_opt(restart_at) => {
                    self.handle_restarts_due().await;
                }

                () = sleep_until_opt(self.linger_until) => {
                    self.done = true;
                }

                Some((remote, event)) = self.peer_rx.recv() => {
                    self.handle_peer(remote, event).await;
                }

                input = self.receiver.recv() => {
                    let Some(input) = input else {
                        debug!(target: "cc.controller", "All handles dropped");
                        self.finish(EndReason::Shutdown).await;
                        self.done = true;
                        continue;
                    };
                    self.dispatch(input).await;
                }
            }
            self.publish();
        }

        info!(target: "cc.controller", phase = ?self.phase, "Controller stopped");
    }

    async fn dispatch(&mut self, input: ControllerInput) {
        match input {
            ControllerInput::Server(event) => self.handle_server(event).await,
            ControllerInput::Intent { intent, respond_to } => {
                let result = self.handle_intent(intent).await;
                if let Err(e) = &result {
                    debug!(target: "cc.controller", ?intent, error = %e, "Intent refused");
                }
                let _ = respond_to.send(result);
            }
            ControllerInput::GetView { respond_to } => {
                while let Ok((remote, event)) = self.peer_rx.try_recv() {
                    self.handle_peer(remote, event).await;
                }
                let _ = respond_to.send(self.view());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Outgoing setup
    // ------------------------------------------------------------------------

    async fn place_call(&mut self, invitees: Vec<UserId>, group_id: Option<GroupId>) {
        match MediaGuard::acquire(self.deps.media.as_ref(), self.call_type).await {
            Ok(media) => self.attach_media(media),
            Err(e) => {
                warn!(target: "cc.controller", error = %e, "Local media unavailable, call not placed");
                self.finish(EndReason::MediaAccessDenied).await;
                return;
            }
        }

        let initiate = ClientEvent::InitiateCall(InitiateCall {
            call_id: self.call_id.clone(),
            call_type: self.call_type,
            invitees,
            group_id,
        });
        // An undelivered invite surfaces as the setup timeout.
        let _ = self.send(initiate).await;
        self.setup_deadline = Some(Instant::now() + self.config.setup_timeout);
    }

    async fn handle_setup_timeout(&mut self) {
        self.setup_deadline = None;
        if self.phase != ControllerPhase::Dialing {
            return;
        }
        info!(target: "cc.controller", "Nobody answered, withdrawing call");
        let _ = self.send(ClientEvent::CancelCall(self.call_ref())).await;
        self.finish(EndReason::SetupTimeout).await;
    }

    // ------------------------------------------------------------------------
    // Server frames
    // ------------------------------------------------------------------------

    async fn handle_server(&mut self, event: ServerEvent) {
        if let Some(call_id) = event_call_id(&event) {
            if call_id != &self.call_id {
                debug!(target: "cc.controller", other = %call_id, "Frame for another call ignored");
                return;
            }
        }

        if self.is_ended() {
            self.reconcile_after_end(&event).await;
            return;
        }

        match event {
            ServerEvent::IncomingCall(_) => {}
            ServerEvent::CallAccepted(notice) => {
                if notice.by_user_id == self.local_user {
                    if !self.accepted_locally {
                        self.finish(EndReason::AnsweredElsewhere).await;
                    }
                } else {
                    self.setup_deadline = None;
                    if self.phase == ControllerPhase::Dialing {
                        self.phase = ControllerPhase::Connecting;
                    }
                    let call_type = self.call_type;
                    self.remotes
                        .entry(notice.by_user_id)
                        .or_insert_with(|| RemoteMedia::for_call(call_type));
                }
            }
            ServerEvent::CallRejected(notice) => {
                let reason = if notice.by_user_id == self.local_user {
                    EndReason::Declined
                } else {
                    EndReason::Rejected {
                        by: notice.by_user_id,
                    }
                };
                self.finish(reason).await;
            }
            ServerEvent::CallCancelled(_) => self.finish(EndReason::Cancelled).await,
            ServerEvent::CallMissed(_) => self.finish(EndReason::Missed).await,
            ServerEvent::CallEnded(ended) => {
                self.finish(EndReason::RemoteEnded {
                    by: ended.notice.by_user_id,
                    duration: ended.duration,
                })
                .await;
            }
            ServerEvent::CallConflict(conflict) => match conflict.status {
                Some(status) if status.is_terminal() => {
                    self.finish(EndReason::Conflict(Some(status))).await;
                }
                status => {
                    warn!(target: "cc.controller", ?status, message = %conflict.message, "Transition lost a race");
                }
            },
            ServerEvent::CallError(notice) => {
                if self.phase == ControllerPhase::Dialing {
                    self.finish(EndReason::Failed {
                        code: notice.code,
                        message: notice.message,
                    })
                    .await;
                } else {
                    warn!(target: "cc.controller", code = notice.code, message = %notice.message, "Request failed");
                }
            }
            ServerEvent::UserJoined(relayed) => self.handle_user_joined(&relayed).await,
            ServerEvent::UserLeft(relayed) => self.handle_user_left(&relayed).await,
            ServerEvent::Offer(relayed) => self.handle_offer(relayed).await,
            ServerEvent::Answer(relayed) => self.handle_answer(relayed).await,
            ServerEvent::IceCandidate(relayed) => self.handle_remote_candidate(relayed).await,
            ServerEvent::ToggleAudio(relayed) => self.handle_remote_toggle(&relayed, TrackKind::Audio),
            ServerEvent::ToggleVideo(relayed) => self.handle_remote_toggle(&relayed, TrackKind::Video),
        }
    }

    /// Only a withdrawn call still listens: if the withdrawal lost to an
    /// accept, end the call that was established anyway.
    async fn reconcile_after_end(&mut self, event: &ServerEvent) {
        if self.linger_until.is_none() {
            return;
        }
        match event {
            ServerEvent::CallConflict(conflict) if conflict.status == Some(CallStatus::Active) => {
                info!(target: "cc.controller", "Withdrawal lost to an accept, ending call");
                let _ = self.send(ClientEvent::EndCall(self.call_ref())).await;
                self.done = true;
            }
            ServerEvent::CallCancelled(_)
            | ServerEvent::CallMissed(_)
            | ServerEvent::CallRejected(_)
            | ServerEvent::CallEnded(_)
            | ServerEvent::CallConflict(_) => self.done = true,
            _ => {}
        }
    }

    async fn handle_user_joined(&mut self, relayed: &Relayed) {
        let presence: Presence = match relayed.body_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(target: "cc.controller", error = %e, "Malformed presence body");
                return;
            }
        };
        if presence.user_id == self.local_user {
            return;
        }
        if self.media.is_none() {
            warn!(target: "cc.controller", remote = %presence.user_id, "Presence before joining the call, ignored");
            return;
        }

        let call_type = self.call_type;
        self.remotes
            .entry(presence.user_id.clone())
            .or_insert_with(|| RemoteMedia::for_call(call_type));

        if presence.should_offer && !self.links.contains_key(&presence.user_id) {
            if let Err(e) = self.offer_to(presence.user_id.clone()).await {
                warn!(target: "cc.controller", remote = %presence.user_id, error = %e, "Offer failed");
                self.close_link(&presence.user_id).await;
            }
        }
    }

    async fn handle_user_left(&mut self, relayed: &Relayed) {
        let Ok(presence) = relayed.body_as::<Presence>() else {
            warn!(target: "cc.controller", from = %relayed.from, "Malformed presence body");
            return;
        };
        debug!(target: "cc.controller", remote = %presence.user_id, "Remote left");
        self.close_link(&presence.user_id).await;
        self.remotes.remove(&presence.user_id);
    }

    async fn offer_to(&mut self, remote: UserId) -> Result<(), ClientError> {
        self.open_link(&remote, true).await?;
        let connection = self.link_connection(&remote)?;

        let offer = connection.create_offer(false).await?;
        connection.set_local_description(offer.clone()).await?;
        self.signal_to(&remote, SignalKind::Offer, body_map(&offer))
            .await
    }

    async fn handle_offer(&mut self, relayed: Relayed) {
        let remote = relayed.from.clone();
        let offer: SessionDescription = match relayed.body_as() {
            Ok(d) => d,
            Err(e) => {
                warn!(target: "cc.controller", from = %remote, error = %e, "Malformed offer");
                return;
            }
        };
        if self.media.is_none() {
            warn!(target: "cc.controller", from = %remote, "Offer before accepting, dropped");
            return;
        }

        if let Err(e) = self.answer_offer(&remote, offer).await {
            warn!(target: "cc.controller", from = %remote, error = %e, "Answering offer failed");
            self.close_link(&remote).await;
        }
    }

    async fn answer_offer(
        &mut self,
        remote: &UserId,
        offer: SessionDescription,
    ) -> Result<(), ClientError> {
        if !self.links.contains_key(remote) {
            self.open_link(remote, false).await?;
        }
        let connection = self.link_connection(remote)?;

        connection.set_remote_description(offer).await?;
        self.remote_described(remote).await;
        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;
        self.signal_to(remote, SignalKind::Answer, body_map(&answer))
            .await
    }

    async fn handle_answer(&mut self, relayed: Relayed) {
        let remote = relayed.from.clone();
        let answer: SessionDescription = match relayed.body_as() {
            Ok(d) => d,
            Err(e) => {
                warn!(target: "cc.controller", from = %remote, error = %e, "Malformed answer");
                return;
            }
        };
        let Ok(connection) = self.link_connection(&remote) else {
            warn!(target: "cc.controller", from = %remote, "Answer without an offer, dropped");
            return;
        };
        match connection.set_remote_description(answer).await {
            Ok(()) => self.remote_described(&remote).await,
            Err(e) => warn!(target: "cc.controller", from = %remote, error = %e, "Setting answer failed"),
        }
    }

    /// Mark the remote description set and apply candidates held until now.
    async fn remote_described(&mut self, remote: &UserId) {
        let Some(link) = self.links.get_mut(remote) else {
            return;
        };
        link.remote_described = true;
        let held = std::mem::take(&mut link.pending_candidates);
        let connection = Arc::clone(&link.connection);
        for candidate in held {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                warn!(target: "cc.controller", from = %remote, error = %e, "ICE candidate rejected");
            }
        }
    }

    async fn handle_remote_candidate(&mut self, relayed: Relayed) {
        let remote = relayed.from.clone();
        let Ok(connection) = self.link_connection(&remote) else {
            warn!(
                target: "cc.controller",
                from = %remote,
                "ICE candidate before peer connection exists, dropped"
            );
            return;
        };
        let candidate: IceCandidate = match relayed.body_as() {
            Ok(c) => c,
            Err(e) => {
                warn!(target: "cc.controller", from = %remote, error = %e, "Malformed ICE candidate");
                return;
            }
        };
        if let Some(link) = self.links.get_mut(&remote) {
            if !link.remote_described {
                debug!(
                    target: "cc.controller",
                    from = %remote,
                    "ICE candidate held until remote description"
                );
                link.pending_candidates.push(candidate);
                return;
            }
        }
        if let Err(e) = connection.add_ice_candidate(candidate).await {
            warn!(target: "cc.controller", from = %remote, error = %e, "ICE candidate rejected");
        }
    }

    fn handle_remote_toggle(&mut self, relayed: &Relayed, kind: TrackKind) {
        let Ok(toggle) = relayed.body_as::<MediaToggle>() else {
            warn!(target: "cc.controller", from = %relayed.from, "Malformed media toggle");
            return;
        };
        let call_type = self.call_type;
        let remote = self
            .remotes
            .entry(relayed.from.clone())
            .or_insert_with(|| RemoteMedia::for_call(call_type));
        match kind {
            TrackKind::Audio => remote.audio_enabled = toggle.enabled,
            TrackKind::Video => remote.video_enabled = toggle.enabled,
        }
    }

    // ------------------------------------------------------------------------
    // Peer events
    // ------------------------------------------------------------------------

    async fn handle_peer(&mut self, remote: UserId, event: PeerEvent) {
        if !self.links.contains_key(&remote) {
            debug!(target: "cc.controller", remote = %remote, "Event from closed link ignored");
            return;
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let _ = self
                    .signal_to(&remote, SignalKind::IceCandidate, body_map(&candidate))
                    .await;
            }
            PeerEvent::StateChanged(state) => self.handle_ice_state(&remote, state).await,
        }
    }

    async fn handle_ice_state(&mut self, remote: &UserId, state: IceConnectionState) {
        let delay = self.config.ice_restart_delay;
        let Some(link) = self.links.get_mut(remote) else {
            return;
        };
        link.state = state;
        debug!(target: "cc.controller", remote = %remote, ?state, restart = ?link.restart, "ICE state changed");

        match state {
            IceConnectionState::Connected | IceConnectionState::Completed => {
                if matches!(link.restart, IceRestart::Scheduled(_)) {
                    link.restart = IceRestart::Unused;
                }
                if self.phase == ControllerPhase::Connecting {
                    self.phase = ControllerPhase::Active;
                    info!(target: "cc.controller", remote = %remote, "Media connected");
                }
            }
            IceConnectionState::Disconnected | IceConnectionState::Failed => {
                let restart = link.restart;
                match restart {
                    IceRestart::Unused => {
                        link.restart = IceRestart::Scheduled(Instant::now() + delay);
                    }
                    IceRestart::Scheduled(_) => {}
                    IceRestart::Used if state == IceConnectionState::Failed => {
                        self.drop_link(remote).await;
                    }
                    IceRestart::Used => {}
                }
            }
            IceConnectionState::New | IceConnectionState::Checking | IceConnectionState::Closed => {}
        }
    }

    async fn handle_restarts_due(&mut self) {
        let now = Instant::now();
        let due: Vec<UserId> = self
            .links
            .values()
            .filter(|l| l.restart_deadline().is_some_and(|at| at <= now))
            .map(|l| l.remote.clone())
            .collect();

        for remote in due {
            let Some(link) = self.links.get_mut(&remote) else {
                continue;
            };
            link.restart = IceRestart::Used;
            if !link.offerer || link.state.is_connected() {
                continue;
            }
            let connection = Arc::clone(&link.connection);

            info!(target: "cc.controller", remote = %remote, "Restarting ICE");
            let restarted = async {
                let offer = connection.create_offer(true).await?;
                connection.set_local_description(offer.clone()).await?;
                self.signal_to(&remote, SignalKind::Offer, body_map(&offer))
                    .await
            }
            .await;
            if let Err(e) = restarted {
                warn!(target: "cc.controller", remote = %remote, error = %e, "ICE restart failed");
            }
        }
    }

    /// Give up on a link after its restart failed.
    async fn drop_link(&mut self, remote: &UserId) {
        warn!(target: "cc.controller", remote = %remote, "Connection lost after ICE restart");
        self.close_link(remote).await;
        if let Some(media) = self.remotes.get_mut(remote) {
            media.dropped = true;
        }

        if self.links.is_empty() {
            let frame = if self.is_group_call {
                ClientEvent::Leave(self.call_ref())
            } else {
                ClientEvent::EndCall(self.call_ref())
            };
            let _ = self.send(frame).await;
            self.finish(EndReason::Dropped).await;
        }
    }

    // ------------------------------------------------------------------------
    // User intents
    // ------------------------------------------------------------------------

    async fn handle_intent(&mut self, intent: UserIntent) -> Result<(), ClientError> {
        if self.is_ended() {
            return Err(ClientError::InvalidState("call has ended".to_string()));
        }
        match intent {
            UserIntent::Accept => self.accept().await,
            UserIntent::Reject => {
                self.require_phase(&ControllerPhase::Ringing)?;
                let _ = self.send(ClientEvent::RejectCall(self.call_ref())).await;
                self.finish(EndReason::Declined).await;
                Ok(())
            }
            UserIntent::HangUp => {
                self.hang_up().await;
                Ok(())
            }
            UserIntent::SetAudio(enabled) => self.set_local_track(TrackKind::Audio, enabled).await,
            UserIntent::SetVideo(enabled) => self.set_local_track(TrackKind::Video, enabled).await,
            UserIntent::StartScreenShare => self.start_screen_share().await,
            UserIntent::StopScreenShare => self.stop_screen_share().await,
        }
    }

    async fn accept(&mut self) -> Result<(), ClientError> {
        self.require_phase(&ControllerPhase::Ringing)?;

        let media = match MediaGuard::acquire(self.deps.media.as_ref(), self.call_type).await {
            Ok(media) => media,
            Err(e) => {
                warn!(target: "cc.controller", error = %e, "Local media unavailable, declining");
                let _ = self.send(ClientEvent::RejectCall(self.call_ref())).await;
                self.finish(EndReason::MediaAccessDenied).await;
                return Err(e);
            }
        };

        self.send(ClientEvent::AcceptCall(self.call_ref())).await?;
        self.attach_media(media);
        self.accepted_locally = true;
        self.phase = ControllerPhase::Connecting;
        Ok(())
    }

    async fn hang_up(&mut self) {
        match self.phase {
            ControllerPhase::Dialing => {
                let _ = self.send(ClientEvent::CancelCall(self.call_ref())).await;
                self.finish(EndReason::HungUp).await;
                self.done = false;
                self.linger_until = Some(Instant::now() + CANCEL_CONFIRM_LINGER);
            }
            ControllerPhase::Ringing => {
                let _ = self.send(ClientEvent::RejectCall(self.call_ref())).await;
                self.finish(EndReason::Declined).await;
            }
            ControllerPhase::Connecting | ControllerPhase::Active => {
                let frame = if self.is_group_call {
                    ClientEvent::Leave(self.call_ref())
                } else {
                    ClientEvent::EndCall(self.call_ref())
                };
                let _ = self.send(frame).await;
                self.finish(EndReason::HungUp).await;
            }
            ControllerPhase::Ended(_) => {}
        }
    }

    async fn set_local_track(&mut self, kind: TrackKind, enabled: bool) -> Result<(), ClientError> {
        let media = self
            .media
            .as_ref()
            .ok_or_else(|| ClientError::InvalidState("not in the call".to_string()))?;
        if kind == TrackKind::Video && self.call_type == CallType::Audio {
            return Err(ClientError::InvalidState("audio-only call".to_string()));
        }
        media.set_enabled(kind, enabled);

        let event = match kind {
            TrackKind::Audio => {
                self.local_audio = enabled;
                ClientEvent::ToggleAudio
            }
            TrackKind::Video => {
                self.local_video = enabled;
                ClientEvent::ToggleVideo
            }
        };
        self.send(event(ClientSignal {
            to: None,
            call_id: self.call_id.clone(),
            body: body_map(&MediaToggle { enabled }),
        }))
        .await
    }

    async fn start_screen_share(&mut self) -> Result<(), ClientError> {
        if self.media.is_none() {
            return Err(ClientError::InvalidState("not in the call".to_string()));
        }
        if self.screen.is_some() {
            return Err(ClientError::InvalidState("already sharing".to_string()));
        }

        let screen = MediaGuard::acquire_screen(self.deps.media.as_ref()).await?;
        let track = screen
            .video_track()
            .ok_or_else(|| ClientError::MediaAccessDenied("screen capture has no video".to_string()))?;
        self.replace_video_everywhere(Some(&track)).await;
        self.screen = Some(screen);
        info!(target: "cc.controller", links = self.links.len(), "Screen share started");
        Ok(())
    }

    async fn stop_screen_share(&mut self) -> Result<(), ClientError> {
        let screen = self
            .screen
            .take()
            .ok_or_else(|| ClientError::InvalidState("not sharing".to_string()))?;
        let camera = self.media.as_ref().and_then(MediaGuard::video_track);
        self.replace_video_everywhere(camera.as_ref()).await;
        drop(screen);
        info!(target: "cc.controller", "Screen share stopped");
        Ok(())
    }

    async fn replace_video_everywhere(&self, track: Option<&MediaTrack>) {
        for link in self.links.values() {
            if let Err(e) = link.connection.replace_video_track(track).await {
                warn!(target: "cc.controller", remote = %link.remote, error = %e, "Track replacement failed");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn attach_media(&mut self, media: MediaGuard) {
        self.local_audio = true;
        self.local_video = media.video_track().is_some();
        self.media = Some(media);
    }

    /// Camera and microphone, with the screen in place of the camera while sharing.
    fn outgoing_tracks(&self) -> Vec<MediaTrack> {
        let screen_video = self.screen.as_ref().and_then(MediaGuard::video_track);
        self.media
            .as_ref()
            .map(MediaGuard::tracks)
            .unwrap_or_default()
            .into_iter()
            .map(|track| match (&screen_video, track.kind) {
                (Some(screen), TrackKind::Video) => screen.clone(),
                _ => track,
            })
            .collect()
    }

    async fn open_link(&mut self, remote: &UserId, offerer: bool) -> Result<(), ClientError> {
        let connection = self
            .deps
            .peers
            .create(PeerEventSink::new(remote.clone(), self.peer_tx.clone()))
            .await?;

        // Insert first so a failure below still closes the connection.
        self.links.insert(
            remote.clone(),
            PeerLink::new(remote.clone(), Arc::clone(&connection), offerer),
        );
        for track in self.outgoing_tracks() {
            connection.add_track(&track).await?;
        }
        debug!(target: "cc.controller", remote = %remote, offerer, "Peer link opened");
        Ok(())
    }

    fn link_connection(
        &self,
        remote: &UserId,
    ) -> Result<Arc<dyn PeerConnection>, ClientError> {
        self.links
            .get(remote)
            .map(|l| Arc::clone(&l.connection))
            .ok_or_else(|| ClientError::InvalidState(format!("no peer link to {remote}")))
    }

    async fn close_link(&mut self, remote: &UserId) {
        if let Some(link) = self.links.remove(remote) {
            link.connection.close().await;
        }
    }

    async fn signal_to(
        &self,
        remote: &UserId,
        kind: SignalKind,
        body: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), ClientError> {
        let signal = ClientSignal {
            to: Some(RelayTarget::User(remote.clone())),
            call_id: self.call_id.clone(),
            body,
        };
        let event = match kind {
            SignalKind::Offer => ClientEvent::Offer(signal),
            SignalKind::Answer => ClientEvent::Answer(signal),
            SignalKind::IceCandidate => ClientEvent::IceCandidate(signal),
        };
        self.send(event).await
    }

    async fn send(&self, event: ClientEvent) -> Result<(), ClientError> {
        let name = event.name();
        self.deps.signaling.send(event).await.map_err(|e| {
            warn!(target: "cc.controller", event = name, error = %e, "Signaling send failed");
            e
        })
    }

    fn call_ref(&self) -> CallRef {
        CallRef {
            call_id: self.call_id.clone(),
        }
    }

    fn require_phase(&self, expected: &ControllerPhase) -> Result<(), ClientError> {
        if &self.phase == expected {
            Ok(())
        } else {
            Err(ClientError::InvalidState(format!(
                "expected {expected:?}, call is {:?}",
                self.phase
            )))
        }
    }

    fn is_ended(&self) -> bool {
        matches!(self.phase, ControllerPhase::Ended(_))
    }

    /// Tear down links and media and enter `Ended`. Idempotent.
    async fn finish(&mut self, reason: EndReason) {
        if self.is_ended() {
            return;
        }
        info!(target: "cc.controller", ?reason, "Call ended");

        for (_, link) in std::mem::take(&mut self.links) {
            link.connection.close().await;
        }
        self.screen = None;
        self.media = None;
        self.local_audio = false;
        self.local_video = false;
        self.setup_deadline = None;
        self.phase = ControllerPhase::Ended(reason);
        self.done = true;
    }

    fn view(&self) -> CallView {
        let remotes = self
            .remotes
            .iter()
            .map(|(user_id, media)| {
                let link = self.links.get(user_id);
                (
                    user_id.clone(),
                    RemoteView {
                        audio_enabled: media.audio_enabled,
                        video_enabled: media.video_enabled,
                        quality: link.map(PeerLink::quality),
                        reconnecting: link.is_some_and(PeerLink::reconnecting),
                        dropped: media.dropped,
                    },
                )
            })
            .collect();

        CallView {
            call_id: self.call_id.clone(),
            call_type: self.call_type,
            is_group_call: self.is_group_call,
            phase: self.phase.clone(),
            local_audio: self.local_audio,
            local_video: self.local_video,
            screen_sharing: self.screen.is_some(),
            remotes,
            quality: ConnectionQuality::aggregate(self.links.values().map(PeerLink::quality)),
        }
    }

    fn publish(&self) {
        let view = self.view();
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}

impl RemoteMedia {
    fn for_call(call_type: CallType) -> Self {
        Self {
            audio_enabled: true,
            video_enabled: call_type == CallType::Video,
            dropped: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// Call id a server frame refers to.
fn event_call_id(event: &ServerEvent) -> Option<&CallId> {
    match event {
        ServerEvent::IncomingCall(e) => Some(&e.call_id),
        ServerEvent::CallAccepted(n)
        | ServerEvent::CallRejected(n)
        | ServerEvent::CallCancelled(n)
        | ServerEvent::CallMissed(n) => Some(&n.call_id),
        ServerEvent::CallEnded(e) => Some(&e.notice.call_id),
        ServerEvent::CallConflict(c) => Some(&c.call_id),
        ServerEvent::CallError(e) => e.call_id.as_ref(),
        ServerEvent::UserJoined(r)
        | ServerEvent::UserLeft(r)
        | ServerEvent::Offer(r)
        | ServerEvent::Answer(r)
        | ServerEvent::IceCandidate(r)
        | ServerEvent::ToggleVideo(r)
        | ServerEvent::ToggleAudio(r) => Some(&r.call_id),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::testing::{FakeMediaDevices, FakePeerFactory, PeerOp, RecordingSignaling};
    use call_protocol::{CallConflict, CallEnded, LifecycleNotice, SdpType};

    struct Fixture {
        media: Arc<FakeMediaDevices>,
        peers: Arc<FakePeerFactory>,
        signaling: Arc<RecordingSignaling>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                media: FakeMediaDevices::new(),
                peers: FakePeerFactory::new(),
                signaling: RecordingSignaling::new(),
            }
        }

        fn deps(&self) -> ControllerDeps {
            ControllerDeps {
                media: self.media.clone(),
                peers: self.peers.clone(),
                signaling: self.signaling.clone(),
            }
        }

        fn outgoing(&self, call_type: CallType) -> CallControllerHandle {
            let setup = CallSetup::Outgoing {
                call_id: CallId::from("c1"),
                call_type,
                invitees: vec![UserId::from("bob")],
                group_id: None,
            };
            let (handle, _task) = CallController::spawn(
                setup,
                UserId::from("alice"),
                self.deps(),
                ControllerConfig::default(),
                CancellationToken::new(),
            );
            handle
        }

        fn incoming(&self, local: &str) -> CallControllerHandle {
            let setup = CallSetup::Incoming(IncomingCall {
                call_id: CallId::from("c1"),
                group_id: None,
                by_user_id: UserId::from("alice"),
                call_type: CallType::Video,
                is_group_call: false,
                invitees: vec![UserId::from("bob")],
            });
            let (handle, _task) = CallController::spawn(
                setup,
                UserId::from(local),
                self.deps(),
                ControllerConfig::default(),
                CancellationToken::new(),
            );
            handle
        }
    }

    fn notice(by: &str) -> LifecycleNotice {
        LifecycleNotice {
            call_id: CallId::from("c1"),
            group_id: None,
            by_user_id: UserId::from(by),
        }
    }

    fn relayed<T: serde::Serialize>(from: &str, to: &str, body: &T) -> Relayed {
        Relayed {
            from: UserId::from(from),
            to: RelayTarget::User(UserId::from(to)),
            call_id: CallId::from("c1"),
            body: body_map(body),
        }
    }

    fn presence(user: &str, should_offer: bool) -> Presence {
        Presence {
            user_id: UserId::from(user),
            should_offer,
        }
    }

    fn sdp(sdp_type: SdpType) -> SessionDescription {
        SessionDescription {
            sdp_type,
            sdp: "v=0".to_string(),
        }
    }

    /// Alice calls bob, bob accepts and joins; alice is the offerer.
    async fn connected_caller(fx: &Fixture) -> CallControllerHandle {
        let handle = fx.outgoing(CallType::Video);
        handle
            .deliver(ServerEvent::CallAccepted(notice("bob")))
            .await
            .unwrap();
        handle
            .deliver(ServerEvent::UserJoined(relayed(
                "bob",
                "alice",
                &presence("bob", true),
            )))
            .await
            .unwrap();
        handle
            .deliver(ServerEvent::Answer(relayed("bob", "alice", &sdp(SdpType::Answer))))
            .await
            .unwrap();
        handle.snapshot().await.unwrap();
        fx.peers
            .peer_for("bob")
            .unwrap()
            .emit_state(IceConnectionState::Connected);
        let view = handle.snapshot().await.unwrap();
        assert_eq!(view.phase, ControllerPhase::Active);
        handle
    }

    #[tokio::test]
    async fn test_outgoing_call_offers_when_callee_joins() {
        let fx = Fixture::new();
        let handle = fx.outgoing(CallType::Video);

        let view = handle.snapshot().await.unwrap();
        assert_eq!(view.phase, ControllerPhase::Dialing);
        assert!(view.local_audio && view.local_video);
        assert_eq!(fx.signaling.names(), vec!["initiate-call"]);
        assert_eq!(fx.media.live_tracks(), 2);

        handle
            .deliver(ServerEvent::CallAccepted(notice("bob")))
            .await
            .unwrap();
        assert_eq!(
            handle.snapshot().await.unwrap().phase,
            ControllerPhase::Connecting
        );

        handle
            .deliver(ServerEvent::UserJoined(relayed(
                "bob",
                "alice",
                &presence("bob", true),
            )))
            .await
            .unwrap();
        handle.snapshot().await.unwrap();

        let peer = fx.peers.peer_for("bob").unwrap();
        assert_eq!(
            peer.ops(),
            vec![
                PeerOp::AddTrack("mic".to_string()),
                PeerOp::AddTrack("camera".to_string()),
                PeerOp::CreateOffer { ice_restart: false },
                PeerOp::SetLocal(SdpType::Offer),
            ]
        );
        match fx.signaling.sent().last().unwrap() {
            ClientEvent::Offer(signal) => {
                assert_eq!(signal.to, Some(RelayTarget::User(UserId::from("bob"))));
            }
            other => unreachable!("unexpected {other:?}"),
        }

        handle
            .deliver(ServerEvent::Answer(relayed("bob", "alice", &sdp(SdpType::Answer))))
            .await
            .unwrap();
        peer.emit_state(IceConnectionState::Completed);

        let view = handle.snapshot().await.unwrap();
        assert_eq!(view.phase, ControllerPhase::Active);
        assert_eq!(view.quality, Some(ConnectionQuality::Excellent));
        assert!(peer.ops().contains(&PeerOp::SetRemote(SdpType::Answer)));
    }

    #[tokio::test]
    async fn test_incoming_call_answers_offer() {
        let fx = Fixture::new();
        let handle = fx.incoming("bob");
        assert_eq!(
            handle.snapshot().await.unwrap().phase,
            ControllerPhase::Ringing
        );
        assert_eq!(fx.media.live_tracks(), 0, "no capture before answering");

        handle.accept().await.unwrap();
        assert_eq!(fx.signaling.names(), vec!["accept-call"]);

        // The member already present makes the offer
        handle
            .deliver(ServerEvent::UserJoined(relayed(
                "alice",
                "bob",
                &presence("alice", false),
            )))
            .await
            .unwrap();
        handle.snapshot().await.unwrap();
        assert_eq!(fx.peers.created(), 0);

        handle
            .deliver(ServerEvent::Offer(relayed("alice", "bob", &sdp(SdpType::Offer))))
            .await
            .unwrap();
        handle.snapshot().await.unwrap();

        let peer = fx.peers.peer_for("alice").unwrap();
        assert_eq!(
            peer.ops(),
            vec![
                PeerOp::AddTrack("mic".to_string()),
                PeerOp::AddTrack("camera".to_string()),
                PeerOp::SetRemote(SdpType::Offer),
                PeerOp::CreateAnswer,
                PeerOp::SetLocal(SdpType::Answer),
            ]
        );
        assert_eq!(fx.signaling.names().last(), Some(&"call:answer"));
    }

    #[tokio::test]
    async fn test_candidate_before_peer_connection_is_dropped() {
        let fx = Fixture::new();
        let handle = fx.incoming("bob");
        handle.accept().await.unwrap();

        let candidate = IceCandidate {
            candidate: "candidate:1".to_string(),
            sdp_mid: None,
            sdp_m_line_index: None,
        };
        handle
            .deliver(ServerEvent::IceCandidate(relayed("alice", "bob", &candidate)))
            .await
            .unwrap();

        let view = handle.snapshot().await.unwrap();
        assert_eq!(view.phase, ControllerPhase::Connecting);
        assert_eq!(fx.peers.created(), 0);
    }

    #[tokio::test]
    async fn test_candidate_before_answer_is_applied_after_it() {
        let fx = Fixture::new();
        let handle = fx.outgoing(CallType::Audio);
        handle
            .deliver(ServerEvent::CallAccepted(notice("bob")))
            .await
            .unwrap();
        handle
            .deliver(ServerEvent::UserJoined(relayed(
                "bob",
                "alice",
                &presence("bob", true),
            )))
            .await
            .unwrap();

        let candidate = IceCandidate {
            candidate: "candidate:3".to_string(),
            sdp_mid: None,
            sdp_m_line_index: None,
        };
        handle
            .deliver(ServerEvent::IceCandidate(relayed("bob", "alice", &candidate)))
            .await
            .unwrap();
        handle.snapshot().await.unwrap();
        let peer = fx.peers.peer_for("bob").unwrap();
        assert!(!peer
            .ops()
            .contains(&PeerOp::AddCandidate("candidate:3".to_string())));

        handle
            .deliver(ServerEvent::Answer(relayed("bob", "alice", &sdp(SdpType::Answer))))
            .await
            .unwrap();
        handle.snapshot().await.unwrap();
        let ops = peer.ops();
        assert_eq!(
            &ops[ops.len() - 2..],
            &[
                PeerOp::SetRemote(SdpType::Answer),
                PeerOp::AddCandidate("candidate:3".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_local_candidates_are_trickled() {
        let fx = Fixture::new();
        let handle = connected_caller(&fx).await;

        fx.peers.peer_for("bob").unwrap().emit_candidate("candidate:7");
        handle.snapshot().await.unwrap();

        match fx.signaling.sent().last().unwrap() {
            ClientEvent::IceCandidate(signal) => {
                assert_eq!(signal.body["candidate"], "candidate:7");
            }
            other => unreachable!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peer_event_burst_is_delivered_in_full() {
        let fx = Fixture::new();
        let handle = connected_caller(&fx).await;
        let peer = fx.peers.peer_for("bob").unwrap();

        // More events than the controller mailbox holds, before it runs again
        let burst = CONTROLLER_CHANNEL_BUFFER + 44;
        for i in 0..burst {
            peer.emit_candidate(&format!("candidate:{i}"));
        }
        peer.emit_state(IceConnectionState::Failed);
        let view = handle.snapshot().await.unwrap();

        let trickled: Vec<String> = fx
            .signaling
            .sent()
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::IceCandidate(signal) => {
                    signal.body["candidate"].as_str().map(str::to_string)
                }
                _ => None,
            })
            .collect();
        assert_eq!(trickled.len(), burst);
        assert_eq!(trickled[0], "candidate:0");
        assert_eq!(trickled[burst - 1], format!("candidate:{}", burst - 1));

        let remote = &view.remotes[&UserId::from("bob")];
        assert_eq!(remote.quality, Some(ConnectionQuality::Fair), "restart pending");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_restarts_ice_once() {
        let fx = Fixture::new();
        let handle = connected_caller(&fx).await;
        let peer = fx.peers.peer_for("bob").unwrap();

        peer.emit_state(IceConnectionState::Disconnected);
        let view = handle.snapshot().await.unwrap();
        let remote = &view.remotes[&UserId::from("bob")];
        assert_eq!(remote.quality, Some(ConnectionQuality::Fair), "grace period");
        assert!(!remote.reconnecting);

        tokio::time::sleep(DEFAULT_ICE_RESTART_DELAY + Duration::from_millis(100)).await;
        let view = handle.snapshot().await.unwrap();
        let remote = &view.remotes[&UserId::from("bob")];
        assert_eq!(remote.quality, Some(ConnectionQuality::Poor));
        assert!(remote.reconnecting);

        let restarts = peer
            .ops()
            .iter()
            .filter(|op| **op == PeerOp::CreateOffer { ice_restart: true })
            .count();
        assert_eq!(restarts, 1);

        // A second disconnect does not restart again
        peer.emit_state(IceConnectionState::Connected);
        peer.emit_state(IceConnectionState::Disconnected);
        tokio::time::sleep(DEFAULT_ICE_RESTART_DELAY * 2).await;
        handle.snapshot().await.unwrap();
        let restarts = peer
            .ops()
            .iter()
            .filter(|op| **op == PeerOp::CreateOffer { ice_restart: true })
            .count();
        assert_eq!(restarts, 1);

        peer.emit_state(IceConnectionState::Failed);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let view = handle.current();
        assert_eq!(view.phase, ControllerPhase::Ended(EndReason::Dropped));
        assert!(view.remotes[&UserId::from("bob")].dropped);
        assert!(peer.is_closed());
        assert_eq!(fx.signaling.names().last(), Some(&"end-call"));
        assert_eq!(fx.media.live_tracks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_before_restart_keeps_restart_available() {
        let fx = Fixture::new();
        let handle = connected_caller(&fx).await;
        let peer = fx.peers.peer_for("bob").unwrap();

        peer.emit_state(IceConnectionState::Disconnected);
        handle.snapshot().await.unwrap();
        peer.emit_state(IceConnectionState::Connected);
        tokio::time::sleep(DEFAULT_ICE_RESTART_DELAY * 2).await;

        let view = handle.snapshot().await.unwrap();
        assert_eq!(view.quality, Some(ConnectionQuality::Good));
        assert!(!peer.ops().contains(&PeerOp::CreateOffer { ice_restart: true }));
    }

    #[tokio::test]
    async fn test_screen_share_replaces_video_track() {
        let fx = Fixture::new();
        let handle = connected_caller(&fx).await;
        let peer = fx.peers.peer_for("bob").unwrap();

        handle.start_screen_share().await.unwrap();
        assert!(handle.snapshot().await.unwrap().screen_sharing);
        assert_eq!(fx.media.live_tracks(), 3);
        assert_eq!(
            peer.ops().last(),
            Some(&PeerOp::ReplaceVideo(Some("screen".to_string())))
        );

        assert!(matches!(
            handle.start_screen_share().await,
            Err(ClientError::InvalidState(_))
        ));

        handle.stop_screen_share().await.unwrap();
        assert_eq!(
            peer.ops().last(),
            Some(&PeerOp::ReplaceVideo(Some("camera".to_string())))
        );
        assert_eq!(fx.media.live_tracks(), 2, "screen capture released");
        let offers = peer
            .ops()
            .iter()
            .filter(|op| matches!(op, PeerOp::CreateOffer { .. }))
            .count();
        assert_eq!(offers, 1, "track replacement does not renegotiate");
    }

    #[tokio::test]
    async fn test_mute_sends_toggle_to_room() {
        let fx = Fixture::new();
        let handle = connected_caller(&fx).await;

        handle.set_audio(false).await.unwrap();

        assert!(!handle.snapshot().await.unwrap().local_audio);
        assert_eq!(fx.media.enabled(TrackKind::Audio), Some(false));
        match fx.signaling.sent().last().unwrap() {
            ClientEvent::ToggleAudio(signal) => {
                assert!(signal.to.is_none());
                assert_eq!(signal.body["enabled"], false);
            }
            other => unreachable!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_video_toggle_refused_on_audio_call() {
        let fx = Fixture::new();
        let handle = fx.outgoing(CallType::Audio);
        handle.snapshot().await.unwrap();
        assert_eq!(fx.media.live_tracks(), 1);

        assert!(matches!(
            handle.set_video(true).await,
            Err(ClientError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_remote_toggle_updates_view() {
        let fx = Fixture::new();
        let handle = connected_caller(&fx).await;

        handle
            .deliver(ServerEvent::ToggleVideo(relayed(
                "bob",
                "alice",
                &MediaToggle { enabled: false },
            )))
            .await
            .unwrap();

        let view = handle.snapshot().await.unwrap();
        let bob = &view.remotes[&UserId::from("bob")];
        assert!(!bob.video_enabled);
        assert!(bob.audio_enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_outgoing_call_times_out() {
        let fx = Fixture::new();
        let handle = fx.outgoing(CallType::Video);
        handle.snapshot().await.unwrap();

        tokio::time::sleep(DEFAULT_SETUP_TIMEOUT + Duration::from_secs(1)).await;

        assert_eq!(
            handle.current().phase,
            ControllerPhase::Ended(EndReason::SetupTimeout)
        );
        assert_eq!(fx.signaling.names(), vec!["initiate-call", "cancel-call"]);
        assert_eq!(fx.media.live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_media_denied_never_places_call() {
        let fx = Fixture::new();
        fx.media.deny();
        let handle = fx.outgoing(CallType::Video);

        let mut view = handle.view();
        view.wait_for(|v| matches!(v.phase, ControllerPhase::Ended(_)))
            .await
            .unwrap();

        assert_eq!(
            handle.current().phase,
            ControllerPhase::Ended(EndReason::MediaAccessDenied)
        );
        assert!(fx.signaling.names().is_empty());
    }

    #[tokio::test]
    async fn test_media_denied_on_accept_declines() {
        let fx = Fixture::new();
        let handle = fx.incoming("bob");
        fx.media.deny();

        let result = handle.accept().await;
        assert!(matches!(result, Err(ClientError::MediaAccessDenied(_))));
        assert_eq!(fx.signaling.names(), vec!["reject-call"]);
        assert_eq!(
            handle.current().phase,
            ControllerPhase::Ended(EndReason::MediaAccessDenied)
        );
    }

    #[tokio::test]
    async fn test_cancel_mid_negotiation_tears_down() {
        let fx = Fixture::new();
        let handle = fx.incoming("bob");
        handle.accept().await.unwrap();
        handle
            .deliver(ServerEvent::Offer(relayed("alice", "bob", &sdp(SdpType::Offer))))
            .await
            .unwrap();
        handle.snapshot().await.unwrap();
        assert_eq!(fx.media.live_tracks(), 2);

        handle
            .deliver(ServerEvent::CallCancelled(notice("alice")))
            .await
            .unwrap();
        let mut view = handle.view();
        view.wait_for(|v| matches!(v.phase, ControllerPhase::Ended(_)))
            .await
            .unwrap();

        assert_eq!(
            handle.current().phase,
            ControllerPhase::Ended(EndReason::Cancelled)
        );
        assert!(fx.peers.peer_for("alice").unwrap().is_closed());
        assert_eq!(fx.media.live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_accept_on_other_device_stops_ringing() {
        let fx = Fixture::new();
        let handle = fx.incoming("bob");

        handle
            .deliver(ServerEvent::CallAccepted(notice("bob")))
            .await
            .unwrap();
        let mut view = handle.view();
        view.wait_for(|v| matches!(v.phase, ControllerPhase::Ended(_)))
            .await
            .unwrap();

        assert_eq!(
            handle.current().phase,
            ControllerPhase::Ended(EndReason::AnsweredElsewhere)
        );
        assert!(fx.signaling.names().is_empty());
    }

    #[tokio::test]
    async fn test_withdrawal_that_lost_to_accept_ends_call() {
        let fx = Fixture::new();
        let handle = fx.outgoing(CallType::Video);

        handle.hang_up().await.unwrap();
        assert_eq!(
            handle.current().phase,
            ControllerPhase::Ended(EndReason::HungUp)
        );
        assert_eq!(fx.media.live_tracks(), 0);

        handle
            .deliver(ServerEvent::CallAccepted(notice("bob")))
            .await
            .unwrap();
        handle
            .deliver(ServerEvent::CallConflict(CallConflict {
                call_id: CallId::from("c1"),
                status: Some(CallStatus::Active),
                message: "Call is active".to_string(),
            }))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while !handle.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            fx.signaling.names(),
            vec!["initiate-call", "cancel-call", "end-call"]
        );
    }

    #[tokio::test]
    async fn test_remote_hang_up_reports_duration() {
        let fx = Fixture::new();
        let handle = connected_caller(&fx).await;

        handle
            .deliver(ServerEvent::CallEnded(CallEnded {
                notice: notice("bob"),
                duration: 42,
            }))
            .await
            .unwrap();
        let mut view = handle.view();
        view.wait_for(|v| matches!(v.phase, ControllerPhase::Ended(_)))
            .await
            .unwrap();

        assert_eq!(
            handle.current().phase,
            ControllerPhase::Ended(EndReason::RemoteEnded {
                by: UserId::from("bob"),
                duration: 42
            })
        );
        assert_eq!(fx.media.live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_releases_media() {
        let fx = Fixture::new();
        let handle = connected_caller(&fx).await;
        assert_eq!(fx.media.live_tracks(), 2);

        handle.cancel();
        let mut view = handle.view();
        view.wait_for(|v| matches!(v.phase, ControllerPhase::Ended(_)))
            .await
            .unwrap();

        assert_eq!(
            handle.current().phase,
            ControllerPhase::Ended(EndReason::Shutdown)
        );
        assert_eq!(fx.media.live_tracks(), 0);
        assert!(fx.peers.peer_for("bob").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_frames_for_other_calls_are_ignored() {
        let fx = Fixture::new();
        let handle = fx.incoming("bob");

        let mut other = notice("alice");
        other.call_id = CallId::from("c2");
        handle
            .deliver(ServerEvent::CallCancelled(other))
            .await
            .unwrap();

        assert_eq!(
            handle.snapshot().await.unwrap().phase,
            ControllerPhase::Ringing
        );
    }
}
