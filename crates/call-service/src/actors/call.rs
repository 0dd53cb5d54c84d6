//! `CallActor` - per-call actor that owns one call's lifecycle.
//!
//! Each `CallActor`:
//! - Is the single writer for its call: every transition is a message
//! - Persists through the Call Record Store before announcing a transition
//! - Fans lifecycle events out through the Session Registry
//! - Owns the ring timer and the post-settlement retention timer
//!
//! # States
//!
//! ```text
//! Ringing --accept--> Active --end/leave--> Finished(ended)
//!    |
//!    +--reject--> Finished(rejected)
//!    +--cancel / ring timeout--> Finished(missed)
//! ```
//!
//! The first transition wins. Anything arriving after settlement gets
//! `Conflict` until the retention timer expires and the actor exits.
//!
//! # Shutdown
//!
//! On cancellation a ringing call is settled as missed and an active call as
//! ended, so no record is left non-terminal.
//!
//! A settlement the store refuses with a backend error is kept and retried
//! with backoff. The actor neither retires nor exits on shutdown while one is
//! outstanding.

use super::messages::{CallMessage, CallReply, CallSnapshot, CallSummary, StartCall};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::config::{DEFAULT_RING_TIMEOUT_SECONDS, DEFAULT_TERMINAL_RETENTION_SECONDS};
use crate::errors::CallError;
use crate::notify::{notify_detached, CallNotification, Notifier};
use crate::observability::metrics;
use crate::registry::SessionRegistry;
use crate::relay::SignalingRelay;
use crate::store::{with_retry, CallPatch, CallRecordStore, NewCall, ParticipantPatch, StoreError};

use call_protocol::{
    body_map, CallEnded, CallStatus, CallType, IncomingCall, LifecycleNotice, ParticipantStatus,
    Presence, RelayKind, RelayTarget, Relayed, ServerEvent,
};
use chrono::{DateTime, Utc};
use common::types::{CallId, GroupId, RoomId, SessionId, UserId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Channel buffer size for a call mailbox.
const CALL_CHANNEL_BUFFER: usize = 64;

/// First delay before an unpersisted settlement is written again.
const SETTLE_RETRY_INITIAL: Duration = Duration::from_secs(1);

/// Cap on the delay between settlement writes.
const SETTLE_RETRY_MAX: Duration = Duration::from_secs(30);

/// Timers applied to every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSettings {
    /// How long an unanswered call rings.
    pub ring_timeout: Duration,
    /// How long a settled actor stays reachable.
    pub terminal_retention: Duration,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(DEFAULT_RING_TIMEOUT_SECONDS),
            terminal_retention: Duration::from_secs(DEFAULT_TERMINAL_RETENTION_SECONDS),
        }
    }
}

/// Collaborators shared by every call actor.
#[derive(Clone)]
pub struct CallContext {
    pub registry: Arc<SessionRegistry>,
    pub relay: SignalingRelay,
    pub store: Arc<dyn CallRecordStore>,
    pub notifier: Arc<dyn Notifier>,
    pub metrics: Arc<ActorMetrics>,
    pub settings: CallSettings,
}

/// Handle to a `CallActor`.
#[derive(Debug, Clone)]
pub struct CallActorHandle {
    sender: mpsc::Sender<CallMessage>,
    cancel_token: CancellationToken,
    call_id: CallId,
}

impl CallActorHandle {
    #[must_use]
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    async fn request(
        &self,
        build: impl FnOnce(CallReply) -> CallMessage,
    ) -> Result<CallSnapshot, CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn accept(
        &self,
        user_id: UserId,
        session_id: SessionId,
    ) -> Result<CallSnapshot, CallError> {
        self.request(|respond_to| CallMessage::Accept {
            user_id,
            session_id,
            respond_to,
        })
        .await
    }

    pub async fn reject(&self, user_id: UserId) -> Result<CallSnapshot, CallError> {
        self.request(|respond_to| CallMessage::Reject {
            user_id,
            respond_to,
        })
        .await
    }

    pub async fn cancel_call(&self, user_id: UserId) -> Result<CallSnapshot, CallError> {
        self.request(|respond_to| CallMessage::Cancel {
            user_id,
            respond_to,
        })
        .await
    }

    pub async fn end(&self, user_id: UserId) -> Result<CallSnapshot, CallError> {
        self.request(|respond_to| CallMessage::End {
            user_id,
            respond_to,
        })
        .await
    }

    pub async fn leave(&self, user_id: UserId) -> Result<CallSnapshot, CallError> {
        self.request(|respond_to| CallMessage::Leave {
            user_id,
            respond_to,
        })
        .await
    }

    pub async fn join(
        &self,
        user_id: UserId,
        session_id: SessionId,
    ) -> Result<CallSnapshot, CallError> {
        self.request(|respond_to| CallMessage::Join {
            user_id,
            session_id,
            respond_to,
        })
        .await
    }

    pub async fn get_state(&self) -> Result<CallSnapshot, CallError> {
        self.request(|respond_to| CallMessage::GetState { respond_to })
            .await
    }

    /// True once the actor has exited.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Cancel the actor. A non-terminal call is settled before exit.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallPhase {
    Ringing,
    Active { answered_instant: Instant },
    Finished(CallStatus),
}

impl CallPhase {
    fn status(self) -> CallStatus {
        match self {
            CallPhase::Ringing => CallStatus::Initiated,
            CallPhase::Active { .. } => CallStatus::Active,
            CallPhase::Finished(status) => status,
        }
    }
}

/// A terminal patch the store has not accepted yet.
#[derive(Debug)]
struct PendingSettle {
    patch: CallPatch,
    retry_at: Instant,
    backoff: Duration,
}

/// Sleep until `deadline`, or forever when unset.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The `CallActor` implementation.
pub struct CallActor {
    call_id: CallId,
    call_type: CallType,
    initiator: UserId,
    initiator_session: Option<SessionId>,
    group_id: Option<GroupId>,
    is_group_call: bool,
    room: RoomId,
    /// Invitee statuses. Never includes the initiator.
    invitees: BTreeMap<UserId, ParticipantStatus>,
    /// Cleared when the initiator leaves an active group call.
    initiator_present: bool,
    phase: CallPhase,
    started_at: DateTime<Utc>,
    answered_at: Option<DateTime<Utc>>,
    duration: Option<u64>,
    ring_deadline: Option<Instant>,
    retain_until: Option<Instant>,
    pending_settle: Option<PendingSettle>,
    /// Set once cancelled or orphaned; the loop only finishes pending writes.
    shutting_down: bool,
    receiver: mpsc::Receiver<CallMessage>,
    cancel_token: CancellationToken,
    ctx: CallContext,
    summary: watch::Sender<CallSummary>,
    mailbox: MailboxMonitor,
}

impl CallActor {
    /// Spawn a call actor.
    ///
    /// The actor persists the call and rings the invitees before answering
    /// on `started`. Returns the handle, the task join handle and the
    /// summary channel used for busy checks.
    pub fn spawn(
        request: StartCall,
        ctx: CallContext,
        cancel_token: CancellationToken,
        started: CallReply,
    ) -> (
        CallActorHandle,
        JoinHandle<()>,
        watch::Receiver<CallSummary>,
    ) {
        let (sender, receiver) = mpsc::channel(CALL_CHANNEL_BUFFER);

        let invitees: BTreeMap<UserId, ParticipantStatus> = request
            .invitees
            .iter()
            .map(|u| (u.clone(), ParticipantStatus::Invited))
            .collect();
        let is_group_call = request.group_id.is_some() || invitees.len() > 1;

        let mut engaged: BTreeSet<UserId> = invitees.keys().cloned().collect();
        engaged.insert(request.initiator.clone());
        let (summary, summary_rx) = watch::channel(CallSummary {
            status: CallStatus::Initiated,
            engaged,
        });

        let actor = Self {
            room: RoomId::for_call(&request.call_id),
            mailbox: MailboxMonitor::new(ActorType::Call, request.call_id.as_str()),
            call_id: request.call_id.clone(),
            call_type: request.call_type,
            initiator: request.initiator,
            initiator_session: request.initiator_session,
            group_id: request.group_id,
            is_group_call,
            invitees,
            initiator_present: true,
            phase: CallPhase::Ringing,
            started_at: Utc::now(),
            answered_at: None,
            duration: None,
            ring_deadline: None,
            retain_until: None,
            pending_settle: None,
            shutting_down: false,
            receiver,
            cancel_token: cancel_token.clone(),
            ctx,
            summary,
        };

        let task_handle = tokio::spawn(actor.run(started));

        let handle = CallActorHandle {
            sender,
            cancel_token,
            call_id: request.call_id,
        };

        (handle, task_handle, summary_rx)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "cs.actor.call", fields(call_id = %self.call_id))]
    async fn run(mut self, started: CallReply) {
        info!(
            target: "cs.actor.call",
            call_id = %self.call_id,
            initiator = %self.initiator,
            invitees = self.invitees.len(),
            is_group_call = self.is_group_call,
            "CallActor started"
        );

        if let Err(e) = self.start().await {
            warn!(
                target: "cs.actor.call",
                call_id = %self.call_id,
                error = %e,
                "Call could not be started"
            );
            // Never persisted; reported as settled so it holds no one busy.
            self.summary.send_replace(CallSummary {
                status: CallStatus::Ended,
                engaged: BTreeSet::new(),
            });
            let _ = started.send(Err(e));
            return;
        }
        let _ = started.send(Ok(self.snapshot()));

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled(), if !self.shutting_down => {
                    info!(
                        target: "cs.actor.call",
                        call_id = %self.call_id,
                        "CallActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    self.shutting_down = true;
                    if self.pending_settle.is_none() {
                        break;
                    }
                }

                () = sleep_until_opt(self.ring_deadline) => {
                    self.handle_ring_timeout().await;
                }

                () = sleep_until_opt(self.pending_settle.as_ref().map(|p| p.retry_at)) => {
                    self.retry_pending_settle().await;
                    if self.shutting_down && self.pending_settle.is_none() {
                        break;
                    }
                }

                () = sleep_until_opt(self.retain_until), if self.pending_settle.is_none() => {
                    debug!(
                        target: "cs.actor.call",
                        call_id = %self.call_id,
                        "Retention elapsed"
                    );
                    break;
                }

                msg = self.receiver.recv(), if !self.shutting_down => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_received(self.receiver.len() + 1);
                            self.handle_message(message).await;
                            self.mailbox.record_handled(self.receiver.len());
                            self.ctx.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "cs.actor.call",
                                call_id = %self.call_id,
                                "CallActor channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            self.shutting_down = true;
                            if self.pending_settle.is_none() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!(
            target: "cs.actor.call",
            call_id = %self.call_id,
            status = %self.phase.status(),
            messages_processed = self.mailbox.messages_processed(),
            "CallActor stopped"
        );
    }

    /// Persist the call, ring the invitees and arm the ring timer.
    async fn start(&mut self) -> Result<(), CallError> {
        let invitees: Vec<UserId> = self.invitees.keys().cloned().collect();
        let record = NewCall {
            call_id: self.call_id.clone(),
            call_type: self.call_type,
            is_group_call: self.is_group_call,
            initiator_id: self.initiator.clone(),
            group_id: self.group_id.clone(),
            started_at: self.started_at,
        };

        self.ctx
            .store
            .create_call(record, &invitees)
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => CallError::Conflict {
                    status: None,
                    message: "Call already exists".to_string(),
                },
                other => CallError::Store(other),
            })?;

        if let Some(session_id) = self.initiator_session {
            self.ctx.registry.join_room(session_id, &self.room).await;
        }

        let incoming = IncomingCall {
            call_id: self.call_id.clone(),
            group_id: self.group_id.clone(),
            by_user_id: self.initiator.clone(),
            call_type: self.call_type,
            is_group_call: self.is_group_call,
            invitees: invitees.clone(),
        };
        for invitee in &invitees {
            let sessions = self
                .ctx
                .registry
                .deliver_to_user(invitee, ServerEvent::IncomingCall(incoming.clone()))
                .await;
            debug!(
                target: "cs.actor.call",
                call_id = %self.call_id,
                invitee = %invitee,
                sessions,
                "Invitee rung"
            );
            notify_detached(
                &self.ctx.notifier,
                invitee.clone(),
                CallNotification::IncomingCall {
                    call_id: self.call_id.clone(),
                    from: self.initiator.clone(),
                    call_type: self.call_type,
                    group_id: self.group_id.clone(),
                },
            );
        }

        self.ring_deadline = Some(Instant::now() + self.ctx.settings.ring_timeout);
        metrics::record_call_transition("created");
        Ok(())
    }

    async fn handle_message(&mut self, message: CallMessage) {
        match message {
            CallMessage::Accept {
                user_id,
                session_id,
                respond_to,
            } => {
                let result = self.handle_accept(user_id, session_id).await;
                let _ = respond_to.send(result.map(|()| self.snapshot()));
            }
            CallMessage::Reject {
                user_id,
                respond_to,
            } => {
                let result = self.handle_reject(user_id).await;
                let _ = respond_to.send(result.map(|()| self.snapshot()));
            }
            CallMessage::Cancel {
                user_id,
                respond_to,
            } => {
                let result = self.handle_cancel(user_id).await;
                let _ = respond_to.send(result.map(|()| self.snapshot()));
            }
            CallMessage::End {
                user_id,
                respond_to,
            } => {
                let result = self.handle_end(user_id).await;
                let _ = respond_to.send(result.map(|()| self.snapshot()));
            }
            CallMessage::Leave {
                user_id,
                respond_to,
            } => {
                let result = self.handle_leave(user_id).await;
                let _ = respond_to.send(result.map(|()| self.snapshot()));
            }
            CallMessage::Join {
                user_id,
                session_id,
                respond_to,
            } => {
                let result = self.handle_join(user_id, session_id).await;
                let _ = respond_to.send(result.map(|()| self.snapshot()));
            }
            CallMessage::GetState { respond_to } => {
                let _ = respond_to.send(Ok(self.snapshot()));
            }
        }
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    async fn handle_accept(
        &mut self,
        user_id: UserId,
        session_id: SessionId,
    ) -> Result<(), CallError> {
        self.ensure_open()?;
        if user_id == self.initiator {
            return Err(CallError::PermissionDenied(
                "The caller cannot accept their own call".to_string(),
            ));
        }
        self.ensure_invited(&user_id)?;

        let now = Utc::now();
        if self.phase == CallPhase::Ringing {
            self.persist_call(CallPatch::active(now)).await?;
            self.phase = CallPhase::Active {
                answered_instant: Instant::now(),
            };
            self.answered_at = Some(now);
            self.ring_deadline = None;
            metrics::record_call_transition("accepted");
            info!(
                target: "cs.actor.call",
                call_id = %self.call_id,
                by = %user_id,
                "Call answered"
            );
        }

        self.record_participant(&user_id, ParticipantPatch::joined(now))
            .await;
        self.invitees
            .insert(user_id.clone(), ParticipantStatus::Joined);
        self.publish_summary();

        self.ctx.registry.join_room(session_id, &self.room).await;
        self.broadcast(
            &self.everyone(),
            ServerEvent::CallAccepted(self.notice(&user_id)),
        )
        .await;
        self.announce_presence(&user_id, session_id).await;
        Ok(())
    }

    async fn handle_reject(&mut self, user_id: UserId) -> Result<(), CallError> {
        self.ensure_open()?;
        if user_id == self.initiator {
            return Err(CallError::PermissionDenied(
                "The caller cannot reject their own call".to_string(),
            ));
        }
        self.ensure_invited(&user_id)?;

        let settles = self.phase == CallPhase::Ringing
            && (!self.is_group_call
                || self
                    .invitees
                    .iter()
                    .all(|(u, s)| u == &user_id || *s == ParticipantStatus::Rejected));

        if settles {
            self.persist_call(CallPatch::settled(CallStatus::Rejected, Utc::now(), 0))
                .await?;
            self.record_participant(&user_id, ParticipantPatch::rejected())
                .await;
            self.invitees
                .insert(user_id.clone(), ParticipantStatus::Rejected);
            self.settle(CallStatus::Rejected, 0, "rejected").await;
            self.broadcast(
                &[self.initiator.clone(), user_id.clone()],
                ServerEvent::CallRejected(self.notice(&user_id)),
            )
            .await;
        } else {
            self.persist_participant(&user_id, ParticipantPatch::rejected())
                .await?;
            self.invitees
                .insert(user_id.clone(), ParticipantStatus::Rejected);
            self.publish_summary();
            // Stop ringing on the rejecter's other devices only.
            self.ctx
                .registry
                .deliver_to_user(&user_id, ServerEvent::CallRejected(self.notice(&user_id)))
                .await;
            debug!(
                target: "cs.actor.call",
                call_id = %self.call_id,
                user_id = %user_id,
                "Group invitee declined"
            );
        }
        Ok(())
    }

    async fn handle_cancel(&mut self, user_id: UserId) -> Result<(), CallError> {
        self.ensure_open()?;
        if user_id != self.initiator {
            return Err(CallError::PermissionDenied(
                "Only the caller can cancel a call".to_string(),
            ));
        }
        if self.phase != CallPhase::Ringing {
            return Err(CallError::conflict(self.phase.status()));
        }

        self.persist_call(CallPatch::settled(CallStatus::Missed, Utc::now(), 0))
            .await?;
        self.notify_missed();
        self.settle(CallStatus::Missed, 0, "cancelled").await;
        self.broadcast(
            &self.everyone(),
            ServerEvent::CallCancelled(self.notice(&user_id)),
        )
        .await;
        Ok(())
    }

    async fn handle_end(&mut self, user_id: UserId) -> Result<(), CallError> {
        self.ensure_open()?;
        self.ensure_member(&user_id)?;

        let phase = self.phase;
        match phase {
            CallPhase::Ringing if user_id == self.initiator => self.handle_cancel(user_id).await,
            CallPhase::Ringing => self.handle_reject(user_id).await,
            CallPhase::Active { .. } => self.end_active(&user_id).await,
            CallPhase::Finished(status) => Err(CallError::conflict(status)),
        }
    }

    async fn handle_leave(&mut self, user_id: UserId) -> Result<(), CallError> {
        self.ensure_open()?;
        self.ensure_member(&user_id)?;

        let phase = self.phase;
        match phase {
            CallPhase::Ringing if user_id == self.initiator => self.handle_cancel(user_id).await,
            CallPhase::Ringing => self.handle_reject(user_id).await,
            CallPhase::Active { .. } => self.leave_active(user_id).await,
            CallPhase::Finished(status) => Err(CallError::conflict(status)),
        }
    }

    async fn handle_join(
        &mut self,
        user_id: UserId,
        session_id: SessionId,
    ) -> Result<(), CallError> {
        self.ensure_open()?;
        self.ensure_member(&user_id)?;
        if !self.is_present(&user_id) {
            return Err(CallError::PermissionDenied(
                "Accept the call before joining it".to_string(),
            ));
        }

        let newly_joined = self.ctx.registry.join_room(session_id, &self.room).await;
        if newly_joined && matches!(self.phase, CallPhase::Active { .. }) {
            self.announce_presence(&user_id, session_id).await;
        }
        Ok(())
    }

    async fn handle_ring_timeout(&mut self) {
        self.ring_deadline = None;
        if self.phase != CallPhase::Ringing {
            return;
        }
        info!(
            target: "cs.actor.call",
            call_id = %self.call_id,
            "Ring timeout elapsed"
        );
        self.settle_missed().await;
    }

    /// An active member leaves. The call ends when fewer than two members
    /// would remain, and always for 1:1 calls.
    async fn leave_active(&mut self, user_id: UserId) -> Result<(), CallError> {
        if !self.is_present(&user_id) {
            if self.invitees.get(&user_id) == Some(&ParticipantStatus::Invited) {
                return self.handle_reject(user_id).await;
            }
            return Err(CallError::Conflict {
                status: Some(CallStatus::Active),
                message: "You are not in this call".to_string(),
            });
        }

        let remaining = self.present_members().len().saturating_sub(1);
        if !self.is_group_call || remaining < 2 {
            return self.end_active(&user_id).await;
        }

        if user_id == self.initiator {
            self.initiator_present = false;
        } else {
            self.persist_participant(&user_id, ParticipantPatch::left(Utc::now()))
                .await?;
            self.invitees
                .insert(user_id.clone(), ParticipantStatus::Left);
        }
        self.publish_summary();

        self.ctx.registry.leave_room_all(&user_id, &self.room).await;
        self.ctx
            .relay
            .relay(
                RelayKind::Leave,
                &user_id,
                None,
                RelayTarget::Room(self.room.clone()),
                self.call_id.clone(),
                body_map(&Presence {
                    user_id: user_id.clone(),
                    should_offer: false,
                }),
            )
            .await;

        info!(
            target: "cs.actor.call",
            call_id = %self.call_id,
            user_id = %user_id,
            remaining,
            "Participant left"
        );
        Ok(())
    }

    async fn end_active(&mut self, by: &UserId) -> Result<(), CallError> {
        let (ended_at, duration) = self.elapsed_since_answer()?;
        self.persist_call(CallPatch::settled(CallStatus::Ended, ended_at, duration))
            .await?;
        self.finish_active(by, ended_at, duration).await;
        Ok(())
    }

    /// Local half of an active call ending. The call patch is already done.
    async fn finish_active(&mut self, by: &UserId, ended_at: DateTime<Utc>, duration: u64) {
        let joined: Vec<UserId> = self
            .invitees
            .iter()
            .filter(|(_, s)| **s == ParticipantStatus::Joined)
            .map(|(u, _)| u.clone())
            .collect();
        for user_id in joined {
            self.record_participant(&user_id, ParticipantPatch::left(ended_at))
                .await;
            self.invitees.insert(user_id, ParticipantStatus::Left);
        }
        self.initiator_present = false;

        self.settle(CallStatus::Ended, duration, "ended").await;
        metrics::record_call_duration(duration);
        self.broadcast(
            &self.everyone(),
            ServerEvent::CallEnded(CallEnded {
                notice: self.notice(by),
                duration,
            }),
        )
        .await;
    }

    /// Settle a ringing call as missed, regardless of persistence.
    async fn settle_missed(&mut self) {
        self.persist_settle(CallPatch::settled(CallStatus::Missed, Utc::now(), 0))
            .await;
        self.notify_missed();
        self.settle(CallStatus::Missed, 0, "missed").await;
        self.broadcast(
            &self.everyone(),
            ServerEvent::CallMissed(self.notice(&self.initiator)),
        )
        .await;
    }

    async fn settle(&mut self, status: CallStatus, duration: u64, transition: &'static str) {
        self.phase = CallPhase::Finished(status);
        self.duration = Some(duration);
        self.ring_deadline = None;
        self.retain_until = Some(Instant::now() + self.ctx.settings.terminal_retention);
        self.publish_summary();
        self.ctx.registry.close_room(&self.room).await;
        self.ctx.metrics.call_settled();
        metrics::record_call_transition(transition);

        info!(
            target: "cs.actor.call",
            call_id = %self.call_id,
            status = %status,
            duration,
            "Call settled"
        );
    }

    /// Settle whatever is still open before exiting.
    async fn graceful_shutdown(&mut self) {
        let phase = self.phase;
        match phase {
            CallPhase::Ringing => {
                info!(
                    target: "cs.actor.call",
                    call_id = %self.call_id,
                    "Settling ringing call on shutdown"
                );
                self.settle_missed().await;
            }
            CallPhase::Active { .. } => {
                info!(
                    target: "cs.actor.call",
                    call_id = %self.call_id,
                    "Ending active call on shutdown"
                );
                let Ok((ended_at, duration)) = self.elapsed_since_answer() else {
                    return;
                };
                self.persist_settle(CallPatch::settled(CallStatus::Ended, ended_at, duration))
                    .await;
                let initiator = self.initiator.clone();
                self.finish_active(&initiator, ended_at, duration).await;
            }
            CallPhase::Finished(_) => {}
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn ensure_open(&self) -> Result<(), CallError> {
        match self.phase {
            CallPhase::Finished(status) => Err(CallError::conflict(status)),
            _ => Ok(()),
        }
    }

    fn ensure_member(&self, user_id: &UserId) -> Result<(), CallError> {
        if user_id == &self.initiator || self.invitees.contains_key(user_id) {
            Ok(())
        } else {
            Err(CallError::ParticipantNotFound(user_id.to_string()))
        }
    }

    /// The invitee has not answered yet.
    fn ensure_invited(&self, user_id: &UserId) -> Result<(), CallError> {
        match self.invitees.get(user_id) {
            None => Err(CallError::ParticipantNotFound(user_id.to_string())),
            Some(ParticipantStatus::Invited) => Ok(()),
            Some(_) => Err(CallError::Conflict {
                status: Some(self.phase.status()),
                message: "You already responded to this call".to_string(),
            }),
        }
    }

    fn is_present(&self, user_id: &UserId) -> bool {
        if user_id == &self.initiator {
            self.initiator_present
        } else {
            self.invitees.get(user_id) == Some(&ParticipantStatus::Joined)
        }
    }

    /// Members currently in the call: the initiator unless they left, plus
    /// joined invitees.
    fn present_members(&self) -> Vec<UserId> {
        let mut members: Vec<UserId> = Vec::with_capacity(self.invitees.len() + 1);
        if self.initiator_present {
            members.push(self.initiator.clone());
        }
        members.extend(
            self.invitees
                .iter()
                .filter(|(_, s)| **s == ParticipantStatus::Joined)
                .map(|(u, _)| u.clone()),
        );
        members
    }

    /// Initiator and every invitee.
    fn everyone(&self) -> Vec<UserId> {
        std::iter::once(self.initiator.clone())
            .chain(self.invitees.keys().cloned())
            .collect()
    }

    fn notice(&self, by: &UserId) -> LifecycleNotice {
        LifecycleNotice {
            call_id: self.call_id.clone(),
            group_id: self.group_id.clone(),
            by_user_id: by.clone(),
        }
    }

    fn elapsed_since_answer(&self) -> Result<(DateTime<Utc>, u64), CallError> {
        let CallPhase::Active { answered_instant } = self.phase else {
            return Err(CallError::conflict(self.phase.status()));
        };
        let duration = answered_instant.elapsed().as_secs();
        let answered_at = self.answered_at.unwrap_or(self.started_at);
        let ended_at = answered_at
            + chrono::Duration::from_std(Duration::from_secs(duration))
                .unwrap_or_else(|_| chrono::Duration::zero());
        Ok((ended_at, duration))
    }

    async fn broadcast(&self, users: &[UserId], event: ServerEvent) {
        for user_id in users {
            self.ctx
                .registry
                .deliver_to_user(user_id, event.clone())
                .await;
        }
    }

    /// Tell the room about a newly present member and tell the member who is
    /// already there. Existing members make the offer.
    async fn announce_presence(&self, user_id: &UserId, session_id: SessionId) {
        self.ctx
            .relay
            .relay(
                RelayKind::Join,
                user_id,
                Some(session_id),
                RelayTarget::Room(self.room.clone()),
                self.call_id.clone(),
                body_map(&Presence {
                    user_id: user_id.clone(),
                    should_offer: true,
                }),
            )
            .await;

        for member in self.present_members() {
            if &member == user_id {
                continue;
            }
            let payload = Relayed {
                from: member.clone(),
                to: RelayTarget::User(user_id.clone()),
                call_id: self.call_id.clone(),
                body: body_map(&Presence {
                    user_id: member,
                    should_offer: false,
                }),
            };
            self.ctx
                .registry
                .deliver_to_session(session_id, ServerEvent::UserJoined(payload))
                .await;
        }
    }

    fn notify_missed(&self) {
        for (user_id, status) in &self.invitees {
            if *status == ParticipantStatus::Invited {
                notify_detached(
                    &self.ctx.notifier,
                    user_id.clone(),
                    CallNotification::MissedCall {
                        call_id: self.call_id.clone(),
                        from: self.initiator.clone(),
                    },
                );
            }
        }
    }

    fn publish_summary(&self) {
        let status = self.phase.status();
        let engaged = if status.is_terminal() {
            BTreeSet::new()
        } else {
            let mut engaged: BTreeSet<UserId> = self
                .invitees
                .iter()
                .filter(|(_, s)| {
                    matches!(s, ParticipantStatus::Invited | ParticipantStatus::Joined)
                })
                .map(|(u, _)| u.clone())
                .collect();
            if self.initiator_present {
                engaged.insert(self.initiator.clone());
            }
            engaged
        };
        self.summary.send_replace(CallSummary { status, engaged });
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: self.call_id.clone(),
            call_type: self.call_type,
            status: self.phase.status(),
            is_group_call: self.is_group_call,
            initiator: self.initiator.clone(),
            group_id: self.group_id.clone(),
            participants: self.invitees.clone(),
            answered_at: self.answered_at,
            duration: self.duration,
        }
    }

    async fn persist_call(&self, patch: CallPatch) -> Result<(), StoreError> {
        let store = &self.ctx.store;
        let call_id = &self.call_id;
        let patch = &patch;
        with_retry("patch_call", move || store.patch_call(call_id, patch))
            .await
            .map(drop)
    }

    /// Persist a settlement the actor applies regardless of the store. A
    /// backend failure leaves it pending for `retry_pending_settle`.
    async fn persist_settle(&mut self, patch: CallPatch) {
        let Err(e) = self.persist_call(patch.clone()).await else {
            return;
        };
        error!(
            target: "cs.actor.call",
            call_id = %self.call_id,
            status = ?patch.status,
            error = %e,
            "Failed to persist settlement"
        );
        if e.is_transient() {
            self.pending_settle = Some(PendingSettle {
                patch,
                retry_at: Instant::now() + SETTLE_RETRY_INITIAL,
                backoff: SETTLE_RETRY_INITIAL,
            });
        }
    }

    async fn retry_pending_settle(&mut self) {
        let Some(mut pending) = self.pending_settle.take() else {
            return;
        };
        match self.persist_call(pending.patch.clone()).await {
            Ok(()) => {
                info!(
                    target: "cs.actor.call",
                    call_id = %self.call_id,
                    status = ?pending.patch.status,
                    "Settlement persisted on retry"
                );
            }
            Err(e) if e.is_transient() => {
                pending.backoff = (pending.backoff * 2).min(SETTLE_RETRY_MAX);
                pending.retry_at = Instant::now() + pending.backoff;
                warn!(
                    target: "cs.actor.call",
                    call_id = %self.call_id,
                    error = %e,
                    backoff_secs = pending.backoff.as_secs(),
                    "Settlement still not persisted"
                );
                self.pending_settle = Some(pending);
            }
            Err(e) => {
                error!(
                    target: "cs.actor.call",
                    call_id = %self.call_id,
                    error = %e,
                    "Store refused settlement, giving up"
                );
            }
        }
    }

    async fn persist_participant(
        &self,
        user_id: &UserId,
        patch: ParticipantPatch,
    ) -> Result<(), StoreError> {
        let store = &self.ctx.store;
        let call_id = &self.call_id;
        let patch = &patch;
        with_retry("patch_participant", move || {
            store.patch_participant(call_id, user_id, patch)
        })
        .await
        .map(drop)
    }

    /// Participant write that must not block the call-level transition.
    async fn record_participant(&self, user_id: &UserId, patch: ParticipantPatch) {
        if let Err(e) = self.persist_participant(user_id, patch).await {
            warn!(
                target: "cs.actor.call",
                call_id = %self.call_id,
                user_id = %user_id,
                error = %e,
                "Failed to persist participant update"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::notify::LogNotifier;
    use crate::store::MemoryCallStore;

    struct Harness {
        registry: Arc<SessionRegistry>,
        store: Arc<MemoryCallStore>,
        ctx: CallContext,
    }

    fn harness() -> Harness {
        let registry = Arc::new(SessionRegistry::new());
        let store = Arc::new(MemoryCallStore::new());
        let ctx = CallContext {
            registry: Arc::clone(&registry),
            relay: SignalingRelay::new(Arc::clone(&registry)),
            store: Arc::clone(&store) as Arc<dyn CallRecordStore>,
            notifier: Arc::new(LogNotifier),
            metrics: ActorMetrics::new(),
            settings: CallSettings::default(),
        };
        Harness {
            registry,
            store,
            ctx,
        }
    }

    async fn session(h: &Harness, user: &str) -> (SessionId, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(32);
        let id = h.registry.connect(tx).await;
        h.registry.register_user(id, UserId::from(user)).await;
        (id, rx)
    }

    async fn start(
        h: &Harness,
        call_id: &str,
        initiator_session: SessionId,
        invitees: &[&str],
    ) -> (CallActorHandle, JoinHandle<()>) {
        let (tx, rx) = oneshot::channel();
        let (handle, task, _summary) = CallActor::spawn(
            StartCall {
                call_id: CallId::from(call_id),
                call_type: CallType::Video,
                initiator: UserId::from("alice"),
                initiator_session: Some(initiator_session),
                invitees: invitees.iter().map(|u| UserId::from(*u)).collect(),
                group_id: None,
            },
            h.ctx.clone(),
            CancellationToken::new(),
            tx,
        );
        let snapshot = rx.await.unwrap().unwrap();
        assert_eq!(snapshot.status, CallStatus::Initiated);
        (handle, task)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn names(events: &[ServerEvent]) -> Vec<&'static str> {
        events.iter().map(ServerEvent::name).collect()
    }

    #[tokio::test]
    async fn test_start_rings_invitee_and_persists() {
        let h = harness();
        let (alice, _rx_a) = session(&h, "alice").await;
        let (_bob, mut rx_b) = session(&h, "bob").await;

        let (_handle, _task) = start(&h, "c1", alice, &["bob"]).await;

        match rx_b.try_recv().unwrap() {
            ServerEvent::IncomingCall(incoming) => {
                assert_eq!(incoming.by_user_id, UserId::from("alice"));
                assert!(!incoming.is_group_call);
            }
            other => unreachable!("unexpected {other:?}"),
        }
        let record = h.store.get_call(&CallId::from("c1")).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Initiated);
        assert!(h
            .registry
            .resolve_room_sessions(&RoomId::for_call(&CallId::from("c1")))
            .await
            .contains(&alice));
    }

    #[tokio::test]
    async fn test_accept_activates_and_exchanges_presence() {
        let h = harness();
        let (alice, mut rx_a) = session(&h, "alice").await;
        let (bob, mut rx_b) = session(&h, "bob").await;
        let (handle, _task) = start(&h, "c1", alice, &["bob"]).await;
        drain(&mut rx_b);

        let snapshot = handle.accept(UserId::from("bob"), bob).await.unwrap();

        assert_eq!(snapshot.status, CallStatus::Active);
        assert_eq!(
            snapshot.participants.get(&UserId::from("bob")),
            Some(&ParticipantStatus::Joined)
        );

        let to_alice = drain(&mut rx_a);
        assert_eq!(names(&to_alice), vec!["call-accepted", "call:user-joined"]);
        if let ServerEvent::UserJoined(joined) = &to_alice[1] {
            let presence: Presence = joined.body_as().unwrap();
            assert_eq!(presence.user_id, UserId::from("bob"));
            assert!(presence.should_offer, "existing member makes the offer");
        }

        let to_bob = drain(&mut rx_b);
        assert_eq!(names(&to_bob), vec!["call-accepted", "call:user-joined"]);
        if let ServerEvent::UserJoined(joined) = &to_bob[1] {
            let presence: Presence = joined.body_as().unwrap();
            assert_eq!(presence.user_id, UserId::from("alice"));
            assert!(!presence.should_offer);
        }

        let record = h.store.get_call(&CallId::from("c1")).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Active);
        assert!(record.answered_at.is_some());
    }

    #[tokio::test]
    async fn test_accept_rejections() {
        let h = harness();
        let (alice, _rx_a) = session(&h, "alice").await;
        let (bob, _rx_b) = session(&h, "bob").await;
        let (handle, _task) = start(&h, "c1", alice, &["bob"]).await;

        let result = handle.accept(UserId::from("alice"), alice).await;
        assert!(matches!(result, Err(CallError::PermissionDenied(_))));

        let result = handle.accept(UserId::from("mallory"), bob).await;
        assert!(matches!(result, Err(CallError::ParticipantNotFound(_))));

        handle.accept(UserId::from("bob"), bob).await.unwrap();
        let result = handle.accept(UserId::from("bob"), bob).await;
        assert!(matches!(result, Err(CallError::Conflict { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ring_timeout_marks_missed() {
        let h = harness();
        let (alice, mut rx_a) = session(&h, "alice").await;
        let (bob, mut rx_b) = session(&h, "bob").await;
        let (handle, _task) = start(&h, "c1", alice, &["bob"]).await;
        drain(&mut rx_b);

        tokio::time::sleep(Duration::from_secs(DEFAULT_RING_TIMEOUT_SECONDS + 1)).await;

        assert_eq!(names(&drain(&mut rx_a)), vec!["call-missed"]);
        assert_eq!(names(&drain(&mut rx_b)), vec!["call-missed"]);
        let record = h.store.get_call(&CallId::from("c1")).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Missed);
        assert_eq!(record.duration, Some(0));

        let late = handle.accept(UserId::from("bob"), bob).await;
        match late {
            Err(CallError::Conflict { status, .. }) => assert_eq!(status, Some(CallStatus::Missed)),
            other => unreachable!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_reports_whole_seconds() {
        let h = harness();
        let (alice, mut rx_a) = session(&h, "alice").await;
        let (bob, _rx_b) = session(&h, "bob").await;
        let (handle, _task) = start(&h, "c1", alice, &["bob"]).await;
        handle.accept(UserId::from("bob"), bob).await.unwrap();
        drain(&mut rx_a);

        tokio::time::advance(Duration::from_millis(30_700)).await;
        let snapshot = handle.end(UserId::from("bob")).await.unwrap();

        assert_eq!(snapshot.status, CallStatus::Ended);
        assert_eq!(snapshot.duration, Some(30));
        match drain(&mut rx_a).first() {
            Some(ServerEvent::CallEnded(ended)) => {
                assert_eq!(ended.duration, 30);
                assert_eq!(ended.notice.by_user_id, UserId::from("bob"));
            }
            other => unreachable!("unexpected {other:?}"),
        }
        let record = h.store.get_call(&CallId::from("c1")).await.unwrap().unwrap();
        assert_eq!(record.duration, Some(30));
        let participants = h.store.list_participants(&CallId::from("c1")).await.unwrap();
        assert_eq!(participants[0].status, ParticipantStatus::Left);
    }

    #[tokio::test]
    async fn test_one_to_one_reject_settles_rejected() {
        let h = harness();
        let (alice, mut rx_a) = session(&h, "alice").await;
        let (_bob, mut rx_b) = session(&h, "bob").await;
        let (handle, _task) = start(&h, "c1", alice, &["bob"]).await;
        drain(&mut rx_b);

        let snapshot = handle.reject(UserId::from("bob")).await.unwrap();

        assert_eq!(snapshot.status, CallStatus::Rejected);
        assert_eq!(snapshot.duration, Some(0));
        assert_eq!(names(&drain(&mut rx_a)), vec!["call-rejected"]);
        assert_eq!(names(&drain(&mut rx_b)), vec!["call-rejected"]);
    }

    #[tokio::test]
    async fn test_group_rejection_needs_everyone() {
        let h = harness();
        let (alice, mut rx_a) = session(&h, "alice").await;
        let (handle, _task) = start(&h, "g1", alice, &["bob", "carol"]).await;

        let snapshot = handle.reject(UserId::from("bob")).await.unwrap();
        assert_eq!(snapshot.status, CallStatus::Initiated);
        assert!(drain(&mut rx_a).is_empty(), "caller keeps ringing others");

        let snapshot = handle.reject(UserId::from("carol")).await.unwrap();
        assert_eq!(snapshot.status, CallStatus::Rejected);
        assert_eq!(names(&drain(&mut rx_a)), vec!["call-rejected"]);
    }

    #[tokio::test]
    async fn test_cancel_rules() {
        let h = harness();
        let (alice, _rx_a) = session(&h, "alice").await;
        let (bob, mut rx_b) = session(&h, "bob").await;

        let (handle, _task) = start(&h, "c1", alice, &["bob"]).await;
        let result = handle.cancel_call(UserId::from("bob")).await;
        assert!(matches!(result, Err(CallError::PermissionDenied(_))));

        drain(&mut rx_b);
        let snapshot = handle.cancel_call(UserId::from("alice")).await.unwrap();
        assert_eq!(snapshot.status, CallStatus::Missed);
        assert_eq!(names(&drain(&mut rx_b)), vec!["call-cancelled"]);

        let (handle, _task) = start(&h, "c2", alice, &["bob"]).await;
        handle.accept(UserId::from("bob"), bob).await.unwrap();
        let result = handle.cancel_call(UserId::from("alice")).await;
        match result {
            Err(CallError::Conflict { status, .. }) => assert_eq!(status, Some(CallStatus::Active)),
            other => unreachable!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_group_call_survives_until_one_member_remains() {
        let h = harness();
        let (alice, mut rx_a) = session(&h, "alice").await;
        let (bob, _rx_b) = session(&h, "bob").await;
        let (carol, mut rx_c) = session(&h, "carol").await;
        let (handle, _task) = start(&h, "g1", alice, &["bob", "carol"]).await;
        handle.accept(UserId::from("bob"), bob).await.unwrap();
        handle.accept(UserId::from("carol"), carol).await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_c);

        let snapshot = handle.leave(UserId::from("bob")).await.unwrap();
        assert_eq!(snapshot.status, CallStatus::Active);
        assert_eq!(names(&drain(&mut rx_a)), vec!["call:user-left"]);
        assert_eq!(names(&drain(&mut rx_c)), vec!["call:user-left"]);

        let snapshot = handle.leave(UserId::from("carol")).await.unwrap();
        assert_eq!(snapshot.status, CallStatus::Ended);
        assert_eq!(names(&drain(&mut rx_a)), vec!["call-ended"]);
    }

    #[tokio::test]
    async fn test_ringing_initiator_leave_is_cancel() {
        let h = harness();
        let (alice, _rx_a) = session(&h, "alice").await;
        let (_bob, mut rx_b) = session(&h, "bob").await;
        let (handle, _task) = start(&h, "c1", alice, &["bob"]).await;
        drain(&mut rx_b);

        let snapshot = handle.leave(UserId::from("alice")).await.unwrap();

        assert_eq!(snapshot.status, CallStatus::Missed);
        assert_eq!(names(&drain(&mut rx_b)), vec!["call-cancelled"]);
    }

    #[tokio::test]
    async fn test_cancellation_settles_ringing_call() {
        let h = harness();
        let (alice, _rx_a) = session(&h, "alice").await;
        let (handle, task) = start(&h, "c1", alice, &["bob"]).await;

        handle.cancel();
        task.await.unwrap();

        let record = h.store.get_call(&CallId::from("c1")).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Missed);
        assert!(handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_exits_after_retention() {
        let h = harness();
        let (alice, _rx_a) = session(&h, "alice").await;
        let (handle, task) = start(&h, "c1", alice, &["bob"]).await;
        handle.cancel_call(UserId::from("alice")).await.unwrap();

        tokio::time::sleep(Duration::from_secs(DEFAULT_TERMINAL_RETENTION_SECONDS + 1)).await;

        task.await.unwrap();
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_duplicate_call_id_fails_start() {
        let h = harness();
        let (alice, _rx_a) = session(&h, "alice").await;
        let (_handle, _task) = start(&h, "c1", alice, &["bob"]).await;

        let (tx, rx) = oneshot::channel();
        let (_dup, task, summary) = CallActor::spawn(
            StartCall {
                call_id: CallId::from("c1"),
                call_type: CallType::Audio,
                initiator: UserId::from("carol"),
                initiator_session: None,
                invitees: vec![UserId::from("dave")],
                group_id: None,
            },
            h.ctx.clone(),
            CancellationToken::new(),
            tx,
        );

        assert!(matches!(rx.await.unwrap(), Err(CallError::Conflict { .. })));
        task.await.unwrap();
        assert!(summary.borrow().engaged.is_empty());
    }
}
