//! `CallSupervisorActor` - singleton supervisor for call actors.
//!
//! - Owns the call id to `CallActorHandle` map
//! - Validates `start_call` requests (draining, capacity, busy, duplicates)
//! - Reaps actors that exited after retention, and detects panics
//! - Owns the root `CancellationToken`; every call actor gets a child token
//!
//! # Graceful Shutdown
//!
//! `shutdown(deadline)` stops accepting calls, cancels every call actor, waits
//! for each to settle its call within the deadline, then cancels itself.

use super::call::{CallActor, CallActorHandle, CallContext};
use super::messages::{
    CallReply, CallSnapshot, CallSummary, StartCall, SupervisorMessage, SupervisorStatus,
};
use super::metrics::{ActorType, MailboxMonitor};
use crate::errors::CallError;
use crate::store::CallRecordStore;

use common::types::{CallId, UserId};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Channel buffer size for the supervisor mailbox.
const SUPERVISOR_CHANNEL_BUFFER: usize = 1000;

/// How often finished call actors are reaped.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Wait applied to each call actor when shutting down without a deadline.
const ACTOR_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to the `CallSupervisorActor`.
#[derive(Clone)]
pub struct CallSupervisorHandle {
    sender: mpsc::Sender<SupervisorMessage>,
    cancel_token: CancellationToken,
    ctx: CallContext,
}

impl CallSupervisorHandle {
    /// Spawn the supervisor and return a handle to it.
    #[must_use]
    pub fn new(instance_id: String, ctx: CallContext, max_active_calls: usize) -> Self {
        let (sender, receiver) = mpsc::channel(SUPERVISOR_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = CallSupervisorActor {
            mailbox: MailboxMonitor::new(ActorType::Supervisor, &instance_id),
            instance_id,
            receiver,
            cancel_token: cancel_token.clone(),
            calls: HashMap::new(),
            accepting_new: true,
            max_active_calls,
            ctx: ctx.clone(),
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            ctx,
        }
    }

    /// Start a call. Resolves once the call is persisted and invitees rung.
    pub async fn start_call(&self, request: StartCall) -> Result<CallSnapshot, CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorMessage::StartCall {
                request,
                respond_to: tx,
            })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Look up the live actor for a call.
    ///
    /// Calls whose actor already retired resolve through the store: a settled
    /// record gives `Conflict`, anything else `CallNotFound`.
    pub async fn get_call(&self, call_id: &CallId) -> Result<CallActorHandle, CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorMessage::GetCall {
                call_id: call_id.clone(),
                respond_to: tx,
            })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        match rx
            .await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
        {
            Some(handle) => Ok(handle),
            None => Err(self.retired_call_error(call_id).await),
        }
    }

    /// Error for a transition on a call with no live actor.
    pub async fn retired_call_error(&self, call_id: &CallId) -> CallError {
        match self.ctx.store.get_call(call_id).await {
            Ok(Some(record)) if record.status.is_terminal() => CallError::conflict(record.status),
            Ok(_) => CallError::CallNotFound(call_id.to_string()),
            Err(e) => CallError::Store(e),
        }
    }

    pub async fn get_status(&self) -> Result<SupervisorStatus, CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop accepting calls and settle every live call within `deadline`.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorMessage::Shutdown {
                deadline,
                respond_to: tx,
            })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cancel the supervisor and, through child tokens, every call actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

struct ManagedCall {
    handle: CallActorHandle,
    task_handle: JoinHandle<()>,
    summary: watch::Receiver<CallSummary>,
    created_at: Instant,
}

impl ManagedCall {
    fn is_settled(&self) -> bool {
        self.summary.borrow().status.is_terminal()
    }

    /// First of `users` still engaged in this call.
    fn engaged_user<'a>(&self, users: &'a [UserId]) -> Option<&'a UserId> {
        let summary = self.summary.borrow();
        if summary.status.is_terminal() {
            return None;
        }
        users.iter().find(|u| summary.engaged.contains(*u))
    }
}

pub struct CallSupervisorActor {
    instance_id: String,
    receiver: mpsc::Receiver<SupervisorMessage>,
    cancel_token: CancellationToken,
    calls: HashMap<CallId, ManagedCall>,
    accepting_new: bool,
    max_active_calls: usize,
    ctx: CallContext,
    mailbox: MailboxMonitor,
}

impl CallSupervisorActor {
    #[instrument(skip_all, name = "cs.actor.supervisor", fields(instance_id = %self.instance_id))]
    async fn run(mut self) {
        info!(
            target: "cs.actor.supervisor",
            instance_id = %self.instance_id,
            max_active_calls = self.max_active_calls,
            "CallSupervisorActor started"
        );

        let mut health_check = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        health_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "cs.actor.supervisor",
                        instance_id = %self.instance_id,
                        "CallSupervisorActor received cancellation signal"
                    );
                    self.drain_calls(ACTOR_SHUTDOWN_TIMEOUT).await;
                    break;
                }

                _ = health_check.tick() => {
                    self.check_call_health().await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_received(self.receiver.len() + 1);
                            self.handle_message(message).await;
                            self.mailbox.record_handled(self.receiver.len());
                            self.ctx.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "cs.actor.supervisor",
                                instance_id = %self.instance_id,
                                "CallSupervisorActor channel closed, exiting"
                            );
                            self.drain_calls(ACTOR_SHUTDOWN_TIMEOUT).await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "cs.actor.supervisor",
            instance_id = %self.instance_id,
            calls_remaining = self.calls.len(),
            messages_processed = self.mailbox.messages_processed(),
            "CallSupervisorActor stopped"
        );
    }

    async fn handle_message(&mut self, message: SupervisorMessage) {
        match message {
            SupervisorMessage::StartCall {
                request,
                respond_to,
            } => {
                // A retry may reuse the id of an attempt whose actor already exited.
                if self
                    .calls
                    .get(&request.call_id)
                    .is_some_and(|managed| managed.task_handle.is_finished())
                {
                    self.retire(&request.call_id).await;
                }
                match self.validate(request) {
                    // The actor answers once the call is persisted.
                    Ok(request) => self.spawn_call(request, respond_to),
                    Err(e) => {
                        let _ = respond_to.send(Err(e));
                    }
                }
            }

            SupervisorMessage::GetCall {
                call_id,
                respond_to,
            } => {
                let handle = self
                    .calls
                    .get(&call_id)
                    .filter(|managed| !managed.handle.is_closed())
                    .map(|managed| managed.handle.clone());
                let _ = respond_to.send(handle);
            }

            SupervisorMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            SupervisorMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                info!(
                    target: "cs.actor.supervisor",
                    instance_id = %self.instance_id,
                    call_count = self.calls.len(),
                    deadline_secs = deadline.as_secs(),
                    "Initiating graceful shutdown"
                );
                self.drain_calls(deadline).await;
                self.cancel_token.cancel();
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    /// Check a start request against the current call set.
    fn validate(&self, mut request: StartCall) -> Result<StartCall, CallError> {
        if !self.accepting_new {
            return Err(CallError::Draining);
        }
        if request.call_id.as_str().is_empty() {
            return Err(CallError::InvalidRequest(
                "callId must not be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        request.invitees.retain(|u| seen.insert(u.clone()));
        if request.invitees.is_empty() {
            return Err(CallError::InvalidRequest(
                "A call needs at least one invitee".to_string(),
            ));
        }
        if request.invitees.contains(&request.initiator) {
            return Err(CallError::InvalidRequest(
                "The caller cannot invite themselves".to_string(),
            ));
        }

        if let Some(existing) = self.calls.get(&request.call_id) {
            let status = existing.summary.borrow().status;
            return Err(CallError::Conflict {
                status: Some(status),
                message: "Call already exists".to_string(),
            });
        }

        let unsettled = self.calls.values().filter(|m| !m.is_settled()).count();
        if unsettled >= self.max_active_calls {
            warn!(
                target: "cs.actor.supervisor",
                instance_id = %self.instance_id,
                unsettled,
                max_active_calls = self.max_active_calls,
                "Call rejected at capacity"
            );
            return Err(CallError::CapacityExceeded);
        }

        let mut users = Vec::with_capacity(request.invitees.len() + 1);
        users.push(request.initiator.clone());
        users.extend(request.invitees.iter().cloned());
        if let Some(user) = self
            .calls
            .values()
            .filter(|m| !m.task_handle.is_finished())
            .find_map(|m| m.engaged_user(&users))
        {
            return Err(CallError::Busy(user.to_string()));
        }


        Ok(request)
    }

    fn spawn_call(&mut self, request: StartCall, respond_to: CallReply) {
        let call_id = request.call_id.clone();
        debug!(
            target: "cs.actor.supervisor",
            instance_id = %self.instance_id,
            call_id = %call_id,
            "Spawning call actor"
        );

        let (handle, task_handle, summary) = CallActor::spawn(
            request,
            self.ctx.clone(),
            self.cancel_token.child_token(),
            respond_to,
        );

        self.calls.insert(
            call_id.clone(),
            ManagedCall {
                handle,
                task_handle,
                summary,
                created_at: Instant::now(),
            },
        );
        self.ctx.metrics.call_started();

        info!(
            target: "cs.actor.supervisor",
            instance_id = %self.instance_id,
            call_id = %call_id,
            total_calls = self.calls.len(),
            "Call actor created"
        );
    }

    fn get_status(&self) -> SupervisorStatus {
        SupervisorStatus {
            call_count: self.calls.len(),
            unsettled_count: self.calls.values().filter(|m| !m.is_settled()).count(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    /// Cancel every call actor and wait for each to settle its call.
    async fn drain_calls(&mut self, deadline: Duration) {
        self.accepting_new = false;
        let deadline = Instant::now() + deadline;

        for (call_id, managed) in &self.calls {
            debug!(
                target: "cs.actor.supervisor",
                instance_id = %self.instance_id,
                call_id = %call_id,
                "Cancelling call actor"
            );
            managed.handle.cancel();
        }

        for (call_id, managed) in self.calls.drain() {
            match tokio::time::timeout_at(deadline, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "cs.actor.supervisor",
                        instance_id = %self.instance_id,
                        call_id = %call_id,
                        "Call actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "cs.actor.supervisor",
                        instance_id = %self.instance_id,
                        call_id = %call_id,
                        error = ?e,
                        "Call actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "cs.actor.supervisor",
                        instance_id = %self.instance_id,
                        call_id = %call_id,
                        "Call actor shutdown timed out"
                    );
                }
            }
            self.ctx.metrics.call_removed();
        }

        info!(
            target: "cs.actor.supervisor",
            instance_id = %self.instance_id,
            "Graceful shutdown complete"
        );
    }

    /// Remove call actors whose task has finished.
    async fn check_call_health(&mut self) {
        let finished: Vec<CallId> = self
            .calls
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(call_id, _)| call_id.clone())
            .collect();

        for call_id in finished {
            self.retire(&call_id).await;
        }
    }

    /// Drop a finished call actor from the map and account for how it ended.
    async fn retire(&mut self, call_id: &CallId) {
        let Some(managed) = self.calls.remove(call_id) else {
            return;
        };
        let lifetime = managed.created_at.elapsed();
        match managed.task_handle.await {
            Ok(()) => {
                debug!(
                    target: "cs.actor.supervisor",
                    instance_id = %self.instance_id,
                    call_id = %call_id,
                    lifetime_secs = lifetime.as_secs(),
                    "Call actor retired"
                );
            }
            Err(join_error) => {
                if join_error.is_panic() {
                    error!(
                        target: "cs.actor.supervisor",
                        instance_id = %self.instance_id,
                        call_id = %call_id,
                        error = ?join_error,
                        "Call actor panicked"
                    );
                    self.ctx.metrics.record_panic(ActorType::Call);
                }
            }
        }
        self.ctx.metrics.call_removed();
    }
}
