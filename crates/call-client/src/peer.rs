//! Peer connection seam and per-remote link state.
//!
//! The controller never registers callbacks on a peer connection. The
//! implementation reports local ICE candidates and connectivity changes
//! through a [`PeerEventSink`], which turns them into controller inputs
//! consumed by the same dispatch function as everything else.

use crate::errors::ClientError;
use crate::media::MediaTrack;
use crate::quality::{ConnectionQuality, IceConnectionState};
use call_protocol::{IceCandidate, SessionDescription};
use common::types::UserId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Something a peer connection observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Trickle this candidate to the remote.
    LocalCandidate(IceCandidate),
    StateChanged(IceConnectionState),
}

/// Peer events tagged with the remote they concern.
pub(crate) type PeerEventSender = mpsc::UnboundedSender<(UserId, PeerEvent)>;

/// Reports peer events back to the owning controller. Cheap to clone and
/// callable from any thread. Events are never dropped while the controller
/// runs, so ICE state changes arrive complete and in order.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    remote: UserId,
    tx: PeerEventSender,
}

impl PeerEventSink {
    pub(crate) fn new(remote: UserId, tx: PeerEventSender) -> Self {
        Self { remote, tx }
    }

    #[must_use]
    pub fn remote(&self) -> &UserId {
        &self.remote
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.emit(PeerEvent::LocalCandidate(candidate));
    }

    pub fn state_changed(&self, state: IceConnectionState) {
        self.emit(PeerEvent::StateChanged(state));
    }

    fn emit(&self, event: PeerEvent) {
        if self.tx.send((self.remote.clone(), event)).is_err() {
            debug!(
                target: "cc.peer",
                remote = %self.remote,
                "Controller stopped, peer event ignored"
            );
        }
    }
}

/// One WebRTC peer connection to one remote participant.
#[async_trait::async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), ClientError>;

    /// `ice_restart` gathers fresh credentials on an existing connection.
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, ClientError>;

    async fn create_answer(&self) -> Result<SessionDescription, ClientError>;

    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), ClientError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ClientError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ClientError>;

    /// Swap the outgoing video track in place without renegotiating.
    async fn replace_video_track(&self, track: Option<&MediaTrack>) -> Result<(), ClientError>;

    async fn close(&self);
}

#[async_trait::async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, ClientError>;
}

/// Whether the one automatic ICE restart was spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceRestart {
    Unused,
    Scheduled(Instant),
    Used,
}

/// Controller-side state for one remote participant's connection.
pub struct PeerLink {
    pub remote: UserId,
    pub connection: Arc<dyn PeerConnection>,
    /// This side created the first offer, and so owns ICE restarts.
    pub offerer: bool,
    pub state: IceConnectionState,
    pub restart: IceRestart,
    pub remote_described: bool,
    /// Remote candidates held until the remote description is set.
    pub pending_candidates: Vec<IceCandidate>,
}

impl PeerLink {
    #[must_use]
    pub fn new(remote: UserId, connection: Arc<dyn PeerConnection>, offerer: bool) -> Self {
        Self {
            remote,
            connection,
            offerer,
            state: IceConnectionState::New,
            restart: IceRestart::Unused,
            remote_described: false,
            pending_candidates: Vec::new(),
        }
    }

    #[must_use]
    pub fn restart_deadline(&self) -> Option<Instant> {
        match self.restart {
            IceRestart::Scheduled(at) => Some(at),
            IceRestart::Unused | IceRestart::Used => None,
        }
    }

    /// Quality shown for this link. While a restart is pending the link is
    /// shown as `fair` rather than `poor`.
    #[must_use]
    pub fn quality(&self) -> ConnectionQuality {
        match self.restart {
            IceRestart::Scheduled(_) => ConnectionQuality::Fair,
            IceRestart::Unused | IceRestart::Used => ConnectionQuality::from_ice_state(self.state),
        }
    }

    /// The link is degraded and the restart has already been spent.
    #[must_use]
    pub fn reconnecting(&self) -> bool {
        self.restart == IceRestart::Used && self.state == IceConnectionState::Disconnected
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("remote", &self.remote)
            .field("offerer", &self.offerer)
            .field("state", &self.state)
            .field("restart", &self.restart)
            .finish_non_exhaustive()
    }
}
