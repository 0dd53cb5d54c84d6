//! Fakes for the controller's platform seams.
//!
//! Enabled for unit tests and behind the `test-utils` feature for
//! downstream crates.

use crate::errors::ClientError;
use crate::media::{LocalMedia, MediaConstraints, MediaDevices, MediaTrack, TrackKind};
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerEventSink};
use crate::quality::IceConnectionState;
use crate::signaling::SignalingSink;
use call_protocol::{ClientEvent, IceCandidate, SdpType, SessionDescription};
use common::types::UserId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Media
// ----------------------------------------------------------------------------

/// Devices that hand out fake tracks and count the live ones.
#[derive(Debug, Default)]
pub struct FakeMediaDevices {
    deny: AtomicBool,
    live_tracks: Arc<AtomicUsize>,
    enabled: Arc<Mutex<HashMap<TrackKind, bool>>>,
}

impl FakeMediaDevices {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every later open fails with `MediaAccessDenied`.
    pub fn deny(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    /// Tracks opened and not yet stopped.
    #[must_use]
    pub fn live_tracks(&self) -> usize {
        self.live_tracks.load(Ordering::SeqCst)
    }

    /// Last enabled flag set for camera/microphone tracks of `kind`.
    #[must_use]
    pub fn enabled(&self, kind: TrackKind) -> Option<bool> {
        lock(&self.enabled).get(&kind).copied()
    }

    fn open(&self, tracks: Vec<MediaTrack>, record_enabled: bool) -> Box<dyn LocalMedia> {
        self.live_tracks.fetch_add(tracks.len(), Ordering::SeqCst);
        Box::new(FakeMedia {
            tracks,
            live_tracks: Arc::clone(&self.live_tracks),
            enabled: record_enabled.then(|| Arc::clone(&self.enabled)),
            stopped: AtomicBool::new(false),
        })
    }
}

#[async_trait::async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn open_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Box<dyn LocalMedia>, ClientError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(ClientError::MediaAccessDenied("permission denied".to_string()));
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack {
                id: "mic".to_string(),
                kind: TrackKind::Audio,
            });
        }
        if constraints.video {
            tracks.push(MediaTrack {
                id: "camera".to_string(),
                kind: TrackKind::Video,
            });
        }
        Ok(self.open(tracks, true))
    }

    async fn open_display_media(&self) -> Result<Box<dyn LocalMedia>, ClientError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(ClientError::MediaAccessDenied("capture declined".to_string()));
        }
        let tracks = vec![MediaTrack {
            id: "screen".to_string(),
            kind: TrackKind::Video,
        }];
        Ok(self.open(tracks, false))
    }
}

struct FakeMedia {
    tracks: Vec<MediaTrack>,
    live_tracks: Arc<AtomicUsize>,
    enabled: Option<Arc<Mutex<HashMap<TrackKind, bool>>>>,
    stopped: AtomicBool,
}

impl LocalMedia for FakeMedia {
    fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.clone()
    }

    fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        if let Some(map) = &self.enabled {
            lock(map).insert(kind, enabled);
        }
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.live_tracks.fetch_sub(self.tracks.len(), Ordering::SeqCst);
        }
    }
}

// ----------------------------------------------------------------------------
// Peer connections
// ----------------------------------------------------------------------------

/// Operation applied to a [`FakePeer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOp {
    AddTrack(String),
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    ReplaceVideo(Option<String>),
    Close,
}

/// Records every operation and lets tests emit peer events.
#[derive(Debug)]
pub struct FakePeer {
    sink: PeerEventSink,
    ops: Mutex<Vec<PeerOp>>,
}

impl FakePeer {
    #[must_use]
    pub fn remote(&self) -> &UserId {
        self.sink.remote()
    }

    #[must_use]
    pub fn ops(&self) -> Vec<PeerOp> {
        lock(&self.ops).clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.ops().contains(&PeerOp::Close)
    }

    /// Report a connectivity change, as the WebRTC stack would.
    pub fn emit_state(&self, state: IceConnectionState) {
        self.sink.state_changed(state);
    }

    pub fn emit_candidate(&self, candidate: &str) {
        self.sink.local_candidate(IceCandidate {
            candidate: candidate.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        });
    }

    fn record(&self, op: PeerOp) {
        lock(&self.ops).push(op);
    }
}

#[async_trait::async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), ClientError> {
        self.record(PeerOp::AddTrack(track.id.clone()));
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, ClientError> {
        self.record(PeerOp::CreateOffer { ice_restart });
        Ok(SessionDescription {
            sdp_type: SdpType::Offer,
            sdp: format!("v=0 offer restart={ice_restart}"),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, ClientError> {
        self.record(PeerOp::CreateAnswer);
        Ok(SessionDescription {
            sdp_type: SdpType::Answer,
            sdp: "v=0 answer".to_string(),
        })
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ClientError> {
        self.record(PeerOp::SetLocal(description.sdp_type));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ClientError> {
        self.record(PeerOp::SetRemote(description.sdp_type));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ClientError> {
        self.record(PeerOp::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<&MediaTrack>) -> Result<(), ClientError> {
        self.record(PeerOp::ReplaceVideo(track.map(|t| t.id.clone())));
        Ok(())
    }

    async fn close(&self) {
        self.record(PeerOp::Close);
    }
}

/// Creates [`FakePeer`]s and keeps them for inspection.
#[derive(Debug, Default)]
pub struct FakePeerFactory {
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn created(&self) -> usize {
        lock(&self.peers).len()
    }

    /// Most recent peer created for `remote`.
    #[must_use]
    pub fn peer_for(&self, remote: &str) -> Option<Arc<FakePeer>> {
        lock(&self.peers)
            .iter()
            .rev()
            .find(|p| p.remote().as_str() == remote)
            .cloned()
    }
}

#[async_trait::async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, ClientError> {
        let peer = Arc::new(FakePeer {
            sink: events,
            ops: Mutex::new(Vec::new()),
        });
        lock(&self.peers).push(Arc::clone(&peer));
        Ok(peer)
    }
}

// ----------------------------------------------------------------------------
// Signaling
// ----------------------------------------------------------------------------

/// Signaling sink that keeps every frame.
#[derive(Debug, Default)]
pub struct RecordingSignaling {
    sent: Mutex<Vec<ClientEvent>>,
    fail: AtomicBool,
}

impl RecordingSignaling {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every later send fails.
    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn sent(&self) -> Vec<ClientEvent> {
        lock(&self.sent).clone()
    }

    /// Wire names of the frames sent so far.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        lock(&self.sent).iter().map(ClientEvent::name).collect()
    }
}

#[async_trait::async_trait]
impl SignalingSink for RecordingSignaling {
    async fn send(&self, event: ClientEvent) -> Result<(), ClientError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ClientError::Signaling("transport closed".to_string()));
        }
        lock(&self.sent).push(event);
        Ok(())
    }
}
