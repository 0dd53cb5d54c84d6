//! Local media acquisition.
//!
//! Capture is scoped: [`MediaDevices`] hands back a [`MediaGuard`] that stops
//! every track when dropped, so devices are released on every exit path of
//! the controller, including errors and task cancellation.

use crate::errors::ClientError;
use call_protocol::CallType;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Handle to one outgoing track, as understood by the peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// What to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    #[must_use]
    pub fn for_call(call_type: CallType) -> Self {
        Self {
            audio: true,
            video: call_type == CallType::Video,
        }
    }
}

/// A live capture (camera plus microphone, or a screen).
pub trait LocalMedia: Send + Sync {
    fn tracks(&self) -> Vec<MediaTrack>;

    /// Mute or unmute every track of `kind` without releasing the device.
    fn set_enabled(&self, kind: TrackKind, enabled: bool);

    /// Release the underlying devices. Called once.
    fn stop(&self);
}

/// Device access.
#[async_trait::async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open camera and/or microphone.
    async fn open_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Box<dyn LocalMedia>, ClientError>;

    /// Open a screen capture (video only).
    async fn open_display_media(&self) -> Result<Box<dyn LocalMedia>, ClientError>;
}

/// Owns a capture and stops it on drop.
pub struct MediaGuard {
    media: Box<dyn LocalMedia>,
}

impl MediaGuard {
    /// Acquire user media for a call of `call_type`.
    ///
    /// # Errors
    ///
    /// Returns `MediaAccessDenied` when the devices cannot be opened.
    pub async fn acquire(
        devices: &dyn MediaDevices,
        call_type: CallType,
    ) -> Result<Self, ClientError> {
        let media = devices
            .open_user_media(MediaConstraints::for_call(call_type))
            .await?;
        Ok(Self { media })
    }

    /// Acquire a screen capture.
    ///
    /// # Errors
    ///
    /// Returns `MediaAccessDenied` when the user declines the capture.
    pub async fn acquire_screen(devices: &dyn MediaDevices) -> Result<Self, ClientError> {
        let media = devices.open_display_media().await?;
        Ok(Self { media })
    }

    #[must_use]
    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.media.tracks()
    }

    #[must_use]
    pub fn video_track(&self) -> Option<MediaTrack> {
        self.media
            .tracks()
            .into_iter()
            .find(|t| t.kind == TrackKind::Video)
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        self.media.set_enabled(kind, enabled);
    }
}

impl Drop for MediaGuard {
    fn drop(&mut self) {
        debug!(target: "cc.media", tracks = self.media.tracks().len(), "Releasing local media");
        self.media.stop();
    }
}

impl std::fmt::Debug for MediaGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaGuard")
            .field("tracks", &self.media.tracks())
            .finish()
    }
}
