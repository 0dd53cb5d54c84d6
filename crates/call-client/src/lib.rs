//! Ringline Client Call Controller
//!
//! Per-call, per-participant controller layered on top of the call states the
//! server confirms. It owns the local media for one call and one peer link
//! per remote participant, and exposes a [`controller::CallView`] for the UI.
//!
//! # Architecture
//!
//! ```text
//! UI intents ──┐
//! server events ├──> CallController (one task, one dispatch fn) ──> CallView (watch)
//! peer events ──┘            │
//!                            ├── MediaGuard (local tracks, released on drop)
//!                            └── PeerLink per remote user
//! ```
//!
//! Media devices, peer connections and the signaling transport are trait
//! seams ([`media::MediaDevices`], [`peer::PeerConnectionFactory`],
//! [`signaling::SignalingSink`]) so the controller can run against a browser
//! bridge, a native WebRTC stack or test fakes.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod controller;
pub mod errors;
pub mod media;
pub mod peer;
pub mod quality;
pub mod signaling;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use controller::{
    CallController, CallControllerHandle, CallSetup, CallView, ControllerConfig, ControllerDeps,
    ControllerInput, ControllerPhase, EndReason, RemoteView, UserIntent,
};
pub use errors::ClientError;
pub use quality::ConnectionQuality;
