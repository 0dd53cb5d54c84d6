//! Ringline Call Service Library
//!
//! Call signaling relay and call lifecycle coordinator:
//!
//! - Tracks live websocket sessions and the users and rooms they belong to
//! - Relays WebRTC signaling between call members without inspecting it
//! - Runs each call's state machine (ring, accept, reject, cancel, end)
//! - Persists every call and its participants for history
//!
//! # Architecture
//!
//! ```text
//! websocket session ──> EventDispatcher ──> CallSupervisorActor
//!        ^                    │                   └── CallActor (one per call)
//!        │                    v                           │
//!        └──────── SessionRegistry <── SignalingRelay <───┘
//!                                                         │
//!                                            CallRecordStore, Notifier
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Call lifecycle actors
//! - [`config`] - Service configuration from environment
//! - [`dispatch`] - Client event routing
//! - [`errors`] - Error types with signaling error codes
//! - [`registry`] - Session, user and room membership
//! - [`relay`] - Opaque signaling forwarder
//! - [`store`] - Call record persistence

pub mod actors;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod handlers;
pub mod notify;
pub mod observability;
pub mod registry;
pub mod relay;
pub mod routes;
pub mod store;
