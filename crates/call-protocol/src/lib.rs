//! Wire protocol for Ringline call signaling.
//!
//! Every frame on the transport is a JSON object of the form
//! `{"event": "<name>", "data": { ... }}`. Client-originated frames decode to
//! [`events::ClientEvent`]; server-originated frames are [`events::ServerEvent`].
//!
//! Signaling payloads (offer, answer, ICE candidate, media toggles, presence)
//! are relayed opaquely: the server reads only the routing envelope
//! (`from`, `to`, `callId`) and forwards the rest of the object untouched.

#![warn(clippy::pedantic)]

pub mod codec;
pub mod events;
pub mod payloads;

pub use codec::{decode_client, decode_server, encode, ProtocolError};
pub use events::{ClientEvent, RelayKind, ServerEvent};
pub use payloads::*;
