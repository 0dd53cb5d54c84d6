//! Identifier types for Ringline components.
//!
//! User, room, call and group ids originate outside this system (the
//! account service, the chat service or the calling client) and are carried
//! as opaque strings. Session ids are minted here, one per transport
//! connection.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Borrow the raw identifier.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Unique identifier for an application user.
    UserId
);

string_id!(
    /// Caller-generated identifier, unique per call attempt.
    CallId
);

string_id!(
    /// Identifier of a chat group a call may belong to.
    GroupId
);

string_id!(
    /// Named broadcast group a transport session can join.
    RoomId
);

impl RoomId {
    /// Room every session of `user_id` joins on registration.
    #[must_use]
    pub fn for_user(user_id: &UserId) -> Self {
        Self(format!("user:{user_id}"))
    }

    /// Room carrying media signaling for one call.
    #[must_use]
    pub fn for_call(call_id: &CallId) -> Self {
        Self(format!("call:{call_id}"))
    }

    /// Returns the call id if this is a call room.
    #[must_use]
    pub fn call_id(&self) -> Option<CallId> {
        self.0.strip_prefix("call:").map(CallId::from)
    }
}

/// Unique identifier for a transport session (one per connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new random session ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
