//! Relay-mediated signaling.
//!
//! Two peers find each other by joining the same room on a small rendezvous
//! relay. The relay pairs them, then shuttles their offer/answer/candidate
//! payloads verbatim; it never interprets a payload, only the message tag.
//!
//! The wire format is one JSON object per WebSocket text frame, tagged with
//! `type` (`join`, `welcome`, `user-join`, `user-leave`, `offer`, `answer`,
//! `candidate`, `error`).

pub mod client;
pub mod registry;
pub mod server;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Ephemeral identity of one connected signaling participant, valid for one
/// relay connection lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
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

/// Everything that crosses the relay connection, in either direction.
///
/// Offer/answer/candidate payloads are opaque [`Value`]s: the relay forwards
/// them without validation, and only the peer-link layer gives them meaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Client → relay: join the named room.
    Join { room: String },
    /// Relay → client: the session id assigned on connect.
    Welcome { session: SessionId },
    /// Relay → client: a peer was paired with you in your room.
    UserJoin { peer: SessionId },
    /// Relay → client: your room peer disconnected.
    UserLeave { peer: SessionId },
    /// Session description offer, relayed verbatim.
    Offer { payload: Value },
    /// Session description answer, relayed verbatim.
    Answer { payload: Value },
    /// ICE candidate, relayed verbatim.
    Candidate { payload: Value },
    /// Relay → client: e.g. admission rejection with the observed count.
    Error { message: String },
}

impl SignalingMessage {
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_wire(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
