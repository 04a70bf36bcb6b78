//! Process-wide room/session registry.
//!
//! All mutation happens through `&mut self` under the server's single mutex,
//! so every admission is one atomic check-then-add section: two concurrent
//! joins can never both observe a count under the cap before either is added.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{SessionId, SignalingMessage};

/// Why a join was turned away. The same information goes back to the client
/// as a wire [`SignalingMessage::Error`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    /// Global admission cap reached; carries the count observed at the
    /// moment of the atomic admission check.
    #[error("relay full, {observed} sessions already admitted")]
    AdmissionRejected { observed: usize },
    /// The room already holds a paired couple; late joiners are rejected
    /// rather than silently mismatched.
    #[error("room \"{room}\" is already paired")]
    RoomFull { room: String },
    /// A session may be a member of at most one room.
    #[error("session already joined room \"{room}\"")]
    AlreadyJoined { room: String },
    #[error("unknown session")]
    UnknownSession,
}

struct SessionEntry {
    outbound: mpsc::UnboundedSender<SignalingMessage>,
    room: Option<String>,
}

/// Rooms and sessions for one relay process.
pub struct RoomRegistry {
    cap: usize,
    sessions: HashMap<SessionId, SessionEntry>,
    /// Room code → member ids in join order.
    rooms: HashMap<String, Vec<SessionId>>,
}

impl RoomRegistry {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            sessions: HashMap::new(),
            rooms: HashMap::new(),
        }
    }

    /// Register a freshly accepted connection and tell it its session id.
    pub fn connect(&mut self, session: SessionId, outbound: mpsc::UnboundedSender<SignalingMessage>) {
        debug!(event = "session_connected", %session);
        self.sessions.insert(
            session,
            SessionEntry {
                outbound,
                room: None,
            },
        );
        self.send(session, SignalingMessage::Welcome { session });
    }

    /// Admit `session` into `room`, or reject with an `error` message.
    ///
    /// Admission counts sessions already admitted to a room, globally across
    /// all rooms; on rejection the observed count is echoed back and nothing
    /// else happens. When the room reaches exactly two members, both sides
    /// get a `user-join` carrying the other's session id — once per pairing.
    pub fn join(&mut self, session: SessionId, room: &str) -> Result<(), RelayError> {
        let current_room = self
            .sessions
            .get(&session)
            .map(|e| e.room.clone())
            .ok_or(RelayError::UnknownSession)?;
        if let Some(existing) = current_room {
            return self.reject(session, RelayError::AlreadyJoined { room: existing });
        }

        let observed = self.admitted_count();
        if observed >= self.cap {
            return self.reject(session, RelayError::AdmissionRejected { observed });
        }

        let occupancy = self.rooms.get(room).map(Vec::len).unwrap_or(0);
        if occupancy >= 2 {
            return self.reject(session, RelayError::RoomFull {
                room: room.to_string(),
            });
        }

        let members = self.rooms.entry(room.to_string()).or_default();
        members.push(session);
        let paired = match members[..] {
            [a, b] => Some((a, b)),
            _ => None,
        };
        if let Some(entry) = self.sessions.get_mut(&session) {
            entry.room = Some(room.to_string());
        }
        info!(event = "session_joined", %session, room, admitted = observed + 1);

        if let Some((a, b)) = paired {
            self.send(a, SignalingMessage::UserJoin { peer: b });
            self.send(b, SignalingMessage::UserJoin { peer: a });
            info!(event = "room_paired", room, first = %a, second = %b);
        }
        Ok(())
    }

    /// Forward a message unmodified to every other member of the sender's
    /// room. Pure pass-through; the payload is never inspected.
    pub fn forward(&mut self, sender: SessionId, message: SignalingMessage) {
        let room = match self.sessions.get(&sender).and_then(|e| e.room.clone()) {
            Some(room) => room,
            None => {
                warn!(event = "forward_without_room", %sender, "dropping relayed message");
                return;
            }
        };
        let peers: Vec<SessionId> = self
            .rooms
            .get(&room)
            .map(|members| members.iter().copied().filter(|m| *m != sender).collect())
            .unwrap_or_default();
        for peer in peers {
            self.send(peer, message.clone());
        }
    }

    /// Tear down a session: leave its room, notify whoever remains, and
    /// reclaim the room once it is empty.
    pub fn disconnect(&mut self, session: SessionId) {
        let Some(entry) = self.sessions.remove(&session) else {
            return;
        };
        debug!(event = "session_disconnected", %session);
        let Some(room) = entry.room else {
            return;
        };
        let Some(members) = self.rooms.get_mut(&room) else {
            return;
        };
        members.retain(|m| *m != session);
        if members.is_empty() {
            self.rooms.remove(&room);
            debug!(event = "room_reclaimed", room = %room);
        } else {
            for peer in members.clone() {
                self.send(peer, SignalingMessage::UserLeave { peer: session });
            }
        }
    }

    /// Sessions currently admitted to a room, across all rooms.
    pub fn admitted_count(&self) -> usize {
        self.sessions.values().filter(|e| e.room.is_some()).count()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Send the wire-level `error` for `reason` and hand the typed error back
    /// to the caller. The session's registry state is left untouched.
    fn reject(&self, session: SessionId, reason: RelayError) -> Result<(), RelayError> {
        warn!(event = "join_rejected", %session, %reason);
        self.send(
            session,
            SignalingMessage::Error {
                message: reason.to_string(),
            },
        );
        Err(reason)
    }

    fn send(&self, to: SessionId, message: SignalingMessage) {
        if let Some(entry) = self.sessions.get(&to) {
            // A dead receiver means the connection task is already winding
            // down; disconnect() will clean the entry up.
            let _ = entry.outbound.send(message);
        }
    }
}
