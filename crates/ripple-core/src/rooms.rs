//! Rooms for locally attached sockets.
//!
//! Every socket served by this process is attached with an outbound sender.
//! Rooms are named groups of sockets (per user, per table, per user and
//! table) that events can be emitted to.

use dashmap::{DashMap, DashSet};
use ripple_protocol::Envelope;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};
use uuid::Uuid;

/// A socket identifier.
pub type SocketId = String;

/// Outbound queue of a socket. Emission never blocks the caller.
pub type SocketSender = mpsc::UnboundedSender<Envelope>;

/// Errors raised while emitting to a socket.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The socket is not attached to this process.
    #[error("Socket not attached: {0}")]
    UnknownSocket(String),

    /// The socket's writer has gone away.
    #[error("Socket closed: {0}")]
    SocketClosed(String),
}

/// Generate a random socket id.
#[must_use]
pub fn generate_socket_id() -> SocketId {
    Uuid::new_v4().simple().to_string()
}

/// Room of all sockets of a user.
#[must_use]
pub fn user_room(user_id: &str) -> String {
    format!("user:{user_id}")
}

/// Room of all sockets subscribed to a table.
#[must_use]
pub fn table_room(table: &str) -> String {
    format!("table:{table}")
}

/// Room of a user's sockets subscribed to a table.
#[must_use]
pub fn user_table_room(user_id: &str, table: &str) -> String {
    format!("user:{user_id}:table:{table}")
}

/// Local socket rooms.
pub struct Rooms {
    /// Outbound senders indexed by socket.
    sockets: DashMap<SocketId, SocketSender>,
    /// Room members indexed by room name.
    rooms: DashMap<String, DashSet<SocketId>>,
    /// Rooms each socket has joined.
    memberships: DashMap<SocketId, DashSet<String>>,
    open: AtomicBool,
}

impl Rooms {
    /// Create an empty, open set of rooms.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sockets: DashMap::new(),
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            open: AtomicBool::new(true),
        }
    }

    /// Whether the rooms accept sockets. False after [`Rooms::close`].
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Attach a socket with its outbound sender.
    ///
    /// Returns `false` if the rooms are closed.
    pub fn attach(&self, socket_id: &str, sender: SocketSender) -> bool {
        if !self.is_open() {
            return false;
        }
        self.sockets.insert(socket_id.to_string(), sender);
        debug!(connection = %socket_id, "Socket attached");
        true
    }

    /// Detach a socket and leave every room it joined.
    ///
    /// Returns the rooms the socket was in.
    pub fn detach(&self, socket_id: &str) -> Vec<String> {
        self.sockets.remove(socket_id);

        let joined: Vec<String> = self
            .memberships
            .remove(socket_id)
            .map(|(_, rooms)| rooms.into_iter().collect())
            .unwrap_or_default();

        for room in &joined {
            self.remove_member(room, socket_id);
        }

        debug!(connection = %socket_id, rooms = joined.len(), "Socket detached");
        joined
    }

    /// Check if a socket is attached.
    #[must_use]
    pub fn is_attached(&self, socket_id: &str) -> bool {
        self.sockets.contains_key(socket_id)
    }

    /// Add an attached socket to a room.
    ///
    /// Returns `true` if the socket was not in the room yet.
    pub fn join(&self, socket_id: &str, room: &str) -> bool {
        if !self.is_attached(socket_id) {
            return false;
        }

        self.memberships
            .entry(socket_id.to_string())
            .or_default()
            .insert(room.to_string());

        let added = self
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(socket_id.to_string());

        if added {
            trace!(connection = %socket_id, room = %room, "Joined room");
        }
        added
    }

    /// Remove a socket from a room.
    ///
    /// Returns `true` if the socket was in the room.
    pub fn leave(&self, socket_id: &str, room: &str) -> bool {
        if let Some(rooms) = self.memberships.get(socket_id) {
            rooms.remove(room);
        }
        let removed = self.remove_member(room, socket_id);
        if removed {
            trace!(connection = %socket_id, room = %room, "Left room");
        }
        removed
    }

    fn remove_member(&self, room: &str, socket_id: &str) -> bool {
        let removed = self
            .rooms
            .get(room)
            .map(|members| members.remove(socket_id).is_some())
            .unwrap_or(false);

        // Empty rooms are dropped
        self.rooms.remove_if(room, |_, members| members.is_empty());
        removed
    }

    /// Emit an envelope to one socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is not attached here or its writer
    /// has gone away.
    pub fn emit(&self, socket_id: &str, envelope: Envelope) -> Result<(), TransportError> {
        let sender = self
            .sockets
            .get(socket_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| TransportError::UnknownSocket(socket_id.to_string()))?;

        sender
            .send(envelope)
            .map_err(|_| TransportError::SocketClosed(socket_id.to_string()))
    }

    /// Emit an envelope to every member of a room.
    ///
    /// Returns the number of sockets it was queued for.
    pub fn emit_to_room(&self, room: &str, envelope: &Envelope) -> usize {
        let mut delivered = 0;
        for socket_id in self.members(room) {
            match self.emit(&socket_id, envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(room = %room, error = %e, "Dropped emission"),
            }
        }
        trace!(room = %room, recipients = delivered, event = %envelope.event, "Emitted to room");
        delivered
    }

    /// Members of a room.
    #[must_use]
    pub fn members(&self, room: &str) -> Vec<SocketId> {
        self.rooms
            .get(room)
            .map(|m| m.iter().map(|s| s.clone()).collect())
            .unwrap_or_default()
    }

    /// Rooms a socket has joined.
    #[must_use]
    pub fn rooms_of(&self, socket_id: &str) -> Vec<String> {
        self.memberships
            .get(socket_id)
            .map(|r| r.iter().map(|s| s.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of attached sockets.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.sockets.len()
    }

    /// Room statistics.
    #[must_use]
    pub fn stats(&self) -> RoomStats {
        RoomStats {
            connection_count: self.sockets.len(),
            room_count: self.rooms.len(),
            total_memberships: self.rooms.iter().map(|r| r.len()).sum(),
        }
    }

    /// Stop accepting sockets and drop every attached one.
    ///
    /// Dropping the senders ends each socket's writer.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.sockets.clear();
        self.rooms.clear();
        self.memberships.clear();
        info!("Rooms closed");
    }
}

impl Default for Rooms {
    fn default() -> Self {
        Self::new()
    }
}

/// Room statistics.
#[derive(Debug, Clone)]
pub struct RoomStats {
    /// Number of attached sockets.
    pub connection_count: usize,
    /// Number of non-empty rooms.
    pub room_count: usize,
    /// Sum of room sizes.
    pub total_memberships: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attached(rooms: &Rooms, id: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        assert!(rooms.attach(id, tx));
        rx
    }

    #[test]
    fn test_room_names() {
        assert_eq!(user_room("u1"), "user:u1");
        assert_eq!(table_room("goals"), "table:goals");
        assert_eq!(user_table_room("u1", "goals"), "user:u1:table:goals");
    }

    #[test]
    fn test_join_and_leave() {
        let rooms = Rooms::new();
        let _rx = attached(&rooms, "s1");

        assert!(rooms.join("s1", "table:goals"));
        assert!(!rooms.join("s1", "table:goals"));
        assert_eq!(rooms.members("table:goals"), vec!["s1".to_string()]);

        assert!(rooms.leave("s1", "table:goals"));
        assert!(!rooms.leave("s1", "table:goals"));
        // Empty room is gone
        assert_eq!(rooms.stats().room_count, 0);
    }

    #[test]
    fn test_join_requires_attached_socket() {
        let rooms = Rooms::new();
        assert!(!rooms.join("ghost", "table:goals"));
        assert!(rooms.members("table:goals").is_empty());
    }

    #[test]
    fn test_emit_to_room() {
        let rooms = Rooms::new();
        let mut rx1 = attached(&rooms, "s1");
        let mut rx2 = attached(&rooms, "s2");
        let mut rx3 = attached(&rooms, "s3");
        rooms.join("s1", "table:goals");
        rooms.join("s2", "table:goals");

        let count = rooms.emit_to_room("table:goals", &Envelope::new("goals:insert", json!({})));
        assert_eq!(count, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());
    }

    #[test]
    fn test_emit_errors() {
        let rooms = Rooms::new();
        assert!(matches!(
            rooms.emit("ghost", Envelope::new("x", json!({}))),
            Err(TransportError::UnknownSocket(_))
        ));

        let rx = attached(&rooms, "s1");
        drop(rx);
        assert!(matches!(
            rooms.emit("s1", Envelope::new("x", json!({}))),
            Err(TransportError::SocketClosed(_))
        ));
    }

    #[test]
    fn test_detach_leaves_all_rooms() {
        let rooms = Rooms::new();
        let _rx = attached(&rooms, "s1");
        rooms.join("s1", "user:u1");
        rooms.join("s1", "table:goals");

        let mut left = rooms.detach("s1");
        left.sort();
        assert_eq!(left, vec!["table:goals".to_string(), "user:u1".to_string()]);
        assert!(!rooms.is_attached("s1"));

        let stats = rooms.stats();
        assert_eq!(stats.connection_count, 0);
        assert_eq!(stats.room_count, 0);
        assert_eq!(stats.total_memberships, 0);
    }

    #[test]
    fn test_close() {
        let rooms = Rooms::new();
        let mut rx = attached(&rooms, "s1");
        rooms.close();

        assert!(!rooms.is_open());
        assert_eq!(rooms.connection_count(), 0);
        // Sender dropped, writer sees the end of the queue
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(!rooms.attach("s2", tx));
    }
}
