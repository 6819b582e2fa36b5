//! Broadcast router.
//!
//! Fans events out to a user's sockets and to a table's room. Nothing here
//! fails towards the caller: transport problems are logged and the affected
//! emission is skipped, so a domain operation never fails because a client
//! could not be notified.

use crate::event::ChangeEvent;
use crate::registry::Registry;
use crate::rooms::{table_room, user_room, Rooms, SocketId, TransportError};
use ripple_protocol::Envelope;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Routes events to locally attached sockets.
#[derive(Clone)]
pub struct BroadcastRouter {
    registry: Arc<Registry>,
    rooms: Arc<Rooms>,
}

impl BroadcastRouter {
    /// Create a router over a registry and the local rooms.
    #[must_use]
    pub fn new(registry: Arc<Registry>, rooms: Arc<Rooms>) -> Self {
        Self { registry, rooms }
    }

    /// The local rooms.
    #[must_use]
    pub fn rooms(&self) -> &Arc<Rooms> {
        &self.rooms
    }

    /// The registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Sockets of a user: the registry's view plus the local user room, so
    /// local sockets are still reached while the store is down.
    async fn user_sockets(&self, user_id: &str) -> BTreeSet<SocketId> {
        let mut sockets: BTreeSet<SocketId> = self
            .registry
            .list_user_sockets(user_id)
            .await
            .into_iter()
            .collect();
        sockets.extend(self.rooms.members(&user_room(user_id)));
        sockets
    }

    /// Emit an event to every socket of a user.
    ///
    /// Returns the number of sockets the event was queued for.
    pub async fn broadcast_to_user(&self, user_id: &str, event_name: &str, data: Value) -> usize {
        let sockets = self.user_sockets(user_id).await;
        if sockets.is_empty() {
            debug!(user = %user_id, event = %event_name, "No active sockets for user");
            return 0;
        }

        let envelope = Envelope::new(event_name, data);
        self.emit_all(sockets, &envelope)
    }

    /// Emit an event to every subscriber of a table.
    pub fn broadcast_to_table(&self, table: &str, event_name: &str, data: Value) -> usize {
        let envelope = Envelope::new(event_name, data);
        let count = self.rooms.emit_to_room(&table_room(table), &envelope);
        trace!(table = %table, event = %event_name, recipients = count, "Broadcast to table");
        count
    }

    /// Deliver a change event to its owner's sockets and its table's room.
    ///
    /// A socket in both groups receives the event once.
    pub async fn dispatch(&self, event: &ChangeEvent) -> usize {
        let envelope = match event.to_envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(event = %event.event_name(), error = %e, "Failed to encode change event");
                return 0;
            }
        };

        let mut targets = BTreeSet::new();
        if let Some(user_id) = event.owner() {
            targets.extend(self.user_sockets(user_id).await);
        }
        if let Some(table) = &event.table {
            targets.extend(self.rooms.members(&table_room(table)));
        }

        if targets.is_empty() {
            debug!(event = %envelope.event, "No recipients for change event");
            return 0;
        }

        let count = self.emit_all(targets, &envelope);
        debug!(event = %envelope.event, recipients = count, "Dispatched change event");
        count
    }

    fn emit_all(&self, sockets: impl IntoIterator<Item = SocketId>, envelope: &Envelope) -> usize {
        let mut delivered = 0;
        for socket_id in sockets {
            match self.rooms.emit(&socket_id, envelope.clone()) {
                Ok(()) => delivered += 1,
                // Registered by another process
                Err(TransportError::UnknownSocket(_)) => {
                    trace!(connection = %socket_id, "Socket not attached locally");
                }
                Err(e) => {
                    warn!(connection = %socket_id, error = %e, "Dropped emission");
                }
            }
        }
        delivered
    }
}
