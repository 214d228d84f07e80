use std::collections::HashSet;

use dashmap::DashMap;
use sketchroom_shared::ServerMessage;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// Fans server events out to connections.
///
/// Every connection owns one unbounded queue drained by its writer task,
/// so events pushed by a single origin reach each recipient in the order
/// they were pushed. Delivery is best effort: a closed queue is pruned and
/// the event is dropped for that recipient.
#[derive(Default)]
pub struct Broadcaster {
    connections: DashMap<Uuid, Outbox>,
    rooms: DashMap<String, HashSet<Uuid>>,
}

impl Broadcaster {
    pub fn connect(&self, connection_id: Uuid, outbox: Outbox) {
        self.connections.insert(connection_id, outbox);
    }

    pub fn disconnect(&self, connection_id: Uuid) {
        self.connections.remove(&connection_id);
    }

    pub fn enter_room(&self, room_id: &str, connection_id: Uuid) {
        self.rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(connection_id);
    }

    pub fn exit_room(&self, room_id: &str, connection_id: Uuid) {
        let now_empty = match self.rooms.get_mut(room_id) {
            Some(mut members) => {
                members.remove(&connection_id);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.rooms.remove_if(room_id, |_, members| members.is_empty());
        }
    }

    /// Whether any live connection is still in the room.
    pub fn is_occupied(&self, room_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|members| !members.is_empty())
    }

    pub fn to_room_except_origin(&self, room_id: &str, origin: Uuid, message: ServerMessage) -> usize {
        self.fan_out(room_id, Some(origin), message)
    }

    pub fn to_room_including_origin(&self, room_id: &str, message: ServerMessage) -> usize {
        self.fan_out(room_id, None, message)
    }

    pub fn to_connection(&self, connection_id: Uuid, message: ServerMessage) -> bool {
        let delivered = self
            .connections
            .get(&connection_id)
            .map(|outbox| outbox.send(message).is_ok());
        match delivered {
            Some(true) => true,
            Some(false) => {
                self.prune(&[connection_id]);
                false
            }
            None => false,
        }
    }

    fn fan_out(&self, room_id: &str, skip: Option<Uuid>, message: ServerMessage) -> usize {
        let recipients: Vec<Uuid> = match self.rooms.get(room_id) {
            Some(members) => members
                .iter()
                .copied()
                .filter(|id| Some(*id) != skip)
                .collect(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut stale = Vec::new();
        for id in recipients {
            match self.connections.get(&id) {
                Some(outbox) if outbox.send(message.clone()).is_ok() => delivered += 1,
                _ => stale.push(id),
            }
        }
        if !stale.is_empty() {
            debug!(room = room_id, count = stale.len(), kind = message.kind(), "pruning stale connections");
            self.prune(&stale);
        }
        delivered
    }

    fn prune(&self, stale: &[Uuid]) {
        for id in stale {
            self.connections.remove(id);
        }
    }
}
