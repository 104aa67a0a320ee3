//! Room registry: named groups of connections belonging to one user's devices.
//!
//! A room exists only while it has members: it is created by the first join
//! and removed in the same call that removes its last member. Each room owns
//! the arbitration engine that picks its camera owner, so the engine's state
//! goes away with the room.

use crate::connection::ConnId;
use framelink_arbitration::{ArbitrationConfig, ArbitrationEngine};
use std::collections::HashMap;

pub struct Room {
    pub id: String,
    /// Member connections in join order. One device may appear more than once
    /// (several sockets under the same device id).
    members: Vec<ConnId>,
    pub engine: ArbitrationEngine,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Room {
    fn new(id: String, config: ArbitrationConfig) -> Self {
        Self {
            id,
            members: Vec::new(),
            engine: ArbitrationEngine::new(config),
            created_at: chrono::Utc::now(),
        }
    }

    pub fn members(&self) -> &[ConnId] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, conn: ConnId) -> bool {
        self.members.contains(&conn)
    }
}

/// Result of removing a connection from its room.
#[derive(Debug, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The connection was not a member (or the room is gone).
    NotMember,
    /// It was the last member; the room was deleted.
    RoomDeleted,
    /// Members still in the room, in join order.
    Remaining(Vec<ConnId>),
}

pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
    arbitration: ArbitrationConfig,
}

impl RoomRegistry {
    pub fn new(arbitration: ArbitrationConfig) -> Self {
        Self {
            rooms: HashMap::new(),
            arbitration,
        }
    }

    /// Add `conn` to `room_id`, creating the room if needed.
    /// Returns the member list after the join.
    pub fn join(&mut self, room_id: &str, conn: ConnId) -> Vec<ConnId> {
        let room = self.rooms.entry(room_id.to_string()).or_insert_with(|| {
            tracing::info!(room = %room_id, "Room created");
            Room::new(room_id.to_string(), self.arbitration.clone())
        });
        if !room.contains(conn) {
            room.members.push(conn);
        }
        room.members.clone()
    }

    pub fn leave(&mut self, room_id: &str, conn: ConnId) -> LeaveOutcome {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return LeaveOutcome::NotMember;
        };
        let before = room.members.len();
        room.members.retain(|m| *m != conn);
        if room.members.len() == before {
            return LeaveOutcome::NotMember;
        }
        if room.is_empty() {
            self.rooms.remove(room_id);
            tracing::info!(room = %room_id, "Room deleted (empty)");
            return LeaveOutcome::RoomDeleted;
        }
        LeaveOutcome::Remaining(room.members.clone())
    }

    pub fn get(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn get_mut(&mut self, room_id: &str) -> Option<&mut Room> {
        self.rooms.get_mut(room_id)
    }

    /// Member connections of `room_id`, empty if the room does not exist.
    pub fn members(&self, room_id: &str) -> &[ConnId] {
        self.rooms.get(room_id).map(Room::members).unwrap_or(&[])
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
