//! The signaling hub: connection registry, room registry and delivery.
//!
//! All registry state sits behind one lock, and every mutation (accept, join,
//! leave, sweep, arbitration) takes it for writing. Delivery never waits on a
//! peer: frames are pushed into each connection's bounded outbound queue and
//! the connection's own writer task does the socket I/O.

use crate::connection::{ConnId, Connection, ConnectionHandle, Membership, Outbound};
use crate::room::{LeaveOutcome, RoomRegistry};
use crate::router::{self, Route};
use framelink_arbitration::{ArbitrationConfig, EngineStatus, FaceObservation, SwitchDecision};
use framelink_common::config::AppConfig;
use framelink_common::protocol::{Envelope, MessageKind, ServerMessage, now_millis};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Notify, RwLock, mpsc};

#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Largest accepted WebSocket message, in bytes.
    pub max_frame_bytes: usize,
    /// Per-connection outbound queue capacity, in frames.
    pub outbound_queue: usize,
    /// Sweeps a connection may stay silent through before it is evicted.
    pub missed_probes: u32,
    pub arbitration: ArbitrationConfig,
}

impl HubSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_frame_bytes: config.server.max_frame_bytes,
            outbound_queue: config.server.outbound_queue,
            missed_probes: config.liveness.missed_probes,
            arbitration: ArbitrationConfig::from(&config.arbitration),
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub in_rooms: usize,
    pub external: usize,
    pub rooms: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub evicted: usize,
}

/// Membership and arbitration view of one room.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStatus {
    pub room_id: String,
    pub devices: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub arbitration: EngineStatus,
}

pub struct Hub {
    settings: HubSettings,
    registry: RwLock<Registry>,
}

impl Hub {
    pub fn new(settings: HubSettings) -> Self {
        let rooms = RoomRegistry::new(settings.arbitration.clone());
        Self {
            settings,
            registry: RwLock::new(Registry {
                connections: HashMap::new(),
                rooms,
            }),
        }
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// Register a new socket. The welcome frame is already queued on the
    /// returned handle.
    pub async fn accept(&self, remote: Option<SocketAddr>) -> ConnectionHandle {
        let id = uuid::Uuid::new_v4();
        let (tx, outbound) = mpsc::channel(self.settings.outbound_queue.max(1));
        let closed = Arc::new(Notify::new());

        let conn = Connection::new(id, remote, tx, closed.clone());
        if let Some(welcome) = encode(&ServerMessage::welcome()) {
            conn.deliver(Outbound::Text(welcome));
        }

        let total = {
            let mut reg = self.registry.write().await;
            reg.connections.insert(id, conn);
            reg.connections.len()
        };
        tracing::info!(conn = %id, remote = ?remote, total, "Client connected");

        ConnectionHandle {
            id,
            outbound,
            closed,
        }
    }

    /// The connection answered a liveness probe.
    pub async fn heartbeat_reply(&self, id: ConnId) {
        if let Some(conn) = self.registry.write().await.connections.get_mut(&id) {
            conn.alive = true;
            conn.missed_probes = 0;
        }
    }

    /// One liveness cycle: evict connections that stayed silent for too many
    /// cycles, probe the rest.
    pub async fn sweep(&self) -> SweepReport {
        let mut reg = self.registry.write().await;
        let mut report = SweepReport::default();
        let mut evict = Vec::new();

        for conn in reg.connections.values_mut() {
            if !conn.alive {
                conn.missed_probes += 1;
                if conn.missed_probes >= self.settings.missed_probes {
                    evict.push(conn.id);
                    continue;
                }
            }
            conn.alive = false;
            conn.deliver(Outbound::Ping);
            report.probed += 1;
        }

        let now = Instant::now();
        for id in evict {
            if let Some(conn) = reg.detach(id, now) {
                tracing::warn!(
                    conn = %id,
                    remote = ?conn.remote,
                    missed = conn.missed_probes,
                    "Evicting unresponsive connection"
                );
                conn.close();
                report.evicted += 1;
            }
        }
        report
    }

    /// Remove a connection and run room-leave cleanup. Safe to call more than once.
    pub async fn disconnect(&self, id: ConnId) {
        let mut reg = self.registry.write().await;
        if let Some(conn) = reg.detach(id, Instant::now()) {
            tracing::info!(
                conn = %id,
                remote = ?conn.remote,
                room = conn.membership.room_id().unwrap_or("none"),
                connected_secs = (Utc::now() - conn.connected_at).num_seconds(),
                total = reg.connections.len(),
                "Client disconnected"
            );
        }
    }

    /// Route one inbound text frame from `id`.
    pub async fn handle_text(&self, id: ConnId, text: &str) {
        let env = match Envelope::parse(text) {
            Ok(env) => env,
            Err(err) => {
                tracing::debug!(conn = %id, error = %err, "Malformed frame");
                self.registry
                    .read()
                    .await
                    .send_message(id, &ServerMessage::error(&err));
                return;
            }
        };

        let mut reg = self.registry.write().await;
        let Some(sender) = reg.connections.get(&id) else {
            return;
        };
        let membership = sender.membership.clone();
        let now = Instant::now();

        match router::classify(&env, &membership) {
            Route::Join { room_id, device_id } => reg.join(id, &room_id, &device_id, now),
            Route::RoomPeers => reg.send_room_peers(id, &membership),
            Route::Pong => {
                reg.send_message(id, &ServerMessage::pong());
            }
            Route::Room { room_id, echo } => {
                if !reg.camera_subject_in_room(&room_id, &env, &membership) {
                    tracing::debug!(conn = %id, room = %room_id, "Camera request for a device outside the room dropped");
                    return;
                }
                let text: Arc<str> = Arc::from(text);
                let delivered = reg.broadcast_to_room(&room_id, &text, (!echo).then_some(id));
                tracing::debug!(conn = %id, room = %room_id, kind = %env.kind, delivered, "Room relay");
                reg.arbitrate(&room_id, &env, &membership, now);
            }
            Route::Global => {
                let text: Arc<str> = Arc::from(text);
                let delivered = reg.broadcast_global(&text, id);
                tracing::debug!(conn = %id, kind = %env.kind, delivered, "Global relay");
                if let Membership::RoomMember { room_id, device_id } = &membership {
                    reg.external_call_frame(room_id, device_id, &env.kind);
                }
            }
            Route::Drop(reason) => {
                tracing::debug!(conn = %id, kind = %env.kind, reason = reason.as_str(), "Frame dropped");
            }
        }
    }

    /// Queue a close on every connection. Used on shutdown.
    pub async fn close_all(&self) {
        let reg = self.registry.read().await;
        for conn in reg.connections.values() {
            conn.close();
        }
        tracing::info!(count = reg.connections.len(), "Closing all connections");
    }

    pub async fn stats(&self) -> HubStats {
        let reg = self.registry.read().await;
        let in_rooms = reg
            .connections
            .values()
            .filter(|c| c.membership.in_local_room())
            .count();
        HubStats {
            connections: reg.connections.len(),
            in_rooms,
            external: reg.connections.len() - in_rooms,
            rooms: reg.rooms.room_count(),
        }
    }

    pub async fn room_status(&self, room_id: &str) -> Option<RoomStatus> {
        let reg = self.registry.read().await;
        let room = reg.rooms.get(room_id)?;
        Some(RoomStatus {
            room_id: room.id.clone(),
            devices: reg.device_ids(room.members()),
            created_at: room.created_at,
            arbitration: room.engine.status(Instant::now()),
        })
    }

    /// Turn face-driven switching on or off for one room. Manual camera
    /// requests keep working either way. Returns false if the room does not exist.
    pub async fn set_auto_switching(&self, room_id: &str, enabled: bool) -> bool {
        let mut reg = self.registry.write().await;
        let Some(room) = reg.rooms.get_mut(room_id) else {
            return false;
        };
        room.engine.set_enabled(enabled);
        tracing::info!(room = %room_id, enabled, "Automatic camera switching toggled");
        true
    }
}

/// Serialize a server frame. A failure is logged and the frame is skipped.
fn encode(msg: &ServerMessage) -> Option<Arc<str>> {
    match msg.to_json() {
        Ok(json) => Some(json.into()),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize server frame");
            None
        }
    }
}

/// Device a camera frame is about: its `deviceId`, else the sender's device.
fn camera_subject<'a>(env: &'a Envelope, sender: &'a Membership) -> &'a str {
    env.device_id
        .as_deref()
        .or(sender.device_id())
        .unwrap_or_default()
}

struct Registry {
    connections: HashMap<ConnId, Connection>,
    rooms: RoomRegistry,
}

impl Registry {
    fn send_message(&self, id: ConnId, msg: &ServerMessage) -> bool {
        let Some(text) = encode(msg) else {
            return false;
        };
        self.connections
            .get(&id)
            .is_some_and(|conn| conn.deliver(Outbound::Text(text)))
    }

    fn broadcast_message(&self, room_id: &str, msg: &ServerMessage, exclude: Option<ConnId>) -> usize {
        match encode(msg) {
            Some(text) => self.broadcast_to_room(room_id, &text, exclude),
            None => 0,
        }
    }

    /// Deliver to every open member of `room_id` except `exclude`.
    /// Returns how many connections the frame was queued for.
    fn broadcast_to_room(&self, room_id: &str, text: &Arc<str>, exclude: Option<ConnId>) -> usize {
        let mut delivered = 0;
        for member in self.rooms.members(room_id) {
            if Some(*member) == exclude {
                continue;
            }
            let Some(conn) = self.connections.get(member) else {
                continue;
            };
            if conn.is_open() && conn.deliver(Outbound::Text(text.clone())) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver to every open connection except `exclude`.
    fn broadcast_global(&self, text: &Arc<str>, exclude: ConnId) -> usize {
        self.connections
            .values()
            .filter(|conn| conn.id != exclude && conn.is_open())
            .filter(|conn| conn.deliver(Outbound::Text(text.clone())))
            .count()
    }

    fn device_of(&self, id: ConnId) -> Option<&str> {
        self.connections
            .get(&id)
            .and_then(|conn| conn.membership.device_id())
    }

    fn device_ids(&self, members: &[ConnId]) -> Vec<String> {
        members
            .iter()
            .filter_map(|m| self.device_of(*m))
            .map(str::to_owned)
            .collect()
    }

    fn room_update(&self, room_id: &str) -> ServerMessage {
        let devices = self.device_ids(self.rooms.members(room_id));
        ServerMessage::room_update(room_id, devices)
    }

    /// A `camera-request` may only name a device that is in the room.
    /// Every other frame passes.
    fn camera_subject_in_room(&self, room_id: &str, env: &Envelope, sender: &Membership) -> bool {
        if env.kind != MessageKind::CameraRequest {
            return true;
        }
        let subject = camera_subject(env, sender);
        self.rooms
            .members(room_id)
            .iter()
            .any(|m| self.device_of(*m) == Some(subject))
    }

    fn join(&mut self, id: ConnId, room_id: &str, device_id: &str, now: Instant) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let previous = std::mem::replace(
            &mut conn.membership,
            Membership::RoomMember {
                room_id: room_id.to_string(),
                device_id: device_id.to_string(),
            },
        );
        if let Membership::RoomMember {
            room_id: old_room,
            device_id: old_device,
        } = previous
        {
            if old_room == room_id && old_device == device_id {
                // Already here under the same identity: membership is unchanged
                tracing::debug!(conn = %id, room = %room_id, device = %device_id, "Repeated join");
                self.broadcast_message(room_id, &self.room_update(room_id), None);
                return;
            }
            self.leave_room(id, &old_room, &old_device, now);
        }

        let members = self.rooms.join(room_id, id);
        tracing::info!(conn = %id, room = %room_id, device = %device_id, members = members.len(), "Device joined room");

        self.broadcast_message(room_id, &self.room_update(room_id), None);
        self.broadcast_message(
            room_id,
            &ServerMessage::room_peer_joined(room_id, device_id),
            Some(id),
        );
    }

    fn send_room_peers(&self, id: ConnId, membership: &Membership) {
        let Some(room_id) = membership.room_id() else {
            return;
        };
        self.send_message(id, &self.room_update(room_id));
        for member in self.rooms.members(room_id) {
            if *member == id {
                continue;
            }
            if let Some(device) = self.device_of(*member) {
                self.send_message(id, &ServerMessage::room_peer_joined(room_id, device));
            }
        }
    }

    /// Remove the connection from the registry and from its room.
    fn detach(&mut self, id: ConnId, now: Instant) -> Option<Connection> {
        let conn = self.connections.remove(&id)?;
        if let Membership::RoomMember { room_id, device_id } = &conn.membership {
            self.leave_room(id, room_id, device_id, now);
        }
        Some(conn)
    }

    fn leave_room(&mut self, id: ConnId, room_id: &str, device_id: &str, now: Instant) {
        let remaining = match self.rooms.leave(room_id, id) {
            LeaveOutcome::NotMember | LeaveOutcome::RoomDeleted => return,
            LeaveOutcome::Remaining(members) => members,
        };
        tracing::info!(conn = %id, room = %room_id, device = %device_id, remaining = remaining.len(), "Device left room");

        self.broadcast_message(room_id, &self.room_update(room_id), None);
        self.broadcast_message(room_id, &ServerMessage::room_peer_left(room_id, device_id), None);

        // Another socket of the same device keeps its face state and ownership
        if remaining
            .iter()
            .any(|m| self.device_of(*m) == Some(device_id) && *m != id)
        {
            return;
        }
        let decision = self
            .rooms
            .get_mut(room_id)
            .and_then(|room| room.engine.remove_device(device_id, now));
        if let Some(decision) = decision {
            self.announce_switch(room_id, &decision);
        }
    }

    /// Feed a relayed room frame to the room's arbitration engine.
    fn arbitrate(&mut self, room_id: &str, env: &Envelope, sender: &Membership, now: Instant) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return;
        };
        let members = room.len();
        let sender_device = sender.device_id().unwrap_or_default();
        let subject = camera_subject(env, sender);

        let decision = match env.kind {
            MessageKind::FaceDetectionUpdate => {
                let device_id = env
                    .device_id
                    .as_deref()
                    .or(env.target_device_id.as_deref())
                    .unwrap_or(sender_device);
                let obs = FaceObservation {
                    device_id: device_id.to_string(),
                    has_face: env.has_face.unwrap_or(false),
                    confidence: env.confidence.unwrap_or(0.0),
                };
                room.engine.observe(&obs, now)
            }
            // The request itself was already echoed to the room
            MessageKind::CameraRequest => {
                room.engine.request_manual(subject, now);
                None
            }
            MessageKind::CameraRelease => {
                room.engine.release(subject);
                None
            }
            MessageKind::MasterCallStart => {
                room.engine.start_external_call(members);
                None
            }
            MessageKind::CallEnd => {
                room.engine.end_call();
                None
            }
            _ => None,
        };

        if let Some(decision) = decision {
            self.announce_switch(room_id, &decision);
        }
    }

    /// An external `offer`/`answer` from a member of `room_id`.
    fn external_call_frame(&mut self, room_id: &str, device_id: &str, kind: &MessageKind) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return;
        };
        let members = room.len();
        match kind {
            MessageKind::Offer => {
                if !room.engine.external_offer_from(device_id) {
                    room.engine.start_external_call(members);
                }
            }
            MessageKind::Answer => {
                room.engine.start_external_call(members);
            }
            _ => {}
        }
    }

    /// Tell the whole room about an automatic ownership change.
    fn announce_switch(&self, room_id: &str, decision: &SwitchDecision) {
        let msg = ServerMessage::CameraRequest {
            room_id: room_id.to_string(),
            device_id: decision.to.clone(),
            automatic: decision.is_automatic(),
            reason: Some(decision.reason.as_str().to_string()),
            handover: decision.handover,
            timestamp: now_millis(),
        };
        let delivered = self.broadcast_message(room_id, &msg, None);
        tracing::info!(room = %room_id, device = %decision.to, delivered, "Camera switch announced");
    }
}
