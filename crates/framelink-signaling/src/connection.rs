//! Connection records held by the hub.

use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

pub type ConnId = Uuid;

/// A frame queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(Arc<str>),
    /// Liveness probe (WebSocket ping).
    Ping,
    /// Close the socket after flushing what is queued.
    Close,
}

/// Where a connection stands with respect to rooms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Membership {
    #[default]
    Unjoined,
    RoomMember { room_id: String, device_id: String },
}

impl Membership {
    pub fn room_id(&self) -> Option<&str> {
        match self {
            Self::RoomMember { room_id, .. } => Some(room_id),
            Self::Unjoined => None,
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::RoomMember { device_id, .. } => Some(device_id),
            Self::Unjoined => None,
        }
    }

    pub fn in_local_room(&self) -> bool {
        matches!(self, Self::RoomMember { .. })
    }
}

pub struct Connection {
    pub id: ConnId,
    pub remote: Option<SocketAddr>,
    pub membership: Membership,
    /// Cleared by each sweep, set again by a heartbeat reply.
    pub alive: bool,
    /// Consecutive sweeps that found `alive == false`.
    pub missed_probes: u32,
    pub connected_at: DateTime<Utc>,
    tx: mpsc::Sender<Outbound>,
    closed: Arc<Notify>,
}

impl Connection {
    pub fn new(
        id: ConnId,
        remote: Option<SocketAddr>,
        tx: mpsc::Sender<Outbound>,
        closed: Arc<Notify>,
    ) -> Self {
        Self {
            id,
            remote,
            membership: Membership::Unjoined,
            alive: true,
            missed_probes: 0,
            connected_at: Utc::now(),
            tx,
            closed,
        }
    }

    /// Whether the writer side is still accepting frames.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a frame without waiting. Returns false if the frame was not queued.
    pub fn deliver(&self, frame: Outbound) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(conn = %self.id, "Outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a close frame and wake the connection's receive loop.
    pub fn close(&self) {
        let _ = self.tx.try_send(Outbound::Close);
        self.closed.notify_one();
    }
}

/// What the socket task gets back from [`crate::Hub::accept`].
pub struct ConnectionHandle {
    pub id: ConnId,
    pub outbound: mpsc::Receiver<Outbound>,
    /// Notified when the hub evicts this connection.
    pub closed: Arc<Notify>,
}
