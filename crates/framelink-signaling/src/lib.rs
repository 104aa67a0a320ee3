//! # framelink-signaling
//!
//! WebSocket signaling relay for FrameLink. Handles:
//! - Connection registry with heartbeat-based liveness
//! - Rooms grouping the devices of one user
//! - Routing of signaling frames (room, global or direct reply)
//! - Per-room camera arbitration driven by face-presence reports
//!
//! Frames are opaque JSON beyond a few addressing fields and are relayed as
//! received.

pub mod connection;
pub mod http;
pub mod hub;
pub mod liveness;
pub mod room;
pub mod router;
pub mod ws;

pub use connection::{ConnId, Membership, Outbound};
pub use http::build_router;
pub use hub::{Hub, HubSettings, HubStats, RoomStatus, SweepReport};
