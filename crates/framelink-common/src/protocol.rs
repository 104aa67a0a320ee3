//! Wire protocol: JSON text frames exchanged between browsers and the signaling server.
//!
//! Every frame is a JSON object discriminated by its `type` field. The server
//! only inspects a handful of addressing fields (see [`Envelope`]); the rest of
//! a client frame is opaque payload and is relayed byte-for-byte.
//!
//! Server-originated frames are modelled as [`ServerMessage`].

use crate::error::{FramelinkError, FramelinkResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const WELCOME_MESSAGE: &str = "Connected to FrameLink Signaling Server";
pub const SERVICE_NAME: &str = "framelink-signaling";

/// Current Unix time in milliseconds, the timestamp unit of every frame.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Known message types. Anything else is [`MessageKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    // Room membership control
    JoinRoom,
    RequestRoomPeers,

    // Room-scoped relay
    CameraRequest,
    CameraRelease,
    MasterCallStart,
    ExternalStreamDevice,
    CallEnd,
    RoomVideoOffer,
    RoomVideoAnswer,
    RoomVideoIce,
    RoomPeerJoined,
    RoomPeerLeft,
    FaceDetectionUpdate,

    // WebRTC negotiation
    Offer,
    Answer,
    Ice,

    // Keepalive
    Ping,

    Other(String),
}

impl MessageKind {
    pub fn from_type(ty: &str) -> Self {
        match ty {
            "join-room" => Self::JoinRoom,
            "request-room-peers" => Self::RequestRoomPeers,
            "camera-request" => Self::CameraRequest,
            "camera-release" => Self::CameraRelease,
            "master-call-start" => Self::MasterCallStart,
            "external-stream-device" => Self::ExternalStreamDevice,
            "call-end" => Self::CallEnd,
            "room-video-offer" => Self::RoomVideoOffer,
            "room-video-answer" => Self::RoomVideoAnswer,
            "room-video-ice" => Self::RoomVideoIce,
            "room-peer-joined" => Self::RoomPeerJoined,
            "room-peer-left" => Self::RoomPeerLeft,
            "face-detection-update" => Self::FaceDetectionUpdate,
            "offer" => Self::Offer,
            "answer" => Self::Answer,
            "ice" => Self::Ice,
            "ping" => Self::Ping,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::JoinRoom => "join-room",
            Self::RequestRoomPeers => "request-room-peers",
            Self::CameraRequest => "camera-request",
            Self::CameraRelease => "camera-release",
            Self::MasterCallStart => "master-call-start",
            Self::ExternalStreamDevice => "external-stream-device",
            Self::CallEnd => "call-end",
            Self::RoomVideoOffer => "room-video-offer",
            Self::RoomVideoAnswer => "room-video-answer",
            Self::RoomVideoIce => "room-video-ice",
            Self::RoomPeerJoined => "room-peer-joined",
            Self::RoomPeerLeft => "room-peer-left",
            Self::FaceDetectionUpdate => "face-detection-update",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Ice => "ice",
            Self::Ping => "ping",
            Self::Other(ty) => ty,
        }
    }

    /// `offer`, `answer` or `ice`.
    pub fn is_negotiation(&self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::Ice)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The addressing fields of an inbound frame.
///
/// Field extraction is lenient: a field that is absent, not a string, or an
/// empty string reads as `None`, so routing decisions treat it as missing.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: MessageKind,
    pub room_id: Option<String>,
    pub device_id: Option<String>,
    pub from_device_id: Option<String>,
    pub to_device_id: Option<String>,
    /// Face-presence subject used by older clients instead of `deviceId`.
    pub target_device_id: Option<String>,
    pub has_face: Option<bool>,
    pub confidence: Option<f64>,
}

impl Envelope {
    /// Parse a text frame. Fails if the text is not JSON or not a JSON object.
    pub fn parse(text: &str) -> FramelinkResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(map) = value else {
            return Err(FramelinkError::NotAnObject);
        };
        Ok(Self::from_map(&map))
    }

    pub fn from_map(map: &Map<String, Value>) -> Self {
        let kind = map
            .get("type")
            .and_then(Value::as_str)
            .map(MessageKind::from_type)
            .unwrap_or_else(|| MessageKind::Other(String::new()));

        Self {
            kind,
            room_id: str_field(map, "roomId"),
            device_id: str_field(map, "deviceId"),
            from_device_id: str_field(map, "fromDeviceId"),
            to_device_id: str_field(map, "toDeviceId"),
            target_device_id: str_field(map, "targetDeviceId"),
            has_face: map.get("hasFace").and_then(Value::as_bool),
            confidence: map.get("confidence").and_then(confidence_value),
        }
    }

    /// True when `roomId`, `toDeviceId` and `fromDeviceId` are all present,
    /// i.e. the frame addresses a device inside a local room.
    pub fn is_room_addressed(&self) -> bool {
        self.room_id.is_some() && self.to_device_id.is_some() && self.from_device_id.is_some()
    }
}

fn str_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

fn confidence_value(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A room member as listed in `room-update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
}

/// Frames the server originates (as opposed to relays).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Sent once right after the socket is accepted.
    Welcome { message: String, timestamp: i64 },

    /// Reply to a `ping` frame.
    Pong { timestamp: i64 },

    /// Reply to a malformed frame.
    Error { message: String, timestamp: i64 },

    /// Full member list of a room.
    RoomUpdate {
        room_id: String,
        devices: Vec<DeviceInfo>,
        #[serde(default)]
        timestamp: i64,
    },

    RoomPeerJoined {
        room_id: String,
        device_id: String,
        #[serde(default)]
        timestamp: i64,
    },

    RoomPeerLeft {
        room_id: String,
        device_id: String,
        #[serde(default)]
        timestamp: i64,
    },

    /// Camera ownership moved to `device_id`.
    CameraRequest {
        room_id: String,
        device_id: String,
        #[serde(default)]
        automatic: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// An external call is live and the new owner must renegotiate.
        #[serde(default)]
        handover: bool,
        #[serde(default)]
        timestamp: i64,
    },
}

impl ServerMessage {
    pub fn welcome() -> Self {
        Self::Welcome {
            message: WELCOME_MESSAGE.into(),
            timestamp: now_millis(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: now_millis(),
        }
    }

    pub fn error(err: &FramelinkError) -> Self {
        Self::Error {
            message: err.client_message().into(),
            timestamp: now_millis(),
        }
    }

    pub fn room_update(room_id: &str, device_ids: impl IntoIterator<Item = String>) -> Self {
        Self::RoomUpdate {
            room_id: room_id.into(),
            devices: device_ids
                .into_iter()
                .map(|device_id| DeviceInfo { device_id })
                .collect(),
            timestamp: now_millis(),
        }
    }

    pub fn room_peer_joined(room_id: &str, device_id: &str) -> Self {
        Self::RoomPeerJoined {
            room_id: room_id.into(),
            device_id: device_id.into(),
            timestamp: now_millis(),
        }
    }

    pub fn room_peer_left(room_id: &str, device_id: &str) -> Self {
        Self::RoomPeerLeft {
            room_id: room_id.into(),
            device_id: device_id.into(),
            timestamp: now_millis(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
