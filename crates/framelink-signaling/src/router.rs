//! Message classification.
//!
//! Every inbound frame runs through a fixed, ordered list of stages. The first
//! stage that returns a [`Route`] decides what happens to the frame; later
//! stages never see it. Classification only looks at the frame's envelope and
//! the sender's membership, so it is pure and testable without sockets.

use crate::connection::Membership;
use framelink_common::protocol::{Envelope, MessageKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `join-room` carrying both `roomId` and `deviceId`.
    Join { room_id: String, device_id: String },
    /// `request-room-peers` from a room member.
    RoomPeers,
    /// Reply `pong` to the sender only.
    Pong,
    /// Relay to the sender's room. With `echo` the sender receives it too.
    Room { room_id: String, echo: bool },
    /// Relay to every other connection, in a room or not.
    Global,
    /// Drop silently.
    Drop(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Room-scoped frame from a connection that has not joined a room.
    NotInRoom,
    /// `join-room` without `roomId` or `deviceId`.
    IncompleteJoin,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotInRoom => "sender not in a room",
            Self::IncompleteJoin => "join without roomId/deviceId",
        }
    }
}

type Stage = fn(&Envelope, &Membership) -> Option<Route>;

/// Evaluated in order.
const STAGES: &[(&str, Stage)] = &[
    ("membership", membership_control),
    ("keepalive", keepalive),
    ("room-relay", room_relay),
    ("negotiation", negotiation),
    ("fallback", fallback),
];

/// Decide where a frame goes.
pub fn classify(env: &Envelope, sender: &Membership) -> Route {
    for (name, stage) in STAGES {
        if let Some(route) = stage(env, sender) {
            tracing::trace!(stage = name, kind = %env.kind, ?route, "Frame classified");
            return route;
        }
    }
    Route::Global
}

/// Frames that only make sense inside a room.
pub fn is_room_scoped(kind: &MessageKind) -> bool {
    matches!(
        kind,
        MessageKind::CameraRequest
            | MessageKind::CameraRelease
            | MessageKind::MasterCallStart
            | MessageKind::ExternalStreamDevice
            | MessageKind::CallEnd
            | MessageKind::RoomVideoOffer
            | MessageKind::RoomVideoAnswer
            | MessageKind::RoomVideoIce
            | MessageKind::RoomPeerJoined
            | MessageKind::RoomPeerLeft
            | MessageKind::FaceDetectionUpdate
    )
}

/// Ownership changes are echoed so the requester sees the same owner as its peers.
fn echoes_to_sender(kind: &MessageKind) -> bool {
    matches!(kind, MessageKind::CameraRequest | MessageKind::CameraRelease)
}

fn membership_control(env: &Envelope, sender: &Membership) -> Option<Route> {
    match env.kind {
        MessageKind::JoinRoom => Some(match (&env.room_id, &env.device_id) {
            (Some(room_id), Some(device_id)) => Route::Join {
                room_id: room_id.clone(),
                device_id: device_id.clone(),
            },
            _ => Route::Drop(DropReason::IncompleteJoin),
        }),
        MessageKind::RequestRoomPeers => Some(if sender.in_local_room() {
            Route::RoomPeers
        } else {
            Route::Drop(DropReason::NotInRoom)
        }),
        _ => None,
    }
}

fn keepalive(env: &Envelope, _: &Membership) -> Option<Route> {
    (env.kind == MessageKind::Ping).then_some(Route::Pong)
}

fn room_relay(env: &Envelope, sender: &Membership) -> Option<Route> {
    if !is_room_scoped(&env.kind) {
        return None;
    }
    Some(match sender.room_id() {
        Some(room_id) => Route::Room {
            room_id: room_id.to_string(),
            echo: echoes_to_sender(&env.kind),
        },
        None => Route::Drop(DropReason::NotInRoom),
    })
}

/// `offer`/`answer`/`ice`: intra-room when fully addressed from a room member,
/// otherwise an external call frame for everyone.
fn negotiation(env: &Envelope, sender: &Membership) -> Option<Route> {
    if !env.kind.is_negotiation() {
        return None;
    }
    match sender.room_id() {
        Some(room_id) if env.is_room_addressed() => Some(Route::Room {
            room_id: room_id.to_string(),
            echo: false,
        }),
        _ => Some(Route::Global),
    }
}

fn fallback(_: &Envelope, _: &Membership) -> Option<Route> {
    Some(Route::Global)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(room: &str, device: &str) -> Membership {
        Membership::RoomMember {
            room_id: room.into(),
            device_id: device.into(),
        }
    }

    fn route(json: &str, sender: &Membership) -> Route {
        classify(&Envelope::parse(json).unwrap(), sender)
    }

    #[test]
    fn join_requires_room_and_device() {
        assert_eq!(
            route(r#"{"type":"join-room","roomId":"room-1","deviceId":"A"}"#, &Membership::Unjoined),
            Route::Join {
                room_id: "room-1".into(),
                device_id: "A".into()
            }
        );
        assert_eq!(
            route(r#"{"type":"join-room","roomId":"room-1"}"#, &Membership::Unjoined),
            Route::Drop(DropReason::IncompleteJoin)
        );
    }

    #[test]
    fn room_peers_only_for_members() {
        let json = r#"{"type":"request-room-peers"}"#;
        assert_eq!(route(json, &member("room-1", "A")), Route::RoomPeers);
        assert_eq!(
            route(json, &Membership::Unjoined),
            Route::Drop(DropReason::NotInRoom)
        );
    }

    #[test]
    fn ping_is_answered_never_relayed() {
        assert_eq!(route(r#"{"type":"ping"}"#, &member("room-1", "A")), Route::Pong);
        assert_eq!(route(r#"{"type":"ping"}"#, &Membership::Unjoined), Route::Pong);
    }

    #[test]
    fn room_scoped_frames_go_to_the_senders_room() {
        // roomId in the frame does not matter, the sender's room does
        assert_eq!(
            route(
                r#"{"type":"room-video-offer","roomId":"elsewhere"}"#,
                &member("room-1", "A")
            ),
            Route::Room {
                room_id: "room-1".into(),
                echo: false
            }
        );
        assert_eq!(
            route(r#"{"type":"face-detection-update","hasFace":true}"#, &Membership::Unjoined),
            Route::Drop(DropReason::NotInRoom)
        );
    }

    #[test]
    fn camera_ownership_frames_echo() {
        for ty in ["camera-request", "camera-release"] {
            let json = format!(r#"{{"type":"{ty}","deviceId":"B"}}"#);
            assert_eq!(
                route(&json, &member("room-1", "B")),
                Route::Room {
                    room_id: "room-1".into(),
                    echo: true
                }
            );
        }
    }

    #[test]
    fn fully_addressed_offer_from_member_stays_in_room() {
        let json = r#"{"type":"offer","roomId":"room-1","toDeviceId":"A","fromDeviceId":"B","sdp":"v=0"}"#;
        assert_eq!(
            route(json, &member("room-1", "B")),
            Route::Room {
                room_id: "room-1".into(),
                echo: false
            }
        );
        // Same frame from a connection outside any room is external
        assert_eq!(route(json, &Membership::Unjoined), Route::Global);
    }

    #[test]
    fn partially_addressed_negotiation_is_external() {
        let sender = member("room-1", "B");
        for json in [
            r#"{"type":"offer","roomId":"room-1","toDeviceId":"A"}"#,
            r#"{"type":"answer","toDeviceId":"A","fromDeviceId":"B"}"#,
            r#"{"type":"ice","candidate":"c"}"#,
        ] {
            assert_eq!(route(json, &sender), Route::Global, "{json}");
        }
    }

    #[test]
    fn unknown_types_fall_through_to_global() {
        assert_eq!(
            route(r#"{"type":"future-thing"}"#, &member("room-1", "A")),
            Route::Global
        );
        assert_eq!(route(r#"{"sdp":"no type"}"#, &Membership::Unjoined), Route::Global);
    }
}
