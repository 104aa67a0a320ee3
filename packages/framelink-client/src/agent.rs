//! Per-device room agent.
//!
//! Listens to the room's signaling traffic and runs the call takeover state
//! machine against the device's media layer. When this device becomes camera
//! owner during an external call it waits out the handover delay, then enables
//! its outgoing media and renegotiates, unless a newer ownership change or the
//! end of the call cancels the pending takeover first.

use std::sync::Arc;

use async_trait::async_trait;
use framelink_arbitration::{ArbitrationConfig, CallTakeover, HandoverToken, TakeoverAction, TakeoverPhase};
use framelink_common::protocol::MessageKind;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::signaling::{SignalEvent, SignalingClient};

/// The device's media layer. The external peer connection stays open across
/// every call made here.
#[async_trait]
pub trait MediaController: Send {
    /// Stop sending local tracks on the external connection.
    async fn disable_outgoing(&mut self) -> Result<()>;
    /// Put the local capture onto the external connection's senders.
    async fn enable_outgoing(&mut self) -> Result<()>;
    /// Create a fresh offer on the existing connection.
    async fn create_offer(&mut self) -> Result<Value>;
}

pub struct RoomAgent<M> {
    client: Arc<SignalingClient>,
    media: M,
    room_id: String,
    takeover: CallTakeover,
    owner: Option<String>,
    /// Device count from the latest `room-update`.
    members: usize,
    pending: Option<(HandoverToken, JoinHandle<()>)>,
}

impl<M: MediaController + 'static> RoomAgent<M> {
    pub fn new(
        client: Arc<SignalingClient>,
        media: M,
        room_id: impl Into<String>,
        device_id: impl Into<String>,
        config: &ArbitrationConfig,
    ) -> Self {
        Self {
            client,
            media,
            room_id: room_id.into(),
            takeover: CallTakeover::new(device_id, config.handover_delay),
            owner: None,
            members: 0,
            pending: None,
        }
    }

    pub fn phase(&self) -> TakeoverPhase {
        self.takeover.phase()
    }

    /// Join the room and process events until the client's event stream ends.
    pub async fn run(mut self) -> Result<()> {
        let mut events = self.client.subscribe();
        let (timer_tx, mut timers) = mpsc::channel::<HandoverToken>(16);

        self.client
            .join_room(&self.room_id, self.takeover.device_id())
            .await?;
        info!(room = %self.room_id, device = %self.takeover.device_id(), "Room agent started");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event, &timer_tx).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Room agent lagging behind signaling events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(token) = timers.recv() => {
                    let actions = self.takeover.complete_handover(token);
                    self.apply(actions, &timer_tx).await;
                }
            }
        }

        self.cancel_pending();
        Ok(())
    }

    async fn handle_event(&mut self, event: SignalEvent, timers: &mpsc::Sender<HandoverToken>) {
        let env = &event.envelope;
        let actions = match &env.kind {
            MessageKind::Other(kind) if kind == "room-update" => {
                if env.room_id.as_deref() == Some(self.room_id.as_str()) {
                    self.members = event.data["devices"].as_array().map_or(0, Vec::len);
                    debug!(room = %self.room_id, members = self.members, "Room membership updated");
                }
                return;
            }
            MessageKind::CameraRequest => {
                let Some(device) = env.device_id.clone() else {
                    return;
                };
                debug!(owner = %device, automatic = event.data["automatic"].as_bool().unwrap_or(false), "Camera owner announced");
                let actions = self.takeover.on_owner_changed(Some(device.as_str()));
                self.owner = Some(device);
                actions
            }
            MessageKind::CameraRelease => {
                if env.device_id.is_none() || env.device_id != self.owner {
                    return;
                }
                self.owner = None;
                self.takeover.on_owner_changed(None)
            }
            MessageKind::Offer | MessageKind::Answer if !env.is_room_addressed() => {
                self.takeover.call_started(self.members);
                return;
            }
            MessageKind::MasterCallStart => {
                self.takeover.call_started(self.members);
                return;
            }
            MessageKind::CallEnd => self.takeover.call_ended(),
            _ => return,
        };
        self.apply(actions, timers).await;
    }

    async fn apply(&mut self, actions: Vec<TakeoverAction>, timers: &mpsc::Sender<HandoverToken>) {
        for action in actions {
            match action {
                TakeoverAction::DisableOutgoing => {
                    if let Err(e) = self.media.disable_outgoing().await {
                        warn!(error = %e, "Failed to disable outgoing media");
                    }
                }
                TakeoverAction::EnableOutgoing => {
                    if let Err(e) = self.media.enable_outgoing().await {
                        warn!(error = %e, "Failed to enable outgoing media");
                    }
                }
                TakeoverAction::ScheduleRenegotiation { token, delay } => {
                    let tx = timers.clone();
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(token).await;
                    });
                    if let Some((_, stale)) = self.pending.replace((token, handle)) {
                        stale.abort();
                    }
                }
                TakeoverAction::CancelPending(token) => {
                    if matches!(&self.pending, Some((pending, _)) if *pending == token) {
                        self.cancel_pending();
                    }
                }
                TakeoverAction::Renegotiate => {
                    self.pending = None;
                    self.renegotiate().await;
                }
            }
        }
    }

    async fn renegotiate(&mut self) {
        let offer = match self.media.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                warn!(error = %e, "Failed to create takeover offer");
                return;
            }
        };
        match self.client.send_offer(self.takeover.device_id(), offer).await {
            Ok(()) => info!(device = %self.takeover.device_id(), "Takeover offer sent"),
            Err(e) => warn!(error = %e, "Failed to send takeover offer"),
        }
    }

    fn cancel_pending(&mut self) {
        if let Some((token, handle)) = self.pending.take() {
            debug!(token = token.0, "Pending renegotiation cancelled");
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message;

    const DELAY: Duration = Duration::from_millis(300);

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<&'static str>>>);

    impl Recorder {
        fn calls(&self) -> Vec<&'static str> {
            self.0.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MediaController for Recorder {
        async fn disable_outgoing(&mut self) -> Result<()> {
            self.0.lock().unwrap().push("disable");
            Ok(())
        }
        async fn enable_outgoing(&mut self) -> Result<()> {
            self.0.lock().unwrap().push("enable");
            Ok(())
        }
        async fn create_offer(&mut self) -> Result<Value> {
            self.0.lock().unwrap().push("offer");
            Ok(json!({"type": "offer", "sdp": "v=0"}))
        }
    }

    fn frame_type(msg: &Message) -> String {
        match msg {
            Message::Text(text) => {
                let v: Value = serde_json::from_str(text.as_str()).unwrap();
                v["type"].as_str().unwrap_or_default().to_string()
            }
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    fn room_update(devices: &[&str]) -> Value {
        let devices: Vec<Value> = devices.iter().map(|d| json!({"deviceId": d})).collect();
        json!({"type": "room-update", "roomId": "r1", "devices": devices})
    }

    async fn started_agent() -> (Arc<SignalingClient>, mpsc::Receiver<Message>, Recorder) {
        let (client, mut rx) = SignalingClient::loopback().await;
        let client = Arc::new(client);
        let media = Recorder::default();
        let config = ArbitrationConfig {
            handover_delay: DELAY,
            ..ArbitrationConfig::default()
        };
        let agent = RoomAgent::new(client.clone(), media.clone(), "r1", "X", &config);
        tokio::spawn(agent.run());

        // The agent subscribes before it sends the join
        assert_eq!(frame_type(&rx.recv().await.unwrap()), "join-room");
        (client, rx, media)
    }

    /// Let the agent task drain what has been emitted without moving the clock.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn becoming_owner_mid_call_enables_and_renegotiates_after_delay() {
        let (client, mut rx, media) = started_agent().await;

        client.emit(room_update(&["X", "Y"]));
        client.emit(json!({"type": "answer", "sdp": "v=0"}));
        client.emit(json!({"type": "camera-request", "roomId": "r1", "deviceId": "X", "automatic": true}));

        // Previous owner is still disabling: nothing is live on this device yet
        settle().await;
        tokio::time::sleep(DELAY - Duration::from_millis(1)).await;
        assert!(media.calls().is_empty());

        let start = tokio::time::Instant::now();
        let offer = rx.recv().await.unwrap();
        assert_eq!(frame_type(&offer), "offer");
        assert!(start.elapsed() <= Duration::from_millis(1));
        assert_eq!(media.calls(), vec!["enable", "offer"]);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_ownership_change_cancels_pending_renegotiation() {
        let (client, mut rx, media) = started_agent().await;

        client.emit(room_update(&["X", "Y"]));
        client.emit(json!({"type": "master-call-start", "roomId": "r1"}));
        client.emit(json!({"type": "camera-request", "roomId": "r1", "deviceId": "X"}));
        client.emit(json!({"type": "camera-request", "roomId": "r1", "deviceId": "Y"}));
        client.emit(json!({"type": "camera-request", "roomId": "r1", "deviceId": "X"}));

        assert_eq!(frame_type(&rx.recv().await.unwrap()), "offer");
        tokio::time::sleep(DELAY * 3).await;
        assert!(rx.try_recv().is_err());
        // The superseded takeover never touched the media
        assert_eq!(media.calls(), vec!["enable", "offer"]);
    }

    #[tokio::test(start_paused = true)]
    async fn losing_ownership_mid_call_disables_at_once() {
        let (client, mut rx, media) = started_agent().await;

        client.emit(room_update(&["X", "Y"]));
        client.emit(json!({"type": "camera-request", "roomId": "r1", "deviceId": "X"}));
        client.emit(json!({"type": "answer", "sdp": "v=0"}));
        client.emit(json!({"type": "camera-request", "roomId": "r1", "deviceId": "Y", "automatic": true}));

        settle().await;
        assert_eq!(media.calls(), vec!["disable"]);
        tokio::time::sleep(DELAY * 2).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ownership_changes_without_a_call_touch_nothing() {
        let (client, mut rx, media) = started_agent().await;

        client.emit(room_update(&["X", "Y"]));
        client.emit(json!({"type": "camera-request", "roomId": "r1", "deviceId": "X"}));
        client.emit(json!({"type": "camera-release", "roomId": "r1", "deviceId": "X"}));

        tokio::time::sleep(DELAY * 2).await;
        assert!(rx.try_recv().is_err());
        assert!(media.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lone_device_ignores_external_offers() {
        let (client, mut rx, media) = started_agent().await;

        client.emit(room_update(&["X"]));
        client.emit(json!({"type": "offer", "offer": {"sdp": "v=0"}}));
        client.emit(json!({"type": "camera-request", "roomId": "r1", "deviceId": "X"}));

        tokio::time::sleep(DELAY * 2).await;
        assert!(rx.try_recv().is_err());
        assert!(media.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn call_end_before_delay_cancels_takeover() {
        let (client, mut rx, media) = started_agent().await;

        client.emit(room_update(&["X", "Y"]));
        client.emit(json!({"type": "answer", "sdp": "v=0"}));
        client.emit(json!({"type": "camera-request", "roomId": "r1", "deviceId": "X"}));
        client.emit(json!({"type": "call-end", "roomId": "r1"}));

        tokio::time::sleep(DELAY * 2).await;
        assert!(rx.try_recv().is_err());
        assert!(media.calls().is_empty());
    }
}
