//! Async WebSocket signaling client for FrameLink.

use std::sync::Arc;

use framelink_common::protocol::{Envelope, now_millis};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};

const DEFAULT_URL: &str = "ws://localhost:3000";
const OUTBOUND_BUFFER: usize = 64;

/// One inbound frame: its addressing fields and the full JSON body.
#[derive(Debug, Clone)]
pub struct SignalEvent {
    pub envelope: Envelope,
    pub data: Value,
}

/// Async signaling client.
///
/// ```rust,no_run
/// use framelink_client::SignalingClient;
///
/// #[tokio::main]
/// async fn main() -> framelink_client::Result<()> {
///     let client = SignalingClient::new(Some("ws://localhost:3000"));
///     let mut events = client.subscribe();
///     client.connect().await?;
///     client.join_room("living-room", "laptop").await?;
///     while let Ok(event) = events.recv().await {
///         println!("{}: {}", event.envelope.kind, event.data);
///     }
///     Ok(())
/// }
/// ```
pub struct SignalingClient {
    url: String,
    sender: broadcast::Sender<SignalEvent>,
    outbound: Arc<Mutex<Option<mpsc::Sender<Message>>>>,
}

impl SignalingClient {
    pub fn new(url: Option<&str>) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            url: url.unwrap_or(DEFAULT_URL).to_owned(),
            sender,
            outbound: Arc::new(Mutex::new(None)),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Subscribe to inbound frames.
    pub fn subscribe(&self) -> broadcast::Receiver<SignalEvent> {
        self.sender.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        self.outbound.lock().await.is_some()
    }

    /// Open the socket and spawn the task that pumps it.
    /// Returns once the handshake is done; use [`subscribe`](Self::subscribe) for frames.
    pub async fn connect(&self) -> Result<()> {
        let (ws, _) = connect_async(self.url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
        *self.outbound.lock().await = Some(tx);
        info!(url = %self.url, "Signaling connected");

        let events = self.sender.clone();
        let outbound = Arc::clone(&self.outbound);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    out = rx.recv() => {
                        let Some(msg) = out else { break };
                        let closing = matches!(msg, Message::Close(_));
                        if let Err(e) = sink.send(msg).await {
                            warn!("Signaling: send failed: {e}");
                            break;
                        }
                        if closing {
                            break;
                        }
                    }
                    inbound = stream.next() => match inbound {
                        Some(Ok(Message::Text(text))) => publish(&events, text.as_str()),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Signaling: connection error: {e}");
                            break;
                        }
                    },
                }
            }
            *outbound.lock().await = None;
            info!("Signaling disconnected");
        });

        Ok(())
    }

    /// Send a raw frame.
    pub async fn send(&self, frame: Value) -> Result<()> {
        let guard = self.outbound.lock().await;
        let tx = guard.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(Message::Text(frame.to_string().into()))
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    pub async fn join_room(&self, room_id: &str, device_id: &str) -> Result<()> {
        self.send(json!({ "type": "join-room", "roomId": room_id, "deviceId": device_id }))
            .await
    }

    pub async fn request_room_peers(&self) -> Result<()> {
        self.send(json!({ "type": "request-room-peers" })).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.send(json!({ "type": "ping" })).await
    }

    /// Claim the camera for `device_id`.
    pub async fn request_camera(&self, room_id: &str, device_id: &str) -> Result<()> {
        self.send(json!({
            "type": "camera-request",
            "roomId": room_id,
            "deviceId": device_id,
            "timestamp": now_millis(),
        }))
        .await
    }

    pub async fn release_camera(&self, room_id: &str, device_id: &str) -> Result<()> {
        self.send(json!({
            "type": "camera-release",
            "roomId": room_id,
            "deviceId": device_id,
            "timestamp": now_millis(),
        }))
        .await
    }

    pub async fn report_face(
        &self,
        room_id: &str,
        device_id: &str,
        has_face: bool,
        confidence: f64,
    ) -> Result<()> {
        self.send(json!({
            "type": "face-detection-update",
            "roomId": room_id,
            "deviceId": device_id,
            "hasFace": has_face,
            "confidence": confidence,
            "timestamp": now_millis(),
        }))
        .await
    }

    /// Send an offer to the external peer. No `toDeviceId`, so it is relayed
    /// outside the room.
    pub async fn send_offer(&self, device_id: &str, offer: Value) -> Result<()> {
        self.send(json!({ "type": "offer", "fromDeviceId": device_id, "offer": offer }))
            .await
    }

    pub async fn end_call(&self, room_id: &str, device_id: &str) -> Result<()> {
        self.send(json!({ "type": "call-end", "roomId": room_id, "deviceId": device_id }))
            .await
    }

    /// Ask the pump task to close the socket.
    pub async fn close(&self) -> Result<()> {
        let tx = self.outbound.lock().await.take().ok_or(ClientError::NotConnected)?;
        tx.send(Message::Close(None))
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    /// A client whose outbound frames land in the returned receiver instead of a socket.
    #[cfg(test)]
    pub(crate) async fn loopback() -> (Self, mpsc::Receiver<Message>) {
        let client = Self::new(None);
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        *client.outbound.lock().await = Some(tx);
        (client, rx)
    }

    /// Inject an inbound frame.
    #[cfg(test)]
    pub(crate) fn emit(&self, frame: Value) {
        publish(&self.sender, &frame.to_string());
    }
}

fn publish(events: &broadcast::Sender<SignalEvent>, text: &str) {
    let data: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!("Signaling: ignoring non-JSON frame: {e}");
            return;
        }
    };
    let Some(map) = data.as_object() else {
        debug!("Signaling: ignoring non-object frame");
        return;
    };
    let envelope = Envelope::from_map(map);
    // No subscribers is fine
    let _ = events.send(SignalEvent { envelope, data });
}
