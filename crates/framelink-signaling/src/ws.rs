//! Per-socket task.
//!
//! Split the socket; a writer task drains the connection's outbound queue
//! while this task reads frames and hands them to the hub. The read loop also
//! ends when the hub evicts the connection.

use crate::connection::{ConnectionHandle, Outbound};
use crate::hub::Hub;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// How long the writer may keep flushing after the read side is done.
const WRITER_GRACE: Duration = Duration::from_secs(1);

pub async fn handle_socket(socket: WebSocket, hub: Arc<Hub>, remote: Option<SocketAddr>) {
    let (mut sender, mut receiver) = socket.split();
    let ConnectionHandle {
        id,
        mut outbound,
        closed,
    } = hub.accept(remote).await;

    // ── Sender task ──────────────────────────────────────────────────────────
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let msg = match frame {
                Outbound::Text(text) => Message::Text(text.to_string().into()),
                Outbound::Ping => Message::Ping(Default::default()),
                Outbound::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    // ── Receive loop ─────────────────────────────────────────────────────────
    loop {
        tokio::select! {
            _ = closed.notified() => break,
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => hub.handle_text(id, text.as_str()).await,
                Some(Ok(Message::Binary(bytes))) => {
                    hub.handle_text(id, &String::from_utf8_lossy(&bytes)).await;
                }
                Some(Ok(Message::Pong(_))) => hub.heartbeat_reply(id).await,
                // Pings are answered by the socket itself
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(conn = %id, error = %e, "WebSocket error");
                    break;
                }
            },
        }
    }

    // ── Cleanup ───────────────────────────────────────────────────────────────
    hub.disconnect(id).await;
    // Dropping the hub's entry closed the queue; let the writer flush what is left
    if tokio::time::timeout(WRITER_GRACE, &mut send_task).await.is_err() {
        send_task.abort();
    }
}
