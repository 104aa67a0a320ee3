//! Error types for the FrameLink client.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// An error from the WebSocket layer.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No signaling connection is open.
    #[error("Signaling client is not connected")]
    NotConnected,

    /// The media layer failed to carry out a takeover step.
    #[error("Media error: {0}")]
    Media(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
