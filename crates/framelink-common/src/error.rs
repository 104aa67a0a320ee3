//! Centralized error types for FrameLink.
//!
//! Uses `thiserror` for ergonomic error definitions. Protocol errors are the
//! only kind a client ever sees; everything else stays in the server log.

/// Core application error type used across all FrameLink crates.
#[derive(Debug, thiserror::Error)]
pub enum FramelinkError {
    // === Protocol errors ===
    #[error("Invalid message format")]
    InvalidMessage(#[from] serde_json::Error),

    #[error("Invalid message format: expected a JSON object")]
    NotAnObject,

    // === Startup errors ===
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl FramelinkError {
    /// Whether the error was caused by a client frame rather than by the server.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::InvalidMessage(_) | Self::NotAnObject)
    }

    /// Text sent back to a client in an `error` frame.
    /// Details of the parse failure are logged, never echoed.
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::InvalidMessage(_) | Self::NotAnObject => "Invalid message format",
            _ => "Internal server error",
        }
    }
}

/// Convenience type alias for Results using FramelinkError.
pub type FramelinkResult<T> = Result<T, FramelinkError>;
