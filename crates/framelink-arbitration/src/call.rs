//! External call phase of a room, as seen by the server.

use serde::Serialize;

/// Whether a room is bridged to an outside peer, and whether the camera
/// owner is currently being swapped underneath that call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "kebab-case")]
pub enum CallPhase {
    #[default]
    Idle,
    ExternalCallActive,
    /// Ownership moved to `to` mid-call; waiting for its renegotiation offer.
    HandingOver { to: String },
}

impl CallPhase {
    /// `callActive` in protocol terms.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle)
    }
}
