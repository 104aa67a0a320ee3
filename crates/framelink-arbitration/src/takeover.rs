//! Client-side call takeover.
//!
//! Each device runs one [`CallTakeover`]. When camera ownership moves while an
//! external call is up, the old owner mutes its outgoing media at once. The
//! new owner waits `delay` for that to settle, and only then unmutes and sends
//! a fresh offer on the same peer connection, so the two sources are never
//! live together. The peer connection is never closed by this machine; there
//! is no action that would do so.
//!
//! The delay is modelled as a scheduled action carrying a [`HandoverToken`].
//! A later ownership change supersedes the pending token, and completing with
//! a stale token is a no-op.

use serde::Serialize;
use std::time::Duration;

/// Identifies one scheduled renegotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct HandoverToken(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "kebab-case")]
pub enum TakeoverPhase {
    Idle,
    ExternalCallActive,
    /// This device just became owner mid-call and has a renegotiation pending.
    HandingOver { token: HandoverToken },
}

/// Side effects the caller must perform, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeoverAction {
    /// Stop sending local media on the external connection. Keep the connection.
    DisableOutgoing,
    /// Swap the local capture into the outgoing tracks.
    EnableOutgoing,
    /// Call [`CallTakeover::complete_handover`] with `token` after `delay`.
    /// Outgoing media stays off until then.
    ScheduleRenegotiation { token: HandoverToken, delay: Duration },
    /// The renegotiation scheduled under this token must not run.
    CancelPending(HandoverToken),
    /// Create a new offer and send it to the external peer.
    Renegotiate,
}

#[derive(Debug)]
pub struct CallTakeover {
    device_id: String,
    delay: Duration,
    phase: TakeoverPhase,
    is_owner: bool,
    next_token: u64,
}

impl CallTakeover {
    pub fn new(device_id: impl Into<String>, delay: Duration) -> Self {
        Self {
            device_id: device_id.into(),
            delay,
            phase: TakeoverPhase::Idle,
            is_owner: false,
            next_token: 0,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn phase(&self) -> TakeoverPhase {
        self.phase
    }

    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    pub fn call_active(&self) -> bool {
        !matches!(self.phase, TakeoverPhase::Idle)
    }

    /// An external offer/answer was exchanged while the room had
    /// `member_count` devices. Only a room with more than one member bridges
    /// a call. Returns true on `Idle -> ExternalCallActive`.
    pub fn call_started(&mut self, member_count: usize) -> bool {
        if self.call_active() || member_count <= 1 {
            return false;
        }
        tracing::info!(device = %self.device_id, owner = self.is_owner, members = member_count, "External call started");
        self.phase = TakeoverPhase::ExternalCallActive;
        true
    }

    pub fn call_ended(&mut self) -> Vec<TakeoverAction> {
        let mut actions = Vec::new();
        if let TakeoverPhase::HandingOver { token } = self.phase {
            actions.push(TakeoverAction::CancelPending(token));
        }
        if self.call_active() {
            tracing::info!(device = %self.device_id, "External call ended");
        }
        self.phase = TakeoverPhase::Idle;
        actions
    }

    /// Camera ownership is now `owner` (`None` after a release).
    pub fn on_owner_changed(&mut self, owner: Option<&str>) -> Vec<TakeoverAction> {
        let was_owner = self.is_owner;
        self.is_owner = owner == Some(self.device_id.as_str());

        if was_owner == self.is_owner {
            return Vec::new();
        }

        // A pending takeover never enabled media, so there is nothing to disable
        if let TakeoverPhase::HandingOver { token } = self.phase {
            tracing::info!(device = %self.device_id, token = token.0, "Takeover superseded before media was enabled");
            self.phase = TakeoverPhase::ExternalCallActive;
            return vec![TakeoverAction::CancelPending(token)];
        }

        if !self.call_active() {
            return Vec::new();
        }

        if was_owner {
            tracing::info!(device = %self.device_id, new_owner = owner.unwrap_or("none"), "Handing call media over");
            return vec![TakeoverAction::DisableOutgoing];
        }

        self.next_token += 1;
        let token = HandoverToken(self.next_token);
        tracing::info!(device = %self.device_id, token = token.0, "Taking over call media");
        self.phase = TakeoverPhase::HandingOver { token };
        vec![TakeoverAction::ScheduleRenegotiation {
            token,
            delay: self.delay,
        }]
    }

    /// The delay for `token` elapsed. Returns enable-then-renegotiate only if
    /// `token` is still the pending one, nothing otherwise.
    pub fn complete_handover(&mut self, token: HandoverToken) -> Vec<TakeoverAction> {
        match self.phase {
            TakeoverPhase::HandingOver { token: pending } if pending == token => {
                self.phase = TakeoverPhase::ExternalCallActive;
                vec![TakeoverAction::EnableOutgoing, TakeoverAction::Renegotiate]
            }
            _ => {
                tracing::debug!(device = %self.device_id, token = token.0, "Stale handover token ignored");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_millis(300);

    const TAKE_OVER: [TakeoverAction; 2] =
        [TakeoverAction::EnableOutgoing, TakeoverAction::Renegotiate];

    fn scheduled(actions: &[TakeoverAction]) -> HandoverToken {
        actions
            .iter()
            .find_map(|a| match a {
                TakeoverAction::ScheduleRenegotiation { token, .. } => Some(*token),
                _ => None,
            })
            .expect("renegotiation scheduled")
    }

    #[test]
    fn new_owner_enables_and_renegotiates_only_after_delay() {
        let mut x = CallTakeover::new("X", DELAY);
        assert!(x.call_started(2));

        let actions = x.on_owner_changed(Some("X"));
        let token = scheduled(&actions);
        // Nothing is enabled while the previous owner is still disabling
        assert_eq!(
            actions,
            vec![TakeoverAction::ScheduleRenegotiation { token, delay: DELAY }]
        );
        assert_eq!(x.phase(), TakeoverPhase::HandingOver { token });

        assert_eq!(x.complete_handover(token), TAKE_OVER);
        assert_eq!(x.phase(), TakeoverPhase::ExternalCallActive);
    }

    #[test]
    fn previous_owner_only_disables_media() {
        let mut y = CallTakeover::new("Y", DELAY);
        y.on_owner_changed(Some("Y"));
        y.call_started(2);

        let actions = y.on_owner_changed(Some("X"));
        assert_eq!(actions, vec![TakeoverAction::DisableOutgoing]);
        assert_eq!(y.phase(), TakeoverPhase::ExternalCallActive);
    }

    #[test]
    fn lone_device_never_enters_a_call() {
        let mut x = CallTakeover::new("X", DELAY);
        assert!(!x.call_started(1));
        assert!(!x.call_started(0));
        assert_eq!(x.phase(), TakeoverPhase::Idle);
        assert!(x.on_owner_changed(Some("X")).is_empty());
    }

    #[test]
    fn newer_ownership_change_cancels_pending_renegotiation() {
        let mut x = CallTakeover::new("X", DELAY);
        x.call_started(2);

        let first = scheduled(&x.on_owner_changed(Some("X")));
        // Media was never enabled, so only the timer is cancelled
        let actions = x.on_owner_changed(Some("Z"));
        assert_eq!(actions, vec![TakeoverAction::CancelPending(first)]);

        // The timer fired anyway; its token is stale
        assert!(x.complete_handover(first).is_empty());

        let second = scheduled(&x.on_owner_changed(Some("X")));
        assert_ne!(first, second);
        assert!(x.complete_handover(first).is_empty());
        assert_eq!(x.complete_handover(second), TAKE_OVER);
    }

    #[test]
    fn ownership_changes_outside_a_call_touch_no_media() {
        let mut x = CallTakeover::new("X", DELAY);
        assert!(x.on_owner_changed(Some("X")).is_empty());
        assert!(x.is_owner());
        assert!(x.on_owner_changed(None).is_empty());
        assert_eq!(x.phase(), TakeoverPhase::Idle);
    }

    #[test]
    fn repeated_announcement_of_same_owner_keeps_pending_handover() {
        let mut x = CallTakeover::new("X", DELAY);
        x.call_started(2);
        let token = scheduled(&x.on_owner_changed(Some("X")));

        assert!(x.on_owner_changed(Some("X")).is_empty());
        assert_eq!(x.complete_handover(token), TAKE_OVER);
    }

    #[test]
    fn call_end_cancels_pending_and_returns_to_idle() {
        let mut x = CallTakeover::new("X", DELAY);
        x.call_started(2);
        let token = scheduled(&x.on_owner_changed(Some("X")));

        assert_eq!(x.call_ended(), vec![TakeoverAction::CancelPending(token)]);
        assert_eq!(x.phase(), TakeoverPhase::Idle);
        assert!(x.complete_handover(token).is_empty());
        assert!(x.call_started(3));
    }
}
