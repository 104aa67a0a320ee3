//! Camera arbitration: decides which device in a room owns the camera.
//!
//! One engine per room. It is fed face-presence observations in arrival order
//! and answers with at most one [`SwitchDecision`] per input. Time is passed
//! in by the caller, so the engine never reads a clock itself.

use crate::call::CallPhase;
use crate::face::{FaceState, StabilityRule};
use framelink_common::config::ArbitrationSettings;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// Window the switch-rate limit is measured over.
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Confidence above which the flat confidence bonus applies.
const HIGH_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct ArbitrationConfig {
    /// Initial state of face-driven switching for each engine.
    pub auto_switch: bool,
    pub face_threshold: f64,
    pub min_consecutive_hits: u32,
    pub stability_period: Duration,
    pub confidence_bonus: f64,
    /// Added to the current owner's score so near-ties don't flip the camera.
    pub current_owner_bonus: f64,
    /// A candidate must score above this to take the camera.
    pub switch_threshold: f64,
    /// Minimum spacing between two automatic switches.
    pub hysteresis: Duration,
    pub max_switches_per_minute: u32,
    /// Reject automatic switches past `max_switches_per_minute` instead of only logging.
    pub enforce_rate_limit: bool,
    pub manual_override: Duration,
    pub handover_delay: Duration,
}

impl ArbitrationConfig {
    fn stability_rule(&self) -> StabilityRule {
        StabilityRule {
            threshold: self.face_threshold,
            min_hits: self.min_consecutive_hits,
            period: self.stability_period,
        }
    }
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self::from(&ArbitrationSettings::default())
    }
}

impl From<&ArbitrationSettings> for ArbitrationConfig {
    fn from(s: &ArbitrationSettings) -> Self {
        Self {
            auto_switch: s.auto_switch,
            face_threshold: s.face_threshold,
            min_consecutive_hits: s.min_consecutive_hits,
            stability_period: Duration::from_millis(s.stability_period_ms),
            confidence_bonus: s.confidence_bonus,
            current_owner_bonus: s.current_owner_bonus,
            switch_threshold: s.switch_threshold,
            hysteresis: Duration::from_millis(s.hysteresis_ms),
            max_switches_per_minute: s.max_switches_per_minute,
            enforce_rate_limit: s.enforce_rate_limit,
            manual_override: Duration::from_millis(s.manual_override_ms),
            handover_delay: Duration::from_millis(s.handover_delay_ms),
        }
    }
}

/// One report from a face detector.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceObservation {
    pub device_id: String,
    pub has_face: bool,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SwitchReason {
    /// A stable face outscored the current owner.
    FaceDetected,
    /// The owner lost its face and another device had a stable one.
    FaceLost,
    /// A device asked for the camera explicitly.
    Manual,
    /// The owner left the room.
    OwnerLeft,
}

impl SwitchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FaceDetected => "face-detected",
            Self::FaceLost => "face-lost",
            Self::Manual => "manual",
            Self::OwnerLeft => "owner-left",
        }
    }
}

/// An executed ownership change.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchDecision {
    pub from: Option<String>,
    pub to: String,
    pub reason: SwitchReason,
    pub score: Option<f64>,
    /// An external call was live, so the new owner must take over its media.
    pub handover: bool,
}

impl SwitchDecision {
    pub fn is_automatic(&self) -> bool {
        !matches!(self.reason, SwitchReason::Manual)
    }
}

/// Room-level arbitration state.
#[derive(Debug, Clone, Default)]
pub struct ArbitrationState {
    pub current_owner: Option<String>,
    pub last_switch: Option<Instant>,
    /// Switch times inside the trailing rate window, oldest first.
    pub switch_history: VecDeque<Instant>,
    pub switch_count: u64,
    pub manual_override_until: Option<Instant>,
    pub call: CallPhase,
}

/// Snapshot for logs and diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub enabled: bool,
    pub owner: Option<String>,
    pub manual_override: bool,
    pub switch_count: u64,
    pub recent_switches: usize,
    pub call: CallPhase,
    pub faces: BTreeMap<String, FaceState>,
}

pub struct ArbitrationEngine {
    config: ArbitrationConfig,
    enabled: bool,
    faces: BTreeMap<String, FaceState>,
    state: ArbitrationState,
}

impl ArbitrationEngine {
    pub fn new(config: ArbitrationConfig) -> Self {
        Self {
            enabled: config.auto_switch,
            config,
            faces: BTreeMap::new(),
            state: ArbitrationState::default(),
        }
    }

    pub fn config(&self) -> &ArbitrationConfig {
        &self.config
    }

    pub fn owner(&self) -> Option<&str> {
        self.state.current_owner.as_deref()
    }

    pub fn state(&self) -> &ArbitrationState {
        &self.state
    }

    pub fn call_phase(&self) -> &CallPhase {
        &self.state.call
    }

    pub fn face(&self, device_id: &str) -> Option<&FaceState> {
        self.faces.get(device_id)
    }

    /// Turn automatic switching on or off. Manual requests are always honoured.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_manual_override_active(&self, now: Instant) -> bool {
        self.state
            .manual_override_until
            .is_some_and(|until| now < until)
    }

    pub fn clear_manual_override(&mut self) {
        self.state.manual_override_until = None;
    }

    /// Process one face-presence observation.
    pub fn observe(&mut self, obs: &FaceObservation, now: Instant) -> Option<SwitchDecision> {
        if !self.enabled {
            return None;
        }
        if self.is_manual_override_active(now) {
            tracing::debug!(device = %obs.device_id, "Manual override active, ignoring face update");
            return None;
        }

        let rule = self.config.stability_rule();
        let face = self.faces.entry(obs.device_id.clone()).or_default();
        face.observe(obs.has_face, obs.confidence, now, &rule);
        let (is_stable, has_face) = (face.is_stable, face.has_face);

        let is_owner = self.owner() == Some(obs.device_id.as_str());

        if is_stable {
            let (candidate, score) = self.best_stable(None)?;
            if self.owner() == Some(candidate.as_str()) {
                return None;
            }
            if score <= self.config.switch_threshold {
                tracing::debug!(candidate = %candidate, score, "Candidate below switch threshold");
                return None;
            }
            if self.in_hysteresis(now) {
                tracing::debug!(candidate = %candidate, "Hysteresis window active, holding switch");
                return None;
            }
            if self.rate_limited(now) {
                return None;
            }
            return Some(self.execute_switch(candidate, SwitchReason::FaceDetected, Some(score), now));
        }

        if !has_face && is_owner {
            let Some((candidate, score)) = self.best_stable(Some(&obs.device_id)) else {
                tracing::debug!(device = %obs.device_id, "Owner lost face, no stable alternative; keeping owner");
                return None;
            };
            if self.rate_limited(now) {
                return None;
            }
            return Some(self.execute_switch(candidate, SwitchReason::FaceLost, Some(score), now));
        }

        None
    }

    /// Explicit camera request from a device. Opens the manual override window,
    /// which suppresses automatic switching until it elapses.
    ///
    /// Returns `None` when the device already owns the camera.
    pub fn request_manual(&mut self, device_id: &str, now: Instant) -> Option<SwitchDecision> {
        self.state.manual_override_until = Some(now + self.config.manual_override);

        if self.owner() == Some(device_id) {
            return None;
        }
        Some(self.execute_switch(device_id.to_string(), SwitchReason::Manual, None, now))
    }

    /// The owner gives the camera up. Returns whether ownership was cleared.
    pub fn release(&mut self, device_id: &str) -> bool {
        if self.owner() != Some(device_id) {
            return false;
        }
        tracing::info!(device = %device_id, "Camera released");
        self.state.current_owner = None;
        true
    }

    /// Forget a device that left the room. If it owned the camera the best
    /// stable remaining device takes over; otherwise the room has no owner.
    pub fn remove_device(&mut self, device_id: &str, now: Instant) -> Option<SwitchDecision> {
        self.faces.remove(device_id);

        if self.owner() != Some(device_id) {
            return None;
        }
        match self.best_stable(None) {
            Some((candidate, score)) => {
                Some(self.execute_switch(candidate, SwitchReason::OwnerLeft, Some(score), now))
            }
            None => {
                self.state.current_owner = None;
                if matches!(&self.state.call, CallPhase::HandingOver { to } if to == device_id) {
                    self.state.call = CallPhase::ExternalCallActive;
                }
                None
            }
        }
    }

    /// An external-call signal was seen for this room.
    /// Only a room with more than one member bridges a call.
    pub fn start_external_call(&mut self, member_count: usize) -> bool {
        if self.state.call.is_active() || member_count <= 1 {
            return false;
        }
        tracing::info!(members = member_count, "External call active");
        self.state.call = CallPhase::ExternalCallActive;
        true
    }

    /// An external offer from `device_id`. Completes a pending handover when
    /// it comes from the device being handed to.
    pub fn external_offer_from(&mut self, device_id: &str) -> bool {
        match &self.state.call {
            CallPhase::HandingOver { to } if to == device_id => {
                tracing::info!(device = %device_id, "Handover renegotiated");
                self.state.call = CallPhase::ExternalCallActive;
                true
            }
            _ => false,
        }
    }

    pub fn end_call(&mut self) -> bool {
        if !self.state.call.is_active() {
            return false;
        }
        tracing::info!("External call ended");
        self.state.call = CallPhase::Idle;
        true
    }

    pub fn status(&self, now: Instant) -> EngineStatus {
        EngineStatus {
            enabled: self.enabled,
            owner: self.state.current_owner.clone(),
            manual_override: self.is_manual_override_active(now),
            switch_count: self.state.switch_count,
            recent_switches: self.recent_switches(now),
            call: self.state.call.clone(),
            faces: self.faces.clone(),
        }
    }

    /// `delta + bonus (confidence > 0.8) + owner bonus`.
    fn score(&self, device_id: &str, face: &FaceState) -> f64 {
        let mut score = face.delta();
        if face.confidence > HIGH_CONFIDENCE {
            score += self.config.confidence_bonus;
        }
        if self.owner() == Some(device_id) {
            score += self.config.current_owner_bonus;
        }
        score
    }

    /// Highest-scoring stable device, optionally skipping one. Ties keep the
    /// lexically first device id.
    fn best_stable(&self, exclude: Option<&str>) -> Option<(String, f64)> {
        let mut best: Option<(&str, f64)> = None;
        for (id, face) in &self.faces {
            if !face.is_stable || exclude == Some(id.as_str()) {
                continue;
            }
            let score = self.score(id, face);
            if best.is_none_or(|(_, top)| score > top) {
                best = Some((id, score));
            }
        }
        best.map(|(id, score)| (id.to_string(), score))
    }

    fn in_hysteresis(&self, now: Instant) -> bool {
        self.state
            .last_switch
            .is_some_and(|last| now.saturating_duration_since(last) < self.config.hysteresis)
    }

    fn recent_switches(&self, now: Instant) -> usize {
        self.state
            .switch_history
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < RATE_WINDOW)
            .count()
    }

    fn rate_limited(&self, now: Instant) -> bool {
        let recent = self.recent_switches(now);
        if recent < self.config.max_switches_per_minute as usize {
            return false;
        }
        if self.config.enforce_rate_limit {
            tracing::warn!(recent, "Switch rate limit reached, holding switch");
            true
        } else {
            tracing::debug!(recent, "Switch rate above limit (not enforced)");
            false
        }
    }

    fn execute_switch(
        &mut self,
        to: String,
        reason: SwitchReason,
        score: Option<f64>,
        now: Instant,
    ) -> SwitchDecision {
        let from = self.state.current_owner.replace(to.clone());

        self.state.last_switch = Some(now);
        self.state.switch_count += 1;
        self.state.switch_history.push_back(now);
        while self
            .state
            .switch_history
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= RATE_WINDOW)
        {
            self.state.switch_history.pop_front();
        }

        let handover = self.state.call.is_active();
        if handover {
            self.state.call = CallPhase::HandingOver { to: to.clone() };
        }

        tracing::info!(
            from = from.as_deref().unwrap_or("none"),
            to = %to,
            reason = reason.as_str(),
            score = score.unwrap_or_default(),
            handover,
            "Camera owner switched"
        );

        SwitchDecision {
            from,
            to,
            reason,
            score,
            handover,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn obs(device: &str, has_face: bool, confidence: f64) -> FaceObservation {
        FaceObservation {
            device_id: device.into(),
            has_face,
            confidence,
        }
    }

    /// Feed three hits spanning more than the stability period.
    fn stabilize(
        engine: &mut ArbitrationEngine,
        device: &str,
        confidence: f64,
        start: Instant,
    ) -> Option<SwitchDecision> {
        engine.observe(&obs(device, true, confidence), start);
        engine.observe(&obs(device, true, confidence), start + ms(800));
        engine.observe(&obs(device, true, confidence), start + ms(1600))
    }

    #[test]
    fn stable_high_confidence_face_takes_the_camera() {
        let t0 = Instant::now();
        let mut engine = ArbitrationEngine::new(ArbitrationConfig::default());

        let decision = stabilize(&mut engine, "X", 0.9, t0).expect("switch");
        assert_eq!(decision.to, "X");
        assert_eq!(decision.from, None);
        assert_eq!(decision.reason, SwitchReason::FaceDetected);
        assert!(!decision.handover);
        assert_eq!(engine.owner(), Some("X"));
    }

    #[test]
    fn steady_mid_confidence_does_not_clear_the_threshold() {
        let t0 = Instant::now();
        let mut engine = ArbitrationEngine::new(ArbitrationConfig::default());

        // delta is 0 and no bonus below 0.8
        assert!(stabilize(&mut engine, "X", 0.7, t0).is_none());
        assert_eq!(engine.owner(), None);
    }

    #[test]
    fn unstable_sequences_never_switch() {
        let t0 = Instant::now();
        let mut engine = ArbitrationEngine::new(ArbitrationConfig::default());

        for i in 0..10 {
            assert!(engine.observe(&obs("X", true, 0.95), t0 + ms(i * 100)).is_none());
        }
        assert!(!engine.face("X").unwrap().is_stable);
        assert_eq!(engine.owner(), None);
    }

    #[test]
    fn owner_keeps_camera_against_an_equal_challenger() {
        let t0 = Instant::now();
        let mut engine = ArbitrationEngine::new(ArbitrationConfig::default());

        stabilize(&mut engine, "A", 0.9, t0).expect("A takes camera");
        let later = t0 + ms(5000);
        assert!(stabilize(&mut engine, "B", 0.9, later).is_none());
        assert_eq!(engine.owner(), Some("A"));
    }

    #[test]
    fn owner_losing_face_hands_to_best_stable_alternative() {
        let t0 = Instant::now();
        let mut engine = ArbitrationEngine::new(ArbitrationConfig::default());

        stabilize(&mut engine, "A", 0.9, t0);
        stabilize(&mut engine, "B", 0.9, t0 + ms(5000));
        assert_eq!(engine.owner(), Some("A"));

        let decision = engine
            .observe(&obs("A", false, 0.0), t0 + ms(7000))
            .expect("handover to B");
        assert_eq!(decision.reason, SwitchReason::FaceLost);
        assert_eq!(decision.from.as_deref(), Some("A"));
        assert_eq!(decision.to, "B");
    }

    #[test]
    fn owner_losing_face_without_alternative_keeps_camera() {
        let t0 = Instant::now();
        let mut engine = ArbitrationEngine::new(ArbitrationConfig::default());

        stabilize(&mut engine, "A", 0.9, t0);
        assert!(engine.observe(&obs("A", false, 0.0), t0 + ms(3000)).is_none());
        assert_eq!(engine.owner(), Some("A"));
    }

    #[test]
    fn manual_request_overrides_and_suppresses_automatic_switching() {
        let t0 = Instant::now();
        let mut engine = ArbitrationEngine::new(ArbitrationConfig::default());

        let decision = engine.request_manual("M", t0).expect("manual switch");
        assert_eq!(decision.reason, SwitchReason::Manual);
        assert!(!decision.is_automatic());
        assert!(engine.is_manual_override_active(t0 + ms(9_999)));

        assert!(stabilize(&mut engine, "X", 0.95, t0 + ms(100)).is_none());
        assert_eq!(engine.owner(), Some("M"));

        // After the window closes X can win again
        let after = t0 + ms(20_000);
        assert!(!engine.is_manual_override_active(after));
        let decision = stabilize(&mut engine, "X", 0.95, after).expect("automatic switch");
        assert_eq!(decision.to, "X");
    }

    #[test]
    fn hysteresis_holds_back_rapid_switches() {
        let t0 = Instant::now();
        let config = ArbitrationConfig {
            current_owner_bonus: 0.0,
            ..ArbitrationConfig::default()
        };
        let mut engine = ArbitrationEngine::new(config);

        stabilize(&mut engine, "A", 0.9, t0);
        let switched_at = t0 + ms(1600);

        // B's confidence jump outscores A, but lands inside the hysteresis window
        engine.observe(&obs("B", true, 0.7), switched_at + ms(100));
        engine.observe(&obs("B", true, 0.7), switched_at + ms(200));
        let held = engine.observe(&obs("B", true, 0.95), switched_at + ms(1900));
        assert!(held.is_none());
        assert_eq!(engine.owner(), Some("A"));
    }

    #[test]
    fn rate_limit_is_a_hard_cap_when_enforced() {
        let t0 = Instant::now();
        let config = ArbitrationConfig {
            max_switches_per_minute: 2,
            hysteresis: Duration::ZERO,
            manual_override: Duration::ZERO,
            ..ArbitrationConfig::default()
        };
        let mut engine = ArbitrationEngine::new(config);

        engine.request_manual("A", t0);
        engine.request_manual("B", t0 + ms(10));
        assert_eq!(engine.owner(), Some("B"));

        // Third switch inside the minute is rejected
        assert!(stabilize(&mut engine, "C", 0.95, t0 + ms(100)).is_none());
        assert_eq!(engine.owner(), Some("B"));
        assert_eq!(engine.status(t0 + ms(2000)).recent_switches, 2);
    }

    #[test]
    fn rate_limit_is_informational_when_not_enforced() {
        let t0 = Instant::now();
        let config = ArbitrationConfig {
            max_switches_per_minute: 2,
            enforce_rate_limit: false,
            hysteresis: Duration::ZERO,
            manual_override: Duration::ZERO,
            ..ArbitrationConfig::default()
        };
        let mut engine = ArbitrationEngine::new(config);

        engine.request_manual("A", t0);
        engine.request_manual("B", t0 + ms(10));
        let decision = stabilize(&mut engine, "C", 0.95, t0 + ms(100)).expect("not capped");
        assert_eq!(decision.to, "C");
    }

    #[test]
    fn switch_history_only_keeps_the_trailing_minute() {
        let t0 = Instant::now();
        let mut engine = ArbitrationEngine::new(ArbitrationConfig {
            manual_override: Duration::ZERO,
            ..ArbitrationConfig::default()
        });

        engine.request_manual("A", t0);
        engine.request_manual("B", t0 + Duration::from_secs(30));
        engine.request_manual("C", t0 + Duration::from_secs(70));
        assert_eq!(engine.state().switch_history.len(), 2);
        assert_eq!(engine.state().switch_count, 3);
    }

    #[test]
    fn switch_during_call_enters_handover_until_new_owner_offers() {
        let t0 = Instant::now();
        let mut engine = ArbitrationEngine::new(ArbitrationConfig::default());

        engine.request_manual("Y", t0);
        engine.clear_manual_override();
        assert!(engine.start_external_call(2));
        assert_eq!(engine.call_phase(), &CallPhase::ExternalCallActive);

        let later = t0 + ms(5000);
        let decision = stabilize(&mut engine, "X", 0.9, later).expect("switch to X");
        assert!(decision.handover);
        assert_eq!(
            engine.call_phase(),
            &CallPhase::HandingOver { to: "X".into() }
        );

        // An offer from the wrong device does not finish the handover
        assert!(!engine.external_offer_from("Y"));
        assert!(engine.external_offer_from("X"));
        assert_eq!(engine.call_phase(), &CallPhase::ExternalCallActive);

        assert!(engine.end_call());
        assert_eq!(engine.call_phase(), &CallPhase::Idle);
    }

    #[test]
    fn single_member_rooms_do_not_bridge_calls() {
        let mut engine = ArbitrationEngine::new(ArbitrationConfig::default());
        assert!(!engine.start_external_call(1));
        assert!(!engine.call_phase().is_active());
    }

    #[test]
    fn owner_leaving_reelects_or_clears() {
        let t0 = Instant::now();
        let mut engine = ArbitrationEngine::new(ArbitrationConfig::default());

        stabilize(&mut engine, "A", 0.9, t0);
        stabilize(&mut engine, "B", 0.9, t0 + ms(5000));

        let decision = engine.remove_device("A", t0 + ms(9000)).expect("B takes over");
        assert_eq!(decision.reason, SwitchReason::OwnerLeft);
        assert_eq!(engine.owner(), Some("B"));

        assert!(engine.remove_device("B", t0 + ms(9500)).is_none());
        assert_eq!(engine.owner(), None);
    }

    #[test]
    fn release_only_applies_to_the_owner() {
        let t0 = Instant::now();
        let mut engine = ArbitrationEngine::new(ArbitrationConfig::default());
        engine.request_manual("A", t0);

        assert!(!engine.release("B"));
        assert!(engine.release("A"));
        assert_eq!(engine.owner(), None);
    }

    #[test]
    fn disabled_engine_ignores_faces() {
        let t0 = Instant::now();
        let mut engine = ArbitrationEngine::new(ArbitrationConfig::default());
        engine.set_enabled(false);
        assert!(stabilize(&mut engine, "X", 0.95, t0).is_none());
        assert!(engine.face("X").is_none());
    }

    #[test]
    fn auto_switch_setting_picks_initial_state() {
        let t0 = Instant::now();
        let mut engine = ArbitrationEngine::new(ArbitrationConfig {
            auto_switch: false,
            ..ArbitrationConfig::default()
        });
        assert!(!engine.status(t0).enabled);
        assert!(stabilize(&mut engine, "X", 0.95, t0).is_none());

        // Manual requests are honoured regardless
        assert!(engine.request_manual("Y", t0 + ms(2000)).is_some());

        engine.set_enabled(true);
        engine.clear_manual_override();
        let decision = stabilize(&mut engine, "X", 0.95, t0 + ms(5000)).expect("switch once enabled");
        assert_eq!(decision.to, "X");
    }
}
