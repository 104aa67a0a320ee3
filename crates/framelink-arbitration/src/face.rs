//! Per-device face-presence tracking with a stability window.
//!
//! A detector reports `(hasFace, confidence)` for a device several times a
//! second. Single frames are noisy, so a device is only trusted once it has
//! produced enough consecutive qualifying hits over a minimum span of time.

use serde::Serialize;
use std::time::{Duration, Instant};

/// When an observation counts as a hit, and when a run of hits is stable.
#[derive(Debug, Clone, Copy)]
pub struct StabilityRule {
    /// Minimum confidence for a qualifying hit.
    pub threshold: f64,
    pub min_hits: u32,
    /// Time that must have elapsed since the first hit of the run.
    pub period: Duration,
}

/// Stability state for one device.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceState {
    pub has_face: bool,
    pub confidence: f64,
    pub previous_confidence: f64,
    pub is_stable: bool,
    pub consecutive_hits: u32,
    /// Time of the first hit in the current run.
    #[serde(skip)]
    pub stable_since: Option<Instant>,
    #[serde(skip)]
    pub last_update: Option<Instant>,
}

impl FaceState {
    /// Fold one observation into the state.
    ///
    /// `is_stable` holds only while `consecutive_hits >= rule.min_hits` and
    /// more than `rule.period` has passed since the first hit. A
    /// non-qualifying observation resets the run.
    pub fn observe(&mut self, has_face: bool, confidence: f64, now: Instant, rule: &StabilityRule) {
        let confidence = confidence.clamp(0.0, 1.0);

        self.previous_confidence = self.confidence;
        self.has_face = has_face;
        self.confidence = confidence;
        self.last_update = Some(now);

        if has_face && confidence >= rule.threshold {
            self.consecutive_hits = self.consecutive_hits.saturating_add(1);
            let since = *self.stable_since.get_or_insert(now);
            self.is_stable = self.consecutive_hits >= rule.min_hits
                && now.saturating_duration_since(since) > rule.period;
        } else {
            self.consecutive_hits = 0;
            self.stable_since = None;
            self.is_stable = false;
        }
    }

    /// Confidence gained since the previous observation.
    pub fn delta(&self) -> f64 {
        self.confidence - self.previous_confidence
    }
}
