//! Translation of numbered mode frames into game events.
//!
//! The plugin re-sends its full mode state on every frame, so the tracker
//! diffs against the previous frame and only emits events for what changed.

use super::decoder::ModeFrame;
use super::GameEvent;
use crate::tuning::ModePresets;
use tracing::{debug, warn};

/// Leg interval used for a piston mode without a preset
const FALLBACK_INTERVAL_SECS: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct ModeTracker {
    last: ModeFrame,
    base_stroke_ms: u64,
}

impl ModeTracker {
    /// `base_stroke_ms` must match the motion engine's base stroke duration so
    /// that a preset interval comes out as that many milliseconds per leg.
    pub fn new(base_stroke_ms: u64) -> Self {
        Self {
            last: ModeFrame::default(),
            base_stroke_ms,
        }
    }

    pub fn last(&self) -> ModeFrame {
        self.last
    }

    pub fn reset(&mut self) {
        self.last = ModeFrame::default();
    }

    pub fn translate(&mut self, frame: ModeFrame, presets: &ModePresets) -> Vec<GameEvent> {
        let mut events = Vec::new();

        if frame.piston != self.last.piston {
            self.last.piston = frame.piston;
            match self.piston_velocity(presets) {
                Some(velocity) => events.push(GameEvent::StrokeStart {
                    velocity_hint: Some(velocity),
                }),
                None => events.push(GameEvent::StrokeStop),
            }
        }

        if frame.vibe != self.last.vibe {
            self.last.vibe = frame.vibe;
            events.push(self.vibe_event(presets).unwrap_or(GameEvent::VibrationStop));
        }

        if !events.is_empty() {
            debug!(
                "Mode change piston={} vibe={} -> {} events",
                frame.piston,
                frame.vibe,
                events.len()
            );
        }
        events
    }

    /// Stroke velocity of the active piston mode, `None` while the piston is
    /// off.
    pub fn piston_velocity(&self, presets: &ModePresets) -> Option<f64> {
        let mode = self.last.piston;
        if mode == 0 {
            return None;
        }
        let interval = presets.piston_interval(mode).unwrap_or_else(|| {
            warn!(
                "Unknown piston mode {}, stroking at {} s",
                mode, FALLBACK_INTERVAL_SECS
            );
            FALLBACK_INTERVAL_SECS
        });
        Some(self.base_stroke_ms as f64 / (interval * 1000.0))
    }

    /// Vibration event for the active vibe mode, `None` while vibe is off.
    /// An unknown mode stops vibration.
    pub fn vibe_event(&self, presets: &ModePresets) -> Option<GameEvent> {
        let mode = self.last.vibe;
        if mode == 0 {
            return None;
        }
        match presets.vibe_strength(mode) {
            Some(intensity) => Some(GameEvent::VibrationSet { intensity }),
            None => {
                warn!("Unknown vibe mode {}, stopping vibration", mode);
                Some(GameEvent::VibrationStop)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(piston: u8, vibe: u8) -> ModeFrame {
        ModeFrame { piston, vibe }
    }

    #[test]
    fn test_piston_mode_starts_stroke() {
        let mut tracker = ModeTracker::new(500);
        let events = tracker.translate(frame(2, 0), &ModePresets::default());
        // mode 2 = 0.5 s, base 500 ms -> neutral velocity
        assert_eq!(
            events,
            vec![GameEvent::StrokeStart {
                velocity_hint: Some(1.0)
            }]
        );
    }

    #[test]
    fn test_unchanged_frame_is_silent() {
        let mut tracker = ModeTracker::new(500);
        let presets = ModePresets::default();
        tracker.translate(frame(1, 2), &presets);
        assert!(tracker.translate(frame(1, 2), &presets).is_empty());
    }

    #[test]
    fn test_modes_off_stop_both_channels() {
        let mut tracker = ModeTracker::new(500);
        let presets = ModePresets::default();
        tracker.translate(frame(3, 1), &presets);
        assert_eq!(
            tracker.translate(frame(0, 0), &presets),
            vec![GameEvent::StrokeStop, GameEvent::VibrationStop]
        );
    }

    #[test]
    fn test_vibe_mode_uses_preset_strength() {
        let mut tracker = ModeTracker::new(500);
        let events = tracker.translate(frame(0, 2), &ModePresets::default());
        assert_eq!(events, vec![GameEvent::VibrationSet { intensity: 1.0 }]);
    }

    #[test]
    fn test_unknown_modes_fall_back() {
        let mut tracker = ModeTracker::new(500);
        let presets = ModePresets::default();
        tracker.translate(frame(0, 1), &presets);

        let events = tracker.translate(frame(9, 7), &presets);
        // 1 s legs at base 500 ms
        assert_eq!(
            events,
            vec![
                GameEvent::StrokeStart {
                    velocity_hint: Some(0.5)
                },
                GameEvent::VibrationStop
            ]
        );
        assert_eq!(tracker.last(), frame(9, 7));
        assert!(tracker.translate(frame(9, 7), &presets).is_empty());
    }

    #[test]
    fn test_active_modes_follow_new_presets() {
        let mut tracker = ModeTracker::new(500);
        tracker.translate(frame(1, 1), &ModePresets::default());

        let edited = ModePresets {
            piston_interval_secs: [2.0, 0.5, 0.4],
            vibe_strength: [0.1, 1.0],
        };
        assert_eq!(tracker.piston_velocity(&edited), Some(0.25));
        assert_eq!(
            tracker.vibe_event(&edited),
            Some(GameEvent::VibrationSet { intensity: 0.1 })
        );

        tracker.reset();
        assert_eq!(tracker.piston_velocity(&edited), None);
        assert_eq!(tracker.vibe_event(&edited), None);
    }

    #[test]
    fn test_reset_forgets_last_frame() {
        let mut tracker = ModeTracker::new(500);
        let presets = ModePresets::default();
        tracker.translate(frame(1, 1), &presets);
        tracker.reset();
        assert_eq!(tracker.translate(frame(1, 1), &presets).len(), 2);
    }
}
