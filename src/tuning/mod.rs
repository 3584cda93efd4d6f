//! # Tuning Module
//!
//! Holds the user-adjustable parameters that shape motion output and the
//! surface through which they are published to the engine.
//!
//! ```text
//! tuning/
//! ├── mod.rs      - TuningParameters, ModePresets and their validation
//! └── surface.rs  - TuningSurface: validated setter, atomic snapshots
//! ```
//!
//! Parameters are plain `Copy` values. Every write goes through
//! [`TuningSurface::set`], which validates the complete struct before it is
//! published, so readers only ever see a fully valid snapshot.

pub mod surface;

pub use surface::TuningSurface;

use serde::{Deserialize, Serialize};

/// Accepted interval range (seconds) for each piston mode, index 0 = mode 1.
pub const PISTON_INTERVAL_BOUNDS: [(f64, f64); 3] = [(0.6, 2.0), (0.3, 1.0), (0.1, 0.5)];

/// Live tuning values read by the motion engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningParameters {
    /// Multiplier on stroke speed. Higher values shorten every stroke.
    pub piston_speed_scale: f64,
    /// Lowest position a stroke may reach (0.0 - 1.0)
    pub stroke_range_min: f64,
    /// Highest position a stroke may reach (0.0 - 1.0)
    pub stroke_range_max: f64,
    /// Multiplier applied to every vibration intensity (0.0 - 1.0)
    pub vibration_strength_scale: f64,
}

impl Default for TuningParameters {
    fn default() -> Self {
        Self {
            piston_speed_scale: 1.0,
            stroke_range_min: 0.0,
            stroke_range_max: 0.8,
            vibration_strength_scale: 1.0,
        }
    }
}

impl TuningParameters {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.piston_speed_scale.is_finite() || self.piston_speed_scale <= 0.0 {
            return Err(ValidationError::InvalidSpeedScale(self.piston_speed_scale));
        }
        if !unit_interval(self.stroke_range_min) || !unit_interval(self.stroke_range_max) {
            return Err(ValidationError::RangeOutOfBounds {
                min: self.stroke_range_min,
                max: self.stroke_range_max,
            });
        }
        if self.stroke_range_min > self.stroke_range_max {
            return Err(ValidationError::InvertedRange {
                min: self.stroke_range_min,
                max: self.stroke_range_max,
            });
        }
        if !unit_interval(self.vibration_strength_scale) {
            return Err(ValidationError::VibrationScaleOutOfBounds(
                self.vibration_strength_scale,
            ));
        }
        Ok(())
    }

    /// Linear interpolation of a normalized position into the stroke range.
    pub fn map_position(&self, position: f64) -> f64 {
        let p = position.clamp(0.0, 1.0);
        self.stroke_range_min + p * (self.stroke_range_max - self.stroke_range_min)
    }
}

/// Preset tables for the game plugin's numbered modes.
///
/// The plugin does not send positions or intensities in its mode frames, only
/// "piston mode 2" or "vibe mode 1". These tables turn a mode number into a
/// stroke interval or a vibration strength.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModePresets {
    /// Seconds per stroke leg for piston modes 1, 2 and 3
    pub piston_interval_secs: [f64; 3],
    /// Strength for vibe modes 1 and 2
    pub vibe_strength: [f64; 2],
}

impl Default for ModePresets {
    fn default() -> Self {
        Self {
            piston_interval_secs: [0.9, 0.5, 0.4],
            vibe_strength: [0.5, 1.0],
        }
    }
}

impl ModePresets {
    pub fn piston_interval(&self, mode: u8) -> Option<f64> {
        let idx = usize::from(mode).checked_sub(1)?;
        self.piston_interval_secs.get(idx).copied()
    }

    pub fn vibe_strength(&self, mode: u8) -> Option<f64> {
        let idx = usize::from(mode).checked_sub(1)?;
        self.vibe_strength.get(idx).copied()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for (idx, (value, (lo, hi))) in self
            .piston_interval_secs
            .iter()
            .zip(PISTON_INTERVAL_BOUNDS)
            .enumerate()
        {
            if !value.is_finite() || *value < lo || *value > hi {
                return Err(ValidationError::PresetOutOfBounds {
                    kind: "piston",
                    mode: idx as u8 + 1,
                    value: *value,
                });
            }
        }
        for (idx, value) in self.vibe_strength.iter().enumerate() {
            if !unit_interval(*value) {
                return Err(ValidationError::PresetOutOfBounds {
                    kind: "vibe",
                    mode: idx as u8 + 1,
                    value: *value,
                });
            }
        }
        Ok(())
    }
}

fn unit_interval(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

/// Rejected tuning write. The previously published values stay in effect.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Piston speed scale must be a positive number, got {0}")]
    InvalidSpeedScale(f64),

    #[error("Stroke range [{min}, {max}] is outside [0, 1]")]
    RangeOutOfBounds { min: f64, max: f64 },

    #[error("Stroke range minimum {min} is above maximum {max}")]
    InvertedRange { min: f64, max: f64 },

    #[error("Vibration strength scale must be within [0, 1], got {0}")]
    VibrationScaleOutOfBounds(f64),

    #[error("{kind} mode {mode} preset {value} is out of bounds")]
    PresetOutOfBounds {
        kind: &'static str,
        mode: u8,
        value: f64,
    },
}
