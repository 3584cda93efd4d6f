//! # Motion Module
//!
//! Translates game events into device motion. The engine itself is pure: it
//! reads validated [`TuningParameters`](crate::tuning::TuningParameters),
//! updates an [`ActuationState`] owned by the caller and returns commands.
//!
//! ```text
//! GameEvent ──► MotionEngine::apply ──► Vec<MotionCommand>
//!                     │
//!               ActuationState ◄── MotionEngine::tick (scheduled legs)
//! ```

pub mod engine;

pub use engine::MotionEngine;

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Motion channel a command acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Linear,
    Vibrate,
}

/// Device-level command produced by the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionCommand {
    /// Move to `position` (0.0 - 1.0) over `duration_ms`. Duration must be > 0.
    LinearMove { position: f64, duration_ms: u32 },
    LinearStop,
    /// Vibrate at `intensity` (0.0 - 1.0)
    VibrateAt { intensity: f64 },
    VibrateStop,
}

impl MotionCommand {
    pub fn channel(&self) -> Channel {
        match self {
            MotionCommand::LinearMove { .. } | MotionCommand::LinearStop => Channel::Linear,
            MotionCommand::VibrateAt { .. } | MotionCommand::VibrateStop => Channel::Vibrate,
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, MotionCommand::LinearStop | MotionCommand::VibrateStop)
    }

    /// Checks the command invariants. Violating commands are dropped before
    /// they reach a device.
    pub fn validate(&self) -> Result<(), CommandError> {
        match *self {
            MotionCommand::LinearMove { duration_ms: 0, .. } => Err(CommandError::ZeroDuration),
            MotionCommand::LinearMove { position, .. } if !in_unit(position) => {
                Err(CommandError::OutOfRange(position))
            }
            MotionCommand::VibrateAt { intensity } if !in_unit(intensity) => {
                Err(CommandError::OutOfRange(intensity))
            }
            _ => Ok(()),
        }
    }
}

fn in_unit(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("Linear move with zero duration")]
    ZeroDuration,

    #[error("Command value {0} outside [0, 1]")]
    OutOfRange(f64),
}

/// Direction of the next leg of a reciprocating stroke.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrokeCycle {
    pub velocity_hint: Option<f64>,
    pub next_to_max: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduledKind {
    /// Next leg of the active stroke cycle
    CycleLeg,
    /// Return to the park position after a stop
    Park { position: f64, duration_ms: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledMove {
    pub due_at: Instant,
    pub kind: ScheduledKind,
}

/// Last-known actuation targets per channel plus the pending transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActuationState {
    pub linear_target: Option<f64>,
    pub vibration: Option<f64>,
    pub cycle: Option<StrokeCycle>,
    pub scheduled: Option<ScheduledMove>,
}

impl ActuationState {
    pub fn is_idle(&self) -> bool {
        *self == ActuationState::default()
    }

    /// Changes the velocity of a running stroke cycle. The leg in flight
    /// keeps its duration; the next leg uses the new velocity.
    pub fn retime_cycle(&mut self, velocity_hint: Option<f64>) -> bool {
        match self.cycle.as_mut() {
            Some(cycle) => {
                cycle.velocity_hint = velocity_hint;
                true
            }
            None => false,
        }
    }
}

/// Engine constants, loaded from the `[engine]` config table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Duration of one stroke leg at speed scale 1.0 and neutral velocity
    pub base_stroke_ms: u64,
    /// Scheduling tick; also the shortest move the engine will emit
    pub tick_ms: u64,
    /// Where the stroker rests after a stop. `None` disables parking.
    pub park_position: Option<f64>,
    /// `0` disables parking.
    pub park_duration_ms: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            base_stroke_ms: 500,
            tick_ms: 20,
            park_position: Some(0.5),
            park_duration_ms: 700,
        }
    }
}
