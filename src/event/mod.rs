//! # Event Module
//!
//! Turns raw websocket frames from the game plugin into typed [`GameEvent`]s.
//!
//! ```text
//! event/
//! ├── decoder.rs  - pure frame decoding (tagged events and mode frames)
//! └── modes.rs    - ModeTracker: numbered mode frames -> GameEvents
//! ```
//!
//! Decoding never touches connection state. A frame that cannot be decoded
//! is reported as [`DecodeError::Unrecognized`] and dropped by the caller.

pub mod decoder;
pub mod modes;

pub use decoder::{decode, decode_frame, DecodeError, Frame, ModeFrame};
pub use modes::ModeTracker;

/// A single in-game action, in arrival order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GameEvent {
    /// Begin continuous stroking. The hint scales stroke speed (1.0 = neutral).
    StrokeStart { velocity_hint: Option<f64> },
    /// Move to a normalized position (0.0 - 1.0)
    StrokeUpdate {
        position: f64,
        velocity_hint: Option<f64>,
    },
    StrokeStop,
    /// Set vibration intensity (0.0 - 1.0)
    VibrationSet { intensity: f64 },
    VibrationStop,
    SessionReset,
}

impl GameEvent {
    pub fn name(&self) -> &'static str {
        match self {
            GameEvent::StrokeStart { .. } => "stroke_start",
            GameEvent::StrokeUpdate { .. } => "stroke_update",
            GameEvent::StrokeStop => "stroke_stop",
            GameEvent::VibrationSet { .. } => "vibration_set",
            GameEvent::VibrationStop => "vibration_stop",
            GameEvent::SessionReset => "session_reset",
        }
    }
}
