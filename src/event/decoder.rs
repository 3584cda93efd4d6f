//! Frame decoding for the game plugin link.
//!
//! Two frame shapes are understood:
//!
//! ```text
//! {"event":"stroke_update","position":0.5,"velocity":2.0}   tagged event
//! {"piston":2,"vibe":1}                                     numbered modes
//! ```
//!
//! Everything else is `Unrecognized`.

use super::GameEvent;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Unrecognized frame: {0}")]
    Unrecognized(String),
}

/// Mode numbers as sent by the plugin. 0 means off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeFrame {
    pub piston: u8,
    pub vibe: u8,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Frame {
    Event(GameEvent),
    Modes(ModeFrame),
}

#[derive(Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WireEvent {
    StrokeStart {
        #[serde(default)]
        velocity: Option<f64>,
    },
    StrokeUpdate {
        position: f64,
        #[serde(default)]
        velocity: Option<f64>,
    },
    StrokeStop,
    VibrationSet {
        intensity: f64,
    },
    VibrationStop,
    SessionReset,
}

#[derive(Deserialize)]
struct WireModes {
    #[serde(default)]
    piston: Option<u8>,
    #[serde(default)]
    vibe: Option<u8>,
}

/// Decodes a frame that must carry a tagged event.
pub fn decode(raw: &str) -> Result<GameEvent, DecodeError> {
    match decode_frame(raw)? {
        Frame::Event(event) => Ok(event),
        Frame::Modes(_) => Err(DecodeError::Unrecognized(
            "mode frame where an event was expected".to_string(),
        )),
    }
}

/// Decodes any frame shape the plugin sends.
pub fn decode_frame(raw: &str) -> Result<Frame, DecodeError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| DecodeError::Unrecognized(format!("invalid json: {}", e)))?;

    let Some(object) = value.as_object() else {
        return Err(DecodeError::Unrecognized("frame is not an object".to_string()));
    };

    if object.contains_key("event") {
        let wire: WireEvent = serde_json::from_value(value)
            .map_err(|e| DecodeError::Unrecognized(format!("bad event: {}", e)))?;
        return from_wire(wire).map(Frame::Event);
    }

    if object.contains_key("piston") || object.contains_key("vibe") {
        let wire: WireModes = serde_json::from_value(value)
            .map_err(|e| DecodeError::Unrecognized(format!("bad mode frame: {}", e)))?;
        return Ok(Frame::Modes(ModeFrame {
            piston: wire.piston.unwrap_or(0),
            vibe: wire.vibe.unwrap_or(0),
        }));
    }

    Err(DecodeError::Unrecognized("unknown frame shape".to_string()))
}

fn from_wire(wire: WireEvent) -> Result<GameEvent, DecodeError> {
    let event = match wire {
        WireEvent::StrokeStart { velocity } => GameEvent::StrokeStart {
            velocity_hint: check_velocity(velocity)?,
        },
        WireEvent::StrokeUpdate { position, velocity } => GameEvent::StrokeUpdate {
            position: check_unit("position", position)?,
            velocity_hint: check_velocity(velocity)?,
        },
        WireEvent::StrokeStop => GameEvent::StrokeStop,
        WireEvent::VibrationSet { intensity } => GameEvent::VibrationSet {
            intensity: check_unit("intensity", intensity)?,
        },
        WireEvent::VibrationStop => GameEvent::VibrationStop,
        WireEvent::SessionReset => GameEvent::SessionReset,
    };
    Ok(event)
}

fn check_unit(field: &str, value: f64) -> Result<f64, DecodeError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(DecodeError::Unrecognized(format!(
            "{} {} outside [0, 1]",
            field, value
        )))
    }
}

fn check_velocity(velocity: Option<f64>) -> Result<Option<f64>, DecodeError> {
    match velocity {
        Some(v) if !v.is_finite() || v <= 0.0 => Err(DecodeError::Unrecognized(format!(
            "velocity {} must be positive",
            v
        ))),
        other => Ok(other),
    }
}
