//! Motion profile computation.
//!
//! Stroke positions are interpolated into the configured stroke range and
//! stroke durations shrink with the speed scale and the event's velocity
//! hint. A `StrokeStart` begins a reciprocating cycle between the range
//! limits; each following leg is a scheduled transition fired by [`tick`].
//!
//! [`tick`]: MotionEngine::tick

use super::{
    ActuationState, EngineSettings, MotionCommand, ScheduledKind, ScheduledMove, StrokeCycle,
};
use crate::event::GameEvent;
use crate::tuning::TuningParameters;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct MotionEngine {
    settings: EngineSettings,
}

impl MotionEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Applies one event. Assumes `params` passed validation.
    pub fn apply(
        &self,
        event: GameEvent,
        params: &TuningParameters,
        state: &mut ActuationState,
        now: Instant,
    ) -> Vec<MotionCommand> {
        match event {
            GameEvent::StrokeStart { velocity_hint } => {
                let duration_ms = self.stroke_duration_ms(params, velocity_hint);
                let target = params.stroke_range_max;
                state.cycle = Some(StrokeCycle {
                    velocity_hint,
                    next_to_max: false,
                });
                state.linear_target = Some(target);
                state.scheduled = Some(ScheduledMove {
                    due_at: now + Duration::from_millis(u64::from(duration_ms)),
                    kind: ScheduledKind::CycleLeg,
                });
                debug!("Stroke cycle started, leg {} ms", duration_ms);
                vec![MotionCommand::LinearMove {
                    position: target,
                    duration_ms,
                }]
            }
            GameEvent::StrokeUpdate {
                position,
                velocity_hint,
            } => {
                let duration_ms = self.stroke_duration_ms(params, velocity_hint);
                let target = params.map_position(position);
                state.cycle = None;
                state.scheduled = None;
                state.linear_target = Some(target);
                vec![MotionCommand::LinearMove {
                    position: target,
                    duration_ms,
                }]
            }
            GameEvent::StrokeStop => {
                let was_moving = state.linear_target.is_some() || state.cycle.is_some();
                state.cycle = None;
                state.linear_target = None;
                state.scheduled = match self.settings.park_position {
                    Some(position) if was_moving && self.settings.park_duration_ms > 0 => {
                        Some(ScheduledMove {
                            due_at: now,
                            kind: ScheduledKind::Park {
                                position,
                                duration_ms: self.settings.park_duration_ms,
                            },
                        })
                    }
                    _ => None,
                };
                vec![MotionCommand::LinearStop]
            }
            GameEvent::VibrationSet { intensity } => {
                let scaled = (intensity * params.vibration_strength_scale).clamp(0.0, 1.0);
                state.vibration = Some(scaled);
                vec![MotionCommand::VibrateAt { intensity: scaled }]
            }
            GameEvent::VibrationStop => {
                state.vibration = None;
                vec![MotionCommand::VibrateStop]
            }
            GameEvent::SessionReset => {
                *state = ActuationState::default();
                vec![MotionCommand::LinearStop, MotionCommand::VibrateStop]
            }
        }
    }

    /// Fires the scheduled transition if it is due.
    pub fn tick(
        &self,
        params: &TuningParameters,
        state: &mut ActuationState,
        now: Instant,
    ) -> Option<MotionCommand> {
        let scheduled = state.scheduled?;
        if scheduled.due_at > now {
            return None;
        }
        state.scheduled = None;

        match scheduled.kind {
            ScheduledKind::CycleLeg => {
                let cycle = state.cycle.as_mut()?;
                let target = if cycle.next_to_max {
                    params.stroke_range_max
                } else {
                    params.stroke_range_min
                };
                cycle.next_to_max = !cycle.next_to_max;
                let duration_ms = self.stroke_duration_ms(params, cycle.velocity_hint);
                state.linear_target = Some(target);
                state.scheduled = Some(ScheduledMove {
                    due_at: now + Duration::from_millis(u64::from(duration_ms)),
                    kind: ScheduledKind::CycleLeg,
                });
                Some(MotionCommand::LinearMove {
                    position: target,
                    duration_ms,
                })
            }
            ScheduledKind::Park {
                position,
                duration_ms,
            } => {
                debug!("Parking stroker at {:.2}", position);
                Some(MotionCommand::LinearMove {
                    position,
                    duration_ms,
                })
            }
        }
    }

    /// Leg duration: base / (speed * velocity), never shorter than one tick.
    pub fn stroke_duration_ms(&self, params: &TuningParameters, velocity_hint: Option<f64>) -> u32 {
        let velocity = velocity_hint
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or(1.0);
        let raw = self.settings.base_stroke_ms as f64 / (params.piston_speed_scale * velocity);
        let min = self.settings.tick_ms.max(1) as f64;
        raw.max(min).min(u32::MAX as f64).round() as u32
    }
}
