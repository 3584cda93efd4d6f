//! Validated publish/snapshot access to the tuning parameters.
//!
//! Backed by `tokio::sync::watch`: a write replaces the whole value in one
//! step and a read clones the current value out, so no lock is ever held
//! across an await point and a reader never sees a half-applied update.

use super::{ModePresets, TuningParameters, ValidationError};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct TuningSurface {
    params: Arc<watch::Sender<TuningParameters>>,
    presets: Arc<watch::Sender<ModePresets>>,
}

impl Default for TuningSurface {
    fn default() -> Self {
        Self::new(TuningParameters::default(), ModePresets::default())
    }
}

impl TuningSurface {
    /// Creates a surface from loaded values. Invalid values are replaced by
    /// defaults with a warning so a damaged settings file never blocks startup.
    pub fn new(params: TuningParameters, presets: ModePresets) -> Self {
        let params = match params.validate() {
            Ok(()) => params,
            Err(e) => {
                warn!("Loaded tuning parameters rejected ({}), using defaults", e);
                TuningParameters::default()
            }
        };
        let presets = match presets.validate() {
            Ok(()) => presets,
            Err(e) => {
                warn!("Loaded mode presets rejected ({}), using defaults", e);
                ModePresets::default()
            }
        };

        let (params_tx, _) = watch::channel(params);
        let (presets_tx, _) = watch::channel(presets);
        Self {
            params: Arc::new(params_tx),
            presets: Arc::new(presets_tx),
        }
    }

    /// Single entry point for tuning writes.
    pub fn set(&self, params: TuningParameters) -> Result<(), ValidationError> {
        if let Err(e) = params.validate() {
            warn!("Rejected tuning update {:?}: {}", params, e);
            return Err(e);
        }
        let previous = self.params.send_replace(params);
        if previous != params {
            info!(
                "Tuning updated: speed={:.2} range=[{:.2}, {:.2}] vibe={:.2}",
                params.piston_speed_scale,
                params.stroke_range_min,
                params.stroke_range_max,
                params.vibration_strength_scale
            );
        }
        Ok(())
    }

    pub fn current(&self) -> TuningParameters {
        *self.params.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TuningParameters> {
        self.params.subscribe()
    }

    pub fn set_presets(&self, presets: ModePresets) -> Result<(), ValidationError> {
        presets.validate()?;
        self.presets.send_replace(presets);
        debug!("Mode presets updated: {:?}", presets);
        Ok(())
    }

    pub fn presets(&self) -> ModePresets {
        *self.presets.borrow()
    }

    pub fn subscribe_presets(&self) -> watch::Receiver<ModePresets> {
        self.presets.subscribe()
    }
}
