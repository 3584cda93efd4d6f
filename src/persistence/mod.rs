//! # Persistence Module
//!
//! Stores the tuning parameters and mode presets across runs in a single
//! TOML file next to the application config.
//!
//! ```text
//! persistence/
//! ├── mod.rs          - TuningFile layout
//! ├── tuning_store.rs - load (defaults on any failure) and save
//! └── autosave.rs     - background task: debounced save on change + periodic retry
//! ```
//!
//! Loading never fails: a missing or damaged file degrades to defaults with
//! a warning. Saving is best effort and only logs errors.

pub mod autosave;
pub mod tuning_store;

pub use autosave::AutosaveHandle;
pub use tuning_store::TuningStore;

use crate::tuning::{ModePresets, TuningParameters};
use serde::{Deserialize, Serialize};

/// On-disk layout of `tuning.toml`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningFile {
    pub params: TuningParameters,
    pub presets: ModePresets,
}
