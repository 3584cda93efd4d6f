//! # Pipeline Module
//!
//! The single event-processing sequence. Game frames are decoded, run
//! through the motion engine against the current tuning snapshot, and the
//! resulting commands are dispatched to the device session. Link up/down
//! notifications arrive on the same channel, so they are ordered with
//! respect to game events.
//!
//! ```text
//! game link ───┐
//!              ├──► PipelineInput ──► Pipeline<Active> ──► SessionManager ──► device link
//! device link ─┘                          ▲
//!                                   TuningSurface (watch)
//! ```

pub mod engine;
pub mod handle;

pub use engine::Pipeline;
pub use handle::PipelineHandle;

use crate::device::{DeviceDescriptor, DeviceId};

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineInput {
    /// Raw text frame from the game link
    GameFrame(String),
    GameConnected,
    GameDisconnected,
    /// First device list after a (re)connect of the device link
    DeviceLinkUp { devices: Vec<DeviceDescriptor> },
    /// Device set changed on a live connection
    DevicesChanged { devices: Vec<DeviceDescriptor> },
    DeviceLinkDown,
    SetDeviceEnabled { id: DeviceId, enabled: bool },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames: u64,
    pub decode_errors: u64,
    pub events: u64,
    pub resets: u64,
    pub undeliverable: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid engine settings: {0}")]
    InvalidSettings(String),

    #[error("Pipeline task failed: {0}")]
    TaskError(String),
}
