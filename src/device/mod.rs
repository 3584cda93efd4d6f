//! # Device Module
//!
//! Owns the set of devices reported by the device server and routes motion
//! commands to them.
//!
//! ```text
//! device/
//! ├── mod.rs      - DeviceDescriptor, capabilities, outbound requests
//! ├── manager.rs  - SessionManager: device set, capability routing, coalescing
//! └── slot.rs     - per-device outbound command slot (one tokio task each)
//! ```
//!
//! ## Command Flow
//!
//! ```text
//! MotionCommand ──► SessionManager::dispatch
//!                     │  capability check + duplicate coalescing
//!                     ├──► DeviceSlot(1) ──┐
//!                     └──► DeviceSlot(n) ──┴──► DeviceRequest ──► device link
//! ```
//!
//! Dispatch never awaits. Each slot has its own bounded queue so a device
//! that stops draining only loses its own commands.

pub mod manager;
pub mod slot;

pub use manager::{DispatchError, SessionManager, SessionStats};

use crate::motion::{Channel, MotionCommand};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Opaque device handle, the device server's device index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Motion channel a device declares support for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    Linear,
    Vibrate,
}

impl From<Channel> for Capability {
    fn from(channel: Channel) -> Self {
        match channel {
            Channel::Linear => Capability::Linear,
            Channel::Vibrate => Capability::Vibrate,
        }
    }
}

impl Capability {
    pub fn required_for(command: &MotionCommand) -> Self {
        command.channel().into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub display_name: String,
    pub capabilities: BTreeSet<Capability>,
    /// Position in discovery order
    pub index: u32,
    pub linear_actuators: u32,
    pub vibrate_actuators: u32,
}

impl DeviceDescriptor {
    pub fn new(
        id: DeviceId,
        display_name: impl Into<String>,
        index: u32,
        linear_actuators: u32,
        vibrate_actuators: u32,
    ) -> Self {
        let mut capabilities = BTreeSet::new();
        if linear_actuators > 0 {
            capabilities.insert(Capability::Linear);
        }
        if vibrate_actuators > 0 {
            capabilities.insert(Capability::Vibrate);
        }
        Self {
            id,
            display_name: display_name.into(),
            capabilities,
            index,
            linear_actuators,
            vibrate_actuators,
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// A device the bridge has no use for (neither linear nor vibrate).
    pub fn is_usable(&self) -> bool {
        !self.capabilities.is_empty()
    }
}

/// A command addressed to one device, handed to the device link.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceRequest {
    pub device: DeviceId,
    pub command: MotionCommand,
}

/// Constants from the `[session]` config table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Identical consecutive targets within this window are sent once
    pub min_command_interval_ms: u64,
    /// Queue depth of each device slot
    pub slot_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            min_command_interval_ms: 100,
            slot_capacity: 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_from_actuators() {
        let stroker = DeviceDescriptor::new(DeviceId(0), "Stroker", 0, 1, 0);
        assert!(stroker.supports(Capability::Linear));
        assert!(!stroker.supports(Capability::Vibrate));

        let combo = DeviceDescriptor::new(DeviceId(1), "Combo", 1, 1, 2);
        assert!(combo.supports(Capability::Linear));
        assert!(combo.supports(Capability::Vibrate));

        let sensor = DeviceDescriptor::new(DeviceId(2), "Sensor", 2, 0, 0);
        assert!(!sensor.is_usable());
    }

    #[test]
    fn test_required_capability() {
        assert_eq!(
            Capability::required_for(&MotionCommand::VibrateStop),
            Capability::Vibrate
        );
        assert_eq!(
            Capability::required_for(&MotionCommand::LinearMove {
                position: 0.1,
                duration_ms: 10
            }),
            Capability::Linear
        );
    }
}
