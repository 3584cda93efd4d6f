//! Device session manager.
//!
//! Keeps the current device set, routes each command to every enabled device
//! that supports its channel, and drops identical consecutive targets that
//! arrive within the minimum command interval.

use super::slot::{DeviceSlot, SlotError};
use super::{Capability, DeviceDescriptor, DeviceId, DeviceRequest, SessionSettings};
use crate::motion::{Channel, CommandError, MotionCommand};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("No connected device supports {0:?}")]
    NoCapableDevice(Capability),

    #[error("Invalid command dropped: {0}")]
    InvalidCommand(#[from] CommandError),

    /// Capable devices exist but none of their slots took the command.
    #[error("No device accepted the {0:?} command")]
    Undelivered(Capability),
}

/// Counters for status display and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub dispatched: u64,
    pub coalesced: u64,
    pub dropped: u64,
    pub device_list_changes: u64,
}

#[derive(Debug)]
struct DeviceEntry {
    descriptor: DeviceDescriptor,
    enabled: bool,
    slot: DeviceSlot,
    last_sent: HashMap<Channel, (MotionCommand, Instant)>,
}

pub struct SessionManager {
    settings: SessionSettings,
    devices: BTreeMap<DeviceId, DeviceEntry>,
    outbound: mpsc::Sender<DeviceRequest>,
    devices_tx: watch::Sender<Vec<DeviceDescriptor>>,
    cancel: CancellationToken,
    stats: SessionStats,
}

impl SessionManager {
    pub fn new(
        settings: SessionSettings,
        outbound: mpsc::Sender<DeviceRequest>,
        cancel: CancellationToken,
    ) -> Self {
        let (devices_tx, _) = watch::channel(Vec::new());
        Self {
            settings,
            devices: BTreeMap::new(),
            outbound,
            devices_tx,
            cancel,
            stats: SessionStats::default(),
        }
    }

    /// Replaces the known device set.
    ///
    /// Devices that disappeared, or whose descriptor changed, get their slot
    /// closed and any queued command for them is dropped.
    pub fn on_device_list_changed(&mut self, descriptors: Vec<DeviceDescriptor>) {
        self.stats.device_list_changes += 1;
        let incoming: BTreeMap<DeviceId, DeviceDescriptor> = descriptors
            .into_iter()
            .filter(|d| {
                if !d.is_usable() {
                    debug!("Ignoring device {} without linear/vibrate actuators", d.display_name);
                }
                d.is_usable()
            })
            .map(|d| (d.id, d))
            .collect();

        let stale: Vec<DeviceId> = self
            .devices
            .iter()
            .filter(|(id, entry)| incoming.get(id) != Some(&entry.descriptor))
            .map(|(id, _)| *id)
            .collect();

        let mut kept_enabled = HashMap::new();
        for id in stale {
            if let Some(entry) = self.devices.remove(&id) {
                if incoming.contains_key(&id) {
                    kept_enabled.insert(id, entry.enabled);
                } else {
                    info!("Device removed: {} ({})", entry.descriptor.display_name, id);
                }
                entry.slot.close();
            }
        }

        for (id, descriptor) in incoming {
            if self.devices.contains_key(&id) {
                continue;
            }
            info!(
                "Device available: {} ({}) caps={:?}",
                descriptor.display_name, id, descriptor.capabilities
            );
            let slot = DeviceSlot::spawn(
                id,
                self.settings.slot_capacity,
                self.outbound.clone(),
                self.cancel.child_token(),
            );
            self.devices.insert(
                id,
                DeviceEntry {
                    descriptor,
                    enabled: kept_enabled.get(&id).copied().unwrap_or(true),
                    slot,
                    last_sent: HashMap::new(),
                },
            );
        }

        self.publish();
    }

    /// Routes a command to every enabled device supporting its channel.
    pub fn dispatch(&mut self, command: MotionCommand) -> Result<(), DispatchError> {
        self.dispatch_at(command, tokio::time::Instant::now().into_std())
    }

    pub fn dispatch_at(&mut self, command: MotionCommand, now: Instant) -> Result<(), DispatchError> {
        if let Err(e) = command.validate() {
            warn!("Dropping invalid command {:?}: {}", command, e);
            self.stats.dropped += 1;
            return Err(e.into());
        }

        let capability = Capability::required_for(&command);
        let channel = command.channel();
        let window = Duration::from_millis(self.settings.min_command_interval_ms);
        let mut matched = false;
        let mut delivered = false;

        for (id, entry) in self.devices.iter_mut() {
            if !entry.enabled || !entry.descriptor.supports(capability) {
                continue;
            }
            matched = true;

            if let Some((last, sent_at)) = entry.last_sent.get(&channel) {
                if same_target(last, &command) && now.saturating_duration_since(*sent_at) < window
                {
                    self.stats.coalesced += 1;
                    delivered = true;
                    continue;
                }
            }

            match entry.slot.try_push(command) {
                Ok(()) => {
                    self.stats.dispatched += 1;
                    delivered = true;
                    entry.last_sent.insert(channel, (command, now));
                }
                Err(SlotError::Full) => {
                    self.stats.dropped += 1;
                    warn!("Outbound slot of device {} is full, dropping {:?}", id, command);
                }
                Err(SlotError::Closed) => {
                    self.stats.dropped += 1;
                    warn!("Outbound slot of device {} is closed", id);
                }
            }
        }

        match (matched, delivered) {
            (false, _) => Err(DispatchError::NoCapableDevice(capability)),
            (true, false) => Err(DispatchError::Undelivered(capability)),
            (true, true) => Ok(()),
        }
    }

    /// Enables or disables routing to a device. Returns false for unknown ids.
    pub fn set_enabled(&mut self, id: DeviceId, enabled: bool) -> bool {
        match self.devices.get_mut(&id) {
            Some(entry) => {
                entry.enabled = enabled;
                entry.last_sent.clear();
                info!(
                    "Device {} ({}) {}",
                    entry.descriptor.display_name,
                    id,
                    if enabled { "enabled" } else { "disabled" }
                );
                true
            }
            None => false,
        }
    }

    /// Forgets the coalescing history so the next command of every channel
    /// is sent regardless of what was sent before.
    pub fn forget_history(&mut self) {
        for entry in self.devices.values_mut() {
            entry.last_sent.clear();
        }
    }

    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.devices.values().map(|e| e.descriptor.clone()).collect()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn subscribe_devices(&self) -> watch::Receiver<Vec<DeviceDescriptor>> {
        self.devices_tx.subscribe()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Closes every slot.
    pub fn clear(&mut self) {
        for (_, entry) in std::mem::take(&mut self.devices) {
            entry.slot.close();
        }
        self.publish();
    }

    fn publish(&self) {
        self.devices_tx.send_replace(self.devices());
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        for (_, entry) in std::mem::take(&mut self.devices) {
            entry.slot.close();
        }
    }
}

fn same_target(last: &MotionCommand, next: &MotionCommand) -> bool {
    match (last, next) {
        (
            MotionCommand::LinearMove { position: a, .. },
            MotionCommand::LinearMove { position: b, .. },
        ) => a == b,
        (MotionCommand::VibrateAt { intensity: a }, MotionCommand::VibrateAt { intensity: b }) => {
            a == b
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stroker(id: u32) -> DeviceDescriptor {
        DeviceDescriptor::new(DeviceId(id), format!("Stroker {}", id), id, 1, 0)
    }

    fn vibrator(id: u32) -> DeviceDescriptor {
        DeviceDescriptor::new(DeviceId(id), format!("Vibe {}", id), id, 0, 1)
    }

    fn manager() -> (SessionManager, mpsc::Receiver<DeviceRequest>) {
        let (tx, rx) = mpsc::channel(64);
        (
            SessionManager::new(SessionSettings::default(), tx, CancellationToken::new()),
            rx,
        )
    }

    #[tokio::test]
    async fn test_routes_by_capability() {
        let (mut session, mut rx) = manager();
        session.on_device_list_changed(vec![stroker(0), vibrator(1)]);

        session
            .dispatch(MotionCommand::VibrateAt { intensity: 0.4 })
            .unwrap();
        let req = rx.recv().await.unwrap();
        assert_eq!(req.device, DeviceId(1));
        assert_eq!(req.command, MotionCommand::VibrateAt { intensity: 0.4 });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_capable_device() {
        let (mut session, _rx) = manager();
        session.on_device_list_changed(vec![stroker(0)]);
        assert_eq!(
            session.dispatch(MotionCommand::VibrateAt { intensity: 0.5 }),
            Err(DispatchError::NoCapableDevice(Capability::Vibrate))
        );
    }

    #[tokio::test]
    async fn test_identical_vibrations_coalesced() {
        let (mut session, mut rx) = manager();
        session.on_device_list_changed(vec![vibrator(0)]);
        let now = Instant::now();

        for i in 0..10 {
            session
                .dispatch_at(
                    MotionCommand::VibrateAt { intensity: 0.6 },
                    now + Duration::from_millis(i * 5),
                )
                .unwrap();
        }

        assert_eq!(session.stats().dispatched, 1);
        assert_eq!(session.stats().coalesced, 9);
        assert!(rx.recv().await.is_some());
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_identical_after_interval_resent() {
        let (mut session, _rx) = manager();
        session.on_device_list_changed(vec![vibrator(0)]);
        let now = Instant::now();
        let cmd = MotionCommand::VibrateAt { intensity: 0.6 };
        session.dispatch_at(cmd, now).unwrap();
        session
            .dispatch_at(cmd, now + Duration::from_millis(150))
            .unwrap();
        assert_eq!(session.stats().dispatched, 2);
    }

    #[tokio::test]
    async fn test_stops_never_coalesced() {
        let (mut session, _rx) = manager();
        session.on_device_list_changed(vec![vibrator(0)]);
        let now = Instant::now();
        session.dispatch_at(MotionCommand::VibrateStop, now).unwrap();
        session.dispatch_at(MotionCommand::VibrateStop, now).unwrap();
        assert_eq!(session.stats().dispatched, 2);
    }

    #[tokio::test]
    async fn test_zero_duration_move_dropped() {
        let (mut session, _rx) = manager();
        session.on_device_list_changed(vec![stroker(0)]);
        let result = session.dispatch(MotionCommand::LinearMove {
            position: 0.3,
            duration_ms: 0,
        });
        assert_eq!(
            result,
            Err(DispatchError::InvalidCommand(CommandError::ZeroDuration))
        );
        assert_eq!(session.stats().dispatched, 0);
    }

    #[tokio::test]
    async fn test_closed_slots_report_undelivered() {
        let (mut session, rx) = manager();
        session.on_device_list_changed(vec![stroker(0)]);
        drop(rx);

        // The slot accepts this one, then dies trying to forward it.
        session
            .dispatch(MotionCommand::LinearMove {
                position: 0.3,
                duration_ms: 200,
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = session.dispatch(MotionCommand::LinearMove {
            position: 0.6,
            duration_ms: 200,
        });
        assert_eq!(result, Err(DispatchError::Undelivered(Capability::Linear)));
        assert_eq!(session.stats().dispatched, 1);
    }

    #[tokio::test]
    async fn test_removed_device_no_longer_receives() {
        let (mut session, _rx) = manager();
        session.on_device_list_changed(vec![stroker(0), vibrator(1)]);
        session.on_device_list_changed(vec![stroker(0)]);
        assert_eq!(session.device_count(), 1);
        assert!(session
            .dispatch(MotionCommand::VibrateAt { intensity: 0.1 })
            .is_err());
    }

    #[tokio::test]
    async fn test_disabled_device_skipped() {
        let (mut session, _rx) = manager();
        session.on_device_list_changed(vec![vibrator(0)]);
        assert!(session.set_enabled(DeviceId(0), false));
        assert!(session.dispatch(MotionCommand::VibrateStop).is_err());
        assert!(!session.set_enabled(DeviceId(9), true));
    }

    #[tokio::test]
    async fn test_device_list_published() {
        let (mut session, _rx) = manager();
        let rx = session.subscribe_devices();
        session.on_device_list_changed(vec![
            stroker(0),
            DeviceDescriptor::new(DeviceId(5), "Sensor", 5, 0, 0),
        ]);
        let listed = rx.borrow().clone();
        assert_eq!(listed, vec![stroker(0)]);
        assert_eq!(session.stats().device_list_changes, 1);
    }
}
