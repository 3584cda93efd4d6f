//! Per-device outbound command slot.
//!
//! Each slot is a small tokio task with a bounded queue. When the device link
//! is slower than the command stream, queued commands of the same channel are
//! collapsed to the latest one before sending. Stops are never collapsed and
//! command order per device is preserved.

use super::{DeviceId, DeviceRequest};
use crate::motion::MotionCommand;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug)]
pub struct DeviceSlot {
    device: DeviceId,
    tx: mpsc::Sender<MotionCommand>,
    cancel: CancellationToken,
    task_handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    Full,
    Closed,
}

impl DeviceSlot {
    pub fn spawn(
        device: DeviceId,
        capacity: usize,
        outbound: mpsc::Sender<DeviceRequest>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task_cancel = cancel.clone();
        let task_handle = tokio::spawn(async move {
            run_slot(device, rx, outbound, task_cancel).await;
        });
        debug!("Spawned outbound slot for device {}", device);
        Self {
            device,
            tx,
            cancel,
            task_handle,
        }
    }

    pub fn try_push(&self, command: MotionCommand) -> Result<(), SlotError> {
        self.tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SlotError::Full,
            mpsc::error::TrySendError::Closed(_) => SlotError::Closed,
        })
    }

    /// Cancels the slot. Queued and in-flight commands are dropped.
    pub fn close(self) {
        debug!("Closing outbound slot for device {}", self.device);
        self.cancel.cancel();
        self.task_handle.abort();
    }
}

async fn run_slot(
    device: DeviceId,
    mut rx: mpsc::Receiver<MotionCommand>,
    outbound: mpsc::Sender<DeviceRequest>,
    cancel: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => break,
            cmd = rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
        };

        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            push_coalesced(&mut batch, next);
        }

        for command in batch {
            tokio::select! {
                _ = cancel.cancelled() => return,
                sent = outbound.send(DeviceRequest { device, command }) => {
                    if sent.is_err() {
                        debug!("Device link gone, stopping slot {}", device);
                        return;
                    }
                    trace!("Device {} <- {:?}", device, command);
                }
            }
        }
    }
}

/// Replaces the previous command when both act on the same channel and
/// neither is a stop.
pub(crate) fn push_coalesced(batch: &mut Vec<MotionCommand>, next: MotionCommand) {
    if !next.is_stop() {
        if let Some(last) = batch.last_mut() {
            if !last.is_stop() && last.channel() == next.channel() {
                *last = next;
                return;
            }
        }
    }
    batch.push(next);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn mv(position: f64) -> MotionCommand {
        MotionCommand::LinearMove {
            position,
            duration_ms: 100,
        }
    }

    #[test]
    fn test_burst_collapses_to_latest() {
        let mut batch = vec![mv(0.1)];
        push_coalesced(&mut batch, mv(0.2));
        push_coalesced(&mut batch, mv(0.3));
        assert_eq!(batch, vec![mv(0.3)]);
    }

    #[test]
    fn test_stops_and_channels_kept_in_order() {
        let mut batch = vec![mv(0.1)];
        push_coalesced(&mut batch, MotionCommand::VibrateAt { intensity: 0.5 });
        push_coalesced(&mut batch, MotionCommand::LinearStop);
        push_coalesced(&mut batch, mv(0.4));
        assert_eq!(
            batch,
            vec![
                mv(0.1),
                MotionCommand::VibrateAt { intensity: 0.5 },
                MotionCommand::LinearStop,
                mv(0.4),
            ]
        );
    }

    #[tokio::test]
    async fn test_slot_forwards_in_order() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let slot = DeviceSlot::spawn(DeviceId(3), 8, out_tx, CancellationToken::new());

        slot.try_push(MotionCommand::VibrateAt { intensity: 0.2 }).unwrap();
        slot.try_push(MotionCommand::VibrateStop).unwrap();

        let first = out_rx.recv().await.unwrap();
        let second = out_rx.recv().await.unwrap();
        assert_eq!(first.device, DeviceId(3));
        assert_eq!(first.command, MotionCommand::VibrateAt { intensity: 0.2 });
        assert_eq!(second.command, MotionCommand::VibrateStop);
    }

    #[tokio::test]
    async fn test_closed_slot_stops_forwarding() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let slot = DeviceSlot::spawn(DeviceId(1), 8, out_tx, CancellationToken::new());
        slot.close();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(out_rx.recv().await.is_none());
    }
}
