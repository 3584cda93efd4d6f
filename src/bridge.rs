//! Wires the bridge together and exposes it to a front end.
//!
//! ```text
//! BridgeHandle::spawn
//!   ├── game link task    (supervise + game_link session)
//!   ├── device link task  (supervise + device_link session)
//!   ├── pipeline task     (Pipeline<Active>, owns SessionManager)
//!   │     └── one task per device slot
//!   └── autosave task     (tuning.toml)
//! ```
//!
//! All tasks hang off one root `CancellationToken`.

use crate::config::AppConfig;
use crate::device::{DeviceDescriptor, DeviceId, SessionManager};
use crate::link::{device_link, game_link, supervise, ConnectionState, LinkKind, LinkMonitor};
use crate::persistence::{AutosaveHandle, TuningStore};
use crate::pipeline::{PipelineHandle, PipelineInput};
use crate::status::{StatusEntry, StatusSink};
use crate::tuning::TuningSurface;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const OUTBOUND_CAPACITY: usize = 256;

pub struct BridgeHandle {
    game_state: watch::Receiver<ConnectionState>,
    device_state: watch::Receiver<ConnectionState>,
    devices: watch::Receiver<Vec<DeviceDescriptor>>,
    tuning: TuningSurface,
    status: StatusSink,
    input_tx: mpsc::Sender<PipelineInput>,
    cancel: CancellationToken,
    pipeline: PipelineHandle,
    autosave: AutosaveHandle,
    link_tasks: Vec<JoinHandle<()>>,
}

impl BridgeHandle {
    /// Loads persisted tuning and starts every task.
    pub async fn spawn(config: AppConfig, tuning_path: PathBuf) -> Result<Self> {
        let status = StatusSink::new();
        let cancel = CancellationToken::new();

        let store = TuningStore::new(tuning_path);
        let stored = store.load().await;
        let tuning = TuningSurface::new(stored.params, stored.presets);

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let session = SessionManager::new(config.session, outbound_tx, cancel.child_token());
        let devices = session.subscribe_devices();

        let pipeline = PipelineHandle::spawn(
            config.engine,
            session,
            tuning.clone(),
            status.clone(),
            cancel.clone(),
        )
        .map_err(|e| eyre!("Failed to start event pipeline: {}", e))?;
        let input_tx = pipeline.sender();

        let game_monitor = LinkMonitor::new(LinkKind::Game, config.backoff, status.clone());
        let device_monitor = LinkMonitor::new(LinkKind::Device, config.backoff, status.clone());
        let game_state = game_monitor.subscribe();
        let device_state = device_monitor.subscribe();

        let game_task = {
            let settings = config.links.clone();
            let events = input_tx.clone();
            let session_cancel = cancel.clone();
            tokio::spawn(supervise(game_monitor, cancel.clone(), move |monitor| {
                game_link::run_game_session(
                    settings.clone(),
                    monitor,
                    events.clone(),
                    session_cancel.clone(),
                )
            }))
        };

        let device_task = {
            let settings = config.links.clone();
            let events = input_tx.clone();
            let outbound = Arc::new(Mutex::new(outbound_rx));
            let session_cancel = cancel.clone();
            tokio::spawn(supervise(device_monitor, cancel.clone(), move |monitor| {
                device_link::run_device_session(
                    settings.clone(),
                    monitor,
                    events.clone(),
                    outbound.clone(),
                    session_cancel.clone(),
                )
            }))
        };

        let autosave = AutosaveHandle::spawn(
            store,
            tuning.clone(),
            Duration::from_millis(config.persistence.debounce_ms),
            Duration::from_secs(config.persistence.autosave_secs),
            cancel.clone(),
        );

        info!(
            "Bridge running: game {} / devices {}",
            config.links.game_url, config.links.device_url
        );
        status.info("bridge", "Bridge started");

        Ok(Self {
            game_state,
            device_state,
            devices,
            tuning,
            status,
            input_tx,
            cancel,
            pipeline,
            autosave,
            link_tasks: vec![game_task, device_task],
        })
    }

    pub fn game_state(&self) -> watch::Receiver<ConnectionState> {
        self.game_state.clone()
    }

    pub fn device_state(&self) -> watch::Receiver<ConnectionState> {
        self.device_state.clone()
    }

    pub fn devices(&self) -> watch::Receiver<Vec<DeviceDescriptor>> {
        self.devices.clone()
    }

    /// Setter and snapshot access for the UI.
    pub fn tuning(&self) -> &TuningSurface {
        &self.tuning
    }

    pub fn status(&self) -> broadcast::Receiver<StatusEntry> {
        self.status.subscribe()
    }

    pub async fn set_device_enabled(&self, id: DeviceId, enabled: bool) -> Result<()> {
        self.input_tx
            .send(PipelineInput::SetDeviceEnabled { id, enabled })
            .await
            .map_err(|_| eyre!("Event pipeline is not running"))
    }

    /// Cancels every task. Links in backoff stop immediately; an open device
    /// link gets a short grace period to stop all devices.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Shutting down bridge");
        self.cancel.cancel();

        for task in self.link_tasks.drain(..) {
            if let Err(e) = task.await {
                error!("Link task panicked: {}", e);
            }
        }
        self.pipeline
            .shutdown()
            .await
            .map_err(|e| eyre!("Event pipeline shutdown failed: {}", e))?;
        self.autosave.join().await;
        info!("Bridge stopped");
        Ok(())
    }
}
