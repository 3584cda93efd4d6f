//! Background saving of tuning changes.
//!
//! A change marks the state dirty and (re)arms a debounce timer, so a slider
//! drag produces one write once it settles. A periodic tick retries saves
//! that failed. On shutdown a pending change is flushed.

use super::{TuningFile, TuningStore};
use crate::tuning::{ModePresets, TuningParameters, TuningSurface};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug)]
pub struct AutosaveHandle {
    task_handle: JoinHandle<()>,
}

impl AutosaveHandle {
    pub fn spawn(
        store: TuningStore,
        surface: TuningSurface,
        debounce: Duration,
        autosave_every: Duration,
        cancel: CancellationToken,
    ) -> Self {
        info!(
            "Starting tuning autosave ({:?} debounce, {:?} interval)",
            debounce, autosave_every
        );
        // Subscribed here so writes made before the task first runs count.
        let params_rx = surface.subscribe();
        let presets_rx = surface.subscribe_presets();
        let task_handle = tokio::spawn(run_autosave(
            store,
            surface,
            params_rx,
            presets_rx,
            debounce,
            autosave_every,
            cancel,
        ));
        Self { task_handle }
    }

    /// Waits for the final flush after cancellation.
    pub async fn join(self) {
        if let Err(e) = self.task_handle.await {
            error!("Autosave task panicked: {}", e);
        }
    }
}

async fn run_autosave(
    store: TuningStore,
    surface: TuningSurface,
    mut params_rx: watch::Receiver<TuningParameters>,
    mut presets_rx: watch::Receiver<ModePresets>,
    debounce: Duration,
    autosave_every: Duration,
    cancel: CancellationToken,
) {
    let period = autosave_every.max(Duration::from_secs(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut dirty = false;
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let unseen = params_rx.has_changed().unwrap_or(false)
                    || presets_rx.has_changed().unwrap_or(false);
                if dirty || unseen {
                    save(&store, &surface).await;
                }
                debug!("Autosave stopped");
                return;
            }

            changed = params_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                dirty = true;
                deadline = Some(Instant::now() + debounce);
            }

            changed = presets_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                dirty = true;
                deadline = Some(Instant::now() + debounce);
            }

            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                dirty = !save(&store, &surface).await;
            }

            _ = interval.tick() => {
                if dirty && deadline.is_none() {
                    dirty = !save(&store, &surface).await;
                }
            }
        }
    }
}

async fn save(store: &TuningStore, surface: &TuningSurface) -> bool {
    let file = TuningFile {
        params: surface.current(),
        presets: surface.presets(),
    };
    match store.save(&file).await {
        Ok(()) => true,
        Err(e) => {
            error!("Failed to save tuning: {}", e);
            false
        }
    }
}
