//! Pipeline with statum lifecycle.
//!
//! # State Machine
//!
//! ```text
//! Initializing ──► Configured ──► Active ──► Deactivating ──► Deactivated
//! ```
//!
//! `Active` owns the actuation state, so every mutation of it happens on the
//! pipeline task in input order.

use super::{PipelineError, PipelineInput, PipelineStats};
use crate::device::{Capability, DispatchError, SessionManager};
use crate::event::{decode_frame, Frame, GameEvent, ModeTracker};
use crate::link::LinkKind;
use crate::motion::{ActuationState, EngineSettings, MotionCommand, MotionEngine};
use crate::status::StatusSink;
use crate::tuning::{ModePresets, TuningSurface};
use statum::{machine, state};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[state]
#[derive(Debug, Clone)]
pub enum PipelineState {
    Initializing,
    Configured,
    Active,
    Deactivating,
    Deactivated,
}

#[machine]
pub struct Pipeline<S: PipelineState> {
    input_rx: mpsc::Receiver<PipelineInput>,
    presets_rx: watch::Receiver<ModePresets>,
    engine_settings: EngineSettings,
    engine: MotionEngine,
    actuation: ActuationState,
    modes: ModeTracker,
    session: SessionManager,
    tuning: TuningSurface,
    status: StatusSink,
    stats: PipelineStats,
    /// Last capability reported missing, to keep the status feed quiet
    missing: Option<Capability>,
}

impl<S: PipelineState> Pipeline<S> {
    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn actuation(&self) -> &ActuationState {
        &self.actuation
    }
}

/// Clock used for scheduling and coalescing; follows tokio's clock so that
/// paused-time tests see consistent instants.
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

impl Pipeline<Initializing> {
    pub fn create(
        input_rx: mpsc::Receiver<PipelineInput>,
        engine_settings: EngineSettings,
        session: SessionManager,
        tuning: TuningSurface,
        status: StatusSink,
    ) -> Self {
        info!("Initializing event pipeline");
        let presets_rx = tuning.subscribe_presets();
        Self::new(
            input_rx,
            presets_rx,
            engine_settings,
            MotionEngine::new(engine_settings),
            ActuationState::default(),
            ModeTracker::new(engine_settings.base_stroke_ms),
            session,
            tuning,
            status,
            PipelineStats::default(),
            None,
        )
    }

    pub fn configure(self) -> Result<Pipeline<Configured>, PipelineError> {
        let settings = self.engine_settings;
        if settings.base_stroke_ms == 0 {
            return Err(PipelineError::InvalidSettings(
                "base_stroke_ms must be positive".to_string(),
            ));
        }
        if settings.tick_ms == 0 {
            return Err(PipelineError::InvalidSettings(
                "tick_ms must be positive".to_string(),
            ));
        }
        if let Some(position) = settings.park_position {
            if !(0.0..=1.0).contains(&position) {
                return Err(PipelineError::InvalidSettings(format!(
                    "park_position {} outside [0, 1]",
                    position
                )));
            }
        }
        debug!(
            "Pipeline configured: base stroke {} ms, tick {} ms",
            settings.base_stroke_ms, settings.tick_ms
        );
        Ok(self.transition())
    }
}

impl Pipeline<Configured> {
    pub fn activate(self) -> Pipeline<Active> {
        info!("Activating event pipeline");
        self.transition()
    }
}

impl Pipeline<Active> {
    pub fn handle_input(&mut self, input: PipelineInput, now: Instant) {
        match input {
            PipelineInput::GameFrame(raw) => self.handle_frame(&raw, now),
            PipelineInput::GameConnected => {
                info!("Game link up, resetting actuation state");
                self.reset(LinkKind::Game, now);
            }
            PipelineInput::GameDisconnected => {
                info!("Game link down, stopping motion");
                self.reset(LinkKind::Game, now);
            }
            PipelineInput::DeviceLinkUp { devices } => {
                info!("Device link up with {} device(s)", devices.len());
                self.session.on_device_list_changed(devices);
                self.session.forget_history();
                self.missing = None;
                self.reset(LinkKind::Device, now);
            }
            PipelineInput::DevicesChanged { devices } => {
                self.session.on_device_list_changed(devices);
                self.missing = None;
            }
            PipelineInput::DeviceLinkDown => {
                info!("Device link down, dropping device set");
                self.session.clear();
            }
            PipelineInput::SetDeviceEnabled { id, enabled } => {
                if !self.session.set_enabled(id, enabled) {
                    warn!("Cannot toggle unknown device {}", id);
                }
            }
        }
    }

    pub fn handle_frame(&mut self, raw: &str, now: Instant) {
        self.stats.frames += 1;
        match decode_frame(raw) {
            Ok(Frame::Event(event)) => self.apply_event(event, now),
            Ok(Frame::Modes(frame)) => {
                let presets = self.tuning.presets();
                for event in self.modes.translate(frame, &presets) {
                    self.apply_event(event, now);
                }
            }
            Err(e) => {
                self.stats.decode_errors += 1;
                debug!("Dropping game frame: {}", e);
            }
        }
    }

    pub fn apply_event(&mut self, event: GameEvent, now: Instant) {
        self.stats.events += 1;
        trace!("Applying {}", event.name());
        let params = self.tuning.current();
        let commands = self.engine.apply(event, &params, &mut self.actuation, now);
        for command in commands {
            self.dispatch(command);
        }
    }

    /// Re-derives the running modes from the current presets. A running
    /// stroke cycle is retimed from its next leg on; an active vibe mode is
    /// re-applied right away.
    pub fn on_presets_changed(&mut self, now: Instant) {
        let presets = self.tuning.presets();
        if let Some(velocity) = self.modes.piston_velocity(&presets) {
            if self.actuation.retime_cycle(Some(velocity)) {
                debug!("Stroke cycle retimed to velocity {:.2}", velocity);
            }
        }
        if let Some(event) = self.modes.vibe_event(&presets) {
            self.apply_event(event, now);
        }
    }

    /// Fires a due cycle leg or parking move.
    pub fn on_tick(&mut self, now: Instant) {
        let params = self.tuning.current();
        if let Some(command) = self.engine.tick(&params, &mut self.actuation, now) {
            self.dispatch(command);
        }
    }

    fn reset(&mut self, link: LinkKind, now: Instant) {
        self.stats.resets += 1;
        self.modes.reset();
        debug!("Synthetic session reset after {} change", link);
        self.apply_event(GameEvent::SessionReset, now);
    }

    fn dispatch(&mut self, command: MotionCommand) {
        match self.session.dispatch(command) {
            Ok(()) => {}
            Err(DispatchError::NoCapableDevice(capability)) => {
                self.stats.undeliverable += 1;
                if command.is_stop() {
                    trace!("No device for {:?}", command);
                    return;
                }
                debug!("No device supports {:?}, dropping {:?}", capability, command);
                if self.missing != Some(capability) {
                    self.missing = Some(capability);
                    self.status.warn(
                        "pipeline",
                        format!("No connected device supports {:?}", capability),
                    );
                }
            }
            Err(e @ DispatchError::Undelivered(_)) => {
                self.stats.undeliverable += 1;
                debug!("{}", e);
            }
            Err(e @ DispatchError::InvalidCommand(_)) => {
                self.status.warn("pipeline", e.to_string());
            }
        }
    }

    /// Processes inputs and ticks until cancelled or every input sender is
    /// gone.
    pub async fn run_until_shutdown(mut self, cancel: CancellationToken) -> Pipeline<Deactivating> {
        info!("Starting event pipeline loop");
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.engine_settings.tick_ms.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut presets_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutdown signal received for event pipeline");
                    break;
                }

                input = self.input_rx.recv() => match input {
                    Some(input) => self.handle_input(input, now()),
                    None => {
                        warn!("All pipeline inputs closed");
                        break;
                    }
                },

                changed = self.presets_rx.changed(), if presets_open => match changed {
                    Ok(()) => self.on_presets_changed(now()),
                    Err(_) => presets_open = false,
                },

                _ = tick.tick() => self.on_tick(now()),
            }
        }

        self.transition()
    }
}

impl Pipeline<Deactivating> {
    pub fn shutdown(mut self) -> Pipeline<Deactivated> {
        info!("Shutting down event pipeline");
        self.actuation = ActuationState::default();
        self.session.clear();
        debug!("Pipeline stats at shutdown: {:?}", self.stats);
        self.transition()
    }
}

impl Pipeline<Deactivated> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceDescriptor, DeviceId, DeviceRequest, SessionSettings};
    use crate::tuning::{ModePresets, TuningParameters};

    struct Fixture {
        pipeline: Pipeline<Active>,
        outbound: mpsc::Receiver<DeviceRequest>,
        input_tx: mpsc::Sender<PipelineInput>,
        tuning: TuningSurface,
    }

    fn fixture() -> Fixture {
        let (out_tx, outbound) = mpsc::channel(64);
        let (input_tx, input_rx) = mpsc::channel(16);
        let session = SessionManager::new(SessionSettings::default(), out_tx, CancellationToken::new());
        let tuning = TuningSurface::new(
            TuningParameters {
                piston_speed_scale: 1.0,
                stroke_range_min: 0.2,
                stroke_range_max: 0.8,
                vibration_strength_scale: 1.0,
            },
            ModePresets::default(),
        );
        let pipeline = Pipeline::create(
            input_rx,
            EngineSettings::default(),
            session,
            tuning.clone(),
            StatusSink::new(),
        )
        .configure()
        .unwrap()
        .activate();
        Fixture {
            pipeline,
            outbound,
            input_tx,
            tuning,
        }
    }

    fn stroker(id: u32) -> DeviceDescriptor {
        DeviceDescriptor::new(DeviceId(id), "Stroker", id, 1, 0)
    }

    fn combo(id: u32) -> DeviceDescriptor {
        DeviceDescriptor::new(DeviceId(id), "Combo", id, 1, 1)
    }

    async fn next_request(outbound: &mut mpsc::Receiver<DeviceRequest>) -> DeviceRequest {
        tokio::time::timeout(Duration::from_secs(1), outbound.recv())
            .await
            .expect("no command arrived")
            .expect("outbound closed")
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let (out_tx, _out_rx) = mpsc::channel(1);
        let (_tx, rx) = mpsc::channel(1);
        let settings = EngineSettings {
            tick_ms: 0,
            ..EngineSettings::default()
        };
        let result = Pipeline::create(
            rx,
            settings,
            SessionManager::new(SessionSettings::default(), out_tx, CancellationToken::new()),
            TuningSurface::default(),
            StatusSink::new(),
        )
        .configure();
        assert!(matches!(result, Err(PipelineError::InvalidSettings(_))));
    }

    #[tokio::test]
    async fn test_device_reconnect_resets_before_new_commands() {
        let mut fx = fixture();
        let t0 = now();
        fx.pipeline
            .handle_input(PipelineInput::DeviceLinkUp { devices: vec![combo(1)] }, t0);
        fx.pipeline.handle_frame(r#"{"event":"stroke_start"}"#, t0);

        // Link drops mid-stroke and comes back with a different set.
        fx.pipeline.handle_input(PipelineInput::DeviceLinkDown, t0);
        let before = fx.pipeline.session().stats().device_list_changes;
        fx.pipeline
            .handle_input(PipelineInput::DeviceLinkUp { devices: vec![stroker(2)] }, t0);
        assert_eq!(fx.pipeline.session().stats().device_list_changes, before + 1);
        assert!(fx.pipeline.actuation().is_idle());

        fx.pipeline.handle_frame(r#"{"event":"stroke_update","position":1.0}"#, t0);

        let mut for_new_device = Vec::new();
        while for_new_device.len() < 2 {
            let request = next_request(&mut fx.outbound).await;
            if request.device == DeviceId(2) {
                for_new_device.push(request.command);
            }
        }
        assert_eq!(for_new_device[0], MotionCommand::LinearStop);
        assert!(matches!(
            for_new_device[1],
            MotionCommand::LinearMove { position, .. } if (position - 0.8).abs() < 1e-9
        ));
    }

    #[tokio::test]
    async fn test_vibration_without_capable_device_after_reconnect() {
        let mut fx = fixture();
        let t0 = now();
        fx.pipeline
            .handle_input(PipelineInput::DeviceLinkUp { devices: vec![combo(1)] }, t0);
        fx.pipeline.handle_input(PipelineInput::DeviceLinkDown, t0);
        fx.pipeline
            .handle_input(PipelineInput::DeviceLinkUp { devices: vec![stroker(1)] }, t0);

        let undeliverable = fx.pipeline.stats().undeliverable;
        fx.pipeline
            .handle_frame(r#"{"event":"vibration_set","intensity":0.5}"#, t0);
        assert_eq!(fx.pipeline.stats().undeliverable, undeliverable + 1);
        assert_eq!(fx.pipeline.actuation().vibration, Some(0.5));
        assert_eq!(fx.pipeline.session().device_count(), 1);
    }

    #[tokio::test]
    async fn test_bad_frames_are_counted_and_dropped() {
        let mut fx = fixture();
        let t0 = now();
        fx.pipeline.handle_frame("not json", t0);
        fx.pipeline.handle_frame(r#"{"event":"warp_drive"}"#, t0);
        assert_eq!(fx.pipeline.stats().decode_errors, 2);
        assert_eq!(fx.pipeline.stats().events, 0);
        assert!(fx.pipeline.actuation().is_idle());
    }

    #[tokio::test]
    async fn test_mode_frames_drive_cycle() {
        let mut fx = fixture();
        let t0 = now();
        fx.pipeline
            .handle_input(PipelineInput::DeviceLinkUp { devices: vec![combo(1)] }, t0);
        while fx.outbound.try_recv().is_ok() {}

        fx.pipeline.handle_frame(r#"{"piston":2,"vibe":1}"#, t0);
        assert!(fx.pipeline.actuation().cycle.is_some());
        assert_eq!(fx.pipeline.actuation().vibration, Some(0.5));

        fx.pipeline.on_tick(t0 + Duration::from_millis(500));
        assert_eq!(fx.pipeline.actuation().linear_target, Some(0.2));
    }

    #[tokio::test]
    async fn test_tuning_change_applies_to_next_event() {
        let mut fx = fixture();
        let t0 = now();
        fx.pipeline
            .handle_input(PipelineInput::DeviceLinkUp { devices: vec![combo(1)] }, t0);

        fx.tuning
            .set(TuningParameters {
                vibration_strength_scale: 0.5,
                ..fx.tuning.current()
            })
            .unwrap();
        fx.pipeline
            .handle_frame(r#"{"event":"vibration_set","intensity":0.8}"#, t0);
        assert_eq!(fx.pipeline.actuation().vibration, Some(0.4));
    }

    #[tokio::test]
    async fn test_game_link_change_resets_actuation() {
        for input in [PipelineInput::GameConnected, PipelineInput::GameDisconnected] {
            let mut fx = fixture();
            let t0 = now();
            fx.pipeline
                .handle_input(PipelineInput::DeviceLinkUp { devices: vec![combo(1)] }, t0);
            fx.pipeline.handle_frame(r#"{"piston":2,"vibe":1}"#, t0);
            assert!(!fx.pipeline.actuation().is_idle());
            tokio::time::sleep(Duration::from_millis(20)).await;
            while fx.outbound.try_recv().is_ok() {}

            fx.pipeline.handle_input(input, t0);
            assert!(fx.pipeline.actuation().is_idle());
            assert_eq!(next_request(&mut fx.outbound).await.command, MotionCommand::LinearStop);
            assert_eq!(next_request(&mut fx.outbound).await.command, MotionCommand::VibrateStop);

            // The mode tracker was reset too, so the same frame starts over.
            fx.pipeline.handle_frame(r#"{"piston":2,"vibe":1}"#, t0);
            assert!(fx.pipeline.actuation().cycle.is_some());
            assert_eq!(fx.pipeline.actuation().vibration, Some(0.5));
        }
    }

    #[tokio::test]
    async fn test_preset_edit_retimes_running_modes() {
        let mut fx = fixture();
        let t0 = now();
        fx.pipeline
            .handle_input(PipelineInput::DeviceLinkUp { devices: vec![combo(1)] }, t0);
        // mode 1 = 0.9 s legs
        fx.pipeline.handle_frame(r#"{"piston":1,"vibe":1}"#, t0);
        let first_leg = t0 + Duration::from_millis(900);
        assert_eq!(fx.pipeline.actuation().scheduled.unwrap().due_at, first_leg);

        fx.tuning
            .set_presets(ModePresets {
                piston_interval_secs: [2.0, 0.5, 0.4],
                vibe_strength: [0.1, 1.0],
            })
            .unwrap();
        fx.pipeline.on_presets_changed(t0);
        assert_eq!(fx.pipeline.actuation().vibration, Some(0.1));
        // The leg in flight is not cut short.
        assert_eq!(fx.pipeline.actuation().scheduled.unwrap().due_at, first_leg);

        fx.pipeline.on_tick(first_leg);
        assert_eq!(
            fx.pipeline.actuation().scheduled.unwrap().due_at,
            first_leg + Duration::from_millis(2000)
        );
    }

    #[tokio::test]
    async fn test_preset_edit_without_active_mode_is_silent() {
        let mut fx = fixture();
        let t0 = now();
        fx.pipeline
            .handle_input(PipelineInput::DeviceLinkUp { devices: vec![combo(1)] }, t0);
        let events = fx.pipeline.stats().events;

        fx.pipeline.on_presets_changed(t0);
        assert_eq!(fx.pipeline.stats().events, events);
        assert!(fx.pipeline.actuation().is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_applies_preset_edits() {
        let fx = fixture();
        let cancel = CancellationToken::new();
        let input_tx = fx.input_tx.clone();
        let tuning = fx.tuning.clone();
        let task = tokio::spawn(fx.pipeline.run_until_shutdown(cancel.clone()));

        input_tx
            .send(PipelineInput::DeviceLinkUp { devices: vec![combo(0)] })
            .await
            .unwrap();
        input_tx
            .send(PipelineInput::GameFrame(r#"{"piston":1,"vibe":1}"#.to_string()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        tuning
            .set_presets(ModePresets {
                vibe_strength: [0.1, 1.0],
                ..ModePresets::default()
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let deactivating = task.await.unwrap();
        assert_eq!(deactivating.actuation().vibration, Some(0.1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_stops_on_cancel() {
        let fx = fixture();
        let cancel = CancellationToken::new();
        let input_tx = fx.input_tx.clone();
        let task = tokio::spawn(fx.pipeline.run_until_shutdown(cancel.clone()));

        input_tx
            .send(PipelineInput::DeviceLinkUp { devices: vec![stroker(0)] })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let deactivating = task.await.unwrap();
        assert_eq!(deactivating.session().device_count(), 1);
        let stopped = deactivating.shutdown();
        assert_eq!(stopped.session().device_count(), 0);
    }
}
