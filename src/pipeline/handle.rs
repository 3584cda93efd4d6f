use super::engine::Pipeline;
use super::{PipelineError, PipelineInput};
use crate::device::SessionManager;
use crate::motion::EngineSettings;
use crate::status::StatusSink;
use crate::tuning::TuningSurface;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const INPUT_CAPACITY: usize = 256;

/// Runs the pipeline in its own tokio task.
#[derive(Debug)]
pub struct PipelineHandle {
    input_tx: mpsc::Sender<PipelineInput>,
    cancel: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Configures and activates the pipeline, then spawns its loop.
    pub fn spawn(
        engine_settings: EngineSettings,
        session: SessionManager,
        tuning: TuningSurface,
        status: StatusSink,
        cancel: CancellationToken,
    ) -> Result<Self, PipelineError> {
        let (input_tx, input_rx) = mpsc::channel(INPUT_CAPACITY);
        let pipeline = Pipeline::create(input_rx, engine_settings, session, tuning, status)
            .configure()?
            .activate();

        let task_cancel = cancel.clone();
        let task_handle = tokio::spawn(async move {
            let deactivating = pipeline.run_until_shutdown(task_cancel).await;
            let stopped = deactivating.shutdown();
            info!("Event pipeline stopped after {} frames", stopped.stats().frames);
        });

        Ok(Self {
            input_tx,
            cancel,
            task_handle: Some(task_handle),
        })
    }

    pub fn sender(&self) -> mpsc::Sender<PipelineInput> {
        self.input_tx.clone()
    }

    /// Cancels the loop and waits for the task to finish.
    pub async fn shutdown(&mut self) -> Result<(), PipelineError> {
        debug!("Sending shutdown signal to event pipeline");
        self.cancel.cancel();

        match self.task_handle.take() {
            Some(handle) => handle.await.map_err(|e| {
                error!("Event pipeline task panicked: {}", e);
                PipelineError::TaskError(e.to_string())
            }),
            None => Ok(()),
        }
    }
}
