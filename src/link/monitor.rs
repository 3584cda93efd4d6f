use super::{BackoffSettings, ConnectionState, LinkError, LinkKind};
use crate::status::StatusSink;
use chrono::Local;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-link connection state, published over a watch channel.
///
/// Cloned into each session attempt so the session can report `Connected`
/// once its handshake is done. The retry counter resets on every successful
/// connection.
#[derive(Debug, Clone)]
pub struct LinkMonitor {
    kind: LinkKind,
    state: Arc<watch::Sender<ConnectionState>>,
    attempt: Arc<AtomicU32>,
    backoff: BackoffSettings,
    status: StatusSink,
}

impl LinkMonitor {
    pub fn new(kind: LinkKind, backoff: BackoffSettings, status: StatusSink) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            kind,
            state: Arc::new(state),
            attempt: Arc::new(AtomicU32::new(0)),
            backoff,
            status,
        }
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Failed attempts since the last successful connection.
    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }

    pub fn connecting(&self) {
        debug!("{}: connecting", self.kind);
        self.set(ConnectionState::Connecting);
    }

    pub fn connected(&self) {
        self.attempt.store(0, Ordering::SeqCst);
        info!("{}: connected", self.kind);
        self.status.info("link", format!("{} connected", self.kind));
        self.set(ConnectionState::Connected);
    }

    /// Records a failure and returns how long to wait before the next try.
    pub fn failed(&self, error: &LinkError) -> Duration {
        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.backoff.delay(attempt, &mut rand::thread_rng());
        let next_retry_at = Local::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        warn!(
            "{}: {} (retry {} in {:?})",
            self.kind, error, attempt, delay
        );
        self.status.warn(
            "link",
            format!("{} lost: {}, retrying in {:.1}s", self.kind, error, delay.as_secs_f64()),
        );
        self.set(ConnectionState::Reconnecting {
            attempt,
            next_retry_at,
        });
        delay
    }

    pub fn shutdown(&self) {
        info!("{}: shut down", self.kind);
        self.state.send_replace(ConnectionState::Shutdown);
    }

    fn set(&self, next: ConnectionState) {
        if *self.state.borrow() == ConnectionState::Shutdown {
            return;
        }
        self.state.send_replace(next);
    }
}

/// Runs `session` until the token is cancelled, retrying with backoff.
///
/// A session resolves when its connection ends. Sessions watch the token
/// themselves so they can leave the remote side in a clean state; a session
/// that returns `Ok` is treated as a clean close.
pub async fn supervise<F, Fut>(monitor: LinkMonitor, cancel: CancellationToken, mut session: F)
where
    F: FnMut(LinkMonitor) -> Fut,
    Fut: Future<Output = Result<(), LinkError>>,
{
    info!("Supervising {}", monitor.kind());
    loop {
        if cancel.is_cancelled() {
            break;
        }
        monitor.connecting();
        let outcome = session(monitor.clone()).await;
        if cancel.is_cancelled() {
            break;
        }

        let error = match outcome {
            Ok(()) => LinkError::Closed,
            Err(LinkError::PipelineClosed) => {
                warn!("{}: pipeline stopped, giving up", monitor.kind());
                break;
            }
            Err(e) => e,
        };

        let delay = monitor.failed(&error);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    monitor.shutdown();
}
