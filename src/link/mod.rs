//! # Link Module
//!
//! Keeps the two external websocket links alive: the game plugin link and
//! the device server link. Both run the same supervision loop independently.
//!
//! ```text
//! link/
//! ├── mod.rs          - ConnectionState, LinkError, LinkSettings
//! ├── backoff.rs      - exponential backoff with jitter
//! ├── monitor.rs      - LinkMonitor: per-link state machine + supervise loop
//! ├── buttplug.rs     - device server message shapes (Buttplug v3 JSON)
//! ├── game_link.rs    - game plugin websocket session
//! └── device_link.rs  - device server websocket session, scanning, dispatch
//! ```
//!
//! ## State Machine
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected
//!                     ▲               │ failure
//!                     │               ▼
//!                     └──── Reconnecting(attempt, next_retry_at)
//!
//! any state ──(shutdown)──► Shutdown
//! ```
//!
//! A failing link is retried forever. Only transport failures move the state
//! machine; undecodable frames and dispatch errors never do.

pub mod backoff;
pub mod buttplug;
pub mod device_link;
pub mod game_link;
pub mod monitor;

pub use backoff::BackoffSettings;
pub use monitor::{supervise, LinkMonitor};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkKind {
    Game,
    Device,
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKind::Game => write!(f, "game link"),
            LinkKind::Device => write!(f, "device link"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting {
        attempt: u32,
        next_retry_at: DateTime<Local>,
    },
    /// Terminal, after a shutdown request
    Shutdown,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Reconnecting {
                attempt,
                next_retry_at,
            } => write!(
                f,
                "Reconnecting (attempt {}, next at {})",
                attempt,
                next_retry_at.format("%H:%M:%S")
            ),
            ConnectionState::Shutdown => write!(f, "Shutdown"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Websocket error: {0}")]
    Websocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Event pipeline is gone")]
    PipelineClosed,
}

/// Constants from the `[links]` config table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    pub game_url: String,
    pub device_url: String,
    pub client_name: String,
    pub connect_timeout_ms: u64,
    /// How long a device scan runs before the device list is requested
    pub scan_duration_ms: u64,
    /// Periodic rescan while connected. 0 disables.
    pub rescan_interval_secs: u64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            game_url: "ws://localhost:11451/ws".to_string(),
            device_url: "ws://127.0.0.1:12345".to_string(),
            client_name: "toybridge".to_string(),
            connect_timeout_ms: 5000,
            scan_duration_ms: 3000,
            rescan_interval_secs: 10,
        }
    }
}

impl LinkSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_millis(self.scan_duration_ms)
    }

    pub fn rescan_interval(&self) -> Option<Duration> {
        (self.rescan_interval_secs > 0).then(|| Duration::from_secs(self.rescan_interval_secs))
    }
}
