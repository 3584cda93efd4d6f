//! Device server link.
//!
//! A session connects, performs the server-info handshake, scans for
//! devices and then reports the device set to the pipeline with
//! [`PipelineInput::DeviceLinkUp`]. After that it forwards outbound
//! [`DeviceRequest`]s, follows device add/remove notifications, keeps the
//! server's ping timer satisfied and rescans periodically.

use super::buttplug::{
    self, ClientMessage, DeviceFeatures, DeviceInfo, DeviceOutput, IdOnly, RequestServerInfo,
    ServerInfo, ServerMessage,
};
use super::{LinkError, LinkMonitor, LinkSettings};
use crate::device::{DeviceDescriptor, DeviceId, DeviceRequest};
use crate::pipeline::PipelineInput;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);
const MIN_PING_PERIOD: Duration = Duration::from_millis(100);
/// Stands in for a disabled timer in `select!`
const IDLE_PERIOD: Duration = Duration::from_secs(3600);

struct RegisteredDevice {
    discovery_index: u32,
    output: DeviceOutput,
    descriptor: DeviceDescriptor,
}

/// Devices known on the current connection, in discovery order.
#[derive(Default)]
pub struct DeviceRegistry {
    entries: BTreeMap<DeviceId, RegisteredDevice>,
    next_index: u32,
    published: Option<Vec<DeviceDescriptor>>,
}

impl DeviceRegistry {
    /// Registers a device. A device already known keeps its discovery index
    /// and its last vibration level.
    pub fn add(&mut self, info: &DeviceInfo) {
        let id = DeviceId(info.device_index);
        if let Some(existing) = self.entries.get_mut(&id) {
            existing.output.features = info.features();
            existing.descriptor = info.descriptor(existing.discovery_index);
            return;
        }
        let discovery_index = self.next_index;
        self.next_index += 1;
        self.entries.insert(
            id,
            RegisteredDevice {
                discovery_index,
                output: DeviceOutput::new(info.features()),
                descriptor: info.descriptor(discovery_index),
            },
        );
    }

    /// Replaces the set with a full device list. Devices already known keep
    /// their discovery index.
    pub fn replace(&mut self, devices: &[DeviceInfo]) {
        self.entries
            .retain(|id, _| devices.iter().any(|d| DeviceId(d.device_index) == *id));
        for info in devices {
            self.add(info);
        }
    }

    pub fn remove(&mut self, id: DeviceId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn features(&self, id: DeviceId) -> Option<&DeviceFeatures> {
        self.entries.get(&id).map(|entry| &entry.output.features)
    }

    pub fn output_mut(&mut self, id: DeviceId) -> Option<&mut DeviceOutput> {
        self.entries.get_mut(&id).map(|entry| &mut entry.output)
    }

    pub fn descriptors(&self) -> Vec<DeviceDescriptor> {
        let mut entries: Vec<&RegisteredDevice> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.discovery_index);
        entries
            .into_iter()
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    /// The current set if it differs from what was last published.
    pub fn take_changes(&mut self) -> Option<Vec<DeviceDescriptor>> {
        let current = self.descriptors();
        if self.published.as_ref() == Some(&current) {
            return None;
        }
        self.published = Some(current.clone());
        Some(current)
    }
}

struct DeviceConnection {
    sink: SplitSink<WsStream, Message>,
    next_id: u32,
}

impl DeviceConnection {
    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        // 0 is reserved for server-initiated messages
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);
        id
    }

    async fn send(&mut self, message: ClientMessage) -> Result<(), LinkError> {
        let raw = buttplug::encode(&[message]).map_err(|e| LinkError::Protocol(e.to_string()))?;
        trace!("Device server <- {}", raw);
        self.sink.send(Message::Text(raw)).await?;
        Ok(())
    }

    async fn send_simple(&mut self, build: fn(IdOnly) -> ClientMessage) -> Result<u32, LinkError> {
        let id = self.next_id();
        self.send(build(IdOnly { id })).await?;
        Ok(id)
    }
}

fn parse_frame(text: &str) -> Vec<ServerMessage> {
    buttplug::decode(text).unwrap_or_else(|e| {
        warn!("Unreadable frame from device server: {}", e);
        Vec::new()
    })
}

async fn handshake(
    conn: &mut DeviceConnection,
    stream: &mut SplitStream<WsStream>,
    settings: &LinkSettings,
) -> Result<ServerInfo, LinkError> {
    let id = conn.next_id();
    conn.send(ClientMessage::RequestServerInfo(RequestServerInfo {
        id,
        client_name: settings.client_name.clone(),
        message_version: buttplug::MESSAGE_VERSION,
    }))
    .await?;

    let wait = async {
        while let Some(frame) = stream.next().await {
            let Message::Text(text) = frame? else {
                continue;
            };
            for message in parse_frame(&text) {
                match message {
                    ServerMessage::ServerInfo(info) => return Ok(info),
                    ServerMessage::Error(err) => return Err(LinkError::Protocol(err.error_message)),
                    other => trace!("Ignoring {:?} during handshake", other),
                }
            }
        }
        Err(LinkError::Closed)
    };

    let timeout = settings.connect_timeout();
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| LinkError::Timeout(timeout))?
}

/// One connection lifetime. Resolves `Ok` only after cancellation.
///
/// `outbound` is shared across sessions; requests queued while the link was
/// down are dropped when a new session starts.
pub async fn run_device_session(
    settings: LinkSettings,
    monitor: LinkMonitor,
    events: mpsc::Sender<PipelineInput>,
    outbound: Arc<Mutex<mpsc::Receiver<DeviceRequest>>>,
    cancel: CancellationToken,
) -> Result<(), LinkError> {
    let timeout = settings.connect_timeout();
    let connect = tokio::time::timeout(timeout, connect_async(settings.device_url.as_str()));
    let (ws, _) = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        result = connect => result.map_err(|_| LinkError::Timeout(timeout))??,
    };
    let (sink, mut stream) = ws.split();
    let mut conn = DeviceConnection { sink, next_id: 1 };

    let server = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        server = handshake(&mut conn, &mut stream, &settings) => server?,
    };
    if server.message_version < buttplug::MESSAGE_VERSION {
        return Err(LinkError::Protocol(format!(
            "server '{}' speaks message version {}, need {}",
            server.server_name,
            server.message_version,
            buttplug::MESSAGE_VERSION
        )));
    }
    info!(
        "Device server '{}' ready (ping {} ms)",
        server.server_name, server.max_ping_time
    );
    monitor.connected();

    let mut outbound = outbound.lock().await;
    let mut stale = 0usize;
    while outbound.try_recv().is_ok() {
        stale += 1;
    }
    if stale > 0 {
        debug!("Dropped {} requests queued while disconnected", stale);
    }

    let result = drive_session(
        &settings,
        &server,
        &mut conn,
        &mut stream,
        &events,
        &mut outbound,
        &cancel,
    )
    .await;

    if result.is_err() {
        let _ = events.send(PipelineInput::DeviceLinkDown).await;
    }
    result
}

async fn drive_session(
    settings: &LinkSettings,
    server: &ServerInfo,
    conn: &mut DeviceConnection,
    stream: &mut SplitStream<WsStream>,
    events: &mpsc::Sender<PipelineInput>,
    outbound: &mut mpsc::Receiver<DeviceRequest>,
    cancel: &CancellationToken,
) -> Result<(), LinkError> {
    let mut registry = DeviceRegistry::default();
    let mut initial_pending = true;

    conn.send_simple(ClientMessage::StartScanning).await?;
    let mut scan_deadline = Some(Instant::now() + settings.scan_duration());
    info!("Scanning for devices");

    let ping_enabled = server.max_ping_time > 0;
    let ping_period = if ping_enabled {
        (Duration::from_millis(server.max_ping_time) / 2).max(MIN_PING_PERIOD)
    } else {
        IDLE_PERIOD
    };
    let mut ping = tokio::time::interval_at(Instant::now() + ping_period, ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let rescan_period = settings.rescan_interval();
    let rescan_every = rescan_period.unwrap_or(IDLE_PERIOD);
    let mut rescan = tokio::time::interval_at(Instant::now() + rescan_every, rescan_every);
    rescan.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
                    conn.send_simple(ClientMessage::StopAllDevices).await?;
                    conn.sink.close().await?;
                    Ok::<(), LinkError>(())
                })
                .await;
                return Ok(());
            }

            _ = tokio::time::sleep_until(scan_deadline.unwrap_or_else(Instant::now)), if scan_deadline.is_some() => {
                scan_deadline = None;
                conn.send_simple(ClientMessage::StopScanning).await?;
                conn.send_simple(ClientMessage::RequestDeviceList).await?;
            }

            _ = ping.tick(), if ping_enabled => {
                conn.send_simple(ClientMessage::Ping).await?;
            }

            _ = rescan.tick(), if rescan_period.is_some() && scan_deadline.is_none() && !initial_pending => {
                debug!("Periodic device rescan");
                conn.send_simple(ClientMessage::StartScanning).await?;
                scan_deadline = Some(Instant::now() + settings.scan_duration());
            }

            request = outbound.recv() => {
                let Some(request) = request else {
                    return Err(LinkError::PipelineClosed);
                };
                let Some(output) = registry.output_mut(request.device) else {
                    debug!("Dropping request for unknown device {}", request.device);
                    continue;
                };
                let messages = output.messages(|| conn.next_id(), &request);
                if messages.is_empty() {
                    debug!("Device {} has no actuator for {:?}", request.device, request.command);
                }
                for message in messages {
                    conn.send(message).await?;
                }
            }

            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Device server closed the link: {:?}", frame);
                        return Err(LinkError::Closed);
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(LinkError::Closed),
                };

                for message in parse_frame(&text) {
                    handle_server_message(message, &mut registry, &mut initial_pending, events).await?;
                }
            }
        }
    }
}

async fn handle_server_message(
    message: ServerMessage,
    registry: &mut DeviceRegistry,
    initial_pending: &mut bool,
    events: &mpsc::Sender<PipelineInput>,
) -> Result<(), LinkError> {
    let changed = match message {
        ServerMessage::DeviceList(list) => {
            registry.replace(&list.devices);
            if *initial_pending {
                *initial_pending = false;
                let devices = registry.take_changes().unwrap_or_else(|| registry.descriptors());
                info!("Initial scan found {} device(s)", devices.len());
                return events
                    .send(PipelineInput::DeviceLinkUp { devices })
                    .await
                    .map_err(|_| LinkError::PipelineClosed);
            }
            true
        }
        ServerMessage::DeviceAdded(info) => {
            info!("Device added: {} ({})", info.device_name, info.device_index);
            registry.add(&info);
            true
        }
        ServerMessage::DeviceRemoved(removed) => {
            info!("Device removed: {}", removed.device_index);
            registry.remove(DeviceId(removed.device_index))
        }
        ServerMessage::Error(err) => {
            warn!(
                "Device server error for message {}: {} (code {})",
                err.id, err.error_message, err.error_code
            );
            false
        }
        other => {
            trace!("Device server -> {:?}", other);
            false
        }
    };

    // Until the initial scan is reported, the full list covers everything.
    if changed && !*initial_pending {
        if let Some(devices) = registry.take_changes() {
            return events
                .send(PipelineInput::DevicesChanged { devices })
                .await
                .map_err(|_| LinkError::PipelineClosed);
        }
    }
    Ok(())
}
