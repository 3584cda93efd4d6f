//! Device server wire messages (Buttplug protocol, message version 3).
//!
//! Every websocket frame is a JSON array of single-key objects, the key being
//! the message type:
//!
//! ```text
//! [{"LinearCmd":{"Id":7,"DeviceIndex":0,"Vectors":[{"Index":0,"Duration":500,"Position":0.8}]}}]
//! ```
//!
//! Only the messages the bridge sends or reacts to are modeled. Unknown
//! server messages are skipped with a debug log.

use crate::device::{DeviceDescriptor, DeviceId, DeviceRequest};
use crate::motion::MotionCommand;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const MESSAGE_VERSION: u32 = 3;

const ACTUATOR_VIBRATE: &str = "Vibrate";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ClientMessage {
    RequestServerInfo(RequestServerInfo),
    Ping(IdOnly),
    StartScanning(IdOnly),
    StopScanning(IdOnly),
    RequestDeviceList(IdOnly),
    StopAllDevices(IdOnly),
    LinearCmd(LinearCmd),
    ScalarCmd(ScalarCmd),
    StopDeviceCmd(StopDeviceCmd),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IdOnly {
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestServerInfo {
    pub id: u32,
    pub client_name: String,
    pub message_version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LinearCmd {
    pub id: u32,
    pub device_index: u32,
    pub vectors: Vec<LinearVector>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LinearVector {
    pub index: u32,
    pub duration: u32,
    pub position: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScalarCmd {
    pub id: u32,
    pub device_index: u32,
    pub scalars: Vec<ScalarSubcommand>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScalarSubcommand {
    pub index: u32,
    pub scalar: f64,
    pub actuator_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StopDeviceCmd {
    pub id: u32,
    pub device_index: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub enum ServerMessage {
    ServerInfo(ServerInfo),
    Ok(IdOnly),
    Error(ServerError),
    DeviceList(DeviceList),
    DeviceAdded(DeviceInfo),
    DeviceRemoved(DeviceRemoved),
    ScanningFinished(IdOnly),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerInfo {
    pub id: u32,
    pub server_name: String,
    pub message_version: u32,
    /// Milliseconds, 0 means the server does not expect pings
    #[serde(default)]
    pub max_ping_time: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerError {
    pub id: u32,
    pub error_message: String,
    #[serde(default)]
    pub error_code: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceList {
    pub id: u32,
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceRemoved {
    #[serde(default)]
    pub id: u32,
    pub device_index: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceInfo {
    #[serde(default)]
    pub id: u32,
    pub device_name: String,
    pub device_index: u32,
    #[serde(default)]
    pub device_display_name: Option<String>,
    #[serde(default)]
    pub device_messages: DeviceMessages,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeviceMessages {
    #[serde(rename = "LinearCmd", default)]
    pub linear_cmd: Vec<ActuatorAttributes>,
    #[serde(rename = "ScalarCmd", default)]
    pub scalar_cmd: Vec<ActuatorAttributes>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActuatorAttributes {
    #[serde(default)]
    pub feature_descriptor: Option<String>,
    #[serde(default)]
    pub actuator_type: Option<String>,
    #[serde(default)]
    pub step_count: Option<u32>,
}

/// Which actuator indices of a device the bridge drives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub linear: Vec<u32>,
    /// Indices into the device's ScalarCmd attribute list
    pub vibrate: Vec<u32>,
}

impl DeviceInfo {
    pub fn features(&self) -> DeviceFeatures {
        DeviceFeatures {
            linear: (0..self.device_messages.linear_cmd.len() as u32).collect(),
            vibrate: self
                .device_messages
                .scalar_cmd
                .iter()
                .enumerate()
                .filter(|(_, attr)| attr.actuator_type.as_deref() == Some(ACTUATOR_VIBRATE))
                .map(|(i, _)| i as u32)
                .collect(),
        }
    }

    pub fn descriptor(&self, discovery_index: u32) -> DeviceDescriptor {
        let features = self.features();
        let name = self
            .device_display_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.device_name);
        DeviceDescriptor::new(
            DeviceId(self.device_index),
            name,
            discovery_index,
            features.linear.len() as u32,
            features.vibrate.len() as u32,
        )
    }
}

pub fn encode(messages: &[ClientMessage]) -> Result<String, serde_json::Error> {
    serde_json::to_string(messages)
}

/// Parses one frame. Entries of unknown type are skipped.
pub fn decode(raw: &str) -> Result<Vec<ServerMessage>, serde_json::Error> {
    let entries: Vec<Value> = serde_json::from_str(raw)?;
    let mut messages = Vec::with_capacity(entries.len());
    for entry in entries {
        match serde_json::from_value::<ServerMessage>(entry.clone()) {
            Ok(message) => messages.push(message),
            Err(e) => debug!("Skipping server message {}: {}", entry, e),
        }
    }
    Ok(messages)
}

/// Builds the wire message for a request, or `None` when the device has no
/// actuator for the command's channel.
pub fn command_message(
    id: u32,
    features: &DeviceFeatures,
    request: &DeviceRequest,
) -> Option<ClientMessage> {
    let device_index = request.device.0;
    match request.command {
        MotionCommand::LinearMove {
            position,
            duration_ms,
        } => {
            if features.linear.is_empty() {
                return None;
            }
            Some(ClientMessage::LinearCmd(LinearCmd {
                id,
                device_index,
                vectors: features
                    .linear
                    .iter()
                    .map(|&index| LinearVector {
                        index,
                        duration: duration_ms,
                        position,
                    })
                    .collect(),
            }))
        }
        MotionCommand::LinearStop => Some(ClientMessage::StopDeviceCmd(StopDeviceCmd {
            id,
            device_index,
        })),
        MotionCommand::VibrateAt { intensity } => vibrate_message(id, device_index, features, intensity),
        MotionCommand::VibrateStop => vibrate_message(id, device_index, features, 0.0),
    }
}

/// Actuators of one device plus the vibration level last sent to it.
///
/// Buttplug's `StopDeviceCmd` halts every actuator, so a linear stop on a
/// device that is vibrating is followed by its vibration level again.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceOutput {
    pub features: DeviceFeatures,
    vibration: f64,
}

impl DeviceOutput {
    pub fn new(features: DeviceFeatures) -> Self {
        Self {
            features,
            vibration: 0.0,
        }
    }

    pub fn vibration(&self) -> f64 {
        self.vibration
    }

    /// Wire messages for one request, in send order. Empty when the device
    /// has no actuator for the command's channel.
    pub fn messages(
        &mut self,
        mut next_id: impl FnMut() -> u32,
        request: &DeviceRequest,
    ) -> Vec<ClientMessage> {
        let Some(message) = command_message(next_id(), &self.features, request) else {
            return Vec::new();
        };
        let mut messages = vec![message];
        match request.command {
            MotionCommand::VibrateAt { intensity } => self.vibration = intensity,
            MotionCommand::VibrateStop => self.vibration = 0.0,
            MotionCommand::LinearStop if self.vibration > 0.0 => {
                messages.extend(vibrate_message(
                    next_id(),
                    request.device.0,
                    &self.features,
                    self.vibration,
                ));
            }
            _ => {}
        }
        messages
    }
}

fn vibrate_message(
    id: u32,
    device_index: u32,
    features: &DeviceFeatures,
    scalar: f64,
) -> Option<ClientMessage> {
    if features.vibrate.is_empty() {
        return None;
    }
    Some(ClientMessage::ScalarCmd(ScalarCmd {
        id,
        device_index,
        scalars: features
            .vibrate
            .iter()
            .map(|&index| ScalarSubcommand {
                index,
                scalar,
                actuator_type: ACTUATOR_VIBRATE.to_string(),
            })
            .collect(),
    }))
}
