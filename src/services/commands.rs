//! Outbound configuration and command envelopes.
//!
//! Fire-and-forget: nothing here waits for an acknowledgement. A gateway
//! confirms by publishing a later `status` message, which goes through the
//! ingestion path like any other.

use crate::db::models::{AdcConfig, Gateway, Node, SensorConversion};
use chrono::{SecondsFormat, Utc};
use core::fmt;
use log::{debug, warn};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub enum PublishError {
    /// The transport has no live connection.
    NotConnected,
    /// The command name was empty.
    InvalidCommand,
    /// The node is not attached to the gateway it was addressed through.
    WrongGateway { node: i64, gateway: i64 },
    /// Stored node configuration does not match its schema.
    InvalidConfig { node: i64, message: String },
    Transport(String),
}

impl Display for PublishError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::NotConnected => write!(f, "transport not connected"),
            PublishError::InvalidCommand => write!(f, "command name is empty"),
            PublishError::WrongGateway { node, gateway } => {
                write!(f, "node {} does not belong to gateway {}", node, gateway)
            }
            PublishError::InvalidConfig { node, message } => {
                write!(f, "node {} has invalid stored config: {}", node, message)
            }
            PublishError::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl Error for PublishError {}

/// Outbound side of the pub/sub transport.
pub trait Transport: Send + Sync {
    fn publish(&self, topic: &str, payload: &Value) -> Result<(), PublishError>;
}

/// What was handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedCommand {
    pub topic: String,
    pub payload: Value,
}

#[derive(Serialize)]
struct BluetoothSection<'a> {
    enabled: bool,
    mac: Option<&'a str>,
    scanner_model: Option<&'a str>,
}

#[derive(Serialize)]
struct NodeConfigEnvelope<'a> {
    cmd: &'static str,
    node_id: i32,
    adc_config: AdcConfig,
    sensor_conversions: BTreeMap<String, SensorConversion>,
    bluetooth: BluetoothSection<'a>,
    timestamp: String,
}

pub struct CommandPublisher<T: Transport> {
    transport: T,
    namespace: String,
}

impl<T: Transport> CommandPublisher<T> {
    pub fn new(transport: T, namespace: impl Into<String>) -> Self {
        CommandPublisher {
            transport,
            namespace: namespace.into(),
        }
    }

    pub fn gateway_command_topic(&self, gateway: &Gateway) -> String {
        format!("{}/cmd", gateway.topic_prefix_or(&self.namespace))
    }

    pub fn node_config_topic(&self, gateway: &Gateway, node: &Node) -> String {
        format!("{}/node/{}/config", gateway.topic_prefix_or(&self.namespace), node.node_id)
    }

    /// Sends `{command, params, timestamp}` to `<prefix>/cmd`.
    pub fn publish_gateway_command(
        &self,
        gateway: &Gateway,
        command: &str,
        params: Value,
    ) -> Result<PublishedCommand, PublishError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(PublishError::InvalidCommand);
        }
        let params = if params.is_null() { json!({}) } else { params };
        let payload = json!({
            "command": command,
            "params": params,
            "timestamp": now_rfc3339(),
        });
        self.send(self.gateway_command_topic(gateway), payload)
    }

    /// Pushes the node's acquisition, conversion and scanner settings to
    /// `<prefix>/node/<node_id>/config`.
    pub fn publish_node_config(&self, gateway: &Gateway, node: &Node) -> Result<PublishedCommand, PublishError> {
        if node.gateway_id != gateway.id {
            return Err(PublishError::WrongGateway {
                node: node.id,
                gateway: gateway.id,
            });
        }
        let invalid = |e: serde_json::Error| PublishError::InvalidConfig {
            node: node.id,
            message: e.to_string(),
        };

        let envelope = NodeConfigEnvelope {
            cmd: "config",
            node_id: node.node_id,
            adc_config: node.adc_config().map_err(invalid)?.unwrap_or_default(),
            sensor_conversions: node.sensor_conversions().map_err(invalid)?,
            bluetooth: BluetoothSection {
                enabled: node.bluetooth_enabled,
                mac: node.bluetooth_mac.as_deref(),
                scanner_model: node.scanner_model.as_deref(),
            },
            timestamp: now_rfc3339(),
        };
        let payload = serde_json::to_value(&envelope).map_err(|e| PublishError::Transport(e.to_string()))?;
        self.send(self.node_config_topic(gateway, node), payload)
    }

    fn send(&self, topic: String, payload: Value) -> Result<PublishedCommand, PublishError> {
        match self.transport.publish(&topic, &payload) {
            Ok(()) => {
                debug!("Commands: published to {}", topic);
                Ok(PublishedCommand { topic, payload })
            }
            Err(e) => {
                warn!("Commands: publish to {} failed: {}", topic, e);
                Err(e)
            }
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
