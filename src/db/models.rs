//! Diesel model structs for the inventory hierarchy and the telemetry table.
//!
//! Ownership is site -> gateway -> node -> sensor reading; the cascade is
//! declared in the migrations, not implemented here.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::schema;

/// Default node capacity of a gateway when the management API does not set one.
pub const DEFAULT_MAX_NODES: i32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Online,
    Offline,
    Maintenance,
}

impl GatewayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayStatus::Online => "online",
            GatewayStatus::Offline => "offline",
            GatewayStatus::Maintenance => "maintenance",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
    Error,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
            NodeStatus::Error => "error",
        }
    }
}

/// A status column held a value outside its enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidStatus(pub String);

impl fmt::Display for InvalidStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid status value: {:?}", self.0)
    }
}

impl std::error::Error for InvalidStatus {}

impl FromStr for GatewayStatus {
    type Err = InvalidStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(GatewayStatus::Online),
            "offline" => Ok(GatewayStatus::Offline),
            "maintenance" => Ok(GatewayStatus::Maintenance),
            other => Err(InvalidStatus(other.to_string())),
        }
    }
}

impl FromStr for NodeStatus {
    type Err = InvalidStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(NodeStatus::Online),
            "offline" => Ok(NodeStatus::Offline),
            "error" => Ok(NodeStatus::Error),
            other => Err(InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::sites)]
pub struct Site {
    pub id: i64,
    pub name: String,
    pub location: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::sites)]
pub struct NewSite {
    pub name: String,
    pub location: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::gateways)]
#[diesel(belongs_to(Site))]
pub struct Gateway {
    pub id: i64,
    pub gateway_code: String,
    pub name: String,
    pub site_id: i64,
    pub status: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub max_nodes: i32,
    pub topic_prefix: Option<String>,
    pub firmware_version: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Gateway {
    pub fn status(&self) -> Result<GatewayStatus, InvalidStatus> {
        self.status.parse()
    }

    /// Topic prefix used to address this gateway, falling back to
    /// `<namespace>/gateway/<code>` when none was configured.
    pub fn topic_prefix_or(&self, namespace: &str) -> String {
        match self.topic_prefix.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => p.trim_end_matches('/').to_string(),
            _ => format!("{}/gateway/{}", namespace, self.gateway_code),
        }
    }
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::gateways)]
pub struct NewGateway {
    pub gateway_code: String,
    pub name: String,
    pub site_id: i64,
    pub max_nodes: i32,
    pub topic_prefix: Option<String>,
    pub firmware_version: Option<String>,
}

impl NewGateway {
    pub fn new(gateway_code: impl Into<String>, name: impl Into<String>, site_id: i64) -> Self {
        NewGateway {
            gateway_code: gateway_code.into(),
            name: name.into(),
            site_id,
            max_nodes: DEFAULT_MAX_NODES,
            topic_prefix: None,
            firmware_version: None,
        }
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::nodes)]
#[diesel(belongs_to(Gateway))]
pub struct Node {
    pub id: i64,
    pub node_id: i32,
    pub name: String,
    pub gateway_id: i64,
    pub status: String,
    pub adc_config: Option<serde_json::Value>,
    pub sensor_conversions: Option<serde_json::Value>,
    pub bluetooth_enabled: bool,
    pub bluetooth_mac: Option<String>,
    pub scanner_model: Option<String>,
    pub last_qr_code: Option<String>,
    pub rssi: Option<i32>,
    pub battery_level: Option<f64>,
    pub last_seen: Option<DateTime<Utc>>,
    pub firmware_version: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    pub fn status(&self) -> Result<NodeStatus, InvalidStatus> {
        self.status.parse()
    }

    /// Typed view of the stored acquisition config. `None` when never configured.
    pub fn adc_config(&self) -> Result<Option<AdcConfig>, serde_json::Error> {
        self.adc_config.clone().map(serde_json::from_value).transpose()
    }

    /// Typed view of the per-channel conversion formulas, keyed by channel name.
    pub fn sensor_conversions(&self) -> Result<BTreeMap<String, SensorConversion>, serde_json::Error> {
        match self.sensor_conversions.clone() {
            Some(v) => serde_json::from_value(v),
            None => Ok(BTreeMap::new()),
        }
    }
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::nodes)]
pub struct NewNode {
    pub node_id: i32,
    pub name: String,
    pub gateway_id: i64,
    pub adc_config: Option<serde_json::Value>,
    pub sensor_conversions: Option<serde_json::Value>,
    pub bluetooth_enabled: bool,
    pub bluetooth_mac: Option<String>,
    pub scanner_model: Option<String>,
    pub firmware_version: Option<String>,
}

impl NewNode {
    pub fn new(gateway_id: i64, node_id: i32, name: impl Into<String>) -> Self {
        NewNode {
            node_id,
            name: name.into(),
            gateway_id,
            adc_config: None,
            sensor_conversions: None,
            bluetooth_enabled: false,
            bluetooth_mac: None,
            scanner_model: None,
            firmware_version: None,
        }
    }
}

/// Channel-to-ADC acquisition settings pushed to a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdcConfig {
    pub adc_type: Option<String>,
    pub sample_rate: Option<u32>,
    pub enabled_channels: Vec<u8>,
    pub conversion_enabled: bool,
    /// Acquisition period per ADC, in milliseconds.
    pub periods: BTreeMap<String, u32>,
    /// Firmware keys without a typed field, passed through unchanged.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConversion {
    pub formula: String,
    #[serde(default)]
    pub unit: Option<String>,
}

// Immutable once written; removed only by retention.
#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::sensor_readings)]
#[diesel(belongs_to(Node))]
pub struct SensorReading {
    pub id: i64,
    pub node_id: i64,
    pub timestamp: DateTime<Utc>,
    pub adc_type: String,
    pub channel: i32,
    pub raw_value: Option<i32>,
    pub converted_value: Option<f64>,
    pub unit: Option<String>,
    pub qr_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::sensor_readings)]
pub struct NewSensorReading {
    pub node_id: i64,
    pub timestamp: DateTime<Utc>,
    pub adc_type: String,
    pub channel: i32,
    pub raw_value: Option<i32>,
    pub converted_value: Option<f64>,
    pub unit: Option<String>,
    pub qr_code: Option<String>,
}

/// Liveness fields written for a gateway by the ingestion path.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayLiveness {
    pub status: GatewayStatus,
    pub last_seen: DateTime<Utc>,
}

/// Liveness fields written for a node. `None` leaves the stored value as is.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeLiveness {
    pub status: NodeStatus,
    pub last_seen: DateTime<Utc>,
    pub rssi: Option<i32>,
    pub battery_level: Option<f64>,
    pub last_qr_code: Option<String>,
}
