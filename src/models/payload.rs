//! Inbound gateway payloads.
//!
//! A fixed set of known fields plus explicitly typed nested maps, so a payload
//! of the wrong shape fails here with a JSON path instead of leaking nulls into
//! the inventory. Unknown extra fields are ignored.

use crate::db::models::GatewayStatus;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct PayloadError {
    /// JSON path of the offending value (`.` for the document root).
    pub path: String,
    pub message: String,
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at {}: {}", self.path, self.message)
    }
}

impl std::error::Error for PayloadError {}

/// Parses raw bytes into a JSON document.
pub fn parse_document(bytes: &[u8]) -> Result<Value, PayloadError> {
    serde_json::from_slice(bytes).map_err(|e| PayloadError {
        path: ".".to_string(),
        message: e.to_string(),
    })
}

/// Decodes a typed payload out of an already parsed document.
pub fn decode<T: DeserializeOwned>(doc: &Value) -> Result<T, PayloadError> {
    serde_path_to_error::deserialize(doc).map_err(|e| {
        let path = e.path().to_string();
        PayloadError {
            path,
            message: e.into_inner().to_string(),
        }
    })
}

/// Channel number taken from a map key such as `"ch0"` or `"0"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelKey(pub i32);

impl TryFrom<String> for ChannelKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let digits = value.strip_prefix("ch").unwrap_or(&value);
        match digits.parse::<i32>() {
            Ok(n) if n >= 0 && !digits.starts_with('+') => Ok(ChannelKey(n)),
            _ => Err(format!("invalid channel key {:?}, expected \"chN\" or \"N\"", value)),
        }
    }
}

impl From<ChannelKey> for String {
    fn from(value: ChannelKey) -> Self {
        format!("ch{}", value.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSample {
    #[serde(default)]
    pub raw: Option<i32>,
    #[serde(default, alias = "converted")]
    pub value: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
}

/// adc_type -> channel -> sample
pub type SensorMap = BTreeMap<String, BTreeMap<ChannelKey, ChannelSample>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub node_id: i32,
    #[serde(default)]
    pub rssi: Option<i32>,
    #[serde(default, alias = "battery_level")]
    pub battery: Option<f64>,
    #[serde(default, alias = "qr")]
    pub qr_code: Option<String>,
    #[serde(default)]
    pub sensors: SensorMap,
}

impl NodeReport {
    /// QR tag with surrounding whitespace removed; empty tags count as absent.
    pub fn qr_tag(&self) -> Option<&str> {
        self.qr_code.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn sample_count(&self) -> usize {
        self.sensors.values().map(BTreeMap::len).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPayload {
    #[serde(default)]
    pub nodes: Vec<NodeReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    #[serde(default)]
    pub status: Option<GatewayStatus>,
}

impl StatusPayload {
    pub fn declared_status(&self) -> GatewayStatus {
        self.status.unwrap_or(GatewayStatus::Online)
    }
}
