//! Turns one inbound gateway message into inventory updates, telemetry rows
//! and realtime events.
//!
//! Every message is handled inside a single store transaction. Broadcasts are
//! emitted only after that transaction committed, so subscribers never see a
//! state change that was rolled back.

use crate::db::models::{GatewayLiveness, GatewayStatus, NewSensorReading, NodeLiveness, NodeStatus};
use crate::models::payload::{self, DataPayload, NodeReport, PayloadError, StatusPayload};
use crate::services::realtime::{Broadcaster, Scope, ALERT_NEW, GATEWAY_STATUS, SENSOR_DATA};
use crate::services::stats::IngestStats;
use crate::services::topic::{self, Intent, MessageKind, TopicError};
use crate::store::{Store, StoreError};
use chrono::{DateTime, SecondsFormat, Utc};
use core::fmt;
use log::{debug, info, warn};
use serde_json::{json, Map, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

#[derive(Debug)]
pub enum IngestError {
    MalformedTopic { topic: String, source: TopicError },
    PayloadDecode { topic: String, source: PayloadError },
    UnknownGateway { code: String },
    /// Reported per node entry; never fails the surrounding message.
    UnknownNode { gateway: String, node_id: i32 },
    Persistence(StoreError),
}

impl Display for IngestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::MalformedTopic { topic, source } => write!(f, "malformed topic {:?}: {}", topic, source),
            IngestError::PayloadDecode { topic, source } => write!(f, "undecodable payload on {}: {}", topic, source),
            IngestError::UnknownGateway { code } => write!(f, "unknown gateway {}", code),
            IngestError::UnknownNode { gateway, node_id } => {
                write!(f, "unknown node {} on gateway {}", node_id, gateway)
            }
            IngestError::Persistence(e) => write!(f, "persistence failed: {}", e),
        }
    }
}

impl Error for IngestError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            IngestError::MalformedTopic { source, .. } => Some(source),
            IngestError::PayloadDecode { source, .. } => Some(source),
            IngestError::Persistence(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for IngestError {
    fn from(value: StoreError) -> Self {
        IngestError::Persistence(value)
    }
}

/// Result of a successfully applied message.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub gateway_code: String,
    pub kind: MessageKind,
    pub readings_written: usize,
    pub nodes_updated: usize,
    /// Node numbers in the payload that the gateway does not own.
    pub unknown_nodes: Vec<i32>,
    /// Subscribers that accepted the resulting event.
    pub delivered: usize,
}

impl Outcome {
    fn new(gateway_code: &str, kind: MessageKind) -> Self {
        Outcome {
            gateway_code: gateway_code.to_string(),
            kind,
            readings_written: 0,
            nodes_updated: 0,
            unknown_nodes: Vec::new(),
            delivered: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiryReport {
    pub gateways: usize,
    pub nodes: usize,
}

pub struct Reconciler<S: Store> {
    store: Arc<S>,
    broadcaster: Arc<Broadcaster>,
    stats: Arc<IngestStats>,
}

impl<S: Store> Reconciler<S> {
    pub fn new(store: Arc<S>, broadcaster: Arc<Broadcaster>, stats: Arc<IngestStats>) -> Self {
        Reconciler {
            store,
            broadcaster,
            stats,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    /// Transport callback. Logs and counts every failure; never propagates.
    pub fn on_message(&self, topic: &str, bytes: &[u8]) {
        self.stats.add_received(1);
        match self.handle(topic, bytes) {
            Ok(outcome) => {
                self.stats.add_processed(1);
                self.stats.add_readings(outcome.readings_written as u64);
                self.stats.add_unknown_node(outcome.unknown_nodes.len() as u64);
                debug!(
                    "Ingest: {} {} -> {} reading(s), {} node(s), {} subscriber(s)",
                    outcome.gateway_code,
                    outcome.kind.as_str(),
                    outcome.readings_written,
                    outcome.nodes_updated,
                    outcome.delivered
                );
            }
            Err(e) => {
                match &e {
                    IngestError::MalformedTopic { .. } => self.stats.add_malformed_topic(1),
                    IngestError::PayloadDecode { .. } => self.stats.add_decode_error(1),
                    IngestError::UnknownGateway { .. } => self.stats.add_unknown_gateway(1),
                    IngestError::UnknownNode { .. } => self.stats.add_unknown_node(1),
                    IngestError::Persistence(_) => self.stats.add_persistence_failure(1),
                }
                warn!("Ingest: dropped message on {}: {}", topic, e);
            }
        }
    }

    /// Like [`Reconciler::on_message`] for a topic read off the wire as bytes.
    pub fn on_raw_message(&self, topic: &[u8], bytes: &[u8]) {
        match std::str::from_utf8(topic) {
            Ok(topic) => self.on_message(topic, bytes),
            Err(_) => {
                self.stats.add_received(1);
                self.stats.add_malformed_topic(1);
                let e = IngestError::MalformedTopic {
                    topic: String::from_utf8_lossy(topic).into_owned(),
                    source: TopicError::NotUtf8,
                };
                warn!("Ingest: dropped message: {}", e);
            }
        }
    }

    pub fn handle(&self, topic: &str, bytes: &[u8]) -> Result<Outcome, IngestError> {
        self.handle_at(topic, bytes, Utc::now())
    }

    /// Same as [`Reconciler::handle`] with an explicit ingestion time.
    pub fn handle_at(&self, topic: &str, bytes: &[u8], now: DateTime<Utc>) -> Result<Outcome, IngestError> {
        let intent = topic::parse(topic).map_err(|source| IngestError::MalformedTopic {
            topic: topic.to_string(),
            source,
        })?;
        let decode_err = |source| IngestError::PayloadDecode {
            topic: topic.to_string(),
            source,
        };
        let doc = payload::parse_document(bytes).map_err(decode_err)?;

        match intent.kind {
            MessageKind::Data => {
                let data: DataPayload = payload::decode(&doc).map_err(decode_err)?;
                self.apply_data(&intent, &doc, &data, now)
            }
            MessageKind::Status => {
                let status: StatusPayload = payload::decode(&doc).map_err(decode_err)?;
                self.apply_status(&intent, status.declared_status(), now)
            }
            MessageKind::Alert => self.relay_alert(&intent, doc, now),
        }
    }

    fn apply_data(
        &self,
        intent: &Intent,
        doc: &Value,
        data: &DataPayload,
        now: DateTime<Utc>,
    ) -> Result<Outcome, IngestError> {
        let code = intent.gateway_code.as_str();
        let applied = self.store.transaction(|tx| {
            let Some(gateway) = tx.find_gateway_by_code(code)? else {
                return Ok(None);
            };
            tx.touch_gateway(
                gateway.id,
                &GatewayLiveness {
                    status: GatewayStatus::Online,
                    last_seen: now,
                },
            )?;

            let mut outcome = Outcome::new(code, MessageKind::Data);
            let mut rows = Vec::new();
            for report in &data.nodes {
                let Some(node) = tx.find_node(gateway.id, report.node_id)? else {
                    outcome.unknown_nodes.push(report.node_id);
                    continue;
                };
                tx.touch_node(
                    node.id,
                    &NodeLiveness {
                        status: NodeStatus::Online,
                        last_seen: now,
                        rssi: report.rssi,
                        battery_level: report.battery,
                        last_qr_code: report.qr_tag().map(str::to_string),
                    },
                )?;
                outcome.nodes_updated += 1;
                rows.extend(readings_for(node.id, report, now));
            }
            outcome.readings_written = tx.append_readings(&rows)?;
            Ok(Some(outcome))
        })?;

        let mut outcome = applied.ok_or_else(|| IngestError::UnknownGateway { code: code.to_string() })?;
        for node_id in &outcome.unknown_nodes {
            warn!(
                "Ingest: {}",
                IngestError::UnknownNode {
                    gateway: code.to_string(),
                    node_id: *node_id,
                }
            );
        }

        let nodes = doc.get("nodes").cloned().unwrap_or_else(|| json!([]));
        outcome.delivered = self.broadcast(
            SENSOR_DATA,
            json!({
                "gateway_id": code,
                "timestamp": stamp(now),
                "nodes": nodes,
            }),
        );
        Ok(outcome)
    }

    fn apply_status(&self, intent: &Intent, status: GatewayStatus, now: DateTime<Utc>) -> Result<Outcome, IngestError> {
        let code = intent.gateway_code.as_str();
        let found = self.store.transaction(|tx| {
            let Some(gateway) = tx.find_gateway_by_code(code)? else {
                return Ok(false);
            };
            tx.touch_gateway(gateway.id, &GatewayLiveness { status, last_seen: now })?;
            Ok(true)
        })?;
        if !found {
            return Err(IngestError::UnknownGateway { code: code.to_string() });
        }

        let mut outcome = Outcome::new(code, MessageKind::Status);
        outcome.delivered = self.broadcast(
            GATEWAY_STATUS,
            json!({
                "gateway_id": code,
                "status": status.as_str(),
                "timestamp": stamp(now),
            }),
        );
        Ok(outcome)
    }

    fn relay_alert(&self, intent: &Intent, doc: Value, now: DateTime<Utc>) -> Result<Outcome, IngestError> {
        let code = intent.gateway_code.as_str();
        let known = self.store.transaction(|tx| tx.lookup_gateway_by_code(code))?.is_some();
        if !known {
            return Err(IngestError::UnknownGateway { code: code.to_string() });
        }

        let mut body = match doc {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other);
                map
            }
        };
        body.insert("gateway_id".to_string(), json!(code));
        body.insert("timestamp".to_string(), json!(stamp(now)));
        if let Some(path) = &intent.alert_path {
            body.insert("alert_path".to_string(), json!(path));
        }

        let mut outcome = Outcome::new(code, MessageKind::Alert);
        outcome.delivered = self.broadcast(ALERT_NEW, Value::Object(body));
        Ok(outcome)
    }

    /// Demotes `online` gateways and nodes not seen since `cutoff` to `offline`
    /// and announces every demoted gateway.
    pub fn expire_stale(&self, cutoff: DateTime<Utc>) -> Result<ExpiryReport, StoreError> {
        let (gateways, nodes) = self.store.transaction(|tx| {
            let gateways = tx.demote_stale_gateways(cutoff)?;
            let nodes = tx.demote_stale_nodes(cutoff)?;
            Ok((gateways, nodes))
        })?;

        let now = Utc::now();
        for gateway in &gateways {
            self.broadcast(
                GATEWAY_STATUS,
                json!({
                    "gateway_id": gateway.gateway_code,
                    "status": GatewayStatus::Offline.as_str(),
                    "timestamp": stamp(now),
                }),
            );
        }

        let report = ExpiryReport {
            gateways: gateways.len(),
            nodes,
        };
        info!(
            "Expire: demoted {} gateway(s) and {} node(s) not seen since {}",
            report.gateways, report.nodes, cutoff
        );
        Ok(report)
    }

    fn broadcast(&self, event: &str, payload: Value) -> usize {
        self.stats.add_broadcast(1);
        self.broadcaster.emit(event, payload, &Scope::All)
    }
}

fn readings_for(node_pk: i64, report: &NodeReport, now: DateTime<Utc>) -> Vec<NewSensorReading> {
    let qr_code = report.qr_tag().map(str::to_string);
    report
        .sensors
        .iter()
        .flat_map(|(adc_type, channels)| {
            channels.iter().map(|(channel, sample)| NewSensorReading {
                node_id: node_pk,
                timestamp: now,
                adc_type: adc_type.clone(),
                channel: channel.0,
                raw_value: sample.raw,
                converted_value: sample.value,
                unit: sample.unit.clone(),
                qr_code: qr_code.clone(),
            })
        })
        .collect()
}

fn stamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
