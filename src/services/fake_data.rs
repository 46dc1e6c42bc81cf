//! Synthetic gateway traffic for every gateway and node in the inventory,
//! pushed through the same reconciler path as real messages.

use crate::db::models::{Gateway, Node};
use crate::services::ingest::Reconciler;
use crate::store::Store;
use log::{info, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};
use std::f64::consts::PI;

pub const DEFAULT_SEED: u64 = 0x0420_1337_DEAD_BEEF;

const DEFAULT_ADC: &str = "ADS7128";
const DEFAULT_CHANNELS: [u8; 4] = [0, 1, 2, 3];
const ADC_FULL_SCALE: f64 = 4095.0;
const RANGE_C: f64 = 50.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulationReport {
    pub gateways: usize,
    pub messages: usize,
}

pub fn run<S: Store>(
    reconciler: &Reconciler<S>,
    namespace: &str,
    rounds: u32,
    seed: u64,
) -> Result<SimulationReport, String> {
    let inventory = reconciler
        .store()
        .transaction(|tx| {
            let mut inventory = Vec::new();
            for gateway in tx.list_gateways()? {
                let nodes = tx.list_nodes(gateway.id)?;
                inventory.push((gateway, nodes));
            }
            Ok(inventory)
        })
        .map_err(|e| format!("loading inventory failed: {}", e))?;
    if inventory.is_empty() {
        return Err("inventory has no gateways; nothing to simulate".to_string());
    }

    let node_count = inventory.iter().map(|(_, nodes)| nodes.len()).sum::<usize>();
    info!(
        "Simulate: {} round(s) over {} gateway(s), {} node(s), seed={:#x}",
        rounds,
        inventory.len(),
        node_count,
        seed
    );

    let mut rng = SmallRng::seed_from_u64(seed);
    let mut report = SimulationReport {
        gateways: inventory.len(),
        messages: 0,
    };

    for (gateway, _) in &inventory {
        reconciler.on_message(&topic_for(namespace, gateway, "status"), br#"{"status":"online"}"#);
        report.messages += 1;
    }
    for round in 0..rounds {
        for (gateway, nodes) in &inventory {
            let body = data_payload(nodes, round, &mut rng);
            reconciler.on_message(&topic_for(namespace, gateway, "data"), body.to_string().as_bytes());
            report.messages += 1;
        }
    }

    info!("Simulate: complete ({})", reconciler.stats().snapshot());
    Ok(report)
}

fn topic_for(namespace: &str, gateway: &Gateway, kind: &str) -> String {
    format!("{}/gateway/{}/{}", namespace, gateway.gateway_code, kind)
}

/// One `data` message covering every node of a gateway.
pub fn data_payload(nodes: &[Node], round: u32, rng: &mut SmallRng) -> Value {
    let reports = nodes
        .iter()
        .map(|node| {
            let (adc_type, channels) = acquisition_for(node);
            let units = node.sensor_conversions().unwrap_or_default();

            let mut samples = Map::new();
            for channel in channels {
                let key = format!("ch{}", channel);
                let value = simulated_temperature(node.node_id, channel, round, rng);
                let unit = units.get(&key).and_then(|c| c.unit.clone()).unwrap_or_else(|| "C".to_string());
                samples.insert(
                    key,
                    json!({
                        "raw": ((value / RANGE_C) * ADC_FULL_SCALE).round().clamp(0.0, ADC_FULL_SCALE) as i32,
                        "value": (value * 10.0).round() / 10.0,
                        "unit": unit,
                    }),
                );
            }

            let mut sensors = Map::new();
            sensors.insert(adc_type, Value::Object(samples));

            let battery = (100.0 - f64::from(round) * 0.05 - rng.random_range(0.0..=1.5)).clamp(5.0, 100.0);
            json!({
                "node_id": node.node_id,
                "rssi": rng.random_range(-90..=-40),
                "battery": (battery * 10.0).round() / 10.0,
                "sensors": sensors,
            })
        })
        .collect::<Vec<_>>();

    json!({ "nodes": reports })
}

fn acquisition_for(node: &Node) -> (String, Vec<u8>) {
    let config = match node.adc_config() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            warn!("Simulate: node {} has unreadable adc_config ({}), using defaults", node.id, e);
            Default::default()
        }
    };
    let adc_type = config.adc_type.unwrap_or_else(|| DEFAULT_ADC.to_string());
    let channels = if config.enabled_channels.is_empty() {
        DEFAULT_CHANNELS.to_vec()
    } else {
        config.enabled_channels
    };
    (adc_type, channels)
}

fn simulated_temperature(node_id: i32, channel: u8, round: u32, rng: &mut SmallRng) -> f64 {
    let phase = f64::from(node_id) * 0.7 + f64::from(channel) * 0.3;
    let cycle = ((f64::from(round) / 96.0) * 2.0 * PI + phase).sin() * 3.5;
    let noise = rng.random_range(-0.4..=0.4);
    let spike = if rng.random_bool(0.01) { rng.random_range(4.0..=8.0) } else { 0.0 };
    (21.0 + f64::from(channel) * 1.5 + cycle + noise + spike).clamp(0.0, RANGE_C)
}
