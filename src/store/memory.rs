//! In-memory [`Store`] used by the unit tests.
//!
//! Mirrors the schema constraints the Postgres store relies on: unique gateway
//! codes, unique `(gateway_id, node_id)`, foreign keys and the cascade from
//! sites down to readings. A transaction works on a copy of the state that only
//! replaces the original when the closure succeeds.

use super::{ReadingQuery, RetentionLimits, RetentionReport, Store, StoreError, StoreTx};
use crate::db::models::{
    Gateway, GatewayLiveness, GatewayStatus, NewGateway, NewNode, NewSensorReading, NewSite, Node, NodeLiveness,
    NodeStatus, SensorReading, Site,
};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub sites: Vec<Site>,
    pub gateways: Vec<Gateway>,
    pub nodes: Vec<Node>,
    pub readings: Vec<SensorReading>,
    next_id: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_appends: AtomicBool,
    row_locks: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MemoryState {
        self.state.lock().expect("memory store poisoned").clone()
    }

    /// Makes every subsequent `append_readings` fail, to exercise rollback.
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Number of locking lookups made so far across all transactions.
    pub fn row_locks(&self) -> usize {
        self.row_locks.load(Ordering::SeqCst)
    }

    /// Inserts a reading with an explicit timestamp, bypassing ingestion.
    pub fn insert_reading(&self, row: NewSensorReading) -> SensorReading {
        let mut state = self.state.lock().expect("memory store poisoned");
        let id = state.next_id();
        let reading = SensorReading {
            id,
            node_id: row.node_id,
            timestamp: row.timestamp,
            adc_type: row.adc_type,
            channel: row.channel,
            raw_value: row.raw_value,
            converted_value: row.converted_value,
            unit: row.unit,
            qr_code: row.qr_code,
        };
        state.readings.push(reading.clone());
        reading
    }
}

impl Store for MemoryStore {
    fn transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<T, StoreError>,
    {
        let mut guard = self.state.lock().expect("memory store poisoned");
        let mut tx = MemoryTx {
            state: guard.clone(),
            fail_appends: self.fail_appends.load(Ordering::SeqCst),
            row_locks: 0,
        };
        let out = f(&mut tx);
        self.row_locks.fetch_add(tx.row_locks, Ordering::SeqCst);
        let out = out?;
        *guard = tx.state;
        Ok(out)
    }

    fn query_readings(&self, query: &ReadingQuery) -> Result<Vec<SensorReading>, StoreError> {
        let state = self.state.lock().expect("memory store poisoned");
        let gateway_of = |node_pk: i64| state.nodes.iter().find(|n| n.id == node_pk).map(|n| n.gateway_id);
        let site_of = |gateway_pk: i64| state.gateways.iter().find(|g| g.id == gateway_pk).map(|g| g.site_id);

        let mut rows = state
            .readings
            .iter()
            .filter(|r| query.matches_row(r))
            .filter(|r| query.gateway_id.is_none_or(|g| gateway_of(r.node_id) == Some(g)))
            .filter(|r| {
                query
                    .site_id
                    .is_none_or(|s| gateway_of(r.node_id).and_then(&site_of) == Some(s))
            })
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        rows.truncate(query.effective_limit() as usize);
        Ok(rows)
    }

    fn delete_readings_before(
        &self,
        cutoff: DateTime<Utc>,
        limits: &RetentionLimits,
    ) -> Result<RetentionReport, StoreError> {
        super::delete_in_batches(cutoff, limits, |batch_size| {
            let mut state = self.state.lock().expect("memory store poisoned");
            let mut budget = batch_size.max(0) as usize;
            let before = state.readings.len();
            state.readings.retain(|r| {
                if budget > 0 && r.timestamp < cutoff {
                    budget -= 1;
                    false
                } else {
                    true
                }
            });
            Ok(before - state.readings.len())
        })
    }
}

struct MemoryTx {
    state: MemoryState,
    fail_appends: bool,
    row_locks: usize,
}

impl MemoryTx {
    fn node_slot(&mut self, gateway_id: i64, node_id: i32, except: Option<i64>) -> bool {
        self.state
            .nodes
            .iter()
            .any(|n| n.gateway_id == gateway_id && n.node_id == node_id && Some(n.id) != except)
    }
}

impl StoreTx for MemoryTx {
    fn find_gateway_by_code(&mut self, code: &str) -> Result<Option<Gateway>, StoreError> {
        self.row_locks += 1;
        self.lookup_gateway_by_code(code)
    }

    fn lookup_gateway_by_code(&mut self, code: &str) -> Result<Option<Gateway>, StoreError> {
        Ok(self.state.gateways.iter().find(|g| g.gateway_code == code).cloned())
    }

    fn find_gateway(&mut self, id: i64) -> Result<Option<Gateway>, StoreError> {
        Ok(self.state.gateways.iter().find(|g| g.id == id).cloned())
    }

    fn find_node(&mut self, gateway_id: i64, node_id: i32) -> Result<Option<Node>, StoreError> {
        self.row_locks += 1;
        Ok(self
            .state
            .nodes
            .iter()
            .find(|n| n.gateway_id == gateway_id && n.node_id == node_id)
            .cloned())
    }

    fn find_node_by_pk(&mut self, id: i64) -> Result<Option<Node>, StoreError> {
        Ok(self.state.nodes.iter().find(|n| n.id == id).cloned())
    }

    fn list_gateways(&mut self) -> Result<Vec<Gateway>, StoreError> {
        let mut all = self.state.gateways.clone();
        all.sort_by(|a, b| a.gateway_code.cmp(&b.gateway_code));
        Ok(all)
    }

    fn list_nodes(&mut self, gateway_id: i64) -> Result<Vec<Node>, StoreError> {
        let mut nodes = self
            .state
            .nodes
            .iter()
            .filter(|n| n.gateway_id == gateway_id)
            .cloned()
            .collect::<Vec<_>>();
        nodes.sort_by_key(|n| n.node_id);
        Ok(nodes)
    }

    fn touch_gateway(&mut self, id: i64, liveness: &GatewayLiveness) -> Result<(), StoreError> {
        let gateway = self
            .state
            .gateways
            .iter_mut()
            .find(|g| g.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("gateway {}", id)))?;
        gateway.status = liveness.status.as_str().to_string();
        gateway.last_seen = Some(liveness.last_seen);
        gateway.updated_at = Utc::now();
        Ok(())
    }

    fn touch_node(&mut self, id: i64, liveness: &NodeLiveness) -> Result<(), StoreError> {
        let node = self
            .state
            .nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("node {}", id)))?;
        node.status = liveness.status.as_str().to_string();
        node.last_seen = Some(liveness.last_seen);
        if let Some(rssi) = liveness.rssi {
            node.rssi = Some(rssi);
        }
        if let Some(battery) = liveness.battery_level {
            node.battery_level = Some(battery);
        }
        if let Some(qr) = liveness.last_qr_code.as_ref() {
            node.last_qr_code = Some(qr.clone());
        }
        node.updated_at = Utc::now();
        Ok(())
    }

    fn demote_stale_gateways(&mut self, cutoff: DateTime<Utc>) -> Result<Vec<Gateway>, StoreError> {
        let mut demoted = Vec::new();
        for g in self.state.gateways.iter_mut() {
            if g.status == GatewayStatus::Online.as_str() && g.last_seen.is_none_or(|seen| seen < cutoff) {
                g.status = GatewayStatus::Offline.as_str().to_string();
                g.updated_at = Utc::now();
                demoted.push(g.clone());
            }
        }
        Ok(demoted)
    }

    fn demote_stale_nodes(&mut self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut count = 0;
        for n in self.state.nodes.iter_mut() {
            if n.status == NodeStatus::Online.as_str() && n.last_seen.is_none_or(|seen| seen < cutoff) {
                n.status = NodeStatus::Offline.as_str().to_string();
                n.updated_at = Utc::now();
                count += 1;
            }
        }
        Ok(count)
    }

    fn append_readings(&mut self, rows: &[NewSensorReading]) -> Result<usize, StoreError> {
        if self.fail_appends {
            return Err(StoreError::Timeout("injected append failure".to_string()));
        }
        for row in rows {
            if !self.state.nodes.iter().any(|n| n.id == row.node_id) {
                return Err(StoreError::NotFound(format!("node {}", row.node_id)));
            }
            let id = self.state.next_id();
            self.state.readings.push(SensorReading {
                id,
                node_id: row.node_id,
                timestamp: row.timestamp,
                adc_type: row.adc_type.clone(),
                channel: row.channel,
                raw_value: row.raw_value,
                converted_value: row.converted_value,
                unit: row.unit.clone(),
                qr_code: row.qr_code.clone(),
            });
        }
        Ok(rows.len())
    }

    fn create_site(&mut self, site: &NewSite) -> Result<Site, StoreError> {
        let now = Utc::now();
        let row = Site {
            id: self.state.next_id(),
            name: site.name.clone(),
            location: site.location.clone(),
            description: site.description.clone(),
            created_at: now,
            updated_at: now,
        };
        self.state.sites.push(row.clone());
        Ok(row)
    }

    fn create_gateway(&mut self, gateway: &NewGateway) -> Result<Gateway, StoreError> {
        if !self.state.sites.iter().any(|s| s.id == gateway.site_id) {
            return Err(StoreError::NotFound(format!("site {}", gateway.site_id)));
        }
        if self.state.gateways.iter().any(|g| g.gateway_code == gateway.gateway_code) {
            return Err(StoreError::Conflict(format!("gateway code {}", gateway.gateway_code)));
        }
        let now = Utc::now();
        let row = Gateway {
            id: self.state.next_id(),
            gateway_code: gateway.gateway_code.clone(),
            name: gateway.name.clone(),
            site_id: gateway.site_id,
            status: GatewayStatus::Offline.as_str().to_string(),
            last_seen: None,
            max_nodes: gateway.max_nodes,
            topic_prefix: gateway.topic_prefix.clone(),
            firmware_version: gateway.firmware_version.clone(),
            created_at: now,
            updated_at: now,
        };
        self.state.gateways.push(row.clone());
        Ok(row)
    }

    fn create_node(&mut self, node: &NewNode) -> Result<Node, StoreError> {
        if !self.state.gateways.iter().any(|g| g.id == node.gateway_id) {
            return Err(StoreError::NotFound(format!("gateway {}", node.gateway_id)));
        }
        if self.node_slot(node.gateway_id, node.node_id, None) {
            return Err(StoreError::Conflict(format!(
                "node {} already exists on gateway {}",
                node.node_id, node.gateway_id
            )));
        }
        let now = Utc::now();
        let row = Node {
            id: self.state.next_id(),
            node_id: node.node_id,
            name: node.name.clone(),
            gateway_id: node.gateway_id,
            status: NodeStatus::Offline.as_str().to_string(),
            adc_config: node.adc_config.clone(),
            sensor_conversions: node.sensor_conversions.clone(),
            bluetooth_enabled: node.bluetooth_enabled,
            bluetooth_mac: node.bluetooth_mac.clone(),
            scanner_model: node.scanner_model.clone(),
            last_qr_code: None,
            rssi: None,
            battery_level: None,
            last_seen: None,
            firmware_version: node.firmware_version.clone(),
            created_at: now,
            updated_at: now,
        };
        self.state.nodes.push(row.clone());
        Ok(row)
    }

    fn reassign_node(&mut self, id: i64, gateway_id: i64) -> Result<Node, StoreError> {
        if !self.state.gateways.iter().any(|g| g.id == gateway_id) {
            return Err(StoreError::NotFound(format!("gateway {}", gateway_id)));
        }
        let node_id = self
            .state
            .nodes
            .iter()
            .find(|n| n.id == id)
            .map(|n| n.node_id)
            .ok_or_else(|| StoreError::NotFound(format!("node {}", id)))?;
        if self.node_slot(gateway_id, node_id, Some(id)) {
            return Err(StoreError::Conflict(format!(
                "node {} already exists on gateway {}",
                node_id, gateway_id
            )));
        }
        let node = self
            .state
            .nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("node {}", id)))?;
        node.gateway_id = gateway_id;
        node.updated_at = Utc::now();
        Ok(node.clone())
    }

    fn delete_site(&mut self, id: i64) -> Result<bool, StoreError> {
        let before = self.state.sites.len();
        self.state.sites.retain(|s| s.id != id);
        if self.state.sites.len() == before {
            return Ok(false);
        }
        let gateways = self
            .state
            .gateways
            .iter()
            .filter(|g| g.site_id == id)
            .map(|g| g.id)
            .collect::<Vec<_>>();
        self.state.gateways.retain(|g| g.site_id != id);
        let nodes = self
            .state
            .nodes
            .iter()
            .filter(|n| gateways.contains(&n.gateway_id))
            .map(|n| n.id)
            .collect::<Vec<_>>();
        self.state.nodes.retain(|n| !gateways.contains(&n.gateway_id));
        self.state.readings.retain(|r| !nodes.contains(&r.node_id));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn seed(store: &MemoryStore) -> (Site, Gateway, Gateway) {
        store
            .transaction(|tx| {
                let site = tx.create_site(&NewSite {
                    name: "Plant".into(),
                    location: None,
                    description: None,
                })?;
                let a = tx.create_gateway(&NewGateway::new("GW-A", "A", site.id))?;
                let b = tx.create_gateway(&NewGateway::new("GW-B", "B", site.id))?;
                Ok((site, a, b))
            })
            .expect("seed")
    }

    fn reading(node_id: i64, ts: DateTime<Utc>, channel: i32) -> NewSensorReading {
        NewSensorReading {
            node_id,
            timestamp: ts,
            adc_type: "ADS7128".into(),
            channel,
            raw_value: Some(100),
            converted_value: Some(1.0),
            unit: Some("V".into()),
            qr_code: None,
        }
    }

    #[test]
    fn duplicate_node_number_on_same_gateway_is_rejected() {
        let store = MemoryStore::new();
        let (_, a, b) = seed(&store);

        store
            .transaction(|tx| tx.create_node(&NewNode::new(a.id, 3, "N3")))
            .expect("first insert");
        let err = store
            .transaction(|tx| tx.create_node(&NewNode::new(a.id, 3, "N3 again")))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Same number on another gateway is fine.
        store
            .transaction(|tx| tx.create_node(&NewNode::new(b.id, 3, "N3 on B")))
            .expect("other gateway");
    }

    #[test]
    fn reassigning_into_an_occupied_slot_fails() {
        let store = MemoryStore::new();
        let (_, a, b) = seed(&store);
        let moving = store
            .transaction(|tx| {
                tx.create_node(&NewNode::new(b.id, 5, "occupant"))?;
                tx.create_node(&NewNode::new(a.id, 5, "mover"))
            })
            .expect("nodes");

        let err = store.transaction(|tx| tx.reassign_node(moving.id, b.id)).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let snapshot = store.snapshot();
        let unchanged = snapshot.nodes.iter().find(|n| n.id == moving.id).expect("node");
        assert_eq!(unchanged.gateway_id, a.id);
    }

    #[test]
    fn deleting_a_site_cascades_to_readings() {
        let store = MemoryStore::new();
        let (site, a, _) = seed(&store);
        let node = store
            .transaction(|tx| tx.create_node(&NewNode::new(a.id, 1, "N1")))
            .expect("node");
        store.insert_reading(reading(node.id, Utc::now(), 0));

        assert!(store.transaction(|tx| tx.delete_site(site.id)).expect("delete"));
        let snapshot = store.snapshot();
        assert!(snapshot.gateways.is_empty());
        assert!(snapshot.nodes.is_empty());
        assert!(snapshot.readings.is_empty());
    }

    #[test]
    fn failed_transaction_leaves_state_untouched() {
        let store = MemoryStore::new();
        let (_, a, _) = seed(&store);

        let result: Result<(), StoreError> = store.transaction(|tx| {
            tx.touch_gateway(
                a.id,
                &GatewayLiveness {
                    status: GatewayStatus::Online,
                    last_seen: Utc::now(),
                },
            )?;
            Err(StoreError::Query("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.snapshot().gateways[0].status, "offline");
    }

    #[test]
    fn range_query_orders_filters_and_limits() {
        let store = MemoryStore::new();
        let (_, a, _) = seed(&store);
        let node = store
            .transaction(|tx| tx.create_node(&NewNode::new(a.id, 1, "N1")))
            .expect("node");
        let t0 = Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap();
        for i in 0..6 {
            store.insert_reading(reading(node.id, t0 + Duration::minutes(i), (i % 2) as i32));
        }

        let all = store.query_readings(&ReadingQuery::default()).expect("query");
        assert_eq!(all.len(), 6);
        assert!(all.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));

        let odd = store
            .query_readings(&ReadingQuery {
                channel: Some(1),
                ..Default::default()
            })
            .expect("query");
        assert_eq!(odd.len(), 3);
        assert!(odd.iter().all(|r| r.channel == 1));

        let limited = store
            .query_readings(&ReadingQuery {
                limit: Some(2),
                gateway_id: Some(a.id),
                ..Default::default()
            })
            .expect("query");
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].timestamp, t0 + Duration::minutes(5));
    }

    #[test]
    fn retention_removes_exactly_rows_before_cutoff() {
        let store = MemoryStore::new();
        let (_, a, _) = seed(&store);
        let node = store
            .transaction(|tx| tx.create_node(&NewNode::new(a.id, 1, "N1")))
            .expect("node");
        let cutoff = Utc.with_ymd_and_hms(2025, 5, 8, 0, 0, 0).unwrap();
        store.insert_reading(reading(node.id, cutoff - Duration::days(2), 0));
        store.insert_reading(reading(node.id, cutoff - Duration::seconds(1), 0));
        store.insert_reading(reading(node.id, cutoff, 0));
        store.insert_reading(reading(node.id, cutoff + Duration::hours(1), 0));

        let report = store
            .delete_readings_before(cutoff, &RetentionLimits::default())
            .expect("retention");
        assert_eq!(report.deleted, 2);
        assert!(report.complete);

        let left = store.snapshot().readings;
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|r| r.timestamp >= cutoff));
    }
}
