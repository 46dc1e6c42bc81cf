//! Inventory store and telemetry writer.
//!
//! Everything the ingestion path touches for one message runs inside a single
//! [`Store::transaction`]: committed when the closure returns `Ok`, rolled back
//! otherwise. Lookups made by the reconciler lock the rows they return, so two
//! messages for the same gateway or node serialize while disjoint ones proceed.

pub mod pg;

#[cfg(test)]
pub mod memory;

use crate::db::models::{
    Gateway, GatewayLiveness, NewGateway, NewNode, NewSensorReading, NewSite, Node, NodeLiveness, SensorReading, Site,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use core::fmt;
use log::{debug, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

pub const DEFAULT_QUERY_LIMIT: i64 = 1000;
pub const DEFAULT_RETENTION_DAYS: u32 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No connection could be obtained in time.
    Connection(String),
    /// A statement exceeded its time budget and was cancelled.
    Timeout(String),
    /// A uniqueness constraint rejected the write.
    Conflict(String),
    /// A referenced row does not exist.
    NotFound(String),
    Query(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Connection(e) => write!(f, "connection unavailable: {}", e),
            StoreError::Timeout(e) => write!(f, "statement timed out: {}", e),
            StoreError::Conflict(e) => write!(f, "conflict: {}", e),
            StoreError::NotFound(e) => write!(f, "not found: {}", e),
            StoreError::Query(e) => write!(f, "query failed: {}", e),
        }
    }
}

impl Error for StoreError {}

impl From<diesel::result::Error> for StoreError {
    fn from(value: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error as DieselError};

        match value {
            DieselError::NotFound => StoreError::NotFound("record not found".to_string()),
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                StoreError::Conflict(info.message().to_string())
            }
            DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, info) => {
                StoreError::NotFound(info.message().to_string())
            }
            DieselError::DatabaseError(_, info) if info.message().contains("statement timeout") => {
                StoreError::Timeout(info.message().to_string())
            }
            other => StoreError::Query(other.to_string()),
        }
    }
}

/// Filters for a telemetry range query. Every `None` means "no constraint".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingQuery {
    pub node_id: Option<i64>,
    pub gateway_id: Option<i64>,
    pub site_id: Option<i64>,
    pub adc_type: Option<String>,
    pub channel: Option<i32>,
    /// Inclusive lower bound.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound.
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl ReadingQuery {
    pub fn effective_limit(&self) -> i64 {
        self.limit.filter(|l| *l > 0).unwrap_or(DEFAULT_QUERY_LIMIT)
    }

    /// Checks the filters that only involve the reading row itself
    /// (gateway and site filters need the inventory).
    pub fn matches_row(&self, r: &SensorReading) -> bool {
        self.node_id.is_none_or(|n| r.node_id == n)
            && self.adc_type.as_deref().is_none_or(|a| r.adc_type == a)
            && self.channel.is_none_or(|c| r.channel == c)
            && self.from.is_none_or(|f| r.timestamp >= f)
            && self.to.is_none_or(|t| r.timestamp <= t)
    }
}

/// Bounds for one retention run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionLimits {
    /// Rows removed per statement; each batch commits on its own.
    pub batch_size: i64,
    /// Wall-clock budget; the run stops between batches once exceeded.
    pub max_duration: Duration,
}

impl Default for RetentionLimits {
    fn default() -> Self {
        RetentionLimits {
            batch_size: 10_000,
            max_duration: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionReport {
    pub cutoff: DateTime<Utc>,
    /// Exact number of rows removed by this run.
    pub deleted: usize,
    pub batches: usize,
    /// False when the time budget ran out before every eligible row was gone.
    pub complete: bool,
}

pub fn retention_cutoff(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    now - ChronoDuration::days(i64::from(days))
}

/// Drives one retention run. `delete_batch(n)` removes at most `n` rows older
/// than `cutoff` and returns how many it removed. Batches run until one comes
/// back short or `limits.max_duration` has elapsed between batches.
pub fn delete_in_batches<F>(
    cutoff: DateTime<Utc>,
    limits: &RetentionLimits,
    mut delete_batch: F,
) -> Result<RetentionReport, StoreError>
where
    F: FnMut(i64) -> Result<usize, StoreError>,
{
    let started = Instant::now();
    let batch_size = limits.batch_size.max(1);
    let mut report = RetentionReport {
        cutoff,
        deleted: 0,
        batches: 0,
        complete: false,
    };

    while started.elapsed() < limits.max_duration {
        let removed = match delete_batch(batch_size) {
            Ok(n) => n,
            Err(e) => {
                warn!(
                    "Retention: batch {} failed after deleting {} row(s): {}",
                    report.batches + 1,
                    report.deleted,
                    e
                );
                return Err(e);
            }
        };

        report.deleted += removed;
        report.batches += 1;
        debug!("Retention: batch {} removed {} row(s)", report.batches, removed);

        if (removed as i64) < batch_size {
            report.complete = true;
            break;
        }
    }

    Ok(report)
}

/// Operations available inside one transaction.
pub trait StoreTx {
    /// Looks up a gateway by its externally visible code and locks the row.
    fn find_gateway_by_code(&mut self, code: &str) -> Result<Option<Gateway>, StoreError>;
    /// Like [`StoreTx::find_gateway_by_code`] but takes no row lock.
    fn lookup_gateway_by_code(&mut self, code: &str) -> Result<Option<Gateway>, StoreError>;
    fn find_gateway(&mut self, id: i64) -> Result<Option<Gateway>, StoreError>;
    /// Looks up a node by its per-gateway number and locks the row.
    fn find_node(&mut self, gateway_id: i64, node_id: i32) -> Result<Option<Node>, StoreError>;
    fn find_node_by_pk(&mut self, id: i64) -> Result<Option<Node>, StoreError>;
    fn list_gateways(&mut self) -> Result<Vec<Gateway>, StoreError>;
    fn list_nodes(&mut self, gateway_id: i64) -> Result<Vec<Node>, StoreError>;

    fn touch_gateway(&mut self, id: i64, liveness: &GatewayLiveness) -> Result<(), StoreError>;
    fn touch_node(&mut self, id: i64, liveness: &NodeLiveness) -> Result<(), StoreError>;
    /// Sets every `online` gateway not seen since `cutoff` to `offline`.
    fn demote_stale_gateways(&mut self, cutoff: DateTime<Utc>) -> Result<Vec<Gateway>, StoreError>;
    /// Sets every `online` node not seen since `cutoff` to `offline`.
    fn demote_stale_nodes(&mut self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    fn append_readings(&mut self, rows: &[NewSensorReading]) -> Result<usize, StoreError>;

    fn create_site(&mut self, site: &NewSite) -> Result<Site, StoreError>;
    fn create_gateway(&mut self, gateway: &NewGateway) -> Result<Gateway, StoreError>;
    /// Fails with [`StoreError::Conflict`] when the gateway already has that `node_id`.
    fn create_node(&mut self, node: &NewNode) -> Result<Node, StoreError>;
    /// Fails with [`StoreError::Conflict`] when the target gateway already has
    /// a node with the same `node_id`.
    fn reassign_node(&mut self, id: i64, gateway_id: i64) -> Result<Node, StoreError>;
    /// Removes the site and, through the schema cascade, everything it owns.
    fn delete_site(&mut self, id: i64) -> Result<bool, StoreError>;
}

pub trait Store: Send + Sync {
    fn transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<T, StoreError>;

    /// Readings matching `query`, most recent first, at most `query.effective_limit()`.
    fn query_readings(&self, query: &ReadingQuery) -> Result<Vec<SensorReading>, StoreError>;

    /// Deletes readings with `timestamp < cutoff` in bounded batches.
    fn delete_readings_before(
        &self,
        cutoff: DateTime<Utc>,
        limits: &RetentionLimits,
    ) -> Result<RetentionReport, StoreError>;
}
