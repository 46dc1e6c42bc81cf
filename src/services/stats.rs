use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide ingestion counters, shared by every worker.
#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    processed: AtomicU64,
    malformed_topic: AtomicU64,
    decode_errors: AtomicU64,
    unknown_gateway: AtomicU64,
    unknown_node: AtomicU64,
    persistence_failures: AtomicU64,
    readings_written: AtomicU64,
    broadcasts: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub processed: u64,
    pub malformed_topic: u64,
    pub decode_errors: u64,
    pub unknown_gateway: u64,
    pub unknown_node: u64,
    pub persistence_failures: u64,
    pub readings_written: u64,
    pub broadcasts: u64,
}

impl StatsSnapshot {
    pub fn dropped(&self) -> u64 {
        self.malformed_topic + self.decode_errors + self.unknown_gateway + self.persistence_failures
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received={} processed={} dropped={} (malformed_topic={}, decode={}, unknown_gateway={}, persistence={}) unknown_node={} readings={} broadcasts={}",
            self.received,
            self.processed,
            self.dropped(),
            self.malformed_topic,
            self.decode_errors,
            self.unknown_gateway,
            self.persistence_failures,
            self.unknown_node,
            self.readings_written,
            self.broadcasts
        )
    }
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $name(&self, n: u64) {
                self.$field.fetch_add(n, Ordering::Relaxed);
            }
        )*
    };
}

impl IngestStats {
    counter! {
        add_received => received,
        add_processed => processed,
        add_malformed_topic => malformed_topic,
        add_decode_error => decode_errors,
        add_unknown_gateway => unknown_gateway,
        add_unknown_node => unknown_node,
        add_persistence_failure => persistence_failures,
        add_readings => readings_written,
        add_broadcast => broadcasts,
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            malformed_topic: self.malformed_topic.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            unknown_gateway: self.unknown_gateway.load(Ordering::Relaxed),
            unknown_node: self.unknown_node.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            readings_written: self.readings_written.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
        }
    }
}
