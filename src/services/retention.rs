use crate::store::{retention_cutoff, RetentionLimits, RetentionReport, Store};
use chrono::{DateTime, Utc};
use log::{info, warn};

/// One retention pass: removes readings older than `days` relative to `now`.
pub fn run_once<S: Store>(
    store: &S,
    now: DateTime<Utc>,
    days: u32,
    limits: &RetentionLimits,
) -> Result<RetentionReport, String> {
    let cutoff = retention_cutoff(now, days);
    info!(
        "Retention: deleting readings before {} (window={}d, batch={}, budget={}s)",
        cutoff,
        days,
        limits.batch_size,
        limits.max_duration.as_secs()
    );

    let report = store
        .delete_readings_before(cutoff, limits)
        .map_err(|e| format!("retention failed: {}", e))?;

    if report.complete {
        info!(
            "Retention: removed {} reading(s) in {} batch(es)",
            report.deleted, report.batches
        );
    } else {
        warn!(
            "Retention: time budget exhausted after {} reading(s) in {} batch(es); rows before {} remain",
            report.deleted, report.batches, cutoff
        );
    }
    Ok(report)
}
