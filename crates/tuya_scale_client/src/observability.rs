//! Metric names and per-run recording.
//!
//! The library only emits through the `metrics` facade; whoever hosts it
//! decides whether a recorder is installed.

use crate::sync::SyncReport;

pub const PAGES_FETCHED_TOTAL: &str = "tuya_scale_history_pages_total";
pub const RECORDS_FETCHED_TOTAL: &str = "tuya_scale_records_fetched_total";
pub const RECORDS_APPENDED_TOTAL: &str = "tuya_scale_records_appended_total";
pub const REPORTS_FETCHED_TOTAL: &str = "tuya_scale_analysis_reports_total";
pub const ENRICHMENT_FAILURES_TOTAL: &str = "tuya_scale_enrichment_failures_total";
pub const RETRIES_TOTAL: &str = "tuya_scale_request_retries_total";
pub const TOKEN_REFRESHES_TOTAL: &str = "tuya_scale_token_refreshes_total";
pub const SYNC_RUNS_TOTAL: &str = "tuya_scale_sync_runs_total";
pub const LAST_CREATED_AT: &str = "tuya_scale_last_created_at_ms";

pub fn record_sync(report: &SyncReport) {
    metrics::counter!(SYNC_RUNS_TOTAL, "outcome" => "ok").increment(1);
    metrics::counter!(RECORDS_FETCHED_TOTAL).increment(report.fetched as u64);
    metrics::counter!(RECORDS_APPENDED_TOTAL).increment(report.appended as u64);
    metrics::counter!(REPORTS_FETCHED_TOTAL).increment(report.enriched as u64);
    metrics::counter!(ENRICHMENT_FAILURES_TOTAL).increment(report.failures.len() as u64);
    if let Some(ts) = report.last_created_at {
        metrics::gauge!(LAST_CREATED_AT).set(ts as f64);
    }
}

pub fn record_sync_failure(kind: &'static str) {
    metrics::counter!(SYNC_RUNS_TOTAL, "outcome" => kind).increment(1);
}
