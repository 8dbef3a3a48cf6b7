//! Prometheus metrics for the bridge relayer.
//!
//! Exposed on the relayer's HTTP surface at /metrics.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Gauge, GaugeVec, HistogramVec,
};

lazy_static! {
    // Source progress
    pub static ref CURSOR_POSITION: GaugeVec = register_gauge_vec!(
        "relayer_cursor_position",
        "Persisted cursor position per direction",
        &["direction"]
    ).unwrap();

    pub static ref SAFE_HEAD: GaugeVec = register_gauge_vec!(
        "relayer_safe_head",
        "Confirmed source head per direction",
        &["direction"]
    ).unwrap();

    // Transfer flow
    pub static ref DEPOSITS_OBSERVED: CounterVec = register_counter_vec!(
        "relayer_deposits_observed_total",
        "Deposit events observed on the EVM chain",
        &["token"]
    ).unwrap();

    pub static ref BURNS_OBSERVED: CounterVec = register_counter_vec!(
        "relayer_burns_observed_total",
        "Withdrawal requests observed on the ledger",
        &["token"]
    ).unwrap();

    pub static ref MINTS_SUBMITTED: CounterVec = register_counter_vec!(
        "relayer_mints_submitted_total",
        "Mint exercises submitted to the ledger",
        &["status"]
    ).unwrap();

    pub static ref COMPLETIONS_SUBMITTED: CounterVec = register_counter_vec!(
        "relayer_completions_submitted_total",
        "Completion transactions submitted to the EVM chain",
        &["status"]
    ).unwrap();

    pub static ref OPEN_TRANSFERS: GaugeVec = register_gauge_vec!(
        "relayer_open_transfers",
        "Transfers not yet completed or failed",
        &["direction"]
    ).unwrap();

    pub static ref PROCESSING_LATENCY: HistogramVec = register_histogram_vec!(
        "relayer_processing_latency_seconds",
        "Time from observation to completion of a transfer",
        &["direction"],
        vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0]
    ).unwrap();

    // Health
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "relayer_errors_total",
        "Errors by pipeline and error kind",
        &["pipeline", "kind"]
    ).unwrap();

    pub static ref CONSECUTIVE_FAILURES: GaugeVec = register_gauge_vec!(
        "relayer_consecutive_failures",
        "Consecutive poll-cycle failures (circuit breaker input)",
        &["pipeline"]
    ).unwrap();

    pub static ref LAST_SUCCESSFUL_POLL: GaugeVec = register_gauge_vec!(
        "relayer_last_successful_poll_timestamp",
        "Unix timestamp of the last successful poll cycle",
        &["pipeline"]
    ).unwrap();

    pub static ref UP: Gauge = register_gauge!(
        "relayer_up",
        "Whether the relayer is up and running"
    ).unwrap();
}

pub fn record_cursor(direction: &str, position: i64) {
    CURSOR_POSITION
        .with_label_values(&[direction])
        .set(position as f64);
}

pub fn record_safe_head(direction: &str, head: i64) {
    SAFE_HEAD.with_label_values(&[direction]).set(head as f64);
}

pub fn record_mint_submitted(success: bool) {
    let status = if success { "success" } else { "failure" };
    MINTS_SUBMITTED.with_label_values(&[status]).inc();
}

pub fn record_completion_submitted(success: bool) {
    let status = if success { "success" } else { "failure" };
    COMPLETIONS_SUBMITTED.with_label_values(&[status]).inc();
}

pub fn record_error(pipeline: &str, kind: &str) {
    ERRORS.with_label_values(&[pipeline, kind]).inc();
}

pub fn record_consecutive_failures(pipeline: &str, count: u32) {
    CONSECUTIVE_FAILURES
        .with_label_values(&[pipeline])
        .set(count as f64);
}

pub fn record_successful_poll(pipeline: &str) {
    use std::time::{SystemTime, UNIX_EPOCH};
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    LAST_SUCCESSFUL_POLL
        .with_label_values(&[pipeline])
        .set(timestamp);
}

pub fn record_latency(direction: &str, seconds: f64) {
    PROCESSING_LATENCY
        .with_label_values(&[direction])
        .observe(seconds);
}
