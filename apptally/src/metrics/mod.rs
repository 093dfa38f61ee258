//! Prometheus Metrics for apptally
//!
//! Counters for recorded requests and for the outcome of every counter flush.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, TextEncoder, register_int_counter,
    register_int_counter_vec,
};

lazy_static! {
    /// Requests recorded into the counter cache
    pub static ref EVENTS_RECORDED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "apptally_events_recorded_total",
        "Total number of requests recorded by type",
        &["request_type"]
    ).unwrap();

    /// Flush attempts by outcome (committed, empty, race_lost, error)
    pub static ref FLUSH_OUTCOMES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "apptally_flush_outcomes_total",
        "Counter flush attempts by request type and outcome",
        &["request_type", "outcome"]
    ).unwrap();

    /// Units moved from the cache into durable aggregates
    pub static ref FLUSHED_UNITS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "apptally_flushed_units_total",
        "Total counts committed to aggregate records by type",
        &["request_type"]
    ).unwrap();

    /// Threshold crossings that triggered a synchronous flush
    pub static ref AUTOFLUSH_TOTAL: IntCounter = register_int_counter!(
        "apptally_autoflush_total",
        "Number of flushes triggered by the auto-flush threshold"
    ).unwrap();

    /// Aggregate creations that lost the unique-index race and retried
    pub static ref UPSERT_RETRIES_TOTAL: IntCounter = register_int_counter!(
        "apptally_upsert_retries_total",
        "Aggregate record creations retried after a uniqueness conflict"
    ).unwrap();
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a request counted into the cache
pub fn record_event(request_type: &str) {
    EVENTS_RECORDED_TOTAL
        .with_label_values(&[request_type])
        .inc();
}

/// Record the outcome of one counter flush
pub fn record_flush(request_type: &str, outcome: &str, units: u64) {
    FLUSH_OUTCOMES_TOTAL
        .with_label_values(&[request_type, outcome])
        .inc();
    if units > 0 {
        FLUSHED_UNITS_TOTAL
            .with_label_values(&[request_type])
            .inc_by(units);
    }
}
