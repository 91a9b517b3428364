//! Prometheus metrics for the recorder
//!
//! Every non-fatal error path increments a counter here so gaps in the
//! recorded data can be audited after the fact.

use once_cell::sync::Lazy;
use prometheus::{
    register_gauge, register_int_counter, register_int_counter_vec, register_int_gauge, Encoder,
    Gauge, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

const LABEL_INSTRUMENT: &str = "instrument";
const LABEL_KIND: &str = "kind";
const LABEL_STATE: &str = "state";

static MESSAGES_RECEIVED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lobrec_messages_received_total",
        "Raw frames received from the feed"
    )
    .expect("Failed to register messages_received_total metric")
});

static UPDATES_BUFFERED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "lobrec_updates_buffered_total",
        "Decoded order book updates appended to the ingest buffer",
        &[LABEL_INSTRUMENT]
    )
    .expect("Failed to register updates_buffered_total metric")
});

static DECODE_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "lobrec_decode_failures_total",
        "Frames dropped because they could not be decoded",
        &[LABEL_KIND]
    )
    .expect("Failed to register decode_failures_total metric")
});

static UNCONFIGURED_INSTRUMENT_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lobrec_unconfigured_instrument_total",
        "Well-formed updates dropped for instruments outside the configured set"
    )
    .expect("Failed to register unconfigured_instrument_total metric")
});

static CONTROL_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "lobrec_control_events_total",
        "Control frames received (pong, acks, errors, other channels)",
        &[LABEL_KIND]
    )
    .expect("Failed to register control_events_total metric")
});

static STATE_TRANSITIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "lobrec_connection_state_transitions_total",
        "Connection state machine transitions by target state",
        &[LABEL_STATE]
    )
    .expect("Failed to register connection_state_transitions_total metric")
});

static CONNECTION_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "lobrec_connection_errors_total",
        "Connection-level failures by kind (connect, stale_connection, transport, subscribe_timeout)",
        &[LABEL_KIND]
    )
    .expect("Failed to register connection_errors_total metric")
});

static RECONNECT_ATTEMPTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lobrec_reconnect_attempts_total",
        "Connect attempts made after a failure or a dropped session"
    )
    .expect("Failed to register reconnect_attempts_total metric")
});

static CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "lobrec_connected",
        "Feed session status (1=connected, 0=not connected)"
    )
    .expect("Failed to register connected metric")
});

static LAST_MESSAGE_TIMESTAMP: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "lobrec_last_message_timestamp",
        "Unix timestamp of the last frame received"
    )
    .expect("Failed to register last_message_timestamp metric")
});

static BUFFER_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "lobrec_buffer_depth",
        "Updates currently held in the open batch"
    )
    .expect("Failed to register buffer_depth metric")
});

static EAGER_FLUSHES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lobrec_eager_flushes_total",
        "Flushes triggered by the buffer size limit instead of the timer"
    )
    .expect("Failed to register eager_flushes_total metric")
});

static FILES_WRITTEN_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lobrec_files_written_total",
        "Parquet files committed under the data directory"
    )
    .expect("Failed to register files_written_total metric")
});

static ROWS_WRITTEN_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lobrec_rows_written_total",
        "Rows committed under the data directory"
    )
    .expect("Failed to register rows_written_total metric")
});

static WRITE_RETRIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lobrec_write_retries_total",
        "Failed write attempts that were retried or escalated"
    )
    .expect("Failed to register write_retries_total metric")
});

static FALLBACK_WRITES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lobrec_fallback_writes_total",
        "Batches persisted to the fallback directory"
    )
    .expect("Failed to register fallback_writes_total metric")
});

static UNRECOVERABLE_BATCHES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lobrec_unrecoverable_batches_total",
        "Batches that could not be written anywhere (data loss)"
    )
    .expect("Failed to register unrecoverable_batches_total metric")
});

pub fn inc_message_received() {
    MESSAGES_RECEIVED_TOTAL.inc();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    LAST_MESSAGE_TIMESTAMP.set(now);
}

pub fn inc_update_buffered(instrument: &str) {
    UPDATES_BUFFERED_TOTAL
        .with_label_values(&[instrument])
        .inc();
}

pub fn inc_decode_failure(kind: &str) {
    DECODE_FAILURES_TOTAL.with_label_values(&[kind]).inc();
}

/// Unlabelled: the instrument comes from the feed, not from config.
pub fn inc_unconfigured_instrument() {
    UNCONFIGURED_INSTRUMENT_TOTAL.inc();
}

pub fn inc_control_event(kind: &str) {
    CONTROL_EVENTS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn inc_state_transition(state: &str) {
    STATE_TRANSITIONS_TOTAL.with_label_values(&[state]).inc();
}

pub fn inc_connection_error(kind: &str) {
    CONNECTION_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn inc_reconnect_attempt() {
    RECONNECT_ATTEMPTS_TOTAL.inc();
}

pub fn set_connected(connected: bool) {
    CONNECTED.set(i64::from(connected));
}

pub fn set_buffer_depth(depth: usize) {
    BUFFER_DEPTH.set(depth as i64);
}

pub fn inc_eager_flush() {
    EAGER_FLUSHES_TOTAL.inc();
}

pub fn record_file_written(rows: usize) {
    FILES_WRITTEN_TOTAL.inc();
    ROWS_WRITTEN_TOTAL.inc_by(rows as u64);
}

pub fn inc_write_retry() {
    WRITE_RETRIES_TOTAL.inc();
}

pub fn inc_fallback_write() {
    FALLBACK_WRITES_TOTAL.inc();
}

pub fn inc_unrecoverable_batch() {
    UNRECOVERABLE_BATCHES_TOTAL.inc();
}

/// Encode all registered metrics in Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
