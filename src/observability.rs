//! Metrics collection for negotiation activity using metrics-rs.

use metrics::{counter, Unit};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metric descriptions have been registered.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const NEGOTIATION_PASSES: &str = "concord_negotiation_passes";
const DECISIONS_PUBLISHED: &str = "concord_decisions_published";
const ADVERTISEMENTS_APPLIED: &str = "concord_advertisements_applied";
const CONSUMERS_EXPIRED: &str = "concord_consumers_expired";
const PAYLOADS_PUBLISHED: &str = "concord_payloads_published";
const PAYLOADS_DROPPED: &str = "concord_payloads_dropped";
const PAYLOADS_DISPATCHED: &str = "concord_payloads_dispatched";
const DECODE_FAILURES: &str = "concord_decode_failures";

/// Initialize metric descriptions.
///
/// Call once at application startup before using any metrics. Safe to call
/// multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        NEGOTIATION_PASSES,
        Unit::Count,
        "Total number of negotiation passes run by publishers"
    );
    metrics::describe_counter!(
        DECISIONS_PUBLISHED,
        Unit::Count,
        "Total number of decisions announced (including no-agreement)"
    );
    metrics::describe_counter!(
        ADVERTISEMENTS_APPLIED,
        Unit::Count,
        "Total number of consumer advertisements applied"
    );
    metrics::describe_counter!(
        CONSUMERS_EXPIRED,
        Unit::Count,
        "Total number of consumers removed by liveness expiry"
    );
    metrics::describe_counter!(
        PAYLOADS_PUBLISHED,
        Unit::Count,
        "Total number of payloads encoded and sent"
    );
    metrics::describe_counter!(
        PAYLOADS_DROPPED,
        Unit::Count,
        "Total number of payloads dropped while un-negotiated or on encode failure"
    );
    metrics::describe_counter!(
        PAYLOADS_DISPATCHED,
        Unit::Count,
        "Total number of payloads decoded and handed to a handler"
    );
    metrics::describe_counter!(
        DECODE_FAILURES,
        Unit::Count,
        "Total number of payloads the registered capability failed to decode"
    );
}

/// Record one negotiation pass.
#[inline]
pub fn record_negotiation_pass(stream: &str) {
    counter!(NEGOTIATION_PASSES, "stream" => stream.to_string()).increment(1);
}

/// Record one announced decision.
#[inline]
pub fn record_decision_published(stream: &str) {
    counter!(DECISIONS_PUBLISHED, "stream" => stream.to_string()).increment(1);
}

/// Record one applied consumer advertisement.
#[inline]
pub fn record_advertisement_applied(stream: &str) {
    counter!(ADVERTISEMENTS_APPLIED, "stream" => stream.to_string()).increment(1);
}

/// Record one consumer removed by liveness expiry.
#[inline]
pub fn record_consumer_expired(stream: &str) {
    counter!(CONSUMERS_EXPIRED, "stream" => stream.to_string()).increment(1);
}

/// Record one payload sent on the negotiated channel.
#[inline]
pub fn record_payload_published(stream: &str) {
    counter!(PAYLOADS_PUBLISHED, "stream" => stream.to_string()).increment(1);
}

/// Record one payload dropped.
#[inline]
pub fn record_payload_dropped(stream: &str) {
    counter!(PAYLOADS_DROPPED, "stream" => stream.to_string()).increment(1);
}

/// Record one payload dispatched to a handler.
#[inline]
pub fn record_payload_dispatched(consumer: &str) {
    counter!(PAYLOADS_DISPATCHED, "consumer" => consumer.to_string()).increment(1);
}

/// Record one decode failure.
#[inline]
pub fn record_decode_failure(consumer: &str) {
    counter!(DECODE_FAILURES, "consumer" => consumer.to_string()).increment(1);
}
