//! Metric instrument factories.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an installed provider every instrument is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("offline-queue")
}

/// Counter: operations accepted by `add`.
/// Labels: `operation_type`.
pub fn operations_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("offq.operations.enqueued")
        .with_description("Number of operations enqueued")
        .build()
}

/// Counter: `add` calls rejected because the queue was full.
pub fn capacity_rejections() -> Counter<u64> {
    meter()
        .u64_counter("offq.operations.capacity_rejections")
        .with_description("Operations rejected by capacity enforcement")
        .build()
}

/// Counter: operation status transitions.
/// Labels: `from`, `to`.
pub fn status_transitions() -> Counter<u64> {
    meter()
        .u64_counter("offq.operations.status_transitions")
        .with_description("Number of operation status transitions")
        .build()
}

/// Counter: snapshot writes that failed and were skipped.
pub fn persist_failures() -> Counter<u64> {
    meter()
        .u64_counter("offq.persist.failures")
        .with_description("Failed queue snapshot writes")
        .build()
}

/// Histogram: wall time of one processing run in milliseconds.
pub fn run_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("offq.run.duration_ms")
        .with_description("Processing run duration in milliseconds")
        .with_unit("ms")
        .build()
}
