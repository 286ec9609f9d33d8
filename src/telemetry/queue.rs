//! Span helpers for processing runs.

use tracing::Span;

use crate::model::{OperationId, Status};

/// Span covering one drain of the queue.
pub fn start_run_span(storage_key: &str, pending: usize) -> Span {
    tracing::info_span!(
        "queue.run",
        "queue.key" = storage_key,
        "queue.pending" = pending,
    )
}

/// Span covering one operation inside a run.
pub fn start_operation_span(operation_type: &str, id: &OperationId) -> Span {
    tracing::info_span!(
        "queue.operation",
        "operation.type" = operation_type,
        "operation.id" = %id,
        "operation.status" = tracing::field::Empty,
    )
}

/// Record a status transition on `span` and count it.
pub fn record_status_transition(span: &Span, from: Status, to: Status) {
    span.record("operation.status", to.as_str());
    span.in_scope(|| {
        tracing::debug!(from = from.as_str(), to = to.as_str(), "status_transition");
    });
    super::metrics::status_transitions().add(
        1,
        &[
            opentelemetry::KeyValue::new("from", from.as_str()),
            opentelemetry::KeyValue::new("to", to.as_str()),
        ],
    );
}
