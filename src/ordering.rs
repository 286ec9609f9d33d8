//! Ordering policy: priority descending, then creation time ascending.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::model::{Operation, OperationId};

/// Compare two operations by processing order.
///
/// Higher `priority` sorts first; equal priorities fall back to FIFO on
/// `created_at`.
pub fn compare(a: &Operation, b: &Operation) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
}

/// Stable sort of an id index against the records it points into.
///
/// Ids with identical keys keep their relative order, so appending new ids
/// before sorting preserves insertion order on ties. Ids missing from
/// `records` sort last.
pub fn sort_ids(ids: &mut [OperationId], records: &HashMap<OperationId, Operation>) {
    ids.sort_by(|a, b| match (records.get(a), records.get(b)) {
        (Some(a), Some(b)) => compare(a, b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}
