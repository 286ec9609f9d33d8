//! Persistence adapter: whole-queue snapshots in a single key-value slot.
//!
//! Every mutation rewrites the full record list. Write failures are logged
//! and swallowed so the in-memory queue stays authoritative for the session;
//! unreadable snapshots are logged and treated as an empty queue.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::model::{Operation, Status};
use crate::storage::KvStore;
use crate::telemetry::metrics;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize)]
struct Snapshot<'a> {
    version: u32,
    operations: Vec<&'a Operation>,
}

/// Serialize records into the versioned snapshot format.
pub fn encode<'a>(operations: impl IntoIterator<Item = &'a Operation>) -> Result<String> {
    let snapshot = Snapshot {
        version: SNAPSHOT_VERSION,
        operations: operations.into_iter().collect(),
    };
    Ok(serde_json::to_string(&snapshot)?)
}

/// Parse a stored snapshot without any normalization.
///
/// Accepts the versioned envelope and the unversioned legacy form (a bare
/// array of records).
pub fn decode(raw: &str) -> Result<Vec<Operation>> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    match value {
        serde_json::Value::Array(_) => Ok(serde_json::from_value(value)?),
        serde_json::Value::Object(mut obj) => {
            let version = obj
                .get("version")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| Error::Other("snapshot has no numeric version".to_string()))?;
            if version != u64::from(SNAPSHOT_VERSION) {
                return Err(Error::Other(format!(
                    "unsupported snapshot version {version} (expected {SNAPSHOT_VERSION})"
                )));
            }
            let operations = obj
                .remove("operations")
                .ok_or_else(|| Error::Other("snapshot has no operations".to_string()))?;
            Ok(serde_json::from_value(operations)?)
        }
        other => Err(Error::Other(format!(
            "snapshot is neither an object nor an array: {other}"
        ))),
    }
}

/// Crash recovery: nothing can really be in flight right after a load, so
/// `Processing` records go back to `Pending`. Returns how many were reset.
pub fn normalize(operations: &mut [Operation]) -> usize {
    let mut reset = 0;
    for op in operations.iter_mut().filter(|op| op.status == Status::Processing) {
        op.status = Status::Pending;
        reset += 1;
    }
    reset
}

/// Binds a store to the queue's storage key.
#[derive(Clone)]
pub struct Persistence {
    store: Option<Arc<dyn KvStore>>,
    key: String,
}

impl Persistence {
    pub fn new(store: Arc<dyn KvStore>, key: impl Into<String>) -> Self {
        Self {
            store: Some(store),
            key: key.into(),
        }
    }

    /// Persistence turned off: loads are empty, saves do nothing.
    pub fn disabled() -> Self {
        Self {
            store: None,
            key: String::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Restore records, normalizing crash leftovers. Never fails: corrupt or
    /// unreadable data yields an empty list.
    pub fn load(&self) -> Vec<Operation> {
        let Some(store) = &self.store else {
            return Vec::new();
        };

        let raw = match store.get(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(key = %self.key, "no persisted queue, starting empty");
                return Vec::new();
            }
            Err(e) => {
                error!(key = %self.key, error = %e, "failed to read persisted queue, starting empty");
                return Vec::new();
            }
        };

        let mut operations = match decode(&raw) {
            Ok(ops) => ops,
            Err(e) => {
                error!(
                    key = %self.key,
                    error = %e,
                    bytes = raw.len(),
                    "persisted queue is corrupt, discarding and starting empty"
                );
                return Vec::new();
            }
        };

        let reset = normalize(&mut operations);
        if reset > 0 {
            info!(key = %self.key, reset, "recovered in-flight operations back to pending");
        }
        debug!(key = %self.key, count = operations.len(), "loaded persisted queue");
        operations
    }

    /// Write the full record list. Returns whether the write landed.
    pub fn save<'a>(&self, operations: impl IntoIterator<Item = &'a Operation>) -> bool {
        let Some(store) = &self.store else {
            return true;
        };

        let result = encode(operations).and_then(|raw| store.set(&self.key, &raw));
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %self.key, error = %e, "failed to persist queue, continuing in memory");
                metrics::persist_failures().add(1, &[]);
                false
            }
        }
    }

    /// Drop the persisted slot entirely.
    pub fn erase(&self) -> bool {
        let Some(store) = &self.store else {
            return true;
        };
        match store.remove(&self.key) {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %self.key, error = %e, "failed to erase persisted queue");
                metrics::persist_failures().add(1, &[]);
                false
            }
        }
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("enabled", &self.is_enabled())
            .field("key", &self.key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewOperation;
    use crate::storage::MemoryStore;
    use chrono::Utc;
    use serde_json::json;

    fn op(status: Status) -> Operation {
        let mut op = Operation::from_new(
            NewOperation::new("sync")
                .payload(json!({"x": 1}))
                .metadata(json!({"origin": "test"})),
            3,
            Utc::now(),
        );
        op.status = status;
        op
    }

    #[test]
    fn encode_writes_version() {
        let raw = encode([&op(Status::Pending)]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["operations"].as_array().unwrap().len(), 1);
        assert_eq!(value["operations"][0]["status"], "pending");
    }

    #[test]
    fn decode_reproduces_records() {
        let ops = vec![op(Status::Pending), op(Status::Failed), op(Status::Completed)];
        let decoded = decode(&encode(&ops).unwrap()).unwrap();
        assert_eq!(decoded, ops);
    }

    #[test]
    fn decode_accepts_legacy_bare_array() {
        let ops = vec![op(Status::Pending)];
        let raw = serde_json::to_string(&ops).unwrap();
        assert_eq!(decode(&raw).unwrap(), ops);
    }

    #[test]
    fn decode_rejects_unknown_version() {
        let err = decode(r#"{"version": 99, "operations": []}"#).unwrap_err();
        assert!(err.to_string().contains("unsupported snapshot version"));
    }

    #[test]
    fn normalize_resets_processing_only() {
        let mut ops = vec![op(Status::Processing), op(Status::Failed), op(Status::Processing)];
        assert_eq!(normalize(&mut ops), 2);
        assert_eq!(ops[0].status, Status::Pending);
        assert_eq!(ops[1].status, Status::Failed);
        assert_eq!(ops[2].status, Status::Pending);
    }

    #[test]
    fn load_discards_garbage() {
        let store = MemoryStore::new();
        store.set("q", "{not json").unwrap();
        let p = Persistence::new(Arc::new(store), "q");
        assert!(p.load().is_empty());
    }

    #[test]
    fn save_then_load_normalizes_processing() {
        let store = MemoryStore::new();
        let p = Persistence::new(Arc::new(store), "q");
        let ops = vec![op(Status::Processing)];
        assert!(p.save(&ops));

        let loaded = p.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, ops[0].id);
        assert_eq!(loaded[0].status, Status::Pending);
    }

    #[test]
    fn disabled_persistence_is_inert() {
        let p = Persistence::disabled();
        assert!(!p.is_enabled());
        assert!(p.save(&[op(Status::Pending)]));
        assert!(p.load().is_empty());
    }
}
