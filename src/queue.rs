//! The queue store. The public API for enqueueing and inspecting operations.
//!
//! Records live in an arena keyed by id; a separate index holds processing
//! order and is recomputed by the ordering policy after every add. All reads
//! return owned copies. Every mutation writes a full snapshot through the
//! persistence adapter before the corresponding event is emitted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::event::{Event, EventBus, EventKind, EventType, Subscription};
use crate::model::{NewOperation, Operation, OperationId, QueueState, Status};
use crate::ordering;
use crate::persistence::Persistence;
use crate::processor::RunSlot;
use crate::storage::{KvStore, MemoryStore};
use crate::telemetry::metrics;

// ---------------------------------------------------------------------------
// Arena + index
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct Store {
    records: HashMap<OperationId, Operation>,
    /// Ids in processing order. Always the same set as `records`.
    order: Vec<OperationId>,
}

impl Store {
    fn from_records(operations: Vec<Operation>) -> Self {
        let mut store = Self::default();
        for op in operations {
            if store.records.contains_key(&op.id) {
                warn!(id = %op.id, "duplicate operation id in persisted queue, keeping the first");
                continue;
            }
            store.order.push(op.id);
            store.records.insert(op.id, op);
        }
        store.resort();
        store
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    fn insert(&mut self, op: Operation) {
        self.order.push(op.id);
        self.records.insert(op.id, op);
        self.resort();
    }

    fn resort(&mut self) {
        ordering::sort_ids(&mut self.order, &self.records);
    }

    pub(crate) fn get(&self, id: &OperationId) -> Option<&Operation> {
        self.records.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &OperationId) -> Option<&mut Operation> {
        self.records.get_mut(id)
    }

    fn remove(&mut self, id: &OperationId) -> Option<Operation> {
        let op = self.records.remove(id)?;
        self.order.retain(|other| other != id);
        Some(op)
    }

    /// Records in processing order.
    pub(crate) fn ordered(&self) -> impl Iterator<Item = &Operation> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    pub(crate) fn ids_with_status(&self, status: Status) -> Vec<OperationId> {
        self.ordered()
            .filter(|op| op.status == status)
            .map(|op| op.id)
            .collect()
    }

    /// Failed records, oldest `created_at` first.
    fn failed_oldest_first(&self) -> Vec<OperationId> {
        let mut failed: Vec<&Operation> = self
            .records
            .values()
            .filter(|op| op.status == Status::Failed)
            .collect();
        failed.sort_by_key(|op| op.created_at);
        failed.into_iter().map(|op| op.id).collect()
    }

    /// Drop completed and cancelled records. Returns how many went.
    pub(crate) fn remove_terminal(&mut self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, op| !op.status.is_terminal());
        let records = &self.records;
        self.order.retain(|id| records.contains_key(id));
        before - self.records.len()
    }

    fn clear(&mut self) -> usize {
        let removed = self.records.len();
        self.records.clear();
        self.order.clear();
        removed
    }

    fn counts(&self) -> QueueState {
        let mut state = QueueState {
            length: self.records.len(),
            ..QueueState::default()
        };
        for op in self.records.values() {
            match op.status {
                Status::Pending => state.pending_count += 1,
                Status::Processing => state.processing_count += 1,
                Status::Failed => state.failed_count += 1,
                Status::Completed | Status::Cancelled => {}
            }
        }
        state
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

pub(crate) struct Inner {
    pub(crate) config: QueueConfig,
    pub(crate) store: Mutex<Store>,
    pub(crate) persistence: Persistence,
    pub(crate) events: EventBus,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) run: Mutex<RunSlot>,
    pub(crate) syncing: AtomicBool,
    pub(crate) closed: AtomicBool,
}

/// A durable offline operation queue.
///
/// Cheap to clone; clones share the same queue. Construct one per owner of
/// the backing store and hand clones to whoever needs it.
#[derive(Clone)]
pub struct OfflineQueue {
    pub(crate) inner: Arc<Inner>,
}

impl OfflineQueue {
    /// Create a queue over `store`, restoring whatever it already holds.
    pub fn new(config: QueueConfig, store: Arc<dyn KvStore>) -> Result<Self> {
        Self::builder().config(config).store(store).build()
    }

    /// Create a queue over a fresh, non-durable in-memory store.
    pub fn in_memory(config: QueueConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> OfflineQueueBuilder {
        OfflineQueueBuilder::default()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub(crate) fn lock_store(&self) -> MutexGuard<'_, Store> {
        self.inner.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot `store` through the persistence adapter. Failures are logged
    /// by the adapter and do not propagate.
    pub(crate) fn persist(&self, store: &Store) -> bool {
        self.inner.persistence.save(store.ordered())
    }

    pub(crate) fn emit(&self, kind: EventKind) -> Event {
        self.inner.events.emit(kind)
    }

    /// Enqueue an operation.
    ///
    /// At capacity the oldest failed operations are evicted to make room. If
    /// evicting every failed operation would still leave no room, nothing is
    /// evicted and the add is rejected with [`Error::QueueFull`].
    pub fn add(&self, new: NewOperation) -> Result<Operation> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let max_size = self.inner.config.max_size;

        let op = {
            let mut store = self.lock_store();
            // A snapshot loaded under a smaller max_size can leave the queue
            // over the limit, so more than one eviction may be needed.
            let excess = (store.len() + 1).saturating_sub(max_size);
            if excess > 0 {
                let failed = store.failed_oldest_first();
                if failed.len() < excess {
                    warn!(
                        max_size,
                        len = store.len(),
                        evictable = failed.len(),
                        operation_type = %new.operation_type,
                        "queue full, rejecting operation"
                    );
                    metrics::capacity_rejections().add(1, &[]);
                    return Err(Error::QueueFull { max_size });
                }
                for victim in &failed[..excess] {
                    store.remove(victim);
                    info!(evicted = %victim, max_size, "queue full, evicted oldest failed operation");
                }
            }

            let op = Operation::from_new(
                new,
                self.inner.config.default_max_retries,
                self.inner.clock.now(),
            );
            store.insert(op.clone());
            self.persist(&store);
            op
        };

        debug!(
            id = %op.id,
            operation_type = %op.operation_type,
            priority = op.priority,
            "operation enqueued"
        );
        metrics::operations_enqueued().add(
            1,
            &[KeyValue::new("operation_type", op.operation_type.clone())],
        );
        self.emit(EventKind::QueueAdd {
            operation: op.clone(),
        });
        Ok(op)
    }

    /// Remove an operation regardless of status. Returns whether it existed.
    pub fn remove(&self, id: OperationId) -> bool {
        let mut store = self.lock_store();
        let Some(op) = store.remove(&id) else {
            return false;
        };
        self.persist(&store);
        debug!(%id, status = %op.status, "operation removed");
        true
    }

    /// Cancel a pending operation. Returns false if it is missing or in any
    /// other status.
    pub fn cancel(&self, id: OperationId) -> bool {
        let mut store = self.lock_store();
        let Some(op) = store.get_mut(&id) else {
            return false;
        };
        if op.status != Status::Pending || op.cancel().is_err() {
            debug!(%id, status = %op.status, "cancel refused");
            return false;
        }
        self.persist(&store);
        debug!(%id, "operation cancelled");
        true
    }

    pub fn get(&self, id: OperationId) -> Option<Operation> {
        self.lock_store().get(&id).cloned()
    }

    /// Every record, in processing order.
    pub fn get_all(&self) -> Vec<Operation> {
        self.lock_store().ordered().cloned().collect()
    }

    /// Pending records, in processing order.
    pub fn get_pending(&self) -> Vec<Operation> {
        self.with_status(Status::Pending)
    }

    pub fn get_failed(&self) -> Vec<Operation> {
        self.with_status(Status::Failed)
    }

    fn with_status(&self, status: Status) -> Vec<Operation> {
        self.lock_store()
            .ordered()
            .filter(|op| op.status == status)
            .cloned()
            .collect()
    }

    pub fn get_state(&self) -> QueueState {
        let mut state = self.lock_store().counts();
        state.is_syncing = self.is_syncing();
        state
    }

    pub fn len(&self) -> usize {
        self.lock_store().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Drop completed and cancelled records. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let mut store = self.lock_store();
        let removed = store.remove_terminal();
        if removed > 0 {
            self.persist(&store);
            debug!(removed, "cleaned up terminal operations");
        }
        removed
    }

    /// Drop every record. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut store = self.lock_store();
        let removed = store.clear();
        self.inner.persistence.erase();
        info!(removed, "queue cleared");
        removed
    }

    /// Write the current state to storage. Returns whether the write landed.
    pub fn flush(&self) -> bool {
        let store = self.lock_store();
        self.persist(&store)
    }

    /// Subscribe to one event type.
    pub fn on<F>(&self, event_type: EventType, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.events.on(event_type, listener)
    }

    /// Subscribe to every event type.
    pub fn on_any<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.events.on_any(listener)
    }
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("persistence", &self.inner.persistence)
            .field("state", &self.get_state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct OfflineQueueBuilder {
    config: Option<QueueConfig>,
    store: Option<Arc<dyn KvStore>>,
    clock: Option<Arc<dyn Clock>>,
}

impl OfflineQueueBuilder {
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Durable slot for snapshots. Defaults to a private in-memory store.
    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and restore persisted records.
    pub fn build(self) -> Result<OfflineQueue> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let persistence = if config.persist_to_storage {
            let store = self.store.unwrap_or_else(|| {
                debug!("no store configured, snapshots stay in memory");
                Arc::new(MemoryStore::new())
            });
            Persistence::new(store, config.storage_key.clone())
        } else {
            Persistence::disabled()
        };

        let loaded = persistence.load();
        let store = Store::from_records(loaded);
        if store.len() > config.max_size {
            warn!(
                count = store.len(),
                max_size = config.max_size,
                "persisted queue exceeds max_size; adds must evict failed operations or wait for it to drain"
            );
        }

        let queue = OfflineQueue {
            inner: Arc::new(Inner {
                config,
                store: Mutex::new(store),
                persistence,
                events: EventBus::new(),
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                run: Mutex::new(RunSlot::default()),
                syncing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        };

        // Rewrite the snapshot so normalized records are what's on disk.
        if queue.inner.persistence.is_enabled() && !queue.is_empty() {
            queue.flush();
        }
        let state = queue.get_state();
        info!(
            key = %queue.inner.persistence.key(),
            length = state.length,
            pending = state.pending_count,
            failed = state.failed_count,
            "offline queue ready"
        );
        Ok(queue)
    }
}
