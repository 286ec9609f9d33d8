//! # offline-queue
//!
//! A durable, priority-ordered queue for operations captured while a remote
//! system is unreachable, drained through a caller-supplied handler once it
//! is reachable again.
//!
//! Operations are persisted as whole-queue snapshots in a key-value slot
//! (SQLite or in-memory), retried with a bounded budget, and reported through
//! lifecycle events. Tracing spans and OpenTelemetry metrics cover every run.

pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod model;
pub mod ordering;
pub mod persistence;
pub mod processor;
pub mod queue;
pub mod storage;
pub mod telemetry;

pub use config::QueueConfig;
pub use error::{Error, Result};
pub use event::{Event, EventKind, EventType, Subscription};
pub use handler::{CommandHandler, OperationHandler, handler_fn};
pub use model::{NewOperation, Operation, OperationId, QueueState, Status};
pub use processor::RunReport;
pub use queue::{OfflineQueue, OfflineQueueBuilder};
pub use storage::{KvStore, MemoryStore, SqliteStore};
