//! Core data model.
//!
//! An operation is one mutating unit of work captured while offline. It has
//! identity, a caller-defined type tag and payload, an ordering key
//! (priority + creation time), and a small lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Default priority. Higher values are processed first.
pub const DEFAULT_PRIORITY: i32 = 0;
pub const PRIORITY_LOW: i32 = -10;
pub const PRIORITY_HIGH: i32 = 10;

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique identifier, assigned at enqueue time.
    pub id: OperationId,

    /// What kind of work this is. Opaque to the queue; the handler
    /// dispatches on it.
    pub operation_type: String,

    /// Caller data handed to the handler untouched.
    pub payload: serde_json::Value,

    pub created_at: DateTime<Utc>,

    pub status: Status,

    /// Failed handler invocations so far.
    pub retry_count: u32,

    /// Ceiling for `retry_count`. Reaching it moves the operation to `Failed`.
    pub max_retries: u32,

    /// Higher = processed earlier.
    pub priority: i32,

    /// Diagnostics only. Never read by the queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    /// Last failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Operation {
    pub(crate) fn from_new(new: NewOperation, default_max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: OperationId::new(),
            operation_type: new.operation_type,
            payload: new.payload,
            created_at: now,
            status: Status::Pending,
            retry_count: 0,
            max_retries: new.max_retries.unwrap_or(default_max_retries),
            priority: new.priority,
            metadata: new.metadata,
            error: None,
        }
    }

    /// Has this operation outlived `ttl` as of `now`?
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: std::time::Duration) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now.signed_duration_since(self.created_at) > ttl,
            // A ttl too large for chrono never elapses.
            Err(_) => false,
        }
    }

    fn transition(&mut self, to: Status) -> Result<Status> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidState(format!(
                "operation {}: {from} -> {to} is not allowed",
                self.id
            )));
        }
        self.status = to;
        Ok(from)
    }

    pub(crate) fn mark_processing(&mut self) -> Result<()> {
        self.transition(Status::Processing).map(|_| ())
    }

    pub(crate) fn mark_completed(&mut self) -> Result<()> {
        self.transition(Status::Completed)?;
        self.error = None;
        Ok(())
    }

    /// Record a failed handler invocation. Returns the resulting status:
    /// `Pending` while retry budget remains, `Failed` once it is spent.
    pub(crate) fn record_failure(&mut self, error: String) -> Result<Status> {
        if self.status != Status::Processing {
            return Err(Error::InvalidState(format!(
                "operation {}: failure recorded while {}",
                self.id, self.status
            )));
        }
        // Clamped so retry_count never exceeds max_retries, even for a zero budget.
        self.retry_count = self.retry_count.saturating_add(1).min(self.max_retries);
        self.error = Some(error);
        let next = if self.retry_count >= self.max_retries {
            Status::Failed
        } else {
            Status::Pending
        };
        self.transition(next)?;
        Ok(next)
    }

    pub(crate) fn mark_expired(&mut self) -> Result<()> {
        self.transition(Status::Failed)?;
        self.error = Some(EXPIRED_ERROR.to_string());
        Ok(())
    }

    pub(crate) fn cancel(&mut self) -> Result<()> {
        self.transition(Status::Cancelled).map(|_| ())
    }

    /// Give an exhausted operation a fresh retry budget.
    pub(crate) fn reset_for_retry(&mut self) -> Result<()> {
        self.transition(Status::Pending)?;
        self.retry_count = 0;
        self.error = None;
        Ok(())
    }

    /// Whether the retry budget is spent.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Error recorded on operations that outlived the configured ttl.
pub const EXPIRED_ERROR: &str = "operation expired";

/// Newtype for operation IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for OperationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Other(format!("invalid operation id {s:?}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting for the next processing run.
    Pending,
    /// Handler invocation in flight.
    Processing,
    /// Handler succeeded. Removed by cleanup.
    Completed,
    /// Retry budget spent or expired. Stays until retried or cleared.
    Failed,
    /// Cancelled by the caller before processing. Removed by cleanup.
    Cancelled,
}

impl Status {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Pending, Failed)       // expired before invocation
                | (Processing, Completed)
                | (Processing, Pending)   // retry, or crash recovery
                | (Processing, Failed)
                | (Failed, Pending) // explicit retry_failed
        )
    }

    /// Terminal states are dropped by `cleanup()`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Status::Pending),
            "processing" => Ok(Status::Processing),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            "cancelled" => Ok(Status::Cancelled),
            _ => Err(Error::Other(format!("unknown status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue state
// ---------------------------------------------------------------------------

/// Summary counts, recomputed on demand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueState {
    pub length: usize,
    pub pending_count: usize,
    pub processing_count: usize,
    pub failed_count: usize,
    pub is_syncing: bool,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for enqueueing an operation. The queue's public API for adding work.
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub(crate) operation_type: String,
    pub(crate) payload: serde_json::Value,
    pub(crate) priority: i32,
    pub(crate) max_retries: Option<u32>,
    pub(crate) metadata: Option<serde_json::Value>,
}

impl NewOperation {
    pub fn new(operation_type: impl Into<String>) -> Self {
        Self {
            operation_type: operation_type.into(),
            payload: serde_json::Value::Null,
            priority: DEFAULT_PRIORITY,
            max_retries: None,
            metadata: None,
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Override the queue's `default_max_retries` for this operation.
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
