//! Draining the queue: one run at a time, one operation at a time.
//!
//! `process` is single-flight. The first caller spawns the drain on its own
//! task; anyone who calls while it is running waits for the same outcome
//! instead of starting a second drain. The run works on the pending ids it
//! saw at the start, so records added mid-run wait for the next run, and a
//! record cancelled or removed mid-run is skipped when its turn comes.
//!
//! If the drain task dies (a panicking handler), records it left in
//! `Processing` go back to `Pending` so nothing stays stuck until restart.

use std::sync::atomic::Ordering;
use std::sync::{Arc, MutexGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, warn};

use crate::error::{Error, Result};
use crate::event::{EventKind, panic_message};
use crate::handler::OperationHandler;
use crate::model::{EXPIRED_ERROR, Operation, OperationId, Status};
use crate::queue::OfflineQueue;
use crate::telemetry::{metrics, queue as spans};

/// Tally of one processing run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Handler invocations made.
    pub processed: usize,
    pub completed: usize,
    /// Failures that went back to pending with budget left.
    pub retried: usize,
    /// Failures that spent the retry budget.
    pub failed: usize,
    /// Failed without invoking the handler because the ttl elapsed.
    pub expired: usize,
    /// Snapshot entries no longer pending by the time their turn came.
    pub skipped: usize,
}

type RunOutcome = std::result::Result<RunReport, String>;

/// The in-flight run, if any. Waiters clone the receiver.
pub(crate) type RunSlot = Option<watch::Receiver<Option<RunOutcome>>>;

enum Claim {
    Run(Operation),
    Expired(Operation),
    Skip,
}

impl OfflineQueue {
    fn lock_run(&self) -> MutexGuard<'_, RunSlot> {
        self.inner.run.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drain pending operations through `handler`.
    ///
    /// If a run is already in progress this joins it and returns its report.
    /// Individual operation failures never make this an error; they are
    /// recorded on the operation and reported through events. An error means
    /// the run itself was aborted.
    pub async fn process(&self, handler: Arc<dyn OperationHandler>) -> Result<RunReport> {
        let mut rx = {
            let mut slot = self.lock_run();
            // `close` flips the flag under this lock, so no run can start
            // after it has looked at the slot.
            if self.is_closed() {
                return Err(Error::Closed);
            }
            match slot.as_ref() {
                Some(rx) => {
                    debug!("run already in progress, joining it");
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx.clone());
                    self.inner.syncing.store(true, Ordering::SeqCst);
                    let queue = self.clone();
                    tokio::spawn(async move { queue.supervise(handler, tx).await });
                    rx
                }
            }
        };

        let outcome = match rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => outcome
                .clone()
                .unwrap_or_else(|| Err("run finished without a result".to_string())),
            Err(_) => Err("run task dropped before finishing".to_string()),
        };
        outcome.map_err(Error::RunAborted)
    }

    /// Owns one run: drives the drain, recovers from its death, announces the
    /// outcome, and frees the slot for the next run.
    async fn supervise(
        self,
        handler: Arc<dyn OperationHandler>,
        tx: watch::Sender<Option<RunOutcome>>,
    ) {
        let started = Instant::now();
        let drain = tokio::spawn({
            let queue = self.clone();
            async move { queue.drain(handler).await }
        });

        let outcome: RunOutcome = match drain.await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) if e.is_panic() => Err(format!(
                "handler panicked: {}",
                panic_message(e.into_panic().as_ref())
            )),
            Err(e) => Err(format!("run task failed: {e}")),
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        match &outcome {
            Ok(report) => {
                info!(
                    processed = report.processed,
                    completed = report.completed,
                    retried = report.retried,
                    failed = report.failed,
                    expired = report.expired,
                    skipped = report.skipped,
                    elapsed_ms,
                    "run complete"
                );
                metrics::run_duration_ms().record(
                    elapsed_ms,
                    &[opentelemetry::KeyValue::new("outcome", "complete")],
                );
                self.emit(EventKind::SyncComplete {
                    report: report.clone(),
                });
            }
            Err(message) => {
                let restored = self.restore_in_flight();
                error!(error = %message, restored, elapsed_ms, "run aborted");
                metrics::run_duration_ms().record(
                    elapsed_ms,
                    &[opentelemetry::KeyValue::new("outcome", "error")],
                );
                self.emit(EventKind::SyncError {
                    error: message.clone(),
                });
            }
        }

        {
            let mut slot = self.lock_run();
            *slot = None;
            self.inner.syncing.store(false, Ordering::SeqCst);
        }
        // No receivers left is fine: every caller may have been cancelled.
        let _ = tx.send(Some(outcome));
    }

    /// Put anything left in `Processing` back to `Pending`.
    fn restore_in_flight(&self) -> usize {
        let mut store = self.lock_store();
        let ids = store.ids_with_status(Status::Processing);
        for id in &ids {
            if let Some(op) = store.get_mut(id) {
                op.status = Status::Pending;
            }
        }
        if !ids.is_empty() {
            self.persist(&store);
        }
        ids.len()
    }

    async fn drain(self, handler: Arc<dyn OperationHandler>) -> Result<RunReport> {
        let snapshot = self.lock_store().ids_with_status(Status::Pending);
        self.emit(EventKind::SyncStart {
            pending: snapshot.len(),
        });

        let span = spans::start_run_span(self.inner.persistence.key(), snapshot.len());
        async move {
            let mut report = RunReport::default();
            let retry_interval = self.inner.config.retry_interval();

            for (index, id) in snapshot.iter().enumerate() {
                let op = match self.claim(*id)? {
                    Claim::Run(op) => op,
                    Claim::Expired(op) => {
                        report.expired += 1;
                        self.emit(EventKind::QueueFail {
                            operation: op,
                            error: EXPIRED_ERROR.to_string(),
                            expired: true,
                        });
                        continue;
                    }
                    Claim::Skip => {
                        report.skipped += 1;
                        continue;
                    }
                };

                let op_span = spans::start_operation_span(&op.operation_type, &op.id);
                spans::record_status_transition(&op_span, Status::Pending, Status::Processing);
                self.emit(EventKind::QueueProcess {
                    operation: op.clone(),
                });

                let outcome = handler.handle(&op).instrument(op_span.clone()).await;
                report.processed += 1;

                let Some((updated, status, message)) = self.settle(*id, outcome)? else {
                    debug!(%id, "operation removed while its handler ran, dropping outcome");
                    continue;
                };
                spans::record_status_transition(&op_span, Status::Processing, status);

                match status {
                    Status::Completed => {
                        report.completed += 1;
                        self.emit(EventKind::QueueComplete { operation: updated });
                    }
                    Status::Failed => {
                        report.failed += 1;
                        warn!(
                            %id,
                            operation_type = %updated.operation_type,
                            retry_count = updated.retry_count,
                            error = %message,
                            "operation failed, retry budget spent"
                        );
                        self.emit(EventKind::QueueFail {
                            operation: updated,
                            error: message,
                            expired: false,
                        });
                    }
                    _ => {
                        report.retried += 1;
                        debug!(
                            %id,
                            retry_count = updated.retry_count,
                            max_retries = updated.max_retries,
                            error = %message,
                            "operation failed, will retry"
                        );
                        let more = index + 1 < snapshot.len();
                        if more && !retry_interval.is_zero() {
                            tokio::time::sleep(retry_interval).await;
                        }
                    }
                }
            }

            let removed = self.cleanup();
            debug!(removed, "post-run cleanup");
            Ok::<_, Error>(report)
        }
        .instrument(span)
        .await
    }

    /// Take the next snapshot entry: start it, expire it, or skip it.
    fn claim(&self, id: OperationId) -> Result<Claim> {
        let now = self.inner.clock.now();
        let ttl = self.inner.config.operation_ttl();

        let mut store = self.lock_store();
        let Some(op) = store.get_mut(&id) else {
            return Ok(Claim::Skip);
        };
        if op.status != Status::Pending {
            debug!(%id, status = %op.status, "no longer pending, skipping");
            return Ok(Claim::Skip);
        }

        let claim = match ttl {
            Some(ttl) if op.is_expired(now, ttl) => {
                op.mark_expired()?;
                info!(%id, operation_type = %op.operation_type, "operation expired");
                Claim::Expired(op.clone())
            }
            _ => {
                op.mark_processing()?;
                Claim::Run(op.clone())
            }
        };
        self.persist(&store);
        Ok(claim)
    }

    /// Apply a handler outcome. `None` when the record vanished meanwhile.
    fn settle(
        &self,
        id: OperationId,
        outcome: anyhow::Result<()>,
    ) -> Result<Option<(Operation, Status, String)>> {
        let mut store = self.lock_store();
        let Some(op) = store.get_mut(&id) else {
            return Ok(None);
        };
        let (status, message) = match outcome {
            Ok(()) => {
                op.mark_completed()?;
                (Status::Completed, String::new())
            }
            Err(e) => {
                let message = format!("{e:#}");
                (op.record_failure(message.clone())?, message)
            }
        };
        let updated = op.clone();
        self.persist(&store);
        Ok(Some((updated, status, message)))
    }

    /// Give every exhausted failed operation a fresh retry budget. Returns
    /// how many were reset.
    pub fn retry_failed(&self) -> usize {
        let mut store = self.lock_store();
        let ids = store.ids_with_status(Status::Failed);
        let mut reset = 0;
        for id in &ids {
            let Some(op) = store.get_mut(id) else {
                continue;
            };
            if op.is_exhausted() && op.reset_for_retry().is_ok() {
                reset += 1;
            }
        }
        if reset > 0 {
            self.persist(&store);
            info!(reset, "failed operations reset for retry");
        }
        reset
    }

    /// Stop accepting work, wait for any in-flight run, and write a final
    /// snapshot. Later `add` and `process` calls return [`Error::Closed`].
    pub async fn close(&self) -> Result<()> {
        let inflight = {
            let slot = self.lock_run();
            self.inner.closed.store(true, Ordering::SeqCst);
            slot.clone()
        };
        if let Some(mut rx) = inflight {
            debug!("close waiting for in-flight run");
            let _ = rx.wait_for(|outcome| outcome.is_some()).await;
        }

        if !self.flush() {
            return Err(Error::Other("final queue snapshot was not written".to_string()));
        }
        info!("offline queue closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::handler::handler_fn;
    use crate::model::NewOperation;

    #[tokio::test]
    async fn empty_queue_runs_clean() {
        let q = OfflineQueue::in_memory(QueueConfig::default()).unwrap();
        let report = q.process(Arc::new(handler_fn(|_| async { Ok(()) }))).await.unwrap();
        assert_eq!(report, RunReport::default());
        assert!(!q.is_syncing());
    }

    #[tokio::test]
    async fn claim_skips_non_pending() {
        let q = OfflineQueue::in_memory(QueueConfig::default()).unwrap();
        let op = q.add(NewOperation::new("a")).unwrap();
        assert!(q.cancel(op.id));
        assert!(matches!(q.claim(op.id).unwrap(), Claim::Skip));
        assert!(matches!(q.claim(OperationId::new()).unwrap(), Claim::Skip));
    }

    #[tokio::test]
    async fn settle_records_failure_message() {
        let q = OfflineQueue::in_memory(QueueConfig::default()).unwrap();
        let op = q.add(NewOperation::new("a").max_retries(2)).unwrap();
        assert!(matches!(q.claim(op.id).unwrap(), Claim::Run(_)));

        let (updated, status, message) = q
            .settle(op.id, Err(anyhow::anyhow!("HTTP 503")))
            .unwrap()
            .unwrap();
        assert_eq!(status, Status::Pending);
        assert_eq!(message, "HTTP 503");
        assert_eq!(updated.retry_count, 1);
        assert_eq!(updated.error.as_deref(), Some("HTTP 503"));
    }

    #[tokio::test]
    async fn closed_flag_is_checked_under_the_run_slot() {
        let q = OfflineQueue::in_memory(QueueConfig::default()).unwrap();
        q.add(NewOperation::new("a")).unwrap();
        {
            // Same interleaving as `close` winning the slot lock first.
            let _slot = q.lock_run();
            q.inner.closed.store(true, Ordering::SeqCst);
        }

        let result = q.process(Arc::new(handler_fn(|_| async { Ok(()) }))).await;
        assert!(matches!(result, Err(Error::Closed)));
        assert!(q.lock_run().is_none());
        assert!(!q.is_syncing());
        assert_eq!(q.get_pending().len(), 1);
    }

    #[tokio::test]
    async fn restore_in_flight_resets_processing() {
        let q = OfflineQueue::in_memory(QueueConfig::default()).unwrap();
        let op = q.add(NewOperation::new("a")).unwrap();
        q.claim(op.id).unwrap();
        assert_eq!(q.get(op.id).unwrap().status, Status::Processing);

        assert_eq!(q.restore_in_flight(), 1);
        assert_eq!(q.get(op.id).unwrap().status, Status::Pending);
    }
}
